//! Per-planet surface manager: catalogue loading, base texture population,
//! tile tree construction, and teardown.

use std::sync::Arc;

use glam::{DVec3, Vec3};
use tellus_device::TextureHandle;

use crate::buffer::TileStore;
use crate::catalog::{self, TocRecord};
use crate::context::SurfaceContext;
use crate::dds;
use crate::stats::RenderStats;
use crate::tile::{
    FLAG_LIGHTS, FLAG_OLD_INDEX, FLAG_OPAQUE, FLAG_SPECULAR, FLAG_UNLOADED, NOTILE, PATCH_INDEX,
    TexRef, TileId,
};

/// Atmospheric colour modulation of the specular highlight.
#[derive(Clone, Copy, Debug)]
pub struct AtmosphereParams {
    /// Scattering base colour.
    pub color0: Vec3,
}

/// Tile manager of one planet.
///
/// Construction parses the planet's catalogues, materialises the
/// high-resolution tile tree, and loads the base textures; afterwards
/// [`render`](PlanetSurface::render) walks the tree once per frame.
pub struct PlanetSurface {
    pub(crate) ctx: Arc<SurfaceContext>,
    pub(crate) name: String,
    pub(crate) radius: f64,
    pub(crate) maxlvl: u32,
    pub(crate) maxbaselvl: u32,
    tilever: u32,
    ntex: u32,
    nmask: u32,
    nhitex: u32,
    nhispec: u32,
    pub(crate) base_tiles: Vec<TileId>,
    pub(crate) no_textures: bool,
    pub(crate) spec_base: f32,
    pub(crate) atmosphere: Option<AtmosphereParams>,
    pub(crate) micro_tex: Option<TextureHandle>,
    pub(crate) micro_level: f32,
    pub(crate) ambient: [f32; 4],
    pub(crate) prev_cdir: Option<DVec3>,
    pub(crate) tmissing: u32,
    pub(crate) stats: RenderStats,
}

impl PlanetSurface {
    /// Create the surface manager for a planet.
    ///
    /// `radius` is the planet radius in world units; `max_level` the highest
    /// subdivision level its data set provides. Missing or malformed
    /// catalogue files degrade the planet (fewer levels, no specular) rather
    /// than failing.
    pub fn new(ctx: Arc<SurfaceContext>, name: &str, radius: f64, max_level: u32) -> Self {
        let maxlvl = max_level.clamp(1, ctx.tuning.max_patch_level);
        let maxbaselvl = maxlvl.min(8);

        let mut planet = Self {
            ctx,
            name: name.to_owned(),
            radius,
            maxlvl,
            maxbaselvl,
            tilever: 0,
            ntex: 0,
            nmask: 0,
            nhitex: 0,
            nhispec: 0,
            base_tiles: Vec::new(),
            no_textures: false,
            spec_base: 0.7,
            atmosphere: None,
            micro_tex: None,
            micro_level: 0.0,
            ambient: [0.0; 4],
            prev_cdir: None,
            tmissing: 0,
            stats: RenderStats::default(),
        };

        let ctx = Arc::clone(&planet.ctx);
        {
            let mut store = ctx.buffer.lock();
            for _ in 0..PATCH_INDEX[planet.maxbaselvl as usize] {
                planet.base_tiles.push(store.add_tile());
            }
            planet.load_patch_data(&mut store);
            planet.load_tile_data(&mut store);
            planet.load_textures(&mut store);
            planet.load_specular_masks(&mut store);
        }
        planet.stats.missing = planet.tmissing;

        tracing::info!(
            "surface for {}: levels 1-{}, {} base textures, {} masks, {} catalogued subtiles",
            planet.name,
            planet.maxlvl,
            planet.ntex,
            planet.nmask,
            planet.nhitex,
        );
        planet
    }

    /// Read the specular/light-mask flags of the base tiles.
    fn load_patch_data(&mut self, store: &mut TileStore) -> bool {
        self.nmask = 0;
        let wanted = self.ctx.surface.surface_reflect || self.ctx.surface.surface_lights;
        let path = self.ctx.texture_root.join(format!("{}_lmask.bin", self.name));

        let table = wanted
            .then(|| std::fs::read(&path).ok())
            .flatten()
            .and_then(|data| match catalog::parse_lmask(&data) {
                Ok(table) => Some(table),
                Err(err) => {
                    tracing::warn!("ignoring malformed {}: {err}", path.display());
                    None
                }
            });

        let Some(table) = table else {
            // no specular reflections, no city lights
            for &id in &self.base_tiles {
                store.get_mut(id).flag = FLAG_OPAQUE;
            }
            return false;
        };

        let first = table.first_tile();
        let mut nmask = 0;
        for (i, &id) in self.base_tiles.iter().enumerate() {
            let flag = if i < first {
                FLAG_OPAQUE // below the covered range: opaque, no lights
            } else {
                table.flags.get(i - first).copied().unwrap_or(FLAG_OPAQUE)
            };
            store.get_mut(id).flag = flag;
            if has_mask_flags(flag) {
                nmask += 1;
            }
        }
        self.nmask = nmask;
        true
    }

    /// Read the high-resolution tile table of contents and materialise the
    /// tile tree under the level-8 base tiles.
    fn load_tile_data(&mut self, store: &mut TileStore) -> bool {
        if self.maxlvl <= 8 {
            return false; // no tile data required
        }
        let path = self.ctx.texture_root.join(format!("{}_tile.bin", self.name));
        let Ok(data) = std::fs::read(&path) else {
            tracing::warn!("surface tile TOC not found: {}", path.display());
            return false;
        };
        let (version, mut records) = match catalog::parse_tile_toc(&data) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!("ignoring malformed {}: {err}", path.display());
                return false;
            }
        };
        tracing::debug!(
            "read {} tile records (v{version}) for {}",
            records.len(),
            self.name
        );
        self.tilever = version;

        if self.ctx.surface.preload_mode && version >= 1 {
            // bulk loads consume the archive in order, so offsets become
            // dense load indices
            catalog::convert_offsets_to_indices(&mut records);
            self.tilever = 0;
        }

        let level8 = PATCH_INDEX[7] as usize;
        let count = (PATCH_INDEX[8] - PATCH_INDEX[7]) as usize;
        for i in 0..count.min(records.len()) {
            for sub in 0..4 {
                if records[i].subidx[sub] != 0 {
                    self.add_subtile_data(store, self.base_tiles[level8 + i], &records, i, sub, 9);
                }
            }
        }
        true
    }

    fn add_subtile_data(
        &mut self,
        store: &mut TileStore,
        parent: TileId,
        records: &[TocRecord],
        record: usize,
        sub: usize,
        level: u32,
    ) {
        let child_record = records[record].subidx[sub] as usize;
        let Some(entry) = records.get(child_record).copied() else {
            tracing::warn!("{}: tile TOC child index {child_record} out of range", self.name);
            return;
        };
        let has_children = entry.subidx.iter().any(|&s| s != 0);
        if (entry.flags == 0 && !has_children) || level > self.maxlvl {
            return;
        }

        let child = store.add_tile();
        let descriptor = store.get_mut(child);
        descriptor.flag = entry.flags as u8;
        descriptor.tex = TexRef::from_index(entry.sidx);
        if self.ctx.surface.surface_reflect || self.ctx.surface.surface_lights {
            if entry.midx != NOTILE {
                descriptor.ltex = TexRef::Unresolved(entry.midx);
            }
        } else {
            descriptor.flag = FLAG_OPAQUE;
        }
        descriptor.flag |= FLAG_UNLOADED;
        if self.tilever == 0 {
            descriptor.flag |= FLAG_OLD_INDEX;
        }
        store.get_mut(parent).subtile[sub] = Some(child);

        self.nhitex += 1;
        if entry.midx != NOTILE {
            self.nhispec += 1;
        }

        if has_children {
            for j in 0..4 {
                if entry.subidx[j] != 0 {
                    self.add_subtile_data(store, child, records, child_record, j, level + 1);
                }
            }
        }
    }

    /// Load the base texture archive (levels 1..=8). A short archive lowers
    /// the base level; an empty one disables rendering.
    fn load_textures(&mut self, store: &mut TileStore) {
        let path = self.ctx.texture_root.join(format!("{}.tex", self.name));
        let requested = PATCH_INDEX[self.maxbaselvl as usize] as usize;
        let mut textures = match dds::load_texture_archive(
            self.ctx.device.as_ref(),
            &path,
            requested,
            self.ctx.surface.managed_tiles,
        ) {
            Ok(textures) => textures,
            Err(err) => {
                tracing::warn!("cannot read base textures for {}: {err}", self.name);
                Vec::new()
            }
        };

        if textures.is_empty() {
            self.no_textures = true;
            tracing::warn!("no surface textures for {}; rendering disabled", self.name);
            return;
        }

        // not enough textures loaded for the requested resolution level
        while (textures.len() as u32) < PATCH_INDEX[self.maxbaselvl as usize] {
            self.maxbaselvl -= 1;
            self.maxlvl = self.maxbaselvl;
        }
        while textures.len() as u32 > PATCH_INDEX[self.maxbaselvl as usize] {
            if let Some(surplus) = textures.pop() {
                self.ctx.device.release_texture(surplus);
            }
        }
        if self.base_tiles.len() as u32 > PATCH_INDEX[self.maxbaselvl as usize] {
            tracing::warn!(
                "base texture archive for {} is short; reducing to level {}",
                self.name,
                self.maxbaselvl
            );
            let keep = PATCH_INDEX[self.maxbaselvl as usize] as usize;
            for id in self.base_tiles.split_off(keep) {
                store.delete_tile(id);
            }
        }

        self.ntex = textures.len() as u32;
        for (tex, &id) in textures.iter().zip(&self.base_tiles) {
            store.get_mut(id).tex = TexRef::Loaded(*tex);
        }

        if self.ctx.surface.preload_mode && self.nhitex > 0 {
            self.preload_tile_textures(store);
        }
    }

    /// Load the specular/light mask archive for the base tiles.
    fn load_specular_masks(&mut self, store: &mut TileStore) {
        if self.nmask == 0 {
            return;
        }
        let path = self.ctx.texture_root.join(format!("{}_lmask.tex", self.name));
        let masks = match dds::load_texture_archive(
            self.ctx.device.as_ref(),
            &path,
            self.nmask as usize,
            self.ctx.surface.managed_tiles,
        ) {
            Ok(masks) => masks,
            Err(err) => {
                tracing::debug!("cannot read mask archive for {}: {err}", self.name);
                Vec::new()
            }
        };

        if (masks.len() as u32) < self.nmask {
            tracing::warn!(
                "mask archive for {} too short ({} of {}); disabling specular reflection",
                self.name,
                masks.len(),
                self.nmask
            );
            for mask in masks {
                self.ctx.device.release_texture(mask);
            }
            self.nmask = 0;
            for &id in &self.base_tiles {
                store.get_mut(id).flag = FLAG_OPAQUE;
            }
            return;
        }

        let mut next = 0usize;
        for &id in &self.base_tiles {
            let descriptor = store.get_mut(id);
            if has_mask_flags(descriptor.flag) {
                if next < masks.len() {
                    descriptor.ltex = TexRef::Loaded(masks[next]);
                    next += 1;
                } else {
                    descriptor.flag = FLAG_OPAQUE;
                }
            }
            if !self.ctx.surface.surface_lights {
                descriptor.flag &= !FLAG_LIGHTS;
            }
            if !self.ctx.surface.surface_reflect {
                descriptor.flag &= !FLAG_SPECULAR;
                descriptor.flag |= FLAG_OPAQUE;
            }
        }
        for surplus in &masks[next..] {
            self.ctx.device.release_texture(*surplus);
        }
    }

    /// Bulk-load the high-resolution tile archives and resolve every
    /// catalogued index into a loaded texture.
    fn preload_tile_textures(&mut self, store: &mut TileStore) {
        if self.maxlvl <= 8 {
            return;
        }
        let device = Arc::clone(&self.ctx.device);
        let managed = self.ctx.surface.managed_tiles;
        let dir = self.ctx.texture_root.join("Textures2");

        let mut surfaces: Vec<Option<TextureHandle>> =
            match dds::load_texture_archive(
                device.as_ref(),
                &dir.join(format!("{}_tile.tex", self.name)),
                self.nhitex as usize,
                managed,
            ) {
                Ok(textures) => {
                    tracing::info!(
                        "preloaded {} of {} tile textures for {}",
                        textures.len(),
                        self.nhitex,
                        self.name
                    );
                    textures.into_iter().map(Some).collect()
                }
                Err(err) => {
                    tracing::warn!("cannot preload tile textures for {}: {err}", self.name);
                    Vec::new()
                }
            };
        let mut masks: Vec<Option<TextureHandle>> = if self.nhispec > 0 {
            match dds::load_texture_archive(
                device.as_ref(),
                &dir.join(format!("{}_tile_lmask.tex", self.name)),
                self.nhispec as usize,
                managed,
            ) {
                Ok(textures) => textures.into_iter().map(Some).collect(),
                Err(err) => {
                    tracing::debug!("cannot preload tile masks for {}: {err}", self.name);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let level8 = PATCH_INDEX[7] as usize;
        let count = (PATCH_INDEX[8] - PATCH_INDEX[7]) as usize;
        for i in 0..count {
            let children = store.get(self.base_tiles[level8 + i]).subtile;
            for child in children.into_iter().flatten() {
                self.assign_subtile_textures(store, child, &mut surfaces, &mut masks);
            }
        }

        // release textures no catalogue entry claimed
        for surplus in surfaces.into_iter().flatten() {
            device.release_texture(surplus);
        }
        for surplus in masks.into_iter().flatten() {
            device.release_texture(surplus);
        }
    }

    fn assign_subtile_textures(
        &mut self,
        store: &mut TileStore,
        id: TileId,
        surfaces: &mut [Option<TextureHandle>],
        masks: &mut [Option<TextureHandle>],
    ) {
        let descriptor = store.get(id).clone();

        let tex = match descriptor.tex {
            TexRef::Unresolved(index) => {
                match surfaces.get_mut(index as usize).and_then(Option::take) {
                    Some(handle) => TexRef::Loaded(handle),
                    None => {
                        // catalogue and archive disagree
                        self.tmissing += 1;
                        TexRef::None
                    }
                }
            }
            other => other,
        };
        let ltex = match descriptor.ltex {
            TexRef::Unresolved(index) => {
                match masks.get_mut(index as usize).and_then(Option::take) {
                    Some(handle) => TexRef::Loaded(handle),
                    None => {
                        self.tmissing += 1;
                        TexRef::None
                    }
                }
            }
            other => other,
        };

        let target = store.get_mut(id);
        target.tex = tex;
        target.ltex = ltex;
        target.flag &= !FLAG_UNLOADED;

        for child in descriptor.subtile.into_iter().flatten() {
            self.assign_subtile_textures(store, child, surfaces, masks);
        }
    }

    // --- external state setters -------------------------------------------

    /// Set or clear the atmosphere parameters used for specular colour.
    pub fn set_atmosphere(&mut self, atmosphere: Option<AtmosphereParams>) {
        self.atmosphere = atmosphere;
    }

    /// Base specular reflectance.
    pub fn set_spec_base(&mut self, spec_base: f32) {
        self.spec_base = spec_base;
    }

    /// Set or clear the detail micro-texture.
    pub fn set_microtexture(&mut self, texture: Option<TextureHandle>) {
        self.micro_tex = texture;
    }

    /// Micro-texture blend level.
    pub fn set_microlevel(&mut self, level: f32) {
        self.micro_level = level;
    }

    /// Ambient colour modulation applied to every draw.
    pub fn set_ambient_color(&mut self, ambient: [f32; 4]) {
        self.ambient = ambient;
    }

    // --- accessors --------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Effective maximum subdivision level after catalogue/archive checks.
    pub fn max_level(&self) -> u32 {
        self.maxlvl
    }

    /// Effective maximum base level (1..=8).
    pub fn base_level(&self) -> u32 {
        self.maxbaselvl
    }

    /// Number of base textures loaded.
    pub fn texture_count(&self) -> u32 {
        self.ntex
    }

    /// Number of base tiles carrying a specular/lights mask.
    pub fn mask_count(&self) -> u32 {
        self.nmask
    }

    /// Number of catalogued high-resolution subtiles.
    pub fn subtile_count(&self) -> u32 {
        self.nhitex
    }

    /// Catalogue/archive disagreements seen during preload.
    pub fn missing_count(&self) -> u32 {
        self.tmissing
    }

    /// `true` when no base textures could be loaded and rendering is
    /// disabled.
    pub fn has_textures(&self) -> bool {
        !self.no_textures
    }

    /// Statistics of the most recently rendered frame.
    pub fn stats(&self) -> &RenderStats {
        &self.stats
    }

    /// Flag bytes of the base tiles, in catalogue order.
    pub fn base_flags(&self) -> Vec<u8> {
        let store = self.ctx.buffer.lock();
        self.base_tiles.iter().map(|&id| store.get(id).flag).collect()
    }
}

/// Does this flag combination request a mask texture?
pub(crate) fn has_mask_flags(flag: u8) -> bool {
    (flag & (FLAG_OPAQUE | FLAG_SPECULAR)) == (FLAG_OPAQUE | FLAG_SPECULAR)
        || flag & FLAG_LIGHTS != 0
}

impl Drop for PlanetSurface {
    fn drop(&mut self) {
        let ctx = Arc::clone(&self.ctx);
        let mut store = ctx.buffer.lock();
        for &id in &self.base_tiles {
            store.free_subtree(id);
        }
    }
}
