//! The renderer front-end: turning a selected tile into a draw call.

use std::f64::consts::FRAC_PI_2;
use std::sync::Arc;

use glam::Mat4;
use tellus_device::{TileDrawCall, UvRange};

use crate::lod::{RenderParams, TexStack};
use crate::manager::{PlanetSurface, has_mask_flags};
use crate::templates::PatchMesh;
use crate::tile::{FLAG_LIGHTS, FLAG_SPECULAR, PATCH_INDEX};

impl PlanetSurface {
    /// Submit one tile draw with the chosen texture stack.
    pub(crate) fn render_tile(
        &mut self,
        rp: &RenderParams,
        level: u32,
        world: Mat4,
        rad: f64,
        sdist: f64,
        mesh: &PatchMesh,
        stack: &TexStack,
    ) {
        let mut flag = stack.flag;
        if self.ctx.tuning.night_side_specular_cutoff
            && sdist > FRAC_PI_2 + rad
            && flag & FLAG_SPECULAR != 0
        {
            flag &= !FLAG_SPECULAR; // tile is past the terminator
        }

        let specular = (self.ctx.surface.surface_reflect && flag & FLAG_SPECULAR != 0)
            .then(|| self.specular_colour(rp));
        let ripple = specular.is_some() && self.ctx.surface.surface_ripple;
        let mask = if has_mask_flags(flag) { stack.ltex } else { None };
        let night_lights =
            self.ctx.surface.surface_lights && flag & FLAG_LIGHTS != 0 && mask.is_some();

        self.ctx.device.draw_tile(&TileDrawCall {
            vertices: mesh.vertices,
            indices: mesh.indices,
            vertex_count: mesh.vertex_count,
            face_count: mesh.face_count,
            world,
            surface: stack.tex,
            mask,
            micro: self.micro_tex,
            micro_level: self.micro_level,
            uv: stack.range,
            specular,
            ripple,
            night_lights,
            fog: rp.fog,
            ambient: self.ambient,
        });

        self.stats.tiles[level as usize] += 1;
        self.stats.vertices += mesh.vertex_count;
        self.stats.draws += 1;
    }

    /// Low-resolution path for levels 1..=4: the base tiles are drawn
    /// directly with the shared sphere meshes, no hemisphere split and no
    /// quadtree walk.
    pub(crate) fn render_simple(&mut self, rp: &RenderParams, level: u32) {
        let ctx = Arc::clone(&self.ctx);
        let store = ctx.buffer.lock();

        let base = PATCH_INDEX[level as usize - 1] as usize;
        let npatch = (PATCH_INDEX[level as usize] - PATCH_INDEX[level as usize - 1]) as usize;
        let sdist = rp.sdir.dot(rp.cdir).clamp(-1.0, 1.0).acos();

        for i in 0..npatch {
            let descriptor = store.get(self.base_tiles[base + i]);
            let stack = TexStack {
                range: UvRange::FULL,
                tex: descriptor.tex.loaded(),
                ltex: descriptor.ltex.loaded(),
                flag: descriptor.flag,
            };
            let mesh = *ctx.templates.mesh(level, i as u32);
            self.render_tile(rp, level, rp.wmat, std::f64::consts::PI, sdist, &mesh, &stack);
        }
    }

    /// Specular highlight colour: the base reflectance, attenuated per
    /// channel by atmospheric in-scattering at shallow sun reflection
    /// angles.
    pub(crate) fn specular_colour(&self, rp: &RenderParams) -> [f32; 3] {
        match &self.atmosphere {
            None => [self.spec_base; 3],
            Some(atmosphere) => {
                let cosa = rp.cdir.dot(rp.sdir).clamp(-1.0, 1.0);
                let alpha = 0.5 * cosa.acos(); // sun reflection angle
                let scale = (alpha.sin() * 0.7) as f32;
                [
                    (self.spec_base - scale * atmosphere.color0.x).max(0.0),
                    (self.spec_base - scale * atmosphere.color0.y).max(0.0),
                    (self.spec_base - scale * atmosphere.color0.z).max(0.0),
                ]
            }
        }
    }
}
