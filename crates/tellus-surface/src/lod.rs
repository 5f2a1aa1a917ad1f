//! The per-frame LOD traversal.
//!
//! Starting from the base tiles of `min(level, 8)`, each hemisphere's grid
//! is walked recursively. Per tile the traversal cone-culls against the
//! view aperture, frustum-culls the template bounding sphere, and decides
//! whether to descend (camera close and not too oblique), render, or stop.
//! Descending into an unloaded child queues an asynchronous texture load
//! and draws the child with its parent's texture restricted to the matching
//! UV quadrant until the load lands.

use std::f64::consts::{FRAC_PI_2, PI, SQRT_2, TAU};
use std::sync::Arc;

use glam::{DMat3, DVec3, Mat4};
use tellus_config::TuningConfig;
use tellus_device::{TextureHandle, UvRange};

use crate::buffer::TileStore;
use crate::manager::PlanetSurface;
use crate::stats::RenderStats;
use crate::tile::{FLAG_UNLOADED, NLAT, PATCH_INDEX, TexRef, TileId, nlng_table};

/// Angular half-extent of a tile at `nlat = 1`.
const RAD0: f64 = SQRT_2 * FRAC_PI_2 * 0.5;

/// Per-frame inputs supplied by the outer engine.
#[derive(Clone, Copy, Debug)]
pub struct FrameContext {
    /// Planet world matrix: patch-local unit sphere to camera-relative
    /// world space (includes the radius scale).
    pub world: Mat4,
    /// Global distance scale factor.
    pub scale: f64,
    /// Requested maximum subdivision level.
    pub level: u32,
    /// View half-aperture in radians; 0 derives it from camera distance.
    pub view_aperture: f64,
    /// Distance fog enabled this frame.
    pub fog: bool,
    /// Planet rotation matrix (planet-local to global, unscaled).
    pub rotation: DMat3,
    /// Planet position in the global frame (the sun at the origin).
    pub global_pos: DVec3,
    /// Planet centre relative to the camera, world units.
    pub camera_rel: DVec3,
    /// Camera distance from the planet centre, in planet radii.
    pub camera_distance: f64,
}

/// Frame-constant traversal state.
pub(crate) struct RenderParams {
    /// World matrix of the current hemisphere pass.
    pub wmat: Mat4,
    /// Copy whose translation is replaced per tile at high levels.
    pub wmat_base: Mat4,
    /// Scaled planet rotation (sign-flipped on the southern pass).
    pub grot: DMat3,
    /// Scaled planet position relative to the camera.
    pub cpos: DVec3,
    /// Camera direction in the planet frame.
    pub cdir: DVec3,
    /// Camera distance in planet radii.
    pub cdist: f64,
    /// View half-aperture.
    pub viewap: f64,
    /// Sun direction in the planet frame.
    pub sdir: DVec3,
    /// Tangent distance to the planet limb, world units.
    pub horzdist: f64,
    /// Planet radius, world units.
    pub objsize: f64,
    /// Effective target level after the rate limiter.
    pub tgtlvl: u32,
    pub fog: bool,
}

/// Position of a tile in the subdivision grid.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PatchCoord {
    pub level: u32,
    pub hemisphere: u8,
    pub ilat: u32,
    pub nlat: u32,
    pub ilng: u32,
    pub nlng: u32,
}

/// The texture state a tile is drawn with: either its own (full range) or
/// an ancestor's (sub-rectangle).
#[derive(Clone, Copy, Debug)]
pub(crate) struct TexStack {
    pub range: UvRange,
    pub tex: Option<TextureHandle>,
    pub ltex: Option<TextureHandle>,
    pub flag: u8,
}

/// Apply the camera-motion rate limit: starting from
/// `limit = coeff·2^(-max_patch_level)`, every doubling of the camera's
/// angular step costs one level, down to a floor of 5.
pub(crate) fn rate_limited_level(requested: u32, cstep: f64, tuning: &TuningConfig) -> u32 {
    let mut maxlevel = tuning.max_patch_level;
    let mut limit = tuning.rate_limit_coeff * (2.0f64).powi(-(tuning.max_patch_level as i32));
    while cstep > limit && maxlevel > 5 {
        limit *= 2.0;
        maxlevel -= 1;
    }
    requested.min(maxlevel)
}

/// Direction of the tile centre from the planet centre, planet frame.
pub(crate) fn tile_centre(hemisphere: u8, ilat: u32, nlat: u32, ilng: u32, nlng: u32) -> DVec3 {
    let cntlat = FRAC_PI_2 * (ilat as f64 + 0.5) / nlat as f64;
    let (slat, clat) = cntlat.sin_cos();
    let cntlng = TAU * (ilng as f64 + 0.5) / nlng as f64 + PI;
    let (slng, clng) = cntlng.sin_cos();
    if hemisphere != 0 {
        DVec3::new(clat * clng, -slat, -clat * slng)
    } else {
        DVec3::new(clat * clng, slat, clat * slng)
    }
}

/// Latitude/longitude extents of a tile: `(lat1, lat2, lng1, lng2)`.
pub(crate) fn tile_extents(at: &PatchCoord) -> (f64, f64, f64, f64) {
    let mut lat1 = FRAC_PI_2 * at.ilat as f64 / at.nlat as f64;
    let mut lat2 = lat1 + FRAC_PI_2 / at.nlat as f64;
    let mut lng1 = TAU * at.ilng as f64 / at.nlng as f64 + PI;
    let mut lng2 = lng1 + TAU / at.nlng as f64;
    if at.hemisphere != 0 {
        (lat1, lat2) = (-lat2, -lat1);
        (lng1, lng2) = (-lng2, -lng1);
        if lng2 < 0.0 {
            lng1 += TAU;
            lng2 += TAU;
        }
    }
    (lat1, lat2, lng1, lng2)
}

/// Planet-local direction to equatorial longitude/latitude.
pub(crate) fn local_to_equ(dir: DVec3) -> (f64, f64) {
    let lat = dir.y.clamp(-1.0, 1.0).asin();
    let lng = dir.z.atan2(dir.x);
    (lng, lat)
}

/// World matrix of one tile: the per-longitude Y rotation composed with the
/// hemisphere world matrix. Above 8 latitude bands the translation is
/// recomputed in double precision from the tile's lower-left corner, which
/// is also the origin the template vertices are stored against.
pub(crate) fn world_matrix(rp: &RenderParams, at: &PatchCoord) -> Mat4 {
    let lng = TAU * at.ilng as f64 / at.nlng as f64 + PI; // texture wrap at +-180 deg
    let rtile = Mat4::from_rotation_y(lng as f32);
    if at.nlat > 8 {
        let lat = FRAC_PI_2 * at.ilat as f64 / at.nlat as f64;
        let s = rp.objsize;
        let corner = DVec3::new(
            s * lng.cos() * lat.cos(),
            s * lat.sin(),
            s * lng.sin() * lat.cos(),
        );
        let t = rp.grot * corner + rp.cpos;
        let mut world = rp.wmat_base;
        world.w_axis.x = t.x as f32;
        world.w_axis.y = t.y as f32;
        world.w_axis.z = t.z as f32;
        world * rtile
    } else {
        rp.wmat * rtile
    }
}

impl PlanetSurface {
    /// Render one frame of the planet surface.
    ///
    /// Chooses a cut through the tile quadtree from the camera state in
    /// `frame`, queues texture loads for wanted-but-unloaded tiles, and
    /// submits one draw per selected tile. Holds the tile buffer mutex for
    /// the whole traversal.
    pub fn render(&mut self, frame: &FrameContext) {
        self.stats = RenderStats {
            missing: self.tmissing,
            ..RenderStats::default()
        };
        if self.no_textures {
            return;
        }
        let mut level = frame.level.clamp(1, self.maxlvl);

        let inverse = frame.world.inverse();
        let cdir = inverse.w_axis.truncate().as_dvec3().normalize_or_zero();
        let cdist = frame.camera_distance;
        let viewap = if frame.view_aperture > 0.0 {
            frame.view_aperture
        } else {
            (1.0 / cdist.max(1.0)).acos()
        };
        let grot = frame.rotation * frame.scale;
        let sdir = (grot.transpose() * -frame.global_pos).normalize_or_zero();
        let horzdist = (cdist * cdist - 1.0).max(0.0).sqrt() * self.radius * frame.scale;

        // limit resolution for fast camera movements
        let cstep = match self.prev_cdir {
            Some(prev) => prev.dot(cdir).clamp(-1.0, 1.0).acos(),
            None => 0.0,
        };
        level = rate_limited_level(level, cstep, &self.ctx.tuning);

        let mut rp = RenderParams {
            wmat: frame.world,
            wmat_base: frame.world,
            grot,
            cpos: frame.camera_rel * frame.scale,
            cdir,
            cdist,
            viewap,
            sdir,
            horzdist,
            objsize: self.radius,
            tgtlvl: level,
            fog: frame.fog,
        };

        if level <= 4 {
            self.render_simple(&rp, level);
        } else {
            let startlvl = level.min(8);
            let nlat = NLAT[startlvl as usize];
            let nlng = nlng_table(startlvl);
            let base = PATCH_INDEX[startlvl as usize - 1] as usize;

            let ctx = Arc::clone(&self.ctx);
            let rsouth = ctx.rsouth;
            // the traversal reads and publishes tile state under the queue
            // mutex for the whole frame
            let mut store = ctx.buffer.lock();

            let mut idx = 0usize;
            for hemisphere in 0..2u8 {
                if hemisphere == 1 {
                    // flip the world transformation to the southern hemisphere
                    rp.wmat *= rsouth;
                    rp.wmat_base = rp.wmat;
                    rp.grot.y_axis = -rp.grot.y_axis;
                    rp.grot.z_axis = -rp.grot.z_axis;
                }
                for ilat in (0..nlat).rev() {
                    for ilng in 0..nlng[ilat as usize] {
                        let id = self.base_tiles[base + idx];
                        let descriptor = store.get(id).clone();
                        let stack = TexStack {
                            range: UvRange::FULL,
                            tex: descriptor.tex.loaded(),
                            ltex: descriptor.ltex.loaded(),
                            flag: descriptor.flag,
                        };
                        let at = PatchCoord {
                            level: startlvl,
                            hemisphere,
                            ilat,
                            nlat,
                            ilng,
                            nlng: nlng[ilat as usize],
                        };
                        self.process_tile(&mut store, &rp, at, id, stack, stack);
                        idx += 1;
                    }
                }
            }
        }

        self.prev_cdir = Some(cdir);
    }

    fn process_tile(
        &mut self,
        store: &mut TileStore,
        rp: &RenderParams,
        at: PatchCoord,
        tile: TileId,
        cur: TexStack,
        bkp: TexStack,
    ) {
        // cone cull against the view aperture
        let cnt = tile_centre(at.hemisphere, at.ilat, at.nlat, at.ilng, at.nlng);
        let rad = RAD0 / at.nlat as f64;
        let adist = rp.cdir.dot(cnt).clamp(-1.0, 1.0).acos() - rad;
        if adist >= rp.viewap {
            return;
        }

        let world = world_matrix(rp, &at);
        let bs_scale = world.x_axis.truncate().length();
        let mesh = *self.ctx.templates.mesh(at.level, at.ilat);
        let bs_center = world.transform_point3(mesh.bs_center);
        let bs_radius = mesh.bs_radius * bs_scale;

        if !self.ctx.device.is_sphere_visible(bs_center, bs_radius) {
            store.delete_subtiles(tile);
            return;
        }

        // reduce resolution for distant or oblique patches
        let tuning = &self.ctx.tuning;
        let mut step_down = at.level < rp.tgtlvl;
        let mut coarse_tex = false;
        if step_down && at.level >= 8 && adist > 0.0 {
            let (lat1, lat2, lng1, lng2) = tile_extents(&at);
            let (mut clng, clat) = local_to_equ(rp.cdir);
            if clng < lng1 - PI {
                clng += TAU;
            } else if clng > lng2 + PI {
                clng -= TAU;
            }
            let adist_lng = if clng < lng1 {
                lng1 - clng
            } else if clng > lng2 {
                clng - lng2
            } else {
                0.0
            };
            let adist_lat = if clat < lat1 {
                lat1 - clat
            } else if clat > lat2 {
                clat - lat2
            } else {
                0.0
            };
            let adist2 = adist_lng.max(adist_lat);

            let cosa = adist2.cos();
            let a = adist2.sin();
            let b = rp.cdist - cosa;
            // cosine of the angle the tile surface is viewed under
            let ctilt = b * cosa / (a * a * (1.0 + 2.0 * b) + b * b).sqrt();
            if adist2 > rad * (tuning.tilt_descend_factor * ctilt + tuning.tilt_bias) {
                step_down = false;
                if adist2 > rad * (tuning.tilt_coarse_factor * ctilt + tuning.tilt_bias) {
                    coarse_tex = true;
                }
            }
        }

        if step_down {
            // subdivide into the 2x2 child patches
            let du = (cur.range.u_max - cur.range.u_min) * 0.5;
            let dv = (cur.range.v_max - cur.range.v_min) * 0.5;
            let mut child_index = 0usize;
            for i in (0..2u32).rev() {
                let v_min = cur.range.v_min + (1 - i) as f32 * dv;
                for j in 0..2u32 {
                    let u_min = cur.range.u_min + j as f32 * du;
                    let subrange = UvRange {
                        u_min,
                        u_max: u_min + du,
                        v_min,
                        v_max: v_min + dv,
                    };

                    let (sub_id, known) = match store.get(tile).subtile[child_index] {
                        Some(sub_id) => (sub_id, true),
                        None => {
                            let sub_id = store.add_tile();
                            store.get_mut(tile).subtile[child_index] = Some(sub_id);
                            (sub_id, false)
                        }
                    };
                    let mut isfull = known;
                    if known && store.get(sub_id).flag & FLAG_UNLOADED != 0 {
                        // request the child texture once the parent's own is
                        // present
                        if store.get(tile).flag & FLAG_UNLOADED == 0 {
                            store.load_tile_async(&self.name, sub_id);
                        }
                        isfull = false;
                    }
                    let sub = store.get(sub_id).clone();
                    if isfull {
                        isfull = matches!(sub.tex, TexRef::Loaded(_));
                    }

                    let child = PatchCoord {
                        level: at.level + 1,
                        hemisphere: at.hemisphere,
                        ilat: at.ilat * 2 + i,
                        nlat: at.nlat * 2,
                        ilng: at.ilng * 2 + j,
                        nlng: at.nlng * 2,
                    };
                    if isfull {
                        // child textures take over; the parent stays as the
                        // coarse fallback
                        self.process_tile(
                            store,
                            rp,
                            child,
                            sub_id,
                            TexStack {
                                range: UvRange::FULL,
                                tex: sub.tex.loaded(),
                                ltex: sub.ltex.loaded(),
                                flag: sub.flag,
                            },
                            TexStack {
                                range: subrange,
                                ..cur
                            },
                        );
                    } else {
                        let inherited = TexStack {
                            range: subrange,
                            ..cur
                        };
                        self.process_tile(store, rp, child, sub_id, inherited, inherited);
                    }
                    child_index += 1;
                }
            }
        } else {
            // horizon test on the bounding sphere
            let dist = bs_center.length() as f64;
            if dist - bs_radius as f64 > rp.horzdist {
                return;
            }
            if !self.ctx.device.is_sphere_visible(bs_center, bs_radius) {
                return;
            }
            let sdist = rp.sdir.dot(cnt).clamp(-1.0, 1.0).acos();
            let stack = if coarse_tex { bkp } else { cur };
            self.render_tile(rp, at.level, world, rad, sdist, &mesh, &stack);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_tuning() -> TuningConfig {
        TuningConfig::default()
    }

    #[test]
    fn test_rate_limit_leaves_slow_cameras_alone() {
        let tuning = default_tuning();
        assert_eq!(rate_limited_level(12, 0.0, &tuning), 12);
        // one step below the initial limit
        let limit0 = 5.12 * (2.0f64).powi(-14);
        assert_eq!(rate_limited_level(14, limit0 * 0.9, &tuning), 14);
    }

    #[test]
    fn test_rate_limit_halves_resolution_per_speed_octave() {
        let tuning = default_tuning();
        let limit0 = 5.12 * (2.0f64).powi(-14);
        // just above the initial limit: one level lost
        assert_eq!(rate_limited_level(14, limit0 * 1.5, &tuning), 13);
        // two octaves: two levels
        assert_eq!(rate_limited_level(14, limit0 * 3.0, &tuning), 12);
    }

    #[test]
    fn test_rate_limit_fast_pan_clamps_to_floor() {
        // prev = (1,0,0), cdir = (cos 0.6, sin 0.6, 0) -> cstep = 0.6
        let prev = DVec3::new(1.0, 0.0, 0.0);
        let cdir = DVec3::new(0.6f64.cos(), 0.6f64.sin(), 0.0);
        let cstep = prev.dot(cdir).clamp(-1.0, 1.0).acos();
        assert!((cstep - 0.6).abs() < 1e-12);

        // 5.12*2^-14 doubled 11 times first exceeds 0.6, but the floor at
        // level 5 is reached before that
        assert_eq!(rate_limited_level(12, cstep, &default_tuning()), 5);
    }

    #[test]
    fn test_rate_limit_monotonic_in_camera_speed() {
        let tuning = default_tuning();
        let mut prev_level = u32::MAX;
        let mut cstep = 1e-6;
        while cstep < 2.0 {
            let level = rate_limited_level(14, cstep, &tuning);
            assert!(
                level <= prev_level,
                "level rose from {prev_level} to {level} at cstep {cstep}"
            );
            assert!(level >= 5, "level fell below the floor at cstep {cstep}");
            prev_level = level;
            cstep *= 1.5;
        }
        assert_eq!(prev_level, 5);
    }

    #[test]
    fn test_tile_centre_on_unit_sphere() {
        for hemisphere in 0..2u8 {
            for (ilat, nlat, ilng, nlng) in [(0, 8, 0, 32), (7, 8, 31, 32), (3, 8, 17, 28)] {
                let cnt = tile_centre(hemisphere, ilat, nlat, ilng, nlng);
                assert!((cnt.length() - 1.0).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_tile_centre_hemisphere_mirroring() {
        let north = tile_centre(0, 2, 8, 5, 32);
        let south = tile_centre(1, 2, 8, 5, 32);
        assert!((north.y + south.y).abs() < 1e-12);
        assert!((north.x - south.x).abs() < 1e-12);
        assert!((north.z + south.z).abs() < 1e-12);
    }

    #[test]
    fn test_tile_centre_lies_within_extents() {
        for hemisphere in 0..2u8 {
            let at = PatchCoord {
                level: 8,
                hemisphere,
                ilat: 2,
                nlat: 8,
                ilng: 11,
                nlng: 30,
            };
            let (lat1, lat2, lng1, lng2) = tile_extents(&at);
            assert!(lat1 < lat2);
            assert!(lng1 < lng2);

            let cnt = tile_centre(at.hemisphere, at.ilat, at.nlat, at.ilng, at.nlng);
            let (mut lng, lat) = local_to_equ(cnt);
            if lng < lng1 - PI {
                lng += TAU;
            } else if lng > lng2 + PI {
                lng -= TAU;
            }
            assert!(lat1 <= lat && lat <= lat2, "lat {lat} not in [{lat1}, {lat2}]");
            assert!(lng1 <= lng && lng <= lng2, "lng {lng} not in [{lng1}, {lng2}]");
        }
    }

    #[test]
    fn test_world_matrix_low_level_composes_rotation() {
        let rp = RenderParams {
            wmat: Mat4::from_translation(glam::Vec3::new(0.0, 0.0, -5.0)),
            wmat_base: Mat4::from_translation(glam::Vec3::new(0.0, 0.0, -5.0)),
            grot: DMat3::IDENTITY,
            cpos: DVec3::new(0.0, 0.0, -5.0),
            cdir: DVec3::Z,
            cdist: 5.0,
            viewap: 1.0,
            sdir: DVec3::X,
            horzdist: 10.0,
            objsize: 1.0,
            tgtlvl: 8,
            fog: false,
        };
        let at = PatchCoord {
            level: 8,
            hemisphere: 0,
            ilat: 0,
            nlat: 8,
            ilng: 0,
            nlng: 32,
        };
        let world = world_matrix(&rp, &at);
        // translation passes through untouched at low subdivision
        assert_eq!(world.w_axis.truncate(), glam::Vec3::new(0.0, 0.0, -5.0));
    }

    #[test]
    fn test_world_matrix_high_level_replaces_translation() {
        let rp = RenderParams {
            wmat: Mat4::from_translation(glam::Vec3::new(0.0, 0.0, -5.0)),
            wmat_base: Mat4::from_translation(glam::Vec3::new(0.0, 0.0, -5.0)),
            grot: DMat3::IDENTITY,
            cpos: DVec3::new(0.0, 0.0, -5.0),
            cdir: DVec3::Z,
            cdist: 5.0,
            viewap: 1.0,
            sdir: DVec3::X,
            horzdist: 10.0,
            objsize: 1.0,
            tgtlvl: 10,
            fog: false,
        };
        let at = PatchCoord {
            level: 9,
            hemisphere: 0,
            ilat: 0,
            nlat: 16,
            ilng: 0,
            nlng: 64,
        };
        let world = world_matrix(&rp, &at);

        // translation is the rotated tile corner offset plus the planet
        // position: corner at (lng = pi, lat = 0) is (-1, 0, 0)
        let t = world.w_axis.truncate();
        assert!((t.x - -1.0).abs() < 1e-6);
        assert!(t.y.abs() < 1e-6);
        assert!((t.z - -5.0).abs() < 1e-6);
    }
}
