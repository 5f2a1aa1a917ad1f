//! The patch template library.
//!
//! One immutable mesh per (level, latitude band) slot, built once at
//! startup: full spheres for levels 1-3, hemisphere pairs for level 4,
//! latitude-banded patches for levels 5 and up. Levels 9+ double both the
//! longitude and latitude band counts of the level-8 set and store their
//! vertices relative to the patch corner to keep f32 world matrices
//! precise.

use tellus_device::{BufferHandle, Device, DeviceError};

use crate::patch::{PatchGeometry, SpherePatchParams, create_sphere, create_sphere_patch};
use crate::tile::{SURF_MAX_PATCHLEVEL, nlng_table};

/// Latitudinal mesh resolution per level-8 band.
const RES_8: [u32; 8] = [15, 15, 16, 12, 12, 12, 12, 12];

/// One uploaded patch template mesh.
#[derive(Clone, Copy, Debug)]
pub struct PatchMesh {
    pub vertices: BufferHandle,
    pub indices: BufferHandle,
    pub vertex_count: u32,
    pub face_count: u32,
    pub bs_center: glam::Vec3,
    pub bs_radius: f32,
}

/// The template library: `mesh(level, ilat)` for levels 1..=`max_level`.
pub struct PatchTemplates {
    levels: Vec<Vec<PatchMesh>>,
    max_level: u32,
}

impl PatchTemplates {
    /// Build every template slot up to `max_level` and upload the meshes.
    ///
    /// A device allocation failure here is fatal for the planet; already
    /// uploaded meshes are released before the error is returned.
    pub fn build(device: &dyn Device, max_level: u32) -> Result<Self, DeviceError> {
        let max_level = max_level.clamp(1, SURF_MAX_PATCHLEVEL);
        let mut templates = Self {
            levels: vec![Vec::new()], // level 0 is unused
            max_level,
        };

        let result = templates.build_levels(device);
        if let Err(err) = result {
            templates.release(device);
            return Err(err);
        }
        tracing::debug!("built patch templates through level {max_level}");
        Ok(templates)
    }

    fn build_levels(&mut self, device: &dyn Device) -> Result<(), DeviceError> {
        // levels 1-3: full spheres of increasing resolution
        for (nrings, texres) in [(6, 64), (8, 128), (12, 256)] {
            let mesh = upload(device, &create_sphere(nrings, false, 0, texres))?;
            self.levels.push(vec![mesh]);
        }

        // level 4: one hemisphere per half
        let level4 = vec![
            upload(device, &create_sphere(16, true, 0, 256))?,
            upload(device, &create_sphere(16, true, 1, 256))?,
        ];
        self.levels.push(level4);

        // levels 5-8: tabulated band parameters
        self.push_patch_level(device, &[(4, 1, 18, -1, false)])?;
        self.push_patch_level(device, &[(8, 2, 10, 16, false), (4, 2, 12, -1, false)])?;
        self.push_patch_level(
            device,
            &[
                (16, 4, 12, 12, false),
                (16, 4, 12, 12, false),
                (12, 4, 10, 16, true),
                (6, 4, 12, -1, true),
            ],
        )?;
        self.push_patch_level(
            device,
            &[
                (32, 8, 12, 15, false),
                (32, 8, 12, 15, false),
                (30, 8, 12, 16, false),
                (28, 8, 12, 12, false),
                (24, 8, 12, 12, false),
                (18, 8, 12, 12, false),
                (12, 8, 10, 16, true),
                (6, 8, 12, -1, true),
            ],
        )?;

        // levels 9+: double the level-8 bands, with corner-relative vertices
        let nlng8 = nlng_table(8);
        let mut mult = 2u32;
        for _level in 9..=self.max_level {
            let nlat = 8 * mult;
            let mut bands = Vec::with_capacity(nlat as usize);
            for i in 0..8 {
                for j in 0..mult {
                    let ilat = i * mult + j;
                    bands.push(upload(
                        device,
                        &create_sphere_patch(SpherePatchParams {
                            nlng: nlng8[i as usize] * mult,
                            nlat,
                            ilat,
                            res: 12,
                            bseg: RES_8[i as usize] as i32,
                            reduce: false,
                            outside: true,
                            shift_origin: true,
                        }),
                    )?);
                }
            }
            self.levels.push(bands);
            mult *= 2;
        }
        Ok(())
    }

    fn push_patch_level(
        &mut self,
        device: &dyn Device,
        bands: &[(u32, u32, u32, i32, bool)],
    ) -> Result<(), DeviceError> {
        let mut meshes = Vec::with_capacity(bands.len());
        for (ilat, &(nlng, nlat, res, bseg, reduce)) in bands.iter().enumerate() {
            meshes.push(upload(
                device,
                &create_sphere_patch(SpherePatchParams {
                    nlng,
                    nlat,
                    ilat: ilat as u32,
                    res,
                    bseg,
                    reduce,
                    outside: true,
                    shift_origin: false,
                }),
            )?);
        }
        self.levels.push(meshes);
        Ok(())
    }

    /// Highest level templates were built for.
    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    /// Template for a (level, latitude band) slot. Levels 1-3 have a single
    /// slot; level 4 has one per hemisphere half.
    pub fn mesh(&self, level: u32, ilat: u32) -> &PatchMesh {
        &self.levels[level as usize][ilat as usize]
    }

    /// Release every uploaded buffer.
    pub fn release(&mut self, device: &dyn Device) {
        for level in self.levels.drain(..) {
            for mesh in level {
                device.release_buffer(mesh.vertices);
                device.release_buffer(mesh.indices);
            }
        }
    }
}

fn upload(device: &dyn Device, geometry: &PatchGeometry) -> Result<PatchMesh, DeviceError> {
    let vertices = device.create_vertex_buffer(bytemuck::cast_slice(&geometry.vertices))?;
    let indices = match device.create_index_buffer(&geometry.indices) {
        Ok(handle) => handle,
        Err(err) => {
            device.release_buffer(vertices);
            return Err(err);
        }
    };
    Ok(PatchMesh {
        vertices,
        indices,
        vertex_count: geometry.vertices.len() as u32,
        face_count: (geometry.indices.len() / 3) as u32,
        bs_center: geometry.bs_center,
        bs_radius: geometry.bs_radius,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tellus_device::HeadlessDevice;

    #[test]
    fn test_band_counts_per_level() {
        let device = HeadlessDevice::new();
        let templates = PatchTemplates::build(&device, 10).unwrap();

        assert_eq!(templates.levels[1].len(), 1);
        assert_eq!(templates.levels[2].len(), 1);
        assert_eq!(templates.levels[3].len(), 1);
        assert_eq!(templates.levels[4].len(), 2);
        assert_eq!(templates.levels[5].len(), 1);
        assert_eq!(templates.levels[6].len(), 2);
        assert_eq!(templates.levels[7].len(), 4);
        assert_eq!(templates.levels[8].len(), 8);
        assert_eq!(templates.levels[9].len(), 16);
        assert_eq!(templates.levels[10].len(), 32);
    }

    #[test]
    fn test_max_level_is_clamped() {
        let device = HeadlessDevice::new();
        let templates = PatchTemplates::build(&device, 99).unwrap();
        assert_eq!(templates.max_level(), SURF_MAX_PATCHLEVEL);
    }

    #[test]
    fn test_release_frees_every_buffer() {
        let device = HeadlessDevice::new();
        let mut templates = PatchTemplates::build(&device, 9).unwrap();
        assert!(device.live_buffer_count() > 0);

        templates.release(&device);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn test_level9_doubles_level8_bands() {
        let device = HeadlessDevice::new();
        let templates = PatchTemplates::build(&device, 9).unwrap();

        // a level-9 band mesh keeps the level-8 row resolution, so the two
        // child bands of level-8 band 0 carry the same face layout
        let l9a = templates.mesh(9, 0);
        let l9b = templates.mesh(9, 1);
        assert_eq!(l9a.face_count, l9b.face_count);
        assert!(l9a.vertex_count > 0);
    }
}
