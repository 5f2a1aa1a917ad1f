//! Shared renderer context.
//!
//! Everything that used to be process-global in this subsystem — the patch
//! template library, the southern-hemisphere flip matrix, the viewport
//! bounds, and the tile buffer with its loader thread — lives in one
//! [`SurfaceContext`] value with an explicit lifetime: created before the
//! first planet, dropped after the last.

use std::path::PathBuf;
use std::sync::Arc;

use glam::Mat4;
use tellus_config::{Config, SurfaceConfig, TuningConfig};
use tellus_device::{Device, Viewport};

use crate::buffer::TileBuffer;
use crate::error::SurfaceError;
use crate::templates::PatchTemplates;
use crate::tile::SURF_MAX_PATCHLEVEL;

pub struct SurfaceContext {
    pub(crate) device: Arc<dyn Device>,
    pub(crate) templates: PatchTemplates,
    pub(crate) buffer: TileBuffer,
    pub(crate) surface: SurfaceConfig,
    pub(crate) tuning: TuningConfig,
    pub(crate) texture_root: PathBuf,
    pub(crate) rsouth: Mat4,
    viewport: Viewport,
}

impl SurfaceContext {
    /// Build the template library, start the tile loader, and capture the
    /// viewport. Template allocation failure is fatal.
    pub fn new(
        device: Arc<dyn Device>,
        texture_root: PathBuf,
        config: &Config,
    ) -> Result<Self, SurfaceError> {
        let tuning = TuningConfig {
            max_patch_level: config.tuning.max_patch_level.clamp(1, SURF_MAX_PATCHLEVEL),
            ..config.tuning.clone()
        };
        let templates = PatchTemplates::build(device.as_ref(), tuning.max_patch_level)
            .map_err(SurfaceError::Template)?;
        let buffer = TileBuffer::new(
            Arc::clone(&device),
            texture_root.clone(),
            &config.surface,
            tuning.load_queue_size,
        );
        let viewport = device.viewport();

        Ok(Self {
            device,
            templates,
            buffer,
            surface: config.surface.clone(),
            tuning,
            texture_root,
            rsouth: Mat4::from_rotation_x(std::f32::consts::PI),
            viewport,
        })
    }

    /// The device this context renders through.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Viewport bounds captured at startup.
    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Highest subdivision level templates exist for.
    pub fn max_patch_level(&self) -> u32 {
        self.tuning.max_patch_level
    }

    /// Number of tile load requests currently queued.
    pub fn pending_loads(&self) -> usize {
        self.buffer.pending()
    }

    /// Pause or resume the background tile loader (used across device-loss
    /// windows).
    pub fn hold_loader(&self, hold: bool) {
        self.buffer.hold_loader(hold);
    }
}

impl Drop for SurfaceContext {
    fn drop(&mut self) {
        self.templates.release(self.device.as_ref());
    }
}
