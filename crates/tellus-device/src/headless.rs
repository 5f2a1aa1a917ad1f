//! Software device implementation.
//!
//! Allocates every resource in system memory and records submitted draw
//! calls instead of rasterizing them. Used for headless operation (server
//! side, batch tooling) and as the device under test for the whole surface
//! renderer.

use std::sync::Mutex;

use glam::Vec3;

use crate::device::{
    BufferHandle, CompressedFormat, Device, TexturePool, TextureHandle, TileDrawCall, Viewport,
};
use crate::error::DeviceError;

type VisibilityFn = Box<dyn Fn(Vec3, f32) -> bool + Send + Sync>;

struct StoredTexture {
    width: u32,
    height: u32,
    format: CompressedFormat,
    pool: TexturePool,
    data: Vec<u8>,
}

#[derive(Default)]
struct HeadlessState {
    buffers: Vec<Option<Vec<u8>>>,
    textures: Vec<Option<StoredTexture>>,
    draws: Vec<TileDrawCall>,
}

/// A [`Device`] that lives entirely in system memory.
pub struct HeadlessDevice {
    state: Mutex<HeadlessState>,
    viewport: Viewport,
    visibility: Mutex<Option<VisibilityFn>>,
}

impl HeadlessDevice {
    /// Create a headless device with a 1280x720 viewport.
    pub fn new() -> Self {
        Self::with_viewport(1280, 720)
    }

    /// Create a headless device with the given viewport size.
    pub fn with_viewport(width: u32, height: u32) -> Self {
        Self {
            state: Mutex::new(HeadlessState::default()),
            viewport: Viewport {
                x: 0,
                y: 0,
                width,
                height,
            },
            visibility: Mutex::new(None),
        }
    }

    /// Override the visibility query. `None` restores the default
    /// (everything visible).
    pub fn set_visibility(&self, f: Option<VisibilityFn>) {
        *self.visibility.lock().unwrap() = f;
    }

    /// Drain and return all draw calls recorded since the last drain.
    pub fn take_draws(&self) -> Vec<TileDrawCall> {
        std::mem::take(&mut self.state.lock().unwrap().draws)
    }

    /// Number of currently live textures.
    pub fn live_texture_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .textures
            .iter()
            .filter(|t| t.is_some())
            .count()
    }

    /// Number of currently live buffers.
    pub fn live_buffer_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .buffers
            .iter()
            .filter(|b| b.is_some())
            .count()
    }

    /// Dimensions and format of a live texture.
    pub fn texture_info(&self, texture: TextureHandle) -> Option<(u32, u32, CompressedFormat)> {
        let state = self.state.lock().unwrap();
        let tex = state.textures.get(texture.0 as usize)?.as_ref()?;
        Some((tex.width, tex.height, tex.format))
    }

    /// Copy of a live texture's top mip payload.
    pub fn texture_data(&self, texture: TextureHandle) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let tex = state.textures.get(texture.0 as usize)?.as_ref()?;
        Some(tex.data.clone())
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for HeadlessDevice {
    fn create_vertex_buffer(&self, data: &[u8]) -> Result<BufferHandle, DeviceError> {
        let mut state = self.state.lock().unwrap();
        let handle = BufferHandle(state.buffers.len() as u32);
        state.buffers.push(Some(data.to_vec()));
        Ok(handle)
    }

    fn create_index_buffer(&self, indices: &[u16]) -> Result<BufferHandle, DeviceError> {
        let mut state = self.state.lock().unwrap();
        let handle = BufferHandle(state.buffers.len() as u32);
        let mut bytes = Vec::with_capacity(indices.len() * 2);
        for idx in indices {
            bytes.extend_from_slice(&idx.to_le_bytes());
        }
        state.buffers.push(Some(bytes));
        Ok(handle)
    }

    fn release_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.buffers.get_mut(buffer.0 as usize) {
            *slot = None;
        }
    }

    fn create_texture(
        &self,
        width: u32,
        height: u32,
        format: CompressedFormat,
        pool: TexturePool,
    ) -> Result<TextureHandle, DeviceError> {
        if width == 0 || height == 0 {
            return Err(DeviceError::TextureAllocation {
                width,
                height,
                format,
            });
        }
        let mut state = self.state.lock().unwrap();
        let handle = TextureHandle(state.textures.len() as u32);
        state.textures.push(Some(StoredTexture {
            width,
            height,
            format,
            pool,
            data: vec![0; format.storage_size(width, height)],
        }));
        Ok(handle)
    }

    fn write_texture(&self, texture: TextureHandle, data: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        let tex = state
            .textures
            .get_mut(texture.0 as usize)
            .and_then(|t| t.as_mut())
            .ok_or(DeviceError::InvalidHandle)?;
        if data.len() != tex.data.len() {
            return Err(DeviceError::SizeMismatch {
                actual: data.len(),
                expected: tex.data.len(),
            });
        }
        tex.data.copy_from_slice(data);
        Ok(())
    }

    fn update_texture(&self, src: TextureHandle, dst: TextureHandle) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        let src_data = {
            let src_tex = state
                .textures
                .get(src.0 as usize)
                .and_then(|t| t.as_ref())
                .ok_or(DeviceError::InvalidHandle)?;
            if src_tex.pool != TexturePool::System {
                return Err(DeviceError::IncompatibleTextures);
            }
            (src_tex.width, src_tex.height, src_tex.format, src_tex.data.clone())
        };
        let dst_tex = state
            .textures
            .get_mut(dst.0 as usize)
            .and_then(|t| t.as_mut())
            .ok_or(DeviceError::InvalidHandle)?;
        if (dst_tex.width, dst_tex.height, dst_tex.format) != (src_data.0, src_data.1, src_data.2)
        {
            return Err(DeviceError::IncompatibleTextures);
        }
        dst_tex.data = src_data.3;
        Ok(())
    }

    fn release_texture(&self, texture: TextureHandle) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.textures.get_mut(texture.0 as usize) {
            *slot = None;
        }
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn is_sphere_visible(&self, center: Vec3, radius: f32) -> bool {
        match &*self.visibility.lock().unwrap() {
            Some(f) => f(center, radius),
            None => true,
        }
    }

    fn draw_tile(&self, call: &TileDrawCall) {
        self.state.lock().unwrap().draws.push(call.clone());
    }
}
