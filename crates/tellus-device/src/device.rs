//! The GPU contract consumed by the surface renderer.
//!
//! The renderer never talks to a graphics API directly; everything it needs
//! from the GPU — buffer and texture allocation, compressed texture upload,
//! visibility queries against the current view volume, and indexed tile
//! draws — goes through the [`Device`] trait. The outer engine provides the
//! real implementation; [`HeadlessDevice`](crate::HeadlessDevice) provides a
//! software one.

use glam::{Mat4, Vec3};

use crate::error::DeviceError;

/// Opaque handle to a 2D texture owned by the device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TextureHandle(pub u32);

/// Opaque handle to a vertex or index buffer owned by the device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BufferHandle(pub u32);

/// Block-compressed texture formats accepted for surface tiles.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CompressedFormat {
    Dxt1,
    Dxt3,
    Dxt5,
}

impl CompressedFormat {
    /// Map a DDS pixel-format FourCC to a compressed format.
    pub fn from_fourcc(fourcc: [u8; 4]) -> Option<Self> {
        match &fourcc {
            b"DXT1" => Some(Self::Dxt1),
            b"DXT3" => Some(Self::Dxt3),
            b"DXT5" => Some(Self::Dxt5),
            _ => None,
        }
    }

    /// Bytes per 4x4 texel block.
    pub fn block_size(self) -> usize {
        match self {
            Self::Dxt1 => 8,
            Self::Dxt3 | Self::Dxt5 => 16,
        }
    }

    /// Storage size in bytes of the top mip level.
    pub fn storage_size(self, width: u32, height: u32) -> usize {
        let blocks_w = width.div_ceil(4) as usize;
        let blocks_h = height.div_ceil(4) as usize;
        blocks_w * blocks_h * self.block_size()
    }
}

/// GPU memory residence class of a texture.
///
/// Managed textures keep a system copy and survive device loss; default-pool
/// textures must be filled by staging through a `System` texture and calling
/// [`Device::update_texture`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TexturePool {
    Managed,
    Default,
    System,
}

/// Current viewport bounds in pixels.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A sub-rectangle of texture coordinate space.
///
/// When a tile has no texture of its own it is drawn with an ancestor's
/// texture restricted to this range.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct UvRange {
    pub u_min: f32,
    pub u_max: f32,
    pub v_min: f32,
    pub v_max: f32,
}

impl UvRange {
    /// The full texture: `[0,1]²`.
    pub const FULL: Self = Self {
        u_min: 0.0,
        u_max: 1.0,
        v_min: 0.0,
        v_max: 1.0,
    };
}

/// A single surface tile draw, submitted with shader state pre-bound by the
/// outer engine.
#[derive(Clone, Debug)]
pub struct TileDrawCall {
    /// Vertex buffer of the patch template mesh.
    pub vertices: BufferHandle,
    /// 16-bit index buffer of the patch template mesh.
    pub indices: BufferHandle,
    pub vertex_count: u32,
    pub face_count: u32,
    /// Patch-local to camera-relative world transform.
    pub world: Mat4,
    /// Surface texture, if any ancestor in the tile tree has one loaded.
    pub surface: Option<TextureHandle>,
    /// Specular-mask / night-light texture.
    pub mask: Option<TextureHandle>,
    /// Detail micro-texture blended via the mesh's second UV channel.
    pub micro: Option<TextureHandle>,
    /// Micro-texture blend level.
    pub micro_level: f32,
    /// Sub-rectangle of `surface` (and `mask`) to sample.
    pub uv: UvRange,
    /// Specular highlight colour; `None` disables the specular path.
    pub specular: Option<[f32; 3]>,
    /// Animate specular ripple on this draw.
    pub ripple: bool,
    /// Whether `mask` carries night-side city lights to be added.
    pub night_lights: bool,
    /// Whether distance fog is applied to this draw.
    pub fog: bool,
    /// Ambient colour modulation.
    pub ambient: [f32; 4],
}

/// The device interface.
///
/// Implementations must be thread-safe: resource creation and upload are
/// called from the background tile loader while draws come from the render
/// thread.
pub trait Device: Send + Sync {
    /// Create an immutable vertex buffer from raw vertex bytes.
    fn create_vertex_buffer(&self, data: &[u8]) -> Result<BufferHandle, DeviceError>;

    /// Create an immutable 16-bit index buffer.
    fn create_index_buffer(&self, indices: &[u16]) -> Result<BufferHandle, DeviceError>;

    /// Release a buffer. Unknown handles are ignored.
    fn release_buffer(&self, buffer: BufferHandle);

    /// Allocate a block-compressed 2D texture (single mip level).
    fn create_texture(
        &self,
        width: u32,
        height: u32,
        format: CompressedFormat,
        pool: TexturePool,
    ) -> Result<TextureHandle, DeviceError>;

    /// Upload the top mip level of a managed or system-pool texture.
    fn write_texture(&self, texture: TextureHandle, data: &[u8]) -> Result<(), DeviceError>;

    /// Copy a system-pool staging texture into a default-pool texture.
    fn update_texture(&self, src: TextureHandle, dst: TextureHandle) -> Result<(), DeviceError>;

    /// Release a texture. Unknown handles are ignored.
    fn release_texture(&self, texture: TextureHandle);

    /// Current viewport bounds.
    fn viewport(&self) -> Viewport;

    /// Test whether a bounding sphere in camera-relative world space
    /// intersects the view volume.
    fn is_sphere_visible(&self, center: Vec3, radius: f32) -> bool;

    /// Submit one tile draw.
    fn draw_tile(&self, call: &TileDrawCall);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_mapping() {
        assert_eq!(
            CompressedFormat::from_fourcc(*b"DXT1"),
            Some(CompressedFormat::Dxt1)
        );
        assert_eq!(
            CompressedFormat::from_fourcc(*b"DXT3"),
            Some(CompressedFormat::Dxt3)
        );
        assert_eq!(
            CompressedFormat::from_fourcc(*b"DXT5"),
            Some(CompressedFormat::Dxt5)
        );
        assert_eq!(CompressedFormat::from_fourcc(*b"DXT2"), None);
        assert_eq!(CompressedFormat::from_fourcc(*b"ATI2"), None);
    }

    #[test]
    fn test_storage_size_block_rounding() {
        // 256x256 DXT1: 64x64 blocks of 8 bytes
        assert_eq!(CompressedFormat::Dxt1.storage_size(256, 256), 32768);
        // 256x256 DXT5: 64x64 blocks of 16 bytes
        assert_eq!(CompressedFormat::Dxt5.storage_size(256, 256), 65536);
        // non-multiple-of-4 dimensions round up to whole blocks
        assert_eq!(CompressedFormat::Dxt1.storage_size(5, 5), 8 * 4);
    }

    #[test]
    fn test_full_uv_range() {
        let full = UvRange::FULL;
        assert_eq!(full.u_min, 0.0);
        assert_eq!(full.u_max, 1.0);
        assert_eq!(full.v_min, 0.0);
        assert_eq!(full.v_max, 1.0);
    }
}
