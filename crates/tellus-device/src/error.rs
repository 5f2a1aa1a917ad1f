//! Device error types.

use crate::device::CompressedFormat;

/// Errors reported by a [`Device`](crate::Device) implementation.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Texture allocation failed (out of GPU memory, unsupported size).
    #[error("texture allocation failed ({width}x{height} {format:?})")]
    TextureAllocation {
        width: u32,
        height: u32,
        format: CompressedFormat,
    },

    /// Buffer allocation failed.
    #[error("buffer allocation failed ({size} bytes)")]
    BufferAllocation { size: usize },

    /// A handle did not refer to a live resource.
    #[error("invalid resource handle")]
    InvalidHandle,

    /// Upload data length does not match the resource's storage size.
    #[error("upload size ({actual}) does not match resource size ({expected})")]
    SizeMismatch { actual: usize, expected: usize },

    /// Source and destination of a texture update are incompatible.
    #[error("texture update source and destination are incompatible")]
    IncompatibleTextures,
}
