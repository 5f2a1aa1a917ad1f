//! GPU device contract for the Tellus surface renderer.
//!
//! The renderer consumes the GPU exclusively through the [`Device`] trait:
//! buffer and compressed-texture allocation, staging uploads, viewport and
//! visibility queries, and indexed tile draws. The outer engine supplies the
//! real backend; [`HeadlessDevice`] is a complete software implementation.

mod device;
mod error;
mod headless;

pub use device::{
    BufferHandle, CompressedFormat, Device, TexturePool, TextureHandle, TileDrawCall, UvRange,
    Viewport,
};
pub use error::DeviceError;
pub use headless::HeadlessDevice;
