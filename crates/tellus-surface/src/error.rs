//! Surface renderer error types.

use tellus_device::DeviceError;

/// Errors surfaced by the tile manager.
///
/// Most failure modes (missing catalogues, short archives, unreadable
/// tiles) degrade rendering instead of erroring and are reported through
/// logging and [`RenderStats`](crate::RenderStats); only conditions that
/// make the planet unrenderable are reported through this type.
#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    /// Patch template mesh allocation failed. Fatal: the planet cannot
    /// render without its template meshes.
    #[error("patch template construction failed: {0}")]
    Template(#[source] DeviceError),
}
