//! Planetary surface tile manager.
//!
//! Renders a planet's surface as a hierarchical quadtree of texture-mapped
//! spherical patches. A fixed base set (levels 1-8) covers the whole sphere
//! with eagerly loaded textures; higher levels are materialised from binary
//! tile catalogues and textured on demand by a background loader. Each
//! frame, [`PlanetSurface::render`] chooses a cut through the quadtree from
//! the camera state — distance, view aperture, horizon, frustum, and
//! camera angular speed — and submits one draw per selected tile through
//! the consumed [`tellus_device::Device`] interface.

mod buffer;
mod catalog;
mod context;
mod dds;
mod draw;
mod error;
mod lod;
mod manager;
mod patch;
mod stats;
mod templates;
mod tile;

pub use buffer::{TILESIZE, TileBuffer, TileStore};
pub use catalog::{
    CatalogError, LmaskTable, TocRecord, convert_offsets_to_indices, parse_lmask, parse_tile_toc,
};
pub use context::SurfaceContext;
pub use dds::{DdsError, SurfaceDesc, load_texture_archive, read_surface};
pub use error::SurfaceError;
pub use lod::FrameContext;
pub use manager::{AtmosphereParams, PlanetSurface};
pub use patch::{
    PatchGeometry, PatchVertex, SpherePatchParams, TEX2_MULTIPLIER, create_sphere,
    create_sphere_patch,
};
pub use stats::RenderStats;
pub use templates::{PatchMesh, PatchTemplates};
pub use tile::{
    FLAG_LIGHTS, FLAG_OLD_INDEX, FLAG_OPAQUE, FLAG_SPECULAR, FLAG_UNLOADED, NOTILE, PATCH_INDEX,
    SURF_MAX_PATCHLEVEL, TexRef, TileDescriptor, TileId,
};
