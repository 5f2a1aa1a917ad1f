//! Tile descriptors: the nodes of the surface quadtree.

use tellus_device::TextureHandle;

/// Maximum supported patch subdivision level.
pub const SURF_MAX_PATCHLEVEL: u32 = 14;

/// "No tile" sentinel in catalogue texture index fields.
pub const NOTILE: u32 = 0xFFFF_FFFF;

/// Cumulative base tile counts through level 8: `PATCH_INDEX[L]` is the
/// number of tiles at levels 1..=L.
pub const PATCH_INDEX: [u32; 9] = [0, 1, 2, 3, 5, 13, 37, 137, 501];

/// Latitude band counts per level (levels 1..=8).
pub const NLAT: [u32; 9] = [0, 1, 1, 1, 1, 1, 2, 4, 8];

const NLNG_5: [u32; 1] = [4];
const NLNG_6: [u32; 2] = [8, 4];
const NLNG_7: [u32; 4] = [16, 16, 12, 6];
const NLNG_8: [u32; 8] = [32, 32, 30, 28, 24, 18, 12, 6];

/// Longitude column counts per latitude band for levels 5..=8.
pub fn nlng_table(level: u32) -> &'static [u32] {
    match level {
        5 => &NLNG_5,
        6 => &NLNG_6,
        7 => &NLNG_7,
        8 => &NLNG_8,
        _ => panic!("no longitude table for level {level}"),
    }
}

/// Tile is opaque (no specular transmission through it).
pub const FLAG_OPAQUE: u8 = 0x01;
/// Specular reflection is active on this tile.
pub const FLAG_SPECULAR: u8 = 0x02;
/// A city-lights mask texture is present.
pub const FLAG_LIGHTS: u8 = 0x04;
/// Texture index is an old-style tile index (byte offset = index · TILESIZE).
pub const FLAG_OLD_INDEX: u8 = 0x40;
/// Texture has not been loaded yet.
pub const FLAG_UNLOADED: u8 = 0x80;

/// Slot index of a descriptor in the tile buffer pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TileId(pub(crate) u32);

impl TileId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A tile's texture reference.
///
/// The three states a catalogue texture field can be in are kept explicit so
/// that an unresolved archive index can never be mistaken for a live GPU
/// handle.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum TexRef {
    /// Catalogued archive index, not yet loaded.
    Unresolved(u32),
    /// This tile has no texture of its own at this level.
    #[default]
    None,
    /// Loaded GPU texture.
    Loaded(TextureHandle),
}

impl TexRef {
    /// Map a catalogue index field, folding the `NOTILE` sentinel into
    /// `TexRef::None`.
    pub fn from_index(index: u32) -> Self {
        if index == NOTILE {
            TexRef::None
        } else {
            TexRef::Unresolved(index)
        }
    }

    /// The texture handle, if loaded.
    pub fn loaded(self) -> Option<TextureHandle> {
        match self {
            TexRef::Loaded(handle) => Some(handle),
            _ => None,
        }
    }
}

/// One node of the surface quadtree.
///
/// The descriptor's slot index in the pool is its [`TileId`]; parents link
/// to children by id, so freeing a subtree is O(subtree).
#[derive(Clone, Debug, Default)]
pub struct TileDescriptor {
    /// Flag bits (`FLAG_*`).
    pub flag: u8,
    /// Surface texture.
    pub tex: TexRef,
    /// Specular-mask / city-lights texture.
    pub ltex: TexRef,
    /// Children in quad order {NW, NE, SW, SE} relative to parent UV.
    pub subtile: [Option<TileId>; 4],
}
