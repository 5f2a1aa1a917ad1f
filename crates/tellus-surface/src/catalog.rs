//! Binary tile catalogues.
//!
//! Two files describe a planet's tile set. `<planet>_lmask.bin` carries one
//! flag byte per base tile (specular opacity, city lights); it exists in a
//! v1.00 framing with a `PLTA0100` id and 16-bit flags, and an older
//! headerless framing with 8-bit flags. `<planet>_tile.bin` is the table of
//! contents of the high-resolution tile tree: fixed-size records with
//! surface/mask archive indices, a flag word, and four child record
//! indices (0 = no child).

use crate::tile::{NOTILE, PATCH_INDEX};

/// Byte size of one TOC record on disk.
pub const TOC_RECORD_SIZE: usize = 26;

/// Errors parsing a catalogue file.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalogue truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("light-mask resolution range invalid (minres {minres}, maxres {maxres})")]
    BadResolutionRange { minres: u8, maxres: u8 },
}

/// Parsed light-mask table: one flag byte per base tile in the covered
/// resolution range.
#[derive(Clone, Debug)]
pub struct LmaskTable {
    pub minres: u8,
    pub maxres: u8,
    pub flags: Vec<u8>,
}

impl LmaskTable {
    /// Index of the first base tile the table covers.
    pub fn first_tile(&self) -> usize {
        PATCH_INDEX[self.minres as usize - 1] as usize
    }
}

fn need(data: &[u8], expected: usize) -> Result<(), CatalogError> {
    if data.len() < expected {
        return Err(CatalogError::Truncated {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap())
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

/// Parse a `<planet>_lmask.bin` file in either framing.
pub fn parse_lmask(data: &[u8]) -> Result<LmaskTable, CatalogError> {
    if data.len() >= 8 && &data[0..8] == b"PLTA0100" {
        // v1.00: explicit patch count, 16-bit flag entries
        need(data, 12)?;
        let minres = data[8];
        let maxres = data[9];
        check_range(minres, maxres)?;
        let npatch = read_u16(data, 10) as usize;
        need(data, 12 + 2 * npatch)?;
        let flags = (0..npatch).map(|i| data[12 + 2 * i]).collect();
        Ok(LmaskTable {
            minres,
            maxres,
            flags,
        })
    } else {
        // pre-v1.00: headerless, count derived from the resolution range
        need(data, 2)?;
        let minres = data[0];
        let maxres = data[1];
        check_range(minres, maxres)?;
        let npatch =
            (PATCH_INDEX[maxres as usize] - PATCH_INDEX[minres as usize - 1]) as usize;
        need(data, 2 + npatch)?;
        Ok(LmaskTable {
            minres,
            maxres,
            flags: data[2..2 + npatch].to_vec(),
        })
    }
}

fn check_range(minres: u8, maxres: u8) -> Result<(), CatalogError> {
    if minres == 0 || minres > maxres || maxres as usize >= PATCH_INDEX.len() {
        return Err(CatalogError::BadResolutionRange { minres, maxres });
    }
    Ok(())
}

/// One record of the tile table of contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TocRecord {
    /// Surface texture index (or byte offset) into the tile archive.
    pub sidx: u32,
    /// Mask texture index (or byte offset) into the mask archive.
    pub midx: u32,
    /// Tile flag word (low byte becomes the descriptor flag).
    pub flags: u16,
    /// Child record indices, 0 = absent.
    pub subidx: [u32; 4],
}

/// Parse a `<planet>_tile.bin` file. Returns the format version and the
/// record list; files without the `PLTS` magic are version 0.
pub fn parse_tile_toc(data: &[u8]) -> Result<(u32, Vec<TocRecord>), CatalogError> {
    let (version, mut pos) = if data.len() >= 8 && &data[0..4] == b"PLTS" {
        (read_u32(data, 4), 8)
    } else {
        (0, 0)
    };

    need(data, pos + 4)?;
    let count = read_u32(data, pos) as usize;
    pos += 4;
    need(data, pos + count * TOC_RECORD_SIZE)?;

    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        records.push(TocRecord {
            sidx: read_u32(data, pos),
            midx: read_u32(data, pos + 4),
            flags: read_u16(data, pos + 8),
            subidx: [
                read_u32(data, pos + 10),
                read_u32(data, pos + 14),
                read_u32(data, pos + 18),
                read_u32(data, pos + 22),
            ],
        });
        pos += TOC_RECORD_SIZE;
    }
    Ok((version, records))
}

/// Convert archive byte offsets to dense indices, in place.
///
/// Records are ranked by ascending offset; non-`NOTILE` entries get ranks
/// `0..k`. Surface and mask indices are ranked independently. Used when
/// tiles are preloaded in bulk, where archive order equals load order.
pub fn convert_offsets_to_indices(records: &mut [TocRecord]) {
    let mut order: Vec<usize> = (0..records.len()).collect();

    order.sort_by_key(|&i| records[i].sidx);
    for (rank, &i) in order.iter().enumerate() {
        if records[i].sidx == NOTILE {
            break;
        }
        records[i].sidx = rank as u32;
    }

    order.sort_by_key(|&i| records[i].midx);
    for (rank, &i) in order.iter().enumerate() {
        if records[i].midx == NOTILE {
            break;
        }
        records[i].midx = rank as u32;
    }
}

/// Serialize TOC records into the on-disk layout (version 0, headerless).
#[cfg(test)]
pub(crate) fn test_toc_bytes(records: &[TocRecord], version: Option<u32>) -> Vec<u8> {
    let mut data = Vec::new();
    if let Some(version) = version {
        data.extend_from_slice(b"PLTS");
        data.extend_from_slice(&version.to_le_bytes());
    }
    data.extend_from_slice(&(records.len() as u32).to_le_bytes());
    for record in records {
        data.extend_from_slice(&record.sidx.to_le_bytes());
        data.extend_from_slice(&record.midx.to_le_bytes());
        data.extend_from_slice(&record.flags.to_le_bytes());
        for sub in record.subidx {
            data.extend_from_slice(&sub.to_le_bytes());
        }
    }
    data
}
