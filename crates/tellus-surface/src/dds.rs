//! DDS texture archive reading.
//!
//! Tile textures live as raw DDS surfaces concatenated into archive files:
//! 4-byte `"DDS "` magic, 124-byte surface descriptor, then `linear_size`
//! bytes of DXT-compressed texels. Surfaces are read at a byte offset and
//! uploaded through the device, either directly (managed pool) or staged
//! through a system-memory texture (default pool).

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use tellus_device::{CompressedFormat, Device, DeviceError, TexturePool, TextureHandle};

const DDS_MAGIC: [u8; 4] = *b"DDS ";
/// `dwFlags` bit: `dwPitchOrLinearSize` holds the compressed payload size.
const DDSD_LINEARSIZE: u32 = 0x0008_0000;
/// Magic plus the 124-byte surface descriptor.
const HEADER_SIZE: usize = 128;

/// Errors reading a DDS surface from an archive.
#[derive(Debug, thiserror::Error)]
pub enum DdsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing DDS magic")]
    BadMagic,

    #[error("unsupported pixel format {}", String::from_utf8_lossy(.0))]
    UnsupportedFormat([u8; 4]),

    #[error("surface descriptor has no linear size")]
    NoLinearSize,

    #[error("device rejected surface: {0}")]
    Device(#[from] DeviceError),
}

/// The fields of a DDS surface descriptor the tile loader needs.
#[derive(Clone, Copy, Debug)]
pub struct SurfaceDesc {
    pub width: u32,
    pub height: u32,
    pub linear_size: u32,
    pub format: CompressedFormat,
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

/// Parse the magic and surface descriptor at the head of `buf`.
pub fn parse_surface_header(buf: &[u8; HEADER_SIZE]) -> Result<SurfaceDesc, DdsError> {
    if buf[0..4] != DDS_MAGIC {
        return Err(DdsError::BadMagic);
    }
    let flags = read_u32(buf, 8);
    let height = read_u32(buf, 12);
    let width = read_u32(buf, 16);
    let linear_size = read_u32(buf, 20);
    let fourcc: [u8; 4] = buf[84..88].try_into().unwrap();

    let format =
        CompressedFormat::from_fourcc(fourcc).ok_or(DdsError::UnsupportedFormat(fourcc))?;
    if flags & DDSD_LINEARSIZE == 0 {
        return Err(DdsError::NoLinearSize);
    }
    Ok(SurfaceDesc {
        width,
        height,
        linear_size,
        format,
    })
}

/// Read one DDS surface at `offset` and upload it as a tile texture.
pub fn read_surface(
    device: &dyn Device,
    path: &Path,
    offset: u64,
    managed: bool,
) -> Result<TextureHandle, DdsError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;

    let mut header = [0u8; HEADER_SIZE];
    file.read_exact(&mut header)?;
    let desc = parse_surface_header(&header)?;
    if desc.width > 4096 || desc.height > 4096 {
        tracing::warn!("very large surface tile ({}x{})", desc.width, desc.height);
    }

    let mut payload = vec![0u8; desc.linear_size as usize];
    file.read_exact(&mut payload)?;
    create_texture(device, &desc, &payload, managed)
}

/// Upload one parsed surface through the device.
fn create_texture(
    device: &dyn Device,
    desc: &SurfaceDesc,
    payload: &[u8],
    managed: bool,
) -> Result<TextureHandle, DdsError> {
    if managed {
        let tex = device.create_texture(desc.width, desc.height, desc.format, TexturePool::Managed)?;
        if let Err(err) = device.write_texture(tex, payload) {
            device.release_texture(tex);
            return Err(err.into());
        }
        Ok(tex)
    } else {
        // default-pool textures cannot be written directly; stage through a
        // system-memory copy
        let tex = device.create_texture(desc.width, desc.height, desc.format, TexturePool::Default)?;
        let staging =
            match device.create_texture(desc.width, desc.height, desc.format, TexturePool::System) {
                Ok(staging) => staging,
                Err(err) => {
                    device.release_texture(tex);
                    return Err(err.into());
                }
            };
        let uploaded = device
            .write_texture(staging, payload)
            .and_then(|()| device.update_texture(staging, tex));
        device.release_texture(staging);
        if let Err(err) = uploaded {
            device.release_texture(tex);
            return Err(err.into());
        }
        Ok(tex)
    }
}

/// Read up to `count` concatenated surfaces from the start of an archive.
///
/// A short archive yields fewer textures; a corrupt surface stops the scan
/// with a warning. Only the initial open and hard I/O failures error.
pub fn load_texture_archive(
    device: &dyn Device,
    path: &Path,
    count: usize,
    managed: bool,
) -> Result<Vec<TextureHandle>, DdsError> {
    let mut file = File::open(path)?;
    let mut textures = Vec::new();

    while textures.len() < count {
        let mut header = [0u8; HEADER_SIZE];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let desc = match parse_surface_header(&header) {
            Ok(desc) => desc,
            Err(err) => {
                tracing::warn!(
                    "stopping archive read at surface {}: {err} ({})",
                    textures.len(),
                    path.display()
                );
                break;
            }
        };
        let mut payload = vec![0u8; desc.linear_size as usize];
        match file.read_exact(&mut payload) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        match create_texture(device, &desc, &payload, managed) {
            Ok(tex) => textures.push(tex),
            Err(err) => {
                tracing::warn!("failed to upload archive surface {}: {err}", textures.len());
                break;
            }
        }
    }
    Ok(textures)
}

/// Build a valid single-surface DDS blob with a deterministic payload.
#[cfg(test)]
pub(crate) fn test_dds_blob(width: u32, height: u32, fourcc: [u8; 4]) -> Vec<u8> {
    let format = CompressedFormat::from_fourcc(fourcc).unwrap();
    let linear_size = format.storage_size(width, height);

    let mut blob = vec![0u8; HEADER_SIZE];
    blob[0..4].copy_from_slice(&DDS_MAGIC);
    blob[4..8].copy_from_slice(&124u32.to_le_bytes()); // dwSize
    // CAPS | HEIGHT | WIDTH | PIXELFORMAT | LINEARSIZE
    blob[8..12].copy_from_slice(&0x0008_1007u32.to_le_bytes());
    blob[12..16].copy_from_slice(&height.to_le_bytes());
    blob[16..20].copy_from_slice(&width.to_le_bytes());
    blob[20..24].copy_from_slice(&(linear_size as u32).to_le_bytes());
    blob[76..80].copy_from_slice(&32u32.to_le_bytes()); // ddspf.dwSize
    blob[80..84].copy_from_slice(&0x4u32.to_le_bytes()); // DDPF_FOURCC
    blob[84..88].copy_from_slice(&fourcc);

    blob.extend((0..linear_size).map(|i| i as u8));
    blob
}

#[cfg(test)]
mod tests {
    use super::*;
    use tellus_device::HeadlessDevice;

    fn header_of(blob: &[u8]) -> [u8; HEADER_SIZE] {
        blob[..HEADER_SIZE].try_into().unwrap()
    }

    #[test]
    fn test_parse_valid_header() {
        let blob = test_dds_blob(256, 128, *b"DXT5");
        let desc = parse_surface_header(&header_of(&blob)).unwrap();
        assert_eq!(desc.width, 256);
        assert_eq!(desc.height, 128);
        assert_eq!(desc.format, CompressedFormat::Dxt5);
        assert_eq!(desc.linear_size, 64 * 32 * 16);
    }

    #[test]
    fn test_reject_bad_magic() {
        let mut blob = test_dds_blob(64, 64, *b"DXT1");
        blob[0..4].copy_from_slice(b"PNG ");
        assert!(matches!(
            parse_surface_header(&header_of(&blob)),
            Err(DdsError::BadMagic)
        ));
    }

    #[test]
    fn test_reject_unknown_fourcc() {
        let mut blob = test_dds_blob(64, 64, *b"DXT1");
        blob[84..88].copy_from_slice(b"ATI2");
        assert!(matches!(
            parse_surface_header(&header_of(&blob)),
            Err(DdsError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_reject_missing_linear_size() {
        let mut blob = test_dds_blob(64, 64, *b"DXT1");
        blob[8..12].copy_from_slice(&0x0000_1007u32.to_le_bytes());
        assert!(matches!(
            parse_surface_header(&header_of(&blob)),
            Err(DdsError::NoLinearSize)
        ));
    }

    #[test]
    fn test_read_surface_at_offset() {
        let device = HeadlessDevice::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.tex");

        let first = test_dds_blob(64, 64, *b"DXT1");
        let second = test_dds_blob(32, 32, *b"DXT3");
        let mut archive = first.clone();
        archive.extend_from_slice(&second);
        std::fs::write(&path, &archive).unwrap();

        let tex = read_surface(&device, &path, first.len() as u64, true).unwrap();
        assert_eq!(
            device.texture_info(tex),
            Some((32, 32, CompressedFormat::Dxt3))
        );
        // payload round-trips through the device
        let expected: Vec<u8> = (0..CompressedFormat::Dxt3.storage_size(32, 32))
            .map(|i| i as u8)
            .collect();
        assert_eq!(device.texture_data(tex).unwrap(), expected);
    }

    #[test]
    fn test_read_surface_default_pool_stages_and_cleans_up() {
        let device = HeadlessDevice::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.tex");
        std::fs::write(&path, test_dds_blob(16, 16, *b"DXT5")).unwrap();

        let tex = read_surface(&device, &path, 0, false).unwrap();
        // the staging texture must be gone; only the target survives
        assert_eq!(device.live_texture_count(), 1);
        let expected: Vec<u8> = (0..CompressedFormat::Dxt5.storage_size(16, 16))
            .map(|i| i as u8)
            .collect();
        assert_eq!(device.texture_data(tex).unwrap(), expected);
    }

    #[test]
    fn test_read_surface_missing_file() {
        let device = HeadlessDevice::new();
        let dir = tempfile::tempdir().unwrap();
        let result = read_surface(&device, &dir.path().join("nope.tex"), 0, true);
        assert!(matches!(result, Err(DdsError::Io(_))));
        assert_eq!(device.live_texture_count(), 0);
    }

    #[test]
    fn test_archive_load_stops_at_requested_count() {
        let device = HeadlessDevice::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.tex");

        let mut archive = Vec::new();
        for _ in 0..5 {
            archive.extend_from_slice(&test_dds_blob(16, 16, *b"DXT1"));
        }
        std::fs::write(&path, &archive).unwrap();

        let textures = load_texture_archive(&device, &path, 3, true).unwrap();
        assert_eq!(textures.len(), 3);
        assert_eq!(device.live_texture_count(), 3);
    }

    #[test]
    fn test_short_archive_yields_fewer_textures() {
        let device = HeadlessDevice::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.tex");

        let mut archive = Vec::new();
        archive.extend_from_slice(&test_dds_blob(16, 16, *b"DXT1"));
        archive.extend_from_slice(&test_dds_blob(16, 16, *b"DXT1"));
        std::fs::write(&path, &archive).unwrap();

        let textures = load_texture_archive(&device, &path, 10, true).unwrap();
        assert_eq!(textures.len(), 2);
    }

    #[test]
    fn test_truncated_payload_stops_archive_scan() {
        let device = HeadlessDevice::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.tex");

        let mut archive = test_dds_blob(16, 16, *b"DXT1");
        let whole = test_dds_blob(16, 16, *b"DXT1");
        archive.extend_from_slice(&whole[..whole.len() / 2]);
        std::fs::write(&path, &archive).unwrap();

        let textures = load_texture_archive(&device, &path, 10, true).unwrap();
        assert_eq!(textures.len(), 1);
    }
}
