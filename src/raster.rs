//! BMP output for the preview UI.
//!
//! The UI reads a single, fixed path and expects a top-down 24-bit BMP. The
//! header never changes at runtime, so it is built once and reused. Each frame
//! is written to a sibling temporary file and renamed over the destination, so
//! a reader sees either the previous frame or the new one, never a torn mix.

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::{HEIGHT, PIXEL_BYTES, WIDTH};

/// Size of the BITMAPFILEHEADER + BITMAPINFOHEADER pair.
pub const HEADER_LEN: usize = 54;

const SIGNATURE: &[u8; 2] = b"BM";
const INFO_HEADER_LEN: u32 = 40;
const BITS_PER_PIXEL: u16 = 24;
/// 72 DPI expressed in pixels per metre.
const PIXELS_PER_METRE: i32 = 2835;

// Rows are written without padding, so a row must already be 4-byte aligned.
const _: () = assert!((WIDTH * 3) % 4 == 0, "frame rows would need padding");

const FRAME_HEADER: [u8; HEADER_LEN] = frame_header();

const fn put_u32(mut bytes: [u8; HEADER_LEN], offset: usize, value: [u8; 4]) -> [u8; HEADER_LEN] {
    bytes[offset] = value[0];
    bytes[offset + 1] = value[1];
    bytes[offset + 2] = value[2];
    bytes[offset + 3] = value[3];
    bytes
}

const fn frame_header() -> [u8; HEADER_LEN] {
    let image_size = PIXEL_BYTES as u32;
    let mut bytes = [0u8; HEADER_LEN];
    bytes[0] = SIGNATURE[0];
    bytes[1] = SIGNATURE[1];
    bytes = put_u32(bytes, 2, (HEADER_LEN as u32 + image_size).to_le_bytes());
    // 6..10 reserved
    bytes = put_u32(bytes, 10, (HEADER_LEN as u32).to_le_bytes());
    bytes = put_u32(bytes, 14, INFO_HEADER_LEN.to_le_bytes());
    bytes = put_u32(bytes, 18, (WIDTH as i32).to_le_bytes());
    // negative height: rows are stored top-down
    bytes = put_u32(bytes, 22, (-(HEIGHT as i32)).to_le_bytes());
    bytes[26] = 1;
    let bpp = BITS_PER_PIXEL.to_le_bytes();
    bytes[28] = bpp[0];
    bytes[29] = bpp[1];
    // 30..34 compression = BI_RGB (0)
    bytes = put_u32(bytes, 34, image_size.to_le_bytes());
    bytes = put_u32(bytes, 38, PIXELS_PER_METRE.to_le_bytes());
    bytes = put_u32(bytes, 42, PIXELS_PER_METRE.to_le_bytes());
    // 46..54 palette counts = 0
    bytes
}

/// Fixed 54-byte raster header for an uncompressed top-down 24-bit image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RasterHeader {
    bytes: [u8; HEADER_LEN],
}

impl RasterHeader {
    /// Header for the camera's fixed frame size.
    pub const fn for_frame() -> Self {
        Self {
            bytes: FRAME_HEADER,
        }
    }

    pub fn as_bytes(&self) -> &[u8; HEADER_LEN] {
        &self.bytes
    }

    pub fn file_size(&self) -> u32 {
        read_u32(&self.bytes, 2)
    }

    pub fn pixel_offset(&self) -> u32 {
        read_u32(&self.bytes, 10)
    }

    pub fn width(&self) -> i32 {
        read_u32(&self.bytes, 18) as i32
    }

    pub fn height(&self) -> i32 {
        read_u32(&self.bytes, 22) as i32
    }

    pub fn image_size(&self) -> u32 {
        read_u32(&self.bytes, 34)
    }
}

fn read_u32(bytes: &[u8; HEADER_LEN], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Publishes the latest frame to a fixed path.
#[derive(Clone, Debug)]
pub struct OutputWriter {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl OutputWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut tmp_name = path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);
        Self { path, tmp_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the destination directory if it does not exist yet.
    pub fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create output directory {}", parent.display())
                })?;
            }
        }
        Ok(())
    }

    /// Write header and pixels as one complete file.
    pub fn write_image(&self, header: &RasterHeader, pixels: &[u8]) -> Result<()> {
        let expected = header.image_size() as usize;
        if pixels.len() != expected {
            return Err(anyhow!(
                "pixel buffer length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        self.write_atomic(header.as_bytes(), pixels)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    fn write_atomic(&self, header: &[u8], pixels: &[u8]) -> Result<()> {
        {
            let mut file = File::create(&self.tmp_path)?;
            file.write_all(header)?;
            file.write_all(pixels)?;
            file.sync_all()?;
        }
        fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }
}

/// Size in bytes of a complete frame file.
pub const fn frame_file_len() -> usize {
    HEADER_LEN + PIXEL_BYTES
}
