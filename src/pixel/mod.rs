use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::AppError;

mod convert;

pub use convert::{ConvertFn, PixelFormatConverter, bgr24_to_rgb565, bgra32_to_rgb565};

/// In-memory pixel layouts. All buffers are row-major with a fixed stride of
/// `width * bytes_per_pixel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Blue, green, red, alpha. One byte each.
    #[default]
    Bgra32,
    /// Blue, green, red. One byte each.
    Bgr24,
    /// 5/6/5 bits of red/green/blue packed big-endian into two bytes.
    Rgb565,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra32 => 4,
            PixelFormat::Bgr24 => 3,
            PixelFormat::Rgb565 => 2,
        }
    }

    pub fn stride(self, width: u32) -> usize {
        width as usize * self.bytes_per_pixel()
    }

    /// Byte length of a `width` x `height` buffer, or `None` on overflow.
    pub fn buffer_len(self, width: u32, height: u32) -> Option<usize> {
        (width as usize)
            .checked_mul(self.bytes_per_pixel())?
            .checked_mul(height as usize)
    }

    /// Formats a backend can rasterize into directly.
    pub fn is_native(self) -> bool {
        matches!(self, PixelFormat::Bgra32 | PixelFormat::Bgr24)
    }

    /// Opaque white encoded in this format.
    pub fn white_pixel(self) -> &'static [u8] {
        match self {
            PixelFormat::Bgra32 => &[0xff, 0xff, 0xff, 0xff],
            PixelFormat::Bgr24 => &[0xff, 0xff, 0xff],
            PixelFormat::Rgb565 => &[0xff, 0xff],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Bgra32 => "bgra32",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Rgb565 => "rgb565",
        }
    }

    /// Expands a buffer in this format to straight RGBA8.
    pub fn to_rgba(self, pixels: &[u8]) -> Vec<u8> {
        let mut rgba = Vec::with_capacity(pixels.len() / self.bytes_per_pixel() * 4);
        match self {
            PixelFormat::Bgra32 => {
                for px in pixels.chunks_exact(4) {
                    rgba.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
                }
            }
            PixelFormat::Bgr24 => {
                for px in pixels.chunks_exact(3) {
                    rgba.extend_from_slice(&[px[2], px[1], px[0], 0xff]);
                }
            }
            PixelFormat::Rgb565 => {
                for px in pixels.chunks_exact(2) {
                    let packed = u16::from_be_bytes([px[0], px[1]]);
                    let r = ((packed >> 11) & 0x1f) as u8;
                    let g = ((packed >> 5) & 0x3f) as u8;
                    let b = (packed & 0x1f) as u8;
                    rgba.extend_from_slice(&[
                        (r << 3) | (r >> 2),
                        (g << 2) | (g >> 4),
                        (b << 3) | (b >> 2),
                        0xff,
                    ]);
                }
            }
        }
        rgba
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bgra32" | "bgra" => Ok(PixelFormat::Bgra32),
            "bgr24" | "bgr" => Ok(PixelFormat::Bgr24),
            "rgb565" | "565" => Ok(PixelFormat::Rgb565),
            other => Err(AppError::invalid_argument(format!(
                "unknown pixel format: {other}"
            ))),
        }
    }
}
