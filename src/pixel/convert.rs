use std::collections::HashMap;

use crate::error::{AppError, AppResult};

use super::PixelFormat;

/// Converts `width * height` pixels from `src` into `dst`. Both slices are
/// already sized for their formats.
pub type ConvertFn = fn(src: &[u8], dst: &mut [u8]);

/// Pixel format conversions keyed by (source, destination).
///
/// Conversions are pure: the same input always yields byte-identical output.
#[derive(Debug, Clone)]
pub struct PixelFormatConverter {
    converters: HashMap<(PixelFormat, PixelFormat), ConvertFn>,
}

impl Default for PixelFormatConverter {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(PixelFormat::Bgr24, PixelFormat::Rgb565, bgr24_to_rgb565);
        registry.register(PixelFormat::Bgra32, PixelFormat::Rgb565, bgra32_to_rgb565);
        registry.register(PixelFormat::Bgra32, PixelFormat::Bgr24, bgra32_to_bgr24);
        registry.register(PixelFormat::Bgr24, PixelFormat::Bgra32, bgr24_to_bgra32);
        registry
    }
}

impl PixelFormatConverter {
    pub fn empty() -> Self {
        Self {
            converters: HashMap::new(),
        }
    }

    pub fn register(&mut self, from: PixelFormat, to: PixelFormat, convert: ConvertFn) {
        self.converters.insert((from, to), convert);
    }

    pub fn supports(&self, from: PixelFormat, to: PixelFormat) -> bool {
        from == to || self.converters.contains_key(&(from, to))
    }

    /// Picks the native format to rasterize in before converting to `target`.
    /// The most compact native source wins.
    pub fn native_source_for(&self, target: PixelFormat) -> Option<PixelFormat> {
        if target.is_native() {
            return Some(target);
        }
        [PixelFormat::Bgr24, PixelFormat::Bgra32]
            .into_iter()
            .find(|source| self.converters.contains_key(&(*source, target)))
    }

    pub fn convert(
        &self,
        src: &[u8],
        from: PixelFormat,
        to: PixelFormat,
        width: u32,
        height: u32,
    ) -> AppResult<Vec<u8>> {
        let len = to.buffer_len(width, height).ok_or_else(|| {
            AppError::invalid_argument(format!("{width}x{height} pixels overflow a buffer"))
        })?;
        let mut dst = vec![0_u8; len];
        self.convert_into(src, from, &mut dst, to, width, height)?;
        Ok(dst)
    }

    pub fn convert_into(
        &self,
        src: &[u8],
        from: PixelFormat,
        dst: &mut [u8],
        to: PixelFormat,
        width: u32,
        height: u32,
    ) -> AppResult<()> {
        if from.buffer_len(width, height) != Some(src.len()) {
            return Err(AppError::invalid_argument(
                "source pixels length does not match dimensions",
            ));
        }
        if to.buffer_len(width, height) != Some(dst.len()) {
            return Err(AppError::invalid_argument(
                "destination pixels length does not match dimensions",
            ));
        }
        if from == to {
            dst.copy_from_slice(src);
            return Ok(());
        }

        let convert = self
            .converters
            .get(&(from, to))
            .ok_or(AppError::UnsupportedConversion { from, to })?;
        convert(src, dst);
        Ok(())
    }
}

fn pack_rgb565(r: u8, g: u8, b: u8) -> [u8; 2] {
    let packed = (u16::from(r >> 3) << 11) | (u16::from(g >> 2) << 5) | u16::from(b >> 3);
    packed.to_be_bytes()
}

pub fn bgr24_to_rgb565(src: &[u8], dst: &mut [u8]) {
    for (px, out) in src.chunks_exact(3).zip(dst.chunks_exact_mut(2)) {
        out.copy_from_slice(&pack_rgb565(px[2], px[1], px[0]));
    }
}

pub fn bgra32_to_rgb565(src: &[u8], dst: &mut [u8]) {
    for (px, out) in src.chunks_exact(4).zip(dst.chunks_exact_mut(2)) {
        out.copy_from_slice(&pack_rgb565(px[2], px[1], px[0]));
    }
}

fn bgra32_to_bgr24(src: &[u8], dst: &mut [u8]) {
    for (px, out) in src.chunks_exact(4).zip(dst.chunks_exact_mut(3)) {
        out.copy_from_slice(&px[..3]);
    }
}

fn bgr24_to_bgra32(src: &[u8], dst: &mut [u8]) {
    for (px, out) in src.chunks_exact(3).zip(dst.chunks_exact_mut(4)) {
        out[..3].copy_from_slice(px);
        out[3] = 0xff;
    }
}
