use std::path::Path;

use crate::error::{AppError, AppResult};
use crate::pixel::PixelFormat;
use crate::render::{ClipRect, TileTransform};

use super::handle::{DocumentHandle, PageHandle};

/// Page extent in page-space units.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PageSize {
    pub width: f64,
    pub height: f64,
}

impl PageSize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderFlags {
    /// Collapse color to luma after rasterizing.
    pub grayscale: bool,
}

/// Mutable view over a caller-owned pixel buffer the backend paints into.
#[derive(Debug)]
pub struct BitmapMut<'a> {
    data: &'a mut [u8],
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl<'a> BitmapMut<'a> {
    pub fn new(data: &'a mut [u8], width: u32, height: u32, format: PixelFormat) -> AppResult<Self> {
        if format.buffer_len(width, height) != Some(data.len()) {
            return Err(AppError::invalid_argument(
                "bitmap length does not match dimensions",
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            format,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn stride(&self) -> usize {
        self.format.stride(self.width)
    }

    pub fn data(&self) -> &[u8] {
        &*self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut *self.data
    }

    /// Writes one straight-alpha RGBA pixel, encoded in the bitmap format.
    pub fn put_rgba(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let bpp = self.format.bytes_per_pixel();
        let offset = y as usize * self.stride() + x as usize * bpp;
        let out = &mut self.data[offset..offset + bpp];
        match self.format {
            PixelFormat::Bgra32 => out.copy_from_slice(&[rgba[2], rgba[1], rgba[0], rgba[3]]),
            PixelFormat::Bgr24 => out.copy_from_slice(&[rgba[2], rgba[1], rgba[0]]),
            PixelFormat::Rgb565 => {
                let packed = (u16::from(rgba[0] >> 3) << 11)
                    | (u16::from(rgba[1] >> 2) << 5)
                    | u16::from(rgba[2] >> 3);
                out.copy_from_slice(&packed.to_be_bytes());
            }
        }
    }
}

/// The document decoding and rasterization collaborator.
///
/// Handles are opaque and generation-tagged: calls with a closed handle fail
/// with [`AppError::StaleHandle`] (or are no-ops for `close_*`) instead of
/// touching freed state. `rasterize` may be called concurrently for distinct
/// output buffers; an implementation that cannot paint one document from
/// several threads must serialize internally.
pub trait RasterBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn open_document(&self, path: &Path) -> AppResult<DocumentHandle>;
    fn close_document(&self, document: DocumentHandle);
    fn page_count(&self, document: DocumentHandle) -> usize;
    fn load_page(&self, document: DocumentHandle, index: usize) -> AppResult<PageHandle>;
    fn close_page(&self, page: PageHandle);
    fn page_size(&self, page: PageHandle) -> AppResult<PageSize>;
    fn rasterize(
        &self,
        page: PageHandle,
        target: &mut BitmapMut<'_>,
        transform: &TileTransform,
        clip: &ClipRect,
        flags: RenderFlags,
    ) -> AppResult<()>;
}
