use std::time::{Duration, Instant};

use crate::backend::{BitmapMut, PageHandle, PageSize, RasterBackend, RenderFlags};
use crate::error::{AppError, AppResult};
use crate::pixel::{PixelFormat, PixelFormatConverter};

use super::buffer::TileBuffer;
use super::request::TileRequest;
use super::transform::{ClipRect, TileTransform, WidthNormalization};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RenderTiming {
    pub raster: Duration,
    pub convert: Option<Duration>,
}

/// Paints one tile of a page into a caller-owned buffer.
///
/// The buffer is background-filled before anything else happens and is
/// refilled if the backend fails, so it is always fully populated when this
/// returns.
#[derive(Debug, Clone, Default)]
pub struct TileRenderer {
    converter: PixelFormatConverter,
    normalization: WidthNormalization,
    flags: RenderFlags,
}

impl TileRenderer {
    pub fn new(converter: PixelFormatConverter, normalization: WidthNormalization) -> Self {
        Self {
            converter,
            normalization,
            flags: RenderFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: RenderFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn normalization(&self) -> WidthNormalization {
        self.normalization
    }

    pub fn converter(&self) -> &PixelFormatConverter {
        &self.converter
    }

    /// Native format the backend paints in for a requested output format.
    pub fn raster_format_for(&self, target: PixelFormat) -> AppResult<PixelFormat> {
        self.converter
            .native_source_for(target)
            .ok_or(AppError::UnsupportedConversion {
                from: PixelFormat::Bgra32,
                to: target,
            })
    }

    pub fn transform_for(&self, page_size: PageSize, request: &TileRequest) -> TileTransform {
        TileTransform::compute(page_size, request, self.normalization)
    }

    pub fn render_tile(
        &self,
        backend: &dyn RasterBackend,
        page: PageHandle,
        page_size: PageSize,
        request: &TileRequest,
        into: &mut TileBuffer,
    ) -> AppResult<RenderTiming> {
        if into.width() != request.tile_width()
            || into.height() != request.tile_height()
            || into.format() != request.pixel_format()
        {
            return Err(AppError::invalid_argument(
                "tile buffer does not match the request",
            ));
        }

        into.fill_background();
        let result = self.paint(backend, page, page_size, request, into);
        if result.is_err() {
            into.fill_background();
        }
        result
    }

    fn paint(
        &self,
        backend: &dyn RasterBackend,
        page: PageHandle,
        page_size: PageSize,
        request: &TileRequest,
        into: &mut TileBuffer,
    ) -> AppResult<RenderTiming> {
        let transform = self.transform_for(page_size, request);
        let clip = ClipRect::full(request.tile_width(), request.tile_height());
        let target = request.pixel_format();
        let raster_format = self.raster_format_for(target)?;

        if raster_format == target {
            let started = Instant::now();
            let mut bitmap = into.bitmap_mut()?;
            backend.rasterize(page, &mut bitmap, &transform, &clip, self.flags)?;
            return Ok(RenderTiming {
                raster: started.elapsed(),
                convert: None,
            });
        }

        let (width, height) = (request.tile_width(), request.tile_height());
        let white = raster_format.white_pixel();
        let mut scratch = white.repeat(width as usize * height as usize);

        let started = Instant::now();
        {
            let mut bitmap = BitmapMut::new(&mut scratch, width, height, raster_format)?;
            backend.rasterize(page, &mut bitmap, &transform, &clip, self.flags)?;
        }
        let raster = started.elapsed();

        let started = Instant::now();
        self.converter
            .convert_into(&scratch, raster_format, into.pixels_mut(), target, width, height)?;
        Ok(RenderTiming {
            raster,
            convert: Some(started.elapsed()),
        })
    }
}
