use crate::error::{AppError, AppResult};
use crate::pixel::PixelFormat;

/// Largest accepted tile edge in pixels. A maximal BGRA tile is 256 MiB.
pub const MAX_TILE_EDGE: u32 = 8192;

/// Rejects empty tiles and tiles too large to allocate or rasterize.
pub(crate) fn check_tile_size(width: u32, height: u32) -> AppResult<()> {
    if width == 0 || height == 0 {
        return Err(AppError::invalid_tile(format!(
            "tile dimensions must be positive, got {width}x{height}"
        )));
    }
    if width > MAX_TILE_EDGE || height > MAX_TILE_EDGE {
        return Err(AppError::invalid_tile(format!(
            "tile {width}x{height} exceeds the {MAX_TILE_EDGE}px edge limit"
        )));
    }
    Ok(())
}

/// Where a tile sits on the scaled page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TileOrigin {
    /// Grid cell; fractional rows and columns are allowed.
    Grid { row: f64, column: f64 },
    /// Absolute top-left offset in scaled-page pixels.
    Pixel { x: f64, y: f64 },
}

impl TileOrigin {
    pub fn grid(row: f64, column: f64) -> Self {
        Self::Grid { row, column }
    }

    pub fn pixel(x: f64, y: f64) -> Self {
        Self::Pixel { x, y }
    }

    fn is_finite(&self) -> bool {
        match *self {
            Self::Grid { row, column } => row.is_finite() && column.is_finite(),
            Self::Pixel { x, y } => x.is_finite() && y.is_finite(),
        }
    }
}

/// One screen tile to render. Validated on construction so a request that
/// exists always describes a non-empty buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileRequest {
    page_index: usize,
    origin: TileOrigin,
    display_width: f64,
    tile_width: u32,
    tile_height: u32,
    scale: f64,
    pixel_format: PixelFormat,
}

impl TileRequest {
    pub fn new(
        page_index: usize,
        origin: TileOrigin,
        display_width: f64,
        tile_width: u32,
        tile_height: u32,
        scale: f64,
        pixel_format: PixelFormat,
    ) -> AppResult<Self> {
        check_tile_size(tile_width, tile_height)?;
        if !scale.is_finite() || scale <= 0.0 {
            return Err(AppError::invalid_tile(
                "scale must be a positive finite value",
            ));
        }
        if !display_width.is_finite() || display_width < 0.0 {
            return Err(AppError::invalid_tile(
                "display width must be a non-negative finite value",
            ));
        }
        if !origin.is_finite() {
            return Err(AppError::invalid_tile("tile origin must be finite"));
        }

        Ok(Self {
            page_index,
            origin,
            display_width,
            tile_width,
            tile_height,
            scale,
            pixel_format,
        })
    }

    /// Host-facing shape: signed sizes as they arrive from a display layer.
    #[allow(clippy::too_many_arguments)]
    pub fn from_host(
        page_index: i64,
        row: f64,
        column: f64,
        display_width: f64,
        tile_width: i64,
        tile_height: i64,
        scale: f64,
        pixel_format: PixelFormat,
    ) -> AppResult<Self> {
        let page_index = usize::try_from(page_index)
            .map_err(|_| AppError::invalid_tile(format!("page index {page_index} is negative")))?;
        let tile_width = u32::try_from(tile_width)
            .map_err(|_| AppError::invalid_tile(format!("tile width {tile_width} is out of range")))?;
        let tile_height = u32::try_from(tile_height).map_err(|_| {
            AppError::invalid_tile(format!("tile height {tile_height} is out of range"))
        })?;
        Self::new(
            page_index,
            TileOrigin::grid(row, column),
            display_width,
            tile_width,
            tile_height,
            scale,
            pixel_format,
        )
    }

    pub fn page_index(&self) -> usize {
        self.page_index
    }

    pub fn origin(&self) -> TileOrigin {
        self.origin
    }

    /// Top-left corner of the tile in scaled-page pixels.
    pub fn origin_offset(&self) -> (f64, f64) {
        match self.origin {
            TileOrigin::Grid { row, column } => (
                column * f64::from(self.tile_width),
                row * f64::from(self.tile_height),
            ),
            TileOrigin::Pixel { x, y } => (x, y),
        }
    }

    pub fn display_width(&self) -> f64 {
        self.display_width
    }

    pub fn tile_width(&self) -> u32 {
        self.tile_width
    }

    pub fn tile_height(&self) -> u32 {
        self.tile_height
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn buffer_len(&self) -> usize {
        // edges are capped at MAX_TILE_EDGE, so this cannot overflow
        self.pixel_format.bytes_per_pixel() * self.tile_width as usize * self.tile_height as usize
    }
}
