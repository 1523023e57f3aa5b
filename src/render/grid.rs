use kurbo::Rect;

use crate::backend::PageSize;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCell {
    pub row: u32,
    pub column: u32,
    /// Pixels of page content inside the cell; edge cells are narrower.
    pub width: u32,
    pub height: u32,
}

/// The regular grid of tiles covering one page at one scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileGrid {
    scaled: Rect,
    tile_width: u32,
    tile_height: u32,
}

impl TileGrid {
    pub fn new(page: PageSize, scale: f64, tile_width: u32, tile_height: u32) -> AppResult<Self> {
        if tile_width == 0 || tile_height == 0 {
            return Err(AppError::invalid_tile("tile dimensions must be positive"));
        }
        if !scale.is_finite() || scale <= 0.0 {
            return Err(AppError::invalid_tile("scale must be a positive finite value"));
        }
        Ok(Self {
            scaled: Rect::new(0.0, 0.0, page.width * scale, page.height * scale),
            tile_width,
            tile_height,
        })
    }

    pub fn columns(&self) -> u32 {
        (self.scaled.width() / f64::from(self.tile_width)).ceil().max(0.0) as u32
    }

    pub fn rows(&self) -> u32 {
        (self.scaled.height() / f64::from(self.tile_height)).ceil().max(0.0) as u32
    }

    pub fn len(&self) -> usize {
        self.columns() as usize * self.rows() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `None` when the cell starts at or past the page edge.
    pub fn cell(&self, row: u32, column: u32) -> Option<TileCell> {
        let width = clamped_extent(self.scaled.width(), column, self.tile_width)?;
        let height = clamped_extent(self.scaled.height(), row, self.tile_height)?;
        Some(TileCell {
            row,
            column,
            width,
            height,
        })
    }

    /// Row-major walk over every cell of the page.
    pub fn cells(&self) -> impl Iterator<Item = TileCell> + '_ {
        let columns = self.columns();
        (0..self.rows()).flat_map(move |row| {
            (0..columns).filter_map(move |column| self.cell(row, column))
        })
    }

    /// Cells overlapping `viewport`, given in scaled-page pixels.
    pub fn visible_cells(&self, viewport: Rect) -> Vec<TileCell> {
        let visible = self.scaled.intersect(viewport);
        if visible.width() <= 0.0 || visible.height() <= 0.0 {
            return Vec::new();
        }

        let tile_w = f64::from(self.tile_width);
        let tile_h = f64::from(self.tile_height);
        let first_column = (visible.x0 / tile_w).floor() as u32;
        let last_column = ((visible.x1 / tile_w).ceil() as u32).min(self.columns());
        let first_row = (visible.y0 / tile_h).floor() as u32;
        let last_row = ((visible.y1 / tile_h).ceil() as u32).min(self.rows());

        (first_row..last_row)
            .flat_map(|row| (first_column..last_column).map(move |column| (row, column)))
            .filter_map(|(row, column)| self.cell(row, column))
            .collect()
    }
}

fn clamped_extent(total: f64, index: u32, tile: u32) -> Option<u32> {
    let start = f64::from(index) * f64::from(tile);
    if start >= total {
        return None;
    }
    Some(((total - start).ceil() as u32).min(tile))
}
