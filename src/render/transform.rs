use kurbo::{Affine, Point, Rect};
use serde::Deserialize;

use crate::backend::PageSize;

use super::request::TileRequest;

/// How the zoom scale relates to the on-screen display width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidthNormalization {
    /// Scale factors equal the requested scale.
    #[default]
    Off,
    /// Both axes use `scale * display_width / page_width`.
    DisplayWidth,
}

/// Scale plus tile origin. A page-space point `p` lands on tile pixel
/// `p * scale - translate`, so `translate` is the tile's top-left corner in
/// scaled-page pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileTransform {
    pub scale_x: f64,
    pub scale_y: f64,
    pub translate_x: f64,
    pub translate_y: f64,
}

impl TileTransform {
    pub fn compute(page: PageSize, request: &TileRequest, normalization: WidthNormalization) -> Self {
        let factor = match normalization {
            WidthNormalization::Off => request.scale(),
            WidthNormalization::DisplayWidth
                if page.width > 0.0 && request.display_width() > 0.0 =>
            {
                request.scale() * request.display_width() / page.width
            }
            WidthNormalization::DisplayWidth => request.scale(),
        };

        let (translate_x, translate_y) = request.origin_offset();

        Self {
            scale_x: factor,
            scale_y: factor,
            translate_x,
            translate_y,
        }
    }

    pub fn to_affine(&self) -> Affine {
        Affine::new([
            self.scale_x,
            0.0,
            0.0,
            self.scale_y,
            -self.translate_x,
            -self.translate_y,
        ])
    }

    /// Tile-pixel coordinates of a page-space point.
    pub fn apply(&self, page_point: Point) -> Point {
        self.to_affine() * page_point
    }

    /// Pixel extent of the whole page once scaled.
    pub fn scaled_page(&self, page: PageSize) -> Rect {
        Rect::new(0.0, 0.0, page.width * self.scale_x, page.height * self.scale_y)
    }
}

/// Region of the output bitmap the backend may paint, in tile pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipRect {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl ClipRect {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            left: 0.0,
            top: 0.0,
            right: f64::from(width),
            bottom: f64::from(height),
        }
    }

    pub fn to_rect(&self) -> Rect {
        Rect::new(self.left, self.top, self.right, self.bottom)
    }

    /// Integer pixel bounds clamped to a `width x height` bitmap.
    pub fn pixel_bounds(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let clamp = |value: f64, max: u32| value.round().clamp(0.0, f64::from(max)) as u32;
        (
            clamp(self.left, width),
            clamp(self.top, height),
            clamp(self.right, width),
            clamp(self.bottom, height),
        )
    }
}
