use std::collections::HashMap;
use std::sync::Arc;

use hayro::hayro_interpret::encode::EncodedShadingPattern;
use hayro::hayro_interpret::font::{Glyph, OutlineGlyph};
use hayro::hayro_interpret::pattern::Pattern;
use hayro::hayro_interpret::{
    BlendMode, CacheKey, ClipPath, Context, Device, FillRule, GlyphDrawMode, Image as PdfImage,
    InterpreterSettings, LumaData, MaskType, PageExt, Paint, PathDrawMode, RectExt, RgbData,
    SoftMask, StrokeProps, interpret_page,
};
use hayro::hayro_syntax::page::Page;
use hayro::vello_cpu::color::palette::css::{BLACK, WHITE};
use hayro::vello_cpu::color::{AlphaColor, PremulRgba8, Srgb};
use hayro::vello_cpu::peniko::{self, Compose, Fill, ImageQuality, ImageSampler, Mix};
use hayro::vello_cpu::{
    Image, ImageSource, Level, Mask, PaintType, Pixmap, RenderContext, RenderMode, RenderSettings,
};
use kurbo::{Affine, BezPath, Point, Rect, Shape, Vec2};

/// Tiling pattern cells are rasterized once and repeated; cap their size.
const MAX_PATTERN_CELL: f32 = 3000.0;

/// Interprets `page` straight into a `width` x `height` pixmap. `tile` maps
/// top-down page points to tile pixels, so only content under the tile is
/// rasterized whatever the zoom.
pub(super) fn paint_tile<'a>(
    page: &Page<'a>,
    tile: Affine,
    width: u16,
    height: u16,
    settings: &InterpreterSettings,
) -> Pixmap {
    let initial_transform = tile * page.initial_transform(true);
    let bounds = Rect::new(0.0, 0.0, f64::from(width), f64::from(height));
    let mut context = Context::new(initial_transform, bounds, page.xref(), settings.clone());
    let mut canvas = TileCanvas::new(width, height, canvas_settings());

    canvas.ctx.set_paint(WHITE);
    canvas.ctx.fill_rect(&bounds);

    let mut crop = page.intersected_crop_box().to_kurbo().to_path(0.1);
    crop.apply_affine(initial_transform);
    canvas.push_clip_path(&ClipPath {
        path: crop,
        fill: FillRule::NonZero,
    });
    canvas.push_transparency_group(1.0, None, BlendMode::Normal);
    interpret_page(page, &mut context, &mut canvas);
    canvas.pop_transparency_group();
    canvas.pop_clip_path();

    let mut pixmap = Pixmap::new(width, height);
    canvas.ctx.render_to_pixmap(&mut pixmap);
    pixmap
}

fn canvas_settings() -> RenderSettings {
    RenderSettings {
        level: Level::new(),
        num_threads: 0,
        render_mode: RenderMode::OptimizeSpeed,
    }
}

struct TileCanvas {
    ctx: RenderContext,
    inside_pattern: bool,
    in_type3_glyph: bool,
    blend_mode: BlendMode,
    soft_masks: HashMap<u128, Mask>,
    glyph_outlines: HashMap<u128, BezPath>,
}

impl TileCanvas {
    fn new(width: u16, height: u16, settings: RenderSettings) -> Self {
        Self {
            ctx: RenderContext::new_with(width, height, settings),
            inside_pattern: false,
            in_type3_glyph: false,
            blend_mode: BlendMode::default(),
            soft_masks: HashMap::new(),
            glyph_outlines: HashMap::new(),
        }
    }

    fn child(&self, width: u16, height: u16) -> Self {
        Self::new(width, height, *self.ctx.render_settings())
    }

    fn finish(mut self) -> Pixmap {
        let mut pixmap = Pixmap::new(self.ctx.width(), self.ctx.height());
        self.ctx.flush();
        self.ctx.render_to_pixmap(&mut pixmap);
        pixmap
    }

    fn with_blend(&mut self, op: impl FnOnce(&mut Self)) {
        let push = self.blend_mode != BlendMode::default();
        if push {
            self.ctx.push_blend_layer(blend_mode(self.blend_mode));
        }
        op(self);
        if push {
            self.ctx.pop_layer();
        }
    }

    fn soft_mask(&mut self, mask: &SoftMask<'_>) -> Mask {
        let (width, height) = (self.ctx.width(), self.ctx.height());
        let settings = *self.ctx.render_settings();
        self.soft_masks
            .entry(mask.cache_key())
            .or_insert_with(|| render_soft_mask(mask, settings, width, height))
            .clone()
    }

    fn set_stroke(&mut self, props: &StrokeProps, is_text: bool) {
        // PDF asks for hairlines to stay at least one device pixel wide;
        // text uses a lower floor so small glyphs do not bloat.
        let floor = if is_text { 0.25 } else { 1.0 };
        let factor = min_factor(self.ctx.transform());
        let mut line_width = props.line_width.max(0.01);
        let device_width = line_width * factor;
        if device_width < floor && !self.inside_pattern {
            line_width = line_width / device_width * floor;
        }

        self.ctx.set_stroke(kurbo::Stroke {
            width: f64::from(line_width),
            join: props.line_join,
            miter_limit: f64::from(props.miter_limit),
            start_cap: props.line_cap,
            end_cap: props.line_cap,
            dash_pattern: props.dash_array.iter().map(|n| f64::from(*n)).collect(),
            dash_offset: f64::from(props.dash_offset),
        });
    }

    fn push_device_clip(&mut self, path: &BezPath, fill: FillRule) {
        let transform = *self.ctx.transform();
        self.ctx.set_fill_rule(fill_rule(fill));
        self.ctx.set_transform(Affine::IDENTITY);
        self.ctx.push_clip_path(path);
        self.ctx.set_transform(transform);
    }

    /// Installs `paint` for the next fill or stroke of `path`. Returns a
    /// device-space clip the caller must push around the draw.
    #[must_use]
    fn set_paint(&mut self, paint: &Paint<'_>, path: &BezPath, is_stroke: bool) -> Option<BezPath> {
        let mut paint_transform = Affine::IDENTITY;
        let mut clip = None;

        let paint: PaintType = match paint {
            Paint::Color(color) => {
                let [r, g, b, a] = color.to_rgba().to_rgba8();
                AlphaColor::<Srgb>::from_rgba8(r, g, b, a).into()
            }
            Paint::Pattern(pattern) => {
                let path_transform = *self.ctx.transform();
                match &**pattern {
                    Pattern::Shading(shading) => {
                        clip = shading.shading.clip_path.clone();
                        let mut bbox = (path_transform * path.clone()).bounding_box();
                        if is_stroke {
                            let (a1, a2) = x_y_advances(&path_transform);
                            let grow = a1.length().max(a2.length()) * self.ctx.stroke().width;
                            bbox = bbox.inflate(grow, grow);
                        }
                        bbox = bbox.intersect(Rect::new(
                            0.0,
                            0.0,
                            f64::from(self.ctx.width()),
                            f64::from(self.ctx.height()),
                        ));

                        let (texture, width, height, origin) =
                            shading_texture(bbox, &shading.encode());
                        paint_transform = path_transform.inverse() * origin;
                        let pixmap = Pixmap::from_parts(texture, width, height);
                        PaintType::Image(repeat_image(pixmap))
                    }
                    Pattern::Tiling(tiling) => {
                        let bbox = tiling.bbox;
                        let (mut xs, mut ys) = {
                            let (x, y) = x_y_advances(&tiling.matrix);
                            (x.length() as f32, y.length() as f32)
                        };
                        xs = xs
                            .max(1.0 / bbox.width() as f32)
                            .min(MAX_PATTERN_CELL / bbox.width() as f32);
                        ys = ys
                            .max(1.0 / bbox.height() as f32)
                            .min(MAX_PATTERN_CELL / bbox.height() as f32);

                        let x_step = xs * tiling.x_step;
                        let y_step = ys * tiling.y_step;
                        let cell_width = x_step.abs().round().max(1.0) as u16;
                        let cell_height = y_step.abs().round().max(1.0) as u16;

                        let mut cell = self.child(cell_width, cell_height);
                        cell.inside_pattern = true;
                        let mut cell_transform = Affine::scale_non_uniform(f64::from(xs), f64::from(ys))
                            * Affine::translate((-bbox.x0, -bbox.y0));
                        tiling.interpret(&mut cell, cell_transform, is_stroke);
                        let pixmap = cell.finish();

                        if x_step < 0.0 {
                            let flipped_width = bbox.width() * f64::from(xs);
                            cell_transform *= Affine::new([-1.0, 0.0, 0.0, 1.0, flipped_width, 0.0]);
                        }
                        if y_step < 0.0 {
                            let flipped_height = bbox.height() * f64::from(ys);
                            cell_transform *= Affine::new([1.0, 0.0, 0.0, -1.0, 0.0, flipped_height]);
                        }
                        paint_transform =
                            path_transform.inverse() * tiling.matrix * cell_transform.inverse();
                        PaintType::Image(repeat_image(pixmap))
                    }
                }
            }
        };

        self.ctx.set_paint_transform(paint_transform);
        self.ctx.set_paint(paint);
        clip
    }

    fn fill_path(&mut self, path: &BezPath, transform: Affine, paint: &Paint<'_>, fill: FillRule) {
        self.ctx.set_fill_rule(fill_rule(fill));
        self.ctx.set_transform(transform);
        let clip = self.set_paint(paint, path, false);
        if let Some(clip) = &clip {
            self.push_device_clip(clip, fill);
        }
        self.with_blend(|canvas| canvas.ctx.fill_path(path));
        if clip.is_some() {
            self.ctx.pop_clip_path();
        }
    }

    fn stroke_path(
        &mut self,
        path: &BezPath,
        transform: Affine,
        paint: &Paint<'_>,
        props: &StrokeProps,
        is_text: bool,
    ) {
        self.ctx.set_transform(transform);
        self.set_stroke(props, is_text);
        let clip = self.set_paint(paint, path, true);
        if let Some(clip) = &clip {
            self.push_device_clip(clip, FillRule::NonZero);
        }
        self.with_blend(|canvas| canvas.ctx.stroke_path(path));
        if clip.is_some() {
            self.ctx.pop_clip_path();
        }
    }

    fn glyph_outline(&mut self, glyph: &OutlineGlyph) -> BezPath {
        self.glyph_outlines
            .entry(glyph.identifier().cache_key())
            .or_insert_with(|| glyph.outline())
            .clone()
    }

    /// Draws decoded image samples with the current transform. The image's
    /// unit square maps to `width` x `height` sample space.
    fn draw_samples(&mut self, rgb: RgbData, alpha: Option<LumaData>) {
        let transform = *self.ctx.transform();
        let pixels: Vec<PremulRgba8> = match alpha {
            None => rgb
                .data
                .chunks_exact(3)
                .map(|px| premultiply(px[0], px[1], px[2], 255))
                .collect(),
            Some(alpha)
                if alpha.width != rgb.width
                    || alpha.height != rgb.height
                    || alpha.interpolate != rgb.interpolate =>
            {
                return self.draw_samples_with_mask(rgb, alpha);
            }
            Some(alpha) => rgb
                .data
                .chunks_exact(3)
                .zip(alpha.data)
                .map(|(px, a)| premultiply(px[0], px[1], px[2], a))
                .collect(),
        };

        let (x_scale, y_scale) = {
            let (x, y) = x_y_advances(&transform);
            (x.length(), y.length())
        };
        let quality = if self.in_type3_glyph {
            ImageQuality::High
        } else if rgb.interpolate || x_scale < 1.0 || y_scale < 1.0 {
            ImageQuality::Medium
        } else {
            ImageQuality::Low
        };

        let Some((width, height)) = pixmap_dims(rgb.width, rgb.height) else {
            return;
        };
        if pixels.len() != usize::from(width) * usize::from(height) {
            return;
        }
        let pixmap = Pixmap::from_parts(pixels, width, height);
        self.with_blend(|canvas| canvas.draw_pixmap(Arc::new(pixmap), quality, transform));
    }

    fn draw_samples_with_mask(&mut self, rgb: RgbData, alpha: LumaData) {
        let mask = {
            let transform = *self.ctx.transform()
                * Affine::scale_non_uniform(
                    f64::from(rgb.width) / f64::from(alpha.width),
                    f64::from(rgb.height) / f64::from(alpha.height),
                );
            let mut mask_canvas = self.child(self.ctx.width(), self.ctx.height());
            let opaque = RgbData {
                data: vec![0; alpha.width as usize * alpha.height as usize * 3],
                width: alpha.width,
                height: alpha.height,
                interpolate: alpha.interpolate,
                scale_factors: alpha.scale_factors,
            };
            mask_canvas.ctx.set_transform(transform);
            mask_canvas.draw_samples(opaque, Some(alpha));
            Mask::new_alpha(&mask_canvas.finish())
        };

        self.ctx.push_mask_layer(mask);
        self.draw_samples(rgb, None);
        self.ctx.pop_layer();
    }

    fn draw_pixmap(&mut self, pixmap: Arc<Pixmap>, quality: ImageQuality, transform: Affine) {
        let bounds = Rect::new(0.0, 0.0, f64::from(pixmap.width()), f64::from(pixmap.height()));
        self.ctx.set_transform(transform);
        self.ctx.set_paint(Image {
            image: ImageSource::Pixmap(pixmap),
            sampler: ImageSampler {
                x_extend: peniko::Extend::Pad,
                y_extend: peniko::Extend::Pad,
                quality,
                alpha: 1.0,
            },
        });
        self.ctx.fill_rect(&bounds);
    }

    fn draw_stencil(&mut self, stencil: LumaData, paint: &Paint<'_>, transform: Affine) {
        match paint {
            Paint::Color(color) => {
                let [r, g, b, a] = color.to_rgba().to_rgba8();
                let layered = a != 255 || self.blend_mode != BlendMode::default();
                self.ctx.set_transform(transform);
                if layered {
                    self.ctx.push_layer(
                        None,
                        Some(blend_mode(self.blend_mode)),
                        Some(f32::from(a) / 255.0),
                        None,
                        None,
                    );
                }
                let previous_rule = *self.ctx.fill_rule();
                self.ctx.set_fill_rule(Fill::NonZero);
                let rgb = RgbData {
                    data: stencil.data.iter().flat_map(|_| [r, g, b]).collect(),
                    width: stencil.width,
                    height: stencil.height,
                    interpolate: stencil.interpolate,
                    scale_factors: stencil.scale_factors,
                };
                self.draw_samples(rgb, Some(stencil));
                if layered {
                    self.ctx.pop_layer();
                }
                self.ctx.set_fill_rule(previous_rule);
            }
            Paint::Pattern(_) => {
                let area = Rect::new(0.0, 0.0, f64::from(stencil.width), f64::from(stencil.height));
                let coverage = {
                    let white = RgbData {
                        data: vec![255; stencil.width as usize * stencil.height as usize * 3],
                        width: stencil.width,
                        height: stencil.height,
                        interpolate: stencil.interpolate,
                        scale_factors: stencil.scale_factors,
                    };
                    let mut mask_canvas = self.child(self.ctx.width(), self.ctx.height());
                    mask_canvas.ctx.set_transform(transform);
                    mask_canvas.draw_samples(white, Some(stencil));
                    mask_canvas.finish()
                };

                self.ctx.push_layer(
                    None,
                    Some(blend_mode(self.blend_mode)),
                    None,
                    Some(Mask::new_luminance(&coverage)),
                    None,
                );
                self.ctx.set_transform(transform);
                let clip = self.set_paint(paint, &area.to_path(0.1), true);
                if let Some(clip) = &clip {
                    self.push_device_clip(clip, FillRule::NonZero);
                }
                self.ctx.fill_rect(&area);
                if clip.is_some() {
                    self.ctx.pop_clip_path();
                }
                self.ctx.pop_layer();
            }
        }
    }
}

impl<'a> Device<'a> for TileCanvas {
    fn set_soft_mask(&mut self, mask: Option<SoftMask<'a>>) {
        match mask {
            Some(mask) => {
                let rendered = self.soft_mask(&mask);
                self.ctx.set_mask(rendered);
            }
            None => self.ctx.reset_mask(),
        }
    }

    fn set_blend_mode(&mut self, blend_mode: BlendMode) {
        self.blend_mode = blend_mode;
    }

    fn draw_path(
        &mut self,
        path: &BezPath,
        transform: Affine,
        paint: &Paint<'a>,
        draw_mode: &PathDrawMode,
    ) {
        match draw_mode {
            PathDrawMode::Fill(fill) => self.fill_path(path, transform, paint, *fill),
            PathDrawMode::Stroke(props) => self.stroke_path(path, transform, paint, props, false),
        }
    }

    fn push_clip_path(&mut self, clip_path: &ClipPath) {
        self.push_device_clip(&clip_path.path, clip_path.fill);
    }

    fn push_transparency_group(
        &mut self,
        opacity: f32,
        mask: Option<SoftMask<'a>>,
        blend: BlendMode,
    ) {
        let mask = mask.map(|mask| self.soft_mask(&mask));
        self.ctx
            .push_layer(None, Some(blend_mode(blend)), Some(opacity), mask, None);
    }

    fn draw_glyph(
        &mut self,
        glyph: &Glyph<'a>,
        transform: Affine,
        glyph_transform: Affine,
        paint: &Paint<'a>,
        draw_mode: &GlyphDrawMode,
    ) {
        match (glyph, draw_mode) {
            (_, GlyphDrawMode::Invisible) => {}
            (Glyph::Outline(outline), GlyphDrawMode::Fill) => {
                let path = self.glyph_outline(outline);
                self.fill_path(&path, transform * glyph_transform, paint, FillRule::NonZero);
            }
            (Glyph::Outline(outline), GlyphDrawMode::Stroke(props)) => {
                let path = glyph_transform * self.glyph_outline(outline);
                self.stroke_path(&path, transform, paint, props, true);
            }
            (Glyph::Type3(shape), _) => {
                self.in_type3_glyph = true;
                self.with_blend(|canvas| shape.interpret(canvas, transform, glyph_transform, paint));
                self.in_type3_glyph = false;
            }
        }
    }

    fn draw_image(&mut self, image: PdfImage<'a, '_>, mut transform: Affine) {
        self.ctx.set_paint_transform(Affine::IDENTITY);
        self.ctx.set_aliasing_threshold(Some(1));

        let target_width = (transform * Point::new(f64::from(image.width()), 0.0))
            .to_vec2()
            .length()
            .ceil() as u32;
        let target_height = (transform * Point::new(0.0, f64::from(image.height())))
            .to_vec2()
            .length()
            .ceil() as u32;
        let target = Some((target_width, target_height));

        match image {
            PdfImage::Stencil(stencil) => stencil.with_stencil(
                |luma, paint| {
                    transform *= Affine::scale_non_uniform(
                        f64::from(luma.scale_factors.0),
                        f64::from(luma.scale_factors.1),
                    );
                    self.draw_stencil(luma, paint, transform);
                },
                target,
            ),
            PdfImage::Raster(raster) => raster.with_rgba(
                |rgb, alpha| {
                    transform *= Affine::scale_non_uniform(
                        f64::from(rgb.scale_factors.0),
                        f64::from(rgb.scale_factors.1),
                    );
                    self.ctx.set_transform(transform);
                    self.with_blend(|canvas| canvas.draw_samples(rgb, alpha));
                },
                target,
            ),
        }

        self.ctx.set_aliasing_threshold(None);
    }

    fn pop_clip_path(&mut self) {
        self.ctx.pop_clip_path();
    }

    fn pop_transparency_group(&mut self) {
        self.ctx.pop_layer();
    }
}

fn render_soft_mask(mask: &SoftMask<'_>, settings: RenderSettings, width: u16, height: u16) -> Mask {
    let mut canvas = TileCanvas::new(width, height, settings);
    let backdrop = mask.background_color().to_rgba();
    let painted_backdrop = backdrop.to_rgba8() != BLACK.to_rgba8().to_u8_array();
    if painted_backdrop {
        canvas
            .ctx
            .set_paint(AlphaColor::<Srgb>::new(backdrop.components()));
        canvas
            .ctx
            .fill_rect(&Rect::new(0.0, 0.0, f64::from(width), f64::from(height)));
        canvas.ctx.push_layer(None, None, None, None, None);
    }
    mask.interpret(&mut canvas);
    if painted_backdrop {
        canvas.ctx.pop_layer();
    }

    let pixmap = canvas.finish();
    let rendered = match mask.mask_type() {
        MaskType::Luminosity => Mask::new_luminance(&pixmap),
        MaskType::Alpha => Mask::new_alpha(&pixmap),
    };
    let Some(transfer) = mask.transfer_function() else {
        return rendered;
    };

    let mut mapped = Vec::with_capacity(usize::from(rendered.width()) * usize::from(rendered.height()));
    for y in 0..rendered.height() {
        for x in 0..rendered.width() {
            let value = f32::from(rendered.sample(x, y)) / 255.0;
            mapped.push((transfer.apply(value) * 255.0 + 0.5) as u8);
        }
    }
    Mask::from_parts(mapped, rendered.width(), rendered.height())
}

/// Samples a shading over `bbox` (device pixels) into a texture. Returns the
/// texture and the transform placing it back at `bbox`.
fn shading_texture(bbox: Rect, shading: &EncodedShadingPattern) -> (Vec<PremulRgba8>, u16, u16, Affine) {
    let width = (bbox.width().max(1.0).ceil() as u32).min(u32::from(u16::MAX));
    let height = (bbox.height().max(1.0).ceil() as u32).min(u32::from(u16::MAX));
    let (x_advance, y_advance) = x_y_advances(&shading.base_transform);

    let mut texture = Vec::with_capacity(width as usize * height as usize);
    let mut row_start =
        shading.base_transform * Affine::translate((0.5, 0.5)) * Point::new(bbox.x0, bbox.y0);
    for _ in 0..height {
        let mut point = row_start;
        for _ in 0..width {
            texture.push(AlphaColor::<Srgb>::new(shading.sample(point)).premultiply().to_rgba8());
            point += x_advance;
        }
        row_start += y_advance;
    }

    (
        texture,
        width as u16,
        height as u16,
        Affine::translate((bbox.x0, bbox.y0)),
    )
}

fn repeat_image(pixmap: Pixmap) -> Image {
    Image {
        image: ImageSource::Pixmap(Arc::new(pixmap)),
        sampler: ImageSampler {
            x_extend: peniko::Extend::Repeat,
            y_extend: peniko::Extend::Repeat,
            quality: ImageQuality::Medium,
            alpha: 1.0,
        },
    }
}

fn premultiply(r: u8, g: u8, b: u8, a: u8) -> PremulRgba8 {
    AlphaColor::<Srgb>::from_rgba8(r, g, b, a).premultiply().to_rgba8()
}

fn pixmap_dims(width: u32, height: u32) -> Option<(u16, u16)> {
    let width = u16::try_from(width).ok()?;
    let height = u16::try_from(height).ok()?;
    (width > 0 && height > 0).then_some((width, height))
}

fn min_factor(transform: &Affine) -> f32 {
    let (x, y) = x_y_advances(transform);
    x.length().min(y.length()) as f32
}

/// Device-space steps for one unit along each axis, ignoring translation.
fn x_y_advances(transform: &Affine) -> (Vec2, Vec2) {
    let [a, b, c, d, _, _] = transform.as_coeffs();
    (Vec2::new(a, b), Vec2::new(c, d))
}

fn fill_rule(fill: FillRule) -> Fill {
    match fill {
        FillRule::NonZero => Fill::NonZero,
        FillRule::EvenOdd => Fill::EvenOdd,
    }
}

fn blend_mode(blend: BlendMode) -> peniko::BlendMode {
    let mix = match blend {
        BlendMode::Normal => Mix::Normal,
        BlendMode::Multiply => Mix::Multiply,
        BlendMode::Screen => Mix::Screen,
        BlendMode::Overlay => Mix::Overlay,
        BlendMode::Darken => Mix::Darken,
        BlendMode::Lighten => Mix::Lighten,
        BlendMode::ColorDodge => Mix::ColorDodge,
        BlendMode::ColorBurn => Mix::ColorBurn,
        BlendMode::HardLight => Mix::HardLight,
        BlendMode::SoftLight => Mix::SoftLight,
        BlendMode::Difference => Mix::Difference,
        BlendMode::Exclusion => Mix::Exclusion,
        BlendMode::Hue => Mix::Hue,
        BlendMode::Saturation => Mix::Saturation,
        BlendMode::Color => Mix::Color,
        BlendMode::Luminosity => Mix::Luminosity,
    };
    peniko::BlendMode::new(mix, Compose::SrcOver)
}
