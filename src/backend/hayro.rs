use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hayro::hayro_interpret::InterpreterSettings;
use hayro::hayro_syntax::Pdf;
use log::debug;

use crate::error::{AppError, AppResult};
use crate::render::{ClipRect, TileTransform};

use super::canvas::paint_tile;
use super::handle::{DocumentHandle, HandleArena, PageHandle};
use super::traits::{BitmapMut, PageSize, RasterBackend, RenderFlags};

/// Largest pixmap edge vello can produce.
const MAX_PIXMAP_EDGE: u16 = u16::MAX;

struct HayroDocument {
    path: PathBuf,
    pdf: Arc<Mutex<Pdf>>,
    page_count: usize,
}

struct HayroPage {
    document: DocumentHandle,
    index: usize,
    size: PageSize,
    pdf: Arc<Mutex<Pdf>>,
}

#[derive(Default)]
struct HayroState {
    documents: HandleArena<HayroDocument>,
    pages: HandleArena<HayroPage>,
}

/// Pure-Rust backend on top of hayro. Rasterization of one document is
/// serialized on that document's lock; different documents paint in
/// parallel.
#[derive(Default)]
pub struct HayroBackend {
    state: Mutex<HayroState>,
}

impl HayroBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HayroState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn load_bytes(path: &Path) -> AppResult<Arc<Vec<u8>>> {
        if path.as_os_str().is_empty() {
            return Err(AppError::document_open(path, "pdf path must not be empty"));
        }
        if !path.exists() {
            return Err(AppError::io_with_context(
                std::io::Error::new(std::io::ErrorKind::NotFound, "missing file"),
                format!("pdf file not found: {}", path.display()),
            ));
        }
        if !path.is_file() {
            return Err(AppError::document_open(path, "pdf path must be a regular file"));
        }

        let bytes = std::fs::read(path).map_err(|source| {
            AppError::io_with_context(source, format!("failed to read pdf: {}", path.display()))
        })?;
        if !bytes.starts_with(b"%PDF-") {
            return Err(AppError::document_open(path, "input is not a valid PDF header"));
        }
        Ok(Arc::new(bytes))
    }

    pub fn open_bytes(&self, path: &Path, bytes: Arc<Vec<u8>>) -> AppResult<DocumentHandle> {
        if !bytes.starts_with(b"%PDF-") {
            return Err(AppError::document_open(path, "input is not a valid PDF header"));
        }
        let pdf = Pdf::new(bytes)
            .map_err(|_| AppError::document_open(path, "failed to parse PDF with hayro"))?;
        let page_count = pdf.pages().len();

        let document = HayroDocument {
            path: path.to_path_buf(),
            pdf: Arc::new(Mutex::new(pdf)),
            page_count,
        };
        let handle = DocumentHandle(self.state().documents.insert(document));
        debug!(
            "hayro opened {} as {} ({page_count} pages)",
            path.display(),
            handle.id()
        );
        Ok(handle)
    }
}

impl RasterBackend for HayroBackend {
    fn name(&self) -> &'static str {
        "hayro"
    }

    fn open_document(&self, path: &Path) -> AppResult<DocumentHandle> {
        let bytes = Self::load_bytes(path)?;
        self.open_bytes(path, bytes)
    }

    fn close_document(&self, document: DocumentHandle) {
        let mut state = self.state();
        let Some(closed) = state.documents.remove(document.0) else {
            return;
        };
        let orphans = state.pages.retain(|page| page.document != document);
        if !orphans.is_empty() {
            debug!(
                "hayro closed {} with {} pages still open",
                closed.path.display(),
                orphans.len()
            );
        }
    }

    fn page_count(&self, document: DocumentHandle) -> usize {
        self.state()
            .documents
            .get(document.0)
            .map_or(0, |document| document.page_count)
    }

    fn load_page(&self, document: DocumentHandle, index: usize) -> AppResult<PageHandle> {
        let mut state = self.state();
        let doc = state.documents.get(document.0).ok_or(AppError::StaleHandle)?;
        if index >= doc.page_count {
            return Err(AppError::page_load(index, "page index is out of range"));
        }

        let pdf = Arc::clone(&doc.pdf);
        let (width, height) = {
            let guard = pdf.lock().unwrap_or_else(PoisonError::into_inner);
            let pages = guard.pages();
            let page = pages
                .get(index)
                .ok_or_else(|| AppError::page_load(index, "page index is out of range"))?;
            page.render_dimensions()
        };

        let page = HayroPage {
            document,
            index,
            size: PageSize::new(f64::from(width), f64::from(height)),
            pdf,
        };
        Ok(PageHandle(state.pages.insert(page)))
    }

    fn close_page(&self, page: PageHandle) {
        let _ = self.state().pages.remove(page.0);
    }

    fn page_size(&self, page: PageHandle) -> AppResult<PageSize> {
        self.state()
            .pages
            .get(page.0)
            .map(|page| page.size)
            .ok_or(AppError::StaleHandle)
    }

    fn rasterize(
        &self,
        page: PageHandle,
        target: &mut BitmapMut<'_>,
        transform: &TileTransform,
        clip: &ClipRect,
        flags: RenderFlags,
    ) -> AppResult<()> {
        let (pdf, index, size) = {
            let state = self.state();
            let page = state.pages.get(page.0).ok_or(AppError::StaleHandle)?;
            (Arc::clone(&page.pdf), page.index, page.size)
        };

        let (width, height) = (target.width(), target.height());
        let (Ok(pix_width), Ok(pix_height)) = (u16::try_from(width), u16::try_from(height)) else {
            return Err(AppError::rasterize(
                index,
                AppError::unsupported(format!(
                    "tile {width}x{height} exceeds the rasterizer limit of {MAX_PIXMAP_EDGE} per edge"
                )),
            ));
        };

        let interpreter_settings = InterpreterSettings::default();
        let pixmap = {
            let guard = pdf.lock().unwrap_or_else(PoisonError::into_inner);
            let pages = guard.pages();
            let page_ref = pages
                .get(index)
                .ok_or_else(|| AppError::page_load(index, "page index is out of range"))?;
            paint_tile(
                page_ref,
                transform.to_affine(),
                pix_width,
                pix_height,
                &interpreter_settings,
            )
        };

        // Tile pixels whose centre falls off the scaled page keep the
        // caller's background.
        let page_px = transform.scaled_page(size);
        let src = pixmap.data_as_u8_slice();
        let stride = usize::from(pix_width) * 4;
        let (left, top, right, bottom) = clip.pixel_bounds(width, height);

        for y in top..bottom {
            let py = f64::from(y) + 0.5 + transform.translate_y;
            if py < page_px.y0 || py >= page_px.y1 {
                continue;
            }
            for x in left..right {
                let px = f64::from(x) + 0.5 + transform.translate_x;
                if px < page_px.x0 || px >= page_px.x1 {
                    continue;
                }
                let at = y as usize * stride + x as usize * 4;
                let mut rgba = [src[at], src[at + 1], src[at + 2], src[at + 3]];
                if flags.grayscale {
                    let luma = luma(rgba[0], rgba[1], rgba[2]);
                    rgba = [luma, luma, luma, rgba[3]];
                }
                target.put_rgba(x, y, rgba);
            }
        }
        Ok(())
    }
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((u32::from(r) * 299 + u32::from(g) * 587 + u32::from(b) * 114) / 1000) as u8
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::HayroBackend;
    use crate::backend::{BitmapMut, RasterBackend, RenderFlags};
    use crate::error::AppError;
    use crate::pixel::PixelFormat;
    use crate::render::{ClipRect, TileOrigin, TileRequest, TileTransform, WidthNormalization};
    use crate::testing::{build_pdf, build_pdf_with_black_square, unique_temp_path};

    fn transform_for(row: f64, column: f64, tile: u32, scale: f64) -> TileTransform {
        let request = TileRequest::new(
            0,
            TileOrigin::grid(row, column),
            0.0,
            tile,
            tile,
            scale,
            PixelFormat::Bgra32,
        )
        .expect("request should be valid");
        TileTransform::compute(
            crate::backend::PageSize::new(300.0, 400.0),
            &request,
            WidthNormalization::Off,
        )
    }

    #[test]
    fn open_rejects_directory_path() {
        let dir = unique_temp_path("dir");
        fs::create_dir_all(&dir).expect("test directory should be created");

        let result = HayroBackend::new().open_document(&dir);
        assert!(matches!(
            result,
            Err(AppError::DocumentOpen { reason, .. }) if reason == "pdf path must be a regular file"
        ));

        fs::remove_dir_all(&dir).expect("test directory should be removed");
    }

    #[test]
    fn open_rejects_non_pdf_bytes() {
        let file = unique_temp_path("not_pdf.txt");
        fs::write(&file, b"hello").expect("test file should be created");

        let result = HayroBackend::new().open_document(&file);
        assert!(matches!(result, Err(AppError::DocumentOpen { .. })));

        fs::remove_file(&file).expect("test file should be removed");
    }

    #[test]
    fn missing_file_is_io_error() {
        let result = HayroBackend::new().open_document(Path::new("/definitely/missing.pdf"));
        assert!(matches!(result, Err(AppError::Io { .. })));
    }

    #[test]
    fn loads_pages_and_reports_size() {
        let file = unique_temp_path("pages.pdf");
        fs::write(&file, build_pdf(&["first", "second"])).expect("test file should be created");
        let backend = HayroBackend::new();

        let document = backend.open_document(&file).expect("pdf should open");
        assert_eq!(backend.page_count(document), 2);

        let page = backend.load_page(document, 1).expect("page should load");
        let size = backend.page_size(page).expect("page should be live");
        assert!((size.width - 300.0).abs() < 1e-6);
        assert!((size.height - 300.0).abs() < 1e-6);

        let out_of_range = backend.load_page(document, 2);
        assert!(matches!(out_of_range, Err(AppError::PageLoad { page: 2, .. })));

        backend.close_page(page);
        assert!(matches!(backend.page_size(page), Err(AppError::StaleHandle)));
        backend.close_document(document);
        assert_eq!(backend.page_count(document), 0);

        fs::remove_file(&file).expect("test file should be removed");
    }

    #[test]
    fn closing_document_retires_its_pages() {
        let file = unique_temp_path("orphans.pdf");
        fs::write(&file, build_pdf(&["only"])).expect("test file should be created");
        let backend = HayroBackend::new();

        let document = backend.open_document(&file).expect("pdf should open");
        let page = backend.load_page(document, 0).expect("page should load");
        backend.close_document(document);

        assert!(matches!(backend.page_size(page), Err(AppError::StaleHandle)));
        assert!(matches!(
            backend.load_page(document, 0),
            Err(AppError::StaleHandle)
        ));

        fs::remove_file(&file).expect("test file should be removed");
    }

    #[test]
    fn rasterizes_tile_region_with_offset() {
        let file = unique_temp_path("square.pdf");
        fs::write(&file, build_pdf_with_black_square(1)).expect("test file should be created");
        let backend = HayroBackend::new();
        let document = backend.open_document(&file).expect("pdf should open");
        let page = backend.load_page(document, 0).expect("page should load");

        // page is 300x400 with black covering x < 150 and the bottom half
        let mut data = vec![0_u8; 100 * 100 * 4];
        let mut bitmap =
            BitmapMut::new(&mut data, 100, 100, PixelFormat::Bgra32).expect("length matches");
        let transform = transform_for(3.0, 0.0, 100, 1.0);
        backend
            .rasterize(
                page,
                &mut bitmap,
                &transform,
                &ClipRect::full(100, 100),
                RenderFlags::default(),
            )
            .expect("rasterize should succeed");

        let pixel = |x: usize, y: usize| &data[(y * 100 + x) * 4..(y * 100 + x) * 4 + 4];
        assert_eq!(pixel(10, 10), &[0, 0, 0, 255]);

        let mut data = vec![0_u8; 100 * 100 * 4];
        let mut bitmap =
            BitmapMut::new(&mut data, 100, 100, PixelFormat::Bgra32).expect("length matches");
        let transform = transform_for(0.0, 2.0, 100, 1.0);
        backend
            .rasterize(
                page,
                &mut bitmap,
                &transform,
                &ClipRect::full(100, 100),
                RenderFlags::default(),
            )
            .expect("rasterize should succeed");
        assert_eq!(&data[..4], &[255, 255, 255, 255]);

        fs::remove_file(&file).expect("test file should be removed");
    }

    #[test]
    fn rasterizes_deep_zoom_tile_far_past_pixmap_limit() {
        let file = unique_temp_path("zoom.pdf");
        fs::write(&file, build_pdf_with_black_square(1)).expect("test file should be created");
        let backend = HayroBackend::new();
        let document = backend.open_document(&file).expect("pdf should open");
        let page = backend.load_page(document, 0).expect("page should load");

        // scaled page is 150000x200000 px; last row of the first column sits in the square
        let mut data = vec![0_u8; 100 * 100 * 4];
        let mut bitmap =
            BitmapMut::new(&mut data, 100, 100, PixelFormat::Bgra32).expect("length matches");
        let transform = transform_for(1999.0, 0.0, 100, 500.0);
        backend
            .rasterize(
                page,
                &mut bitmap,
                &transform,
                &ClipRect::full(100, 100),
                RenderFlags::default(),
            )
            .expect("deep zoom tile should rasterize");

        assert!(data.chunks_exact(4).all(|px| px == [0, 0, 0, 255]));

        fs::remove_file(&file).expect("test file should be removed");
    }

    #[test]
    fn rasterize_honors_clip_rect() {
        let file = unique_temp_path("clip.pdf");
        fs::write(&file, build_pdf_with_black_square(1)).expect("test file should be created");
        let backend = HayroBackend::new();
        let document = backend.open_document(&file).expect("pdf should open");
        let page = backend.load_page(document, 0).expect("page should load");

        let mut data = vec![7_u8; 10 * 10 * 4];
        let mut bitmap =
            BitmapMut::new(&mut data, 10, 10, PixelFormat::Bgra32).expect("length matches");
        let clip = ClipRect {
            left: 0.0,
            top: 0.0,
            right: 5.0,
            bottom: 10.0,
        };
        backend
            .rasterize(
                page,
                &mut bitmap,
                &transform_for(39.0, 0.0, 10, 1.0),
                &clip,
                RenderFlags::default(),
            )
            .expect("rasterize should succeed");

        assert_eq!(&data[..4], &[0, 0, 0, 255]);
        assert_eq!(&data[9 * 4..10 * 4], &[7, 7, 7, 7]);

        fs::remove_file(&file).expect("test file should be removed");
    }

    #[test]
    fn rasterize_rejects_stale_page() {
        let file = unique_temp_path("stale.pdf");
        fs::write(&file, build_pdf(&["x"])).expect("test file should be created");
        let backend = HayroBackend::new();
        let document = backend.open_document(&file).expect("pdf should open");
        let page = backend.load_page(document, 0).expect("page should load");
        backend.close_page(page);

        let mut data = vec![0_u8; 4 * 4 * 3];
        let mut bitmap =
            BitmapMut::new(&mut data, 4, 4, PixelFormat::Bgr24).expect("length matches");
        let result = backend.rasterize(
            page,
            &mut bitmap,
            &transform_for(0.0, 0.0, 4, 1.0),
            &ClipRect::full(4, 4),
            RenderFlags::default(),
        );
        assert!(matches!(result, Err(AppError::StaleHandle)));

        fs::remove_file(&file).expect("test file should be removed");
    }
}
