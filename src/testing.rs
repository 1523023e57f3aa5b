use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::backend::{
    BitmapMut, DocumentHandle, HandleArena, PageHandle, PageSize, RasterBackend, RenderFlags,
};
use crate::error::{AppError, AppResult};
use crate::render::{ClipRect, TileTransform};

pub(crate) fn unique_temp_path(suffix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be after unix epoch")
        .as_nanos();

    let mut path = std::env::temp_dir();
    path.push(format!("pvt_{suffix}_{}_{}", process::id(), nanos));
    path
}

/// Shape of the document every `open_document` call on a [`FakeBackend`]
/// produces.
#[derive(Debug, Clone)]
pub(crate) struct FakeDocument {
    pages: Vec<PageSize>,
    ink: Option<[u8; 3]>,
    broken_pages: HashSet<usize>,
}

impl FakeDocument {
    pub(crate) fn uniform(page_count: usize, width: f64, height: f64) -> Self {
        Self::with_pages(vec![PageSize::new(width, height); page_count])
    }

    pub(crate) fn with_pages(pages: Vec<PageSize>) -> Self {
        Self {
            pages,
            ink: None,
            broken_pages: HashSet::new(),
        }
    }

    /// Paints every covered pixel in this RGB color.
    pub(crate) fn with_ink(mut self, rgb: [u8; 3]) -> Self {
        self.ink = Some(rgb);
        self
    }

    pub(crate) fn with_broken_page(mut self, page: usize) -> Self {
        self.broken_pages.insert(page);
        self
    }
}

#[derive(Debug)]
struct FakePage {
    index: usize,
    size: PageSize,
}

#[derive(Debug, Default)]
struct FakeState {
    documents: HandleArena<PathBuf>,
    pages: HandleArena<FakePage>,
    closed_pages: Vec<usize>,
}

/// In-memory backend that records every call.
#[derive(Debug)]
pub(crate) struct FakeBackend {
    document: FakeDocument,
    state: Mutex<FakeState>,
    opens: AtomicUsize,
    document_closes: AtomicUsize,
    page_loads: AtomicUsize,
    raster_calls: AtomicUsize,
    fail_open: AtomicBool,
    fail_rasterize: AtomicBool,
    raster_gate: Mutex<Option<Receiver<()>>>,
}

impl FakeBackend {
    pub(crate) fn new(document: FakeDocument) -> Self {
        Self {
            document,
            state: Mutex::new(FakeState::default()),
            opens: AtomicUsize::new(0),
            document_closes: AtomicUsize::new(0),
            page_loads: AtomicUsize::new(0),
            raster_calls: AtomicUsize::new(0),
            fail_open: AtomicBool::new(false),
            fail_rasterize: AtomicBool::new(false),
            raster_gate: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_rasterize(&self, fail: bool) {
        self.fail_rasterize.store(fail, Ordering::SeqCst);
    }

    /// Parks the next `rasterize` call, after it is counted, until the
    /// returned sender fires or is dropped.
    pub(crate) fn hold_next_rasterize(&self) -> Sender<()> {
        let (release, gate) = mpsc::channel();
        *self.raster_gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(gate);
        release
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn document_closes(&self) -> usize {
        self.document_closes.load(Ordering::SeqCst)
    }

    pub(crate) fn page_loads(&self) -> usize {
        self.page_loads.load(Ordering::SeqCst)
    }

    pub(crate) fn raster_calls(&self) -> usize {
        self.raster_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn closed_pages(&self) -> Vec<usize> {
        self.state().closed_pages.clone()
    }

    pub(crate) fn open_pages(&self) -> usize {
        self.state().pages.len()
    }

    pub(crate) fn open_documents(&self) -> usize {
        self.state().documents.len()
    }
}

impl RasterBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn open_document(&self, path: &Path) -> AppResult<DocumentHandle> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(AppError::document_open(path, "injected open failure"));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(DocumentHandle(self.state().documents.insert(path.to_path_buf())))
    }

    fn close_document(&self, document: DocumentHandle) {
        if self.state().documents.remove(document.0).is_some() {
            self.document_closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn page_count(&self, document: DocumentHandle) -> usize {
        if self.state().documents.contains(document.0) {
            self.document.pages.len()
        } else {
            0
        }
    }

    fn load_page(&self, document: DocumentHandle, index: usize) -> AppResult<PageHandle> {
        let mut state = self.state();
        if !state.documents.contains(document.0) {
            return Err(AppError::StaleHandle);
        }
        if self.document.broken_pages.contains(&index) {
            return Err(AppError::page_load(index, "injected load failure"));
        }
        let size = *self
            .document
            .pages
            .get(index)
            .ok_or_else(|| AppError::page_load(index, "page index is out of range"))?;
        self.page_loads.fetch_add(1, Ordering::SeqCst);
        Ok(PageHandle(state.pages.insert(FakePage { index, size })))
    }

    fn close_page(&self, page: PageHandle) {
        let mut state = self.state();
        if let Some(closed) = state.pages.remove(page.0) {
            state.closed_pages.push(closed.index);
        }
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
        _flags: RenderFlags,
    ) -> AppResult<()> {
        let (index, size) = {
            let state = self.state();
            let page = state.pages.get(page.0).ok_or(AppError::StaleHandle)?;
            (page.index, page.size)
        };
        self.raster_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self
            .raster_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        if self.fail_rasterize.load(Ordering::SeqCst) {
            return Err(AppError::rasterize(
                index,
                AppError::unsupported("injected raster failure"),
            ));
        }
        let Some([r, g, b]) = self.document.ink else {
            return Ok(());
        };

        let scaled = transform.scaled_page(size);
        let (left, top, right, bottom) = clip.pixel_bounds(target.width(), target.height());
        for y in top..bottom {
            for x in left..right {
                let page_x = f64::from(x) + transform.translate_x;
                let page_y = f64::from(y) + transform.translate_y;
                if page_x >= 0.0 && page_y >= 0.0 && page_x < scaled.x1 && page_y < scaled.y1 {
                    target.put_rgba(x, y, [r, g, b, 0xff]);
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn build_pdf(page_texts: &[&str]) -> Vec<u8> {
    let page_streams: Vec<String> = if page_texts.is_empty() {
        vec![String::new()]
    } else {
        page_texts
            .iter()
            .map(|text| format!("BT /F1 14 Tf 36 260 Td ({}) Tj ET", escape_literal_string(text)))
            .collect()
    };
    build_pdf_from_streams(&page_streams, "0 0 300 300")
}

/// One page per stream, each filled with a black square covering the lower
/// left quarter of a `300 x 400` page.
pub(crate) fn build_pdf_with_black_square(page_count: usize) -> Vec<u8> {
    let streams = vec!["0 0 0 rg 0 0 150 200 re f".to_string(); page_count.max(1)];
    build_pdf_from_streams(&streams, "0 0 300 400")
}

fn build_pdf_from_streams(page_streams: &[String], media_box: &str) -> Vec<u8> {
    let page_count = page_streams.len();
    let page_ids: Vec<usize> = (0..page_count).map(|i| 4 + i * 2).collect();

    let mut objects = Vec::new();
    objects.push("<< /Type /Catalog /Pages 2 0 R >>".to_string());

    let kids = page_ids
        .iter()
        .map(|id| format!("{id} 0 R"))
        .collect::<Vec<_>>()
        .join(" ");
    objects.push(format!(
        "<< /Type /Pages /Kids [{kids}] /Count {page_count} >>"
    ));
    objects.push("<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string());

    for (index, stream) in page_streams.iter().enumerate() {
        let content_id = 5 + index * 2;
        objects.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [{media_box}] /Resources << /Font << /F1 3 0 R >> >> /Contents {content_id} 0 R >>"
        ));
        objects.push(format!(
            "<< /Length {} >>\nstream\n{}\nendstream",
            stream.len(),
            stream
        ));
    }

    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n");

    let mut offsets = Vec::with_capacity(objects.len());
    for (index, object) in objects.iter().enumerate() {
        offsets.push(bytes.len());
        bytes.extend_from_slice(format!("{} 0 obj\n{object}\nendobj\n", index + 1).as_bytes());
    }

    let xref_start = bytes.len();
    bytes.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    bytes.extend_from_slice(b"0000000000 65535 f \n");
    for offset in &offsets {
        bytes.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
    }
    bytes.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref_start
        )
        .as_bytes(),
    );

    bytes
}

fn escape_literal_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '(' => out.push_str("\\("),
            ')' => out.push_str("\\)"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out
}
