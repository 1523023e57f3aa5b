use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info, warn};

use crate::backend::{DocumentHandle, PageSize, RasterBackend, RenderFlags};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::perf::PerfStats;
use crate::pixel::{PixelFormat, PixelFormatConverter};
use crate::render::{
    LedgerSnapshot, SharedTile, TileAllocator, TileBuffer, TileOrigin, TileRenderer, TileRequest,
    WidthNormalization,
};

use super::page_cache::{
    CacheCounters, DEFAULT_PAGE_HANDLE_CAPACITY, PageHandleCache, PageLease, SharedPage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Closed,
    Opening,
    Open,
    Closing,
}

impl SessionPhase {
    fn to_u8(self) -> u8 {
        match self {
            SessionPhase::Closed => 0,
            SessionPhase::Opening => 1,
            SessionPhase::Open => 2,
            SessionPhase::Closing => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionPhase::Opening,
            2 => SessionPhase::Open,
            3 => SessionPhase::Closing,
            _ => SessionPhase::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub page_cache_capacity: usize,
    pub normalization: WidthNormalization,
    pub converter: PixelFormatConverter,
    pub flags: RenderFlags,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            page_cache_capacity: DEFAULT_PAGE_HANDLE_CAPACITY,
            normalization: WidthNormalization::default(),
            converter: PixelFormatConverter::default(),
            flags: RenderFlags::default(),
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            page_cache_capacity: config.cache.page_handle_capacity,
            normalization: config.render.width_normalization,
            flags: RenderFlags {
                grayscale: config.render.grayscale,
            },
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentInfo {
    pub path: PathBuf,
    pub doc_id: u64,
    pub page_count: usize,
}

/// Size of one page and where it starts in a continuous vertical layout.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct PageDimensions {
    pub page_index: usize,
    pub width: f64,
    pub height: f64,
    /// Sum of the heights of all earlier pages.
    pub cumulative_height_offset: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileStatus {
    Rendered,
    /// The page could not be opened; the buffer holds only background.
    PageUnavailable,
    /// The backend failed mid-render; the buffer holds only background.
    RasterFailed,
}

/// A finished tile. The buffer is always full size, whatever the status.
#[derive(Debug)]
pub struct RenderedTile {
    pub buffer: TileBuffer,
    pub status: TileStatus,
}

impl RenderedTile {
    pub fn is_rendered(&self) -> bool {
        self.status == TileStatus::Rendered
    }

    pub fn into_buffer(self) -> TileBuffer {
        self.buffer
    }

    pub fn into_shared(self) -> SharedTile {
        self.buffer.into_shared()
    }
}

struct OpenDocument {
    handle: DocumentHandle,
    path: PathBuf,
    doc_id: u64,
    page_count: usize,
    pages: PageHandleCache,
}

impl OpenDocument {
    fn info(&self) -> DocumentInfo {
        DocumentInfo {
            path: self.path.clone(),
            doc_id: self.doc_id,
            page_count: self.page_count,
        }
    }
}

enum SessionState {
    Closed,
    Open(OpenDocument),
}

/// Owns the single open document and its page cache.
///
/// Page queries and tile renders share a read lock; `open` and `close` take
/// the write lock, so a close waits for in-flight renders and no render ever
/// sees a half-closed document.
pub struct DocumentSession {
    backend: Arc<dyn RasterBackend>,
    renderer: TileRenderer,
    allocator: TileAllocator,
    page_cache_capacity: usize,
    state: RwLock<SessionState>,
    phase: AtomicU8,
    opens: AtomicU64,
    perf: Mutex<PerfStats>,
}

impl DocumentSession {
    pub fn new(backend: Arc<dyn RasterBackend>) -> Self {
        Self::with_options(backend, SessionOptions::default())
    }

    pub fn with_options(backend: Arc<dyn RasterBackend>, options: SessionOptions) -> Self {
        Self {
            backend,
            renderer: TileRenderer::new(options.converter, options.normalization)
                .with_flags(options.flags),
            allocator: TileAllocator::new(),
            page_cache_capacity: options.page_cache_capacity.max(1),
            state: RwLock::new(SessionState::Closed),
            phase: AtomicU8::new(SessionPhase::Closed.to_u8()),
            opens: AtomicU64::new(0),
            perf: Mutex::new(PerfStats::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.phase.store(phase.to_u8(), Ordering::Release);
    }

    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Opens `path`, closing the current document first.
    pub fn open(&self, path: impl AsRef<Path>) -> AppResult<DocumentInfo> {
        let path = path.as_ref();
        let mut state = self.write();
        self.close_locked(&mut state);

        self.set_phase(SessionPhase::Opening);
        let handle = match self.backend.open_document(path) {
            Ok(handle) => handle,
            Err(err) => {
                self.set_phase(SessionPhase::Closed);
                warn!("failed to open {}: {err}", path.display());
                return Err(err);
            }
        };

        let sequence = self.opens.fetch_add(1, Ordering::AcqRel);
        let document = OpenDocument {
            handle,
            path: path.to_path_buf(),
            doc_id: calculate_doc_id(path, sequence),
            page_count: self.backend.page_count(handle),
            pages: PageHandleCache::new(self.page_cache_capacity),
        };
        let info = document.info();
        *state = SessionState::Open(document);
        self.set_phase(SessionPhase::Open);
        info!(
            "opened {} ({} pages, doc {:x})",
            info.path.display(),
            info.page_count,
            info.doc_id
        );
        Ok(info)
    }

    /// Drains the page cache and closes the document. Closing a closed
    /// session does nothing.
    pub fn close(&self) {
        let mut state = self.write();
        self.close_locked(&mut state);
    }

    fn close_locked(&self, state: &mut SessionState) {
        let SessionState::Open(document) = std::mem::replace(state, SessionState::Closed) else {
            return;
        };
        self.set_phase(SessionPhase::Closing);
        let drained = document.pages.clear();
        self.backend.close_document(document.handle);
        self.set_phase(SessionPhase::Closed);
        info!(
            "closed {} after draining {drained} cached pages",
            document.path.display()
        );
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.read(), SessionState::Open(_))
    }

    pub fn info(&self) -> Option<DocumentInfo> {
        match &*self.read() {
            SessionState::Open(document) => Some(document.info()),
            SessionState::Closed => None,
        }
    }

    pub fn doc_id(&self) -> Option<u64> {
        self.info().map(|info| info.doc_id)
    }

    /// Zero when no document is open.
    pub fn page_count(&self) -> usize {
        match &*self.read() {
            SessionState::Open(document) => document.page_count,
            SessionState::Closed => 0,
        }
    }

    /// Every page in index order. Pages that fail to load are skipped and
    /// do not contribute to later offsets. Not memoized.
    pub fn page_dimensions(&self) -> Vec<PageDimensions> {
        let state = self.read();
        let SessionState::Open(document) = &*state else {
            debug!("page dimensions requested with no document open");
            return Vec::new();
        };

        let mut dimensions = Vec::with_capacity(document.page_count);
        let mut offset = 0.0;
        for page_index in 0..document.page_count {
            let page = match self.page(document, page_index) {
                Ok(page) => page,
                Err(err) => {
                    warn!("skipping page {page_index} dimensions: {err}");
                    continue;
                }
            };
            let size = page.size();
            dimensions.push(PageDimensions {
                page_index,
                width: size.width,
                height: size.height,
                cumulative_height_offset: offset,
            });
            offset += size.height;
        }
        dimensions
    }

    pub fn page_size(&self, page_index: usize) -> AppResult<PageSize> {
        let state = self.read();
        let SessionState::Open(document) = &*state else {
            return Err(AppError::NoDocumentOpen);
        };
        self.page(document, page_index).map(|page| page.size())
    }

    fn page(&self, document: &OpenDocument, page_index: usize) -> AppResult<SharedPage> {
        if page_index >= document.page_count {
            return Err(AppError::page_load(page_index, "page index is out of range"));
        }
        if let Some(page) = document.pages.get(page_index) {
            return Ok(page);
        }

        let handle = self.backend.load_page(document.handle, page_index)?;
        let size = match self.backend.page_size(handle) {
            Ok(size) => size,
            Err(err) => {
                self.backend.close_page(handle);
                return Err(err);
            }
        };
        let page = Arc::new(PageLease::new(
            Arc::clone(&self.backend),
            handle,
            page_index,
            size,
        ));
        document.pages.put(page_index, Arc::clone(&page));
        Ok(page)
    }

    /// Renders one tile into a fresh buffer.
    ///
    /// Backend trouble (missing page, raster failure) still yields a
    /// full-size background tile with a non-`Rendered` status. Only a closed
    /// session or an unsupported output format is an error.
    pub fn render_tile(&self, request: &TileRequest) -> AppResult<RenderedTile> {
        let state = self.read();
        let SessionState::Open(document) = &*state else {
            return Err(AppError::NoDocumentOpen);
        };
        self.renderer.raster_format_for(request.pixel_format())?;

        let mut buffer = self.allocator.allocate_for(request)?;
        let page = match self.page(document, request.page_index()) {
            Ok(page) => page,
            Err(err) => {
                debug!("tile on page {} unavailable: {err}", request.page_index());
                buffer.fill_background();
                self.record_soft_failure();
                return Ok(RenderedTile {
                    buffer,
                    status: TileStatus::PageUnavailable,
                });
            }
        };

        let rendered = self.renderer.render_tile(
            self.backend.as_ref(),
            page.handle(),
            page.size(),
            request,
            &mut buffer,
        );
        match rendered {
            Ok(timing) => {
                let mut perf = self.perf.lock().unwrap_or_else(PoisonError::into_inner);
                perf.record_render(timing.raster);
                if let Some(convert) = timing.convert {
                    perf.record_convert(convert);
                }
                Ok(RenderedTile {
                    buffer,
                    status: TileStatus::Rendered,
                })
            }
            Err(err) if err.is_soft() => {
                warn!("tile on page {} failed: {err}", request.page_index());
                self.record_soft_failure();
                Ok(RenderedTile {
                    buffer,
                    status: TileStatus::RasterFailed,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Host-facing render: grid addressing with signed sizes.
    #[allow(clippy::too_many_arguments)]
    pub fn render_tile_at(
        &self,
        page_index: i64,
        row: f64,
        column: f64,
        display_width: f64,
        tile_width: i64,
        tile_height: i64,
        scale: f64,
        pixel_format: PixelFormat,
    ) -> AppResult<RenderedTile> {
        let request = TileRequest::from_host(
            page_index,
            row,
            column,
            display_width,
            tile_width,
            tile_height,
            scale,
            pixel_format,
        )?;
        self.render_tile(&request)
    }

    /// Renders a tile addressed by absolute pixel offset.
    pub fn render_tile_at_offset(
        &self,
        page_index: usize,
        x: f64,
        y: f64,
        tile_width: u32,
        tile_height: u32,
        scale: f64,
        pixel_format: PixelFormat,
    ) -> AppResult<RenderedTile> {
        let request = TileRequest::new(
            page_index,
            TileOrigin::pixel(x, y),
            0.0,
            tile_width,
            tile_height,
            scale,
            pixel_format,
        )?;
        self.render_tile(&request)
    }

    fn record_soft_failure(&self) {
        self.perf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_soft_failure();
    }

    pub fn page_cache_counters(&self) -> Option<CacheCounters> {
        match &*self.read() {
            SessionState::Open(document) => Some(document.pages.counters()),
            SessionState::Closed => None,
        }
    }

    pub fn cached_pages(&self) -> usize {
        match &*self.read() {
            SessionState::Open(document) => document.pages.len(),
            SessionState::Closed => 0,
        }
    }

    pub fn perf_snapshot(&self) -> PerfStats {
        let mut stats = self
            .perf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let SessionState::Open(document) = &*self.read() {
            stats.set_page_cache_hit_rate(document.pages.hit_rate());
        }
        stats
    }

    pub fn allocation_ledger(&self) -> LedgerSnapshot {
        self.allocator.ledger()
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let SessionState::Open(document) = std::mem::replace(state, SessionState::Closed) {
            document.pages.clear();
            self.backend.close_document(document.handle);
        }
    }
}

fn calculate_doc_id(path: &Path, sequence: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    sequence.hash(&mut hasher);
    hasher.finish()
}
