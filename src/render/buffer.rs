use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::backend::BitmapMut;
use crate::error::{AppError, AppResult};
use crate::pixel::PixelFormat;

use super::request::{TileRequest, check_tile_size};

/// What a release hook learns about the buffer it is retiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasedTile {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub byte_len: usize,
}

pub type ReleaseHook = Box<dyn FnOnce(ReleasedTile) + Send>;

/// Pixel memory for one tile.
///
/// The buffer frees its memory exactly once: when it is dropped, released
/// explicitly, or when the last [`SharedTile`] clone goes away. Release
/// hooks run at that moment, after the pixels are no longer reachable.
pub struct TileBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    pixels: Box<[u8]>,
    ledger: Option<Arc<AllocationLedger>>,
    release_hooks: Vec<ReleaseHook>,
}

impl fmt::Debug for TileBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("byte_len", &self.pixels.len())
            .field("release_hooks", &self.release_hooks.len())
            .finish()
    }
}

impl TileBuffer {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> AppResult<Self> {
        check_tile_size(width, height)?;
        let len = format.bytes_per_pixel() * width as usize * height as usize;
        Ok(Self {
            width,
            height,
            format,
            pixels: vec![0_u8; len].into_boxed_slice(),
            ledger: None,
            release_hooks: Vec::new(),
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

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    pub fn fill_background(&mut self) {
        let white = self.format.white_pixel();
        for px in self.pixels.chunks_exact_mut(white.len()) {
            px.copy_from_slice(white);
        }
    }

    pub fn is_background(&self) -> bool {
        let white = self.format.white_pixel();
        self.pixels.chunks_exact(white.len()).all(|px| px == white)
    }

    pub fn bitmap_mut(&mut self) -> AppResult<BitmapMut<'_>> {
        BitmapMut::new(&mut self.pixels, self.width, self.height, self.format)
    }

    /// Registers a callback that runs once when the buffer is released.
    pub fn on_release(mut self, hook: impl FnOnce(ReleasedTile) + Send + 'static) -> Self {
        self.release_hooks.push(Box::new(hook));
        self
    }

    pub fn release(self) {
        drop(self);
    }

    /// Hands the buffer to reference-counted owners; release happens when the
    /// last clone is dropped.
    pub fn into_shared(self) -> SharedTile {
        SharedTile(Arc::new(self))
    }

    pub fn to_rgba(&self) -> Vec<u8> {
        self.format.to_rgba(&self.pixels)
    }

    fn released_info(&self) -> ReleasedTile {
        ReleasedTile {
            width: self.width,
            height: self.height,
            format: self.format,
            byte_len: self.pixels.len(),
        }
    }
}

impl Drop for TileBuffer {
    fn drop(&mut self) {
        let info = self.released_info();
        self.pixels = Box::default();
        if let Some(ledger) = self.ledger.take() {
            ledger.record_release(info.byte_len);
        }
        for hook in self.release_hooks.drain(..) {
            hook(info);
        }
    }
}

/// Reference-counted tile handed to display code.
#[derive(Debug, Clone)]
pub struct SharedTile(Arc<TileBuffer>);

impl SharedTile {
    pub fn owners(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn ptr_eq(&self, other: &SharedTile) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for SharedTile {
    type Target = TileBuffer;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerSnapshot {
    pub allocated: u64,
    pub released: u64,
    pub live_bytes: usize,
}

impl LedgerSnapshot {
    pub fn live(&self) -> u64 {
        self.allocated.saturating_sub(self.released)
    }
}

/// Counts tile allocations and releases so leaks and double frees show up.
#[derive(Debug, Default)]
pub struct AllocationLedger {
    allocated: AtomicU64,
    released: AtomicU64,
    live_bytes: AtomicUsize,
}

impl AllocationLedger {
    fn record_allocation(&self, bytes: usize) {
        self.allocated.fetch_add(1, Ordering::AcqRel);
        self.live_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    fn record_release(&self, bytes: usize) {
        self.released.fetch_add(1, Ordering::AcqRel);
        self.live_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            allocated: self.allocated.load(Ordering::Acquire),
            released: self.released.load(Ordering::Acquire),
            live_bytes: self.live_bytes.load(Ordering::Acquire),
        }
    }
}

/// Allocates fresh tile buffers and tracks their lifetime.
#[derive(Debug, Clone, Default)]
pub struct TileAllocator {
    ledger: Arc<AllocationLedger>,
}

impl TileAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, width: u32, height: u32, format: PixelFormat) -> AppResult<TileBuffer> {
        let mut buffer = TileBuffer::new(width, height, format)?;
        self.ledger.record_allocation(buffer.len());
        buffer.ledger = Some(Arc::clone(&self.ledger));
        Ok(buffer)
    }

    pub fn allocate_for(&self, request: &TileRequest) -> AppResult<TileBuffer> {
        self.allocate(
            request.tile_width(),
            request.tile_height(),
            request.pixel_format(),
        )
    }

    pub fn ledger(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }
}
