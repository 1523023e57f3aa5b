use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;
use lru::LruCache;

use crate::backend::{PageHandle, PageSize, RasterBackend};

pub const DEFAULT_PAGE_HANDLE_CAPACITY: usize = 10;

/// An opened page. Closing goes through the backend exactly once, when the
/// last holder (the cache or an in-flight render) lets go.
pub struct PageLease {
    handle: PageHandle,
    index: usize,
    size: PageSize,
    backend: Arc<dyn RasterBackend>,
}

impl PageLease {
    pub fn new(
        backend: Arc<dyn RasterBackend>,
        handle: PageHandle,
        index: usize,
        size: PageSize,
    ) -> Self {
        Self {
            handle,
            index,
            size,
            backend,
        }
    }

    pub fn handle(&self) -> PageHandle {
        self.handle
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn size(&self) -> PageSize {
        self.size
    }
}

impl fmt::Debug for PageLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageLease")
            .field("handle", &self.handle)
            .field("index", &self.index)
            .field("size", &self.size)
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        self.backend.close_page(self.handle);
    }
}

pub type SharedPage = Arc<PageLease>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct CacheInner {
    entries: LruCache<usize, SharedPage>,
    counters: CacheCounters,
}

/// Bounded LRU of opened pages keyed by page index.
///
/// Every operation runs under one lock, so an entry is never evicted twice
/// and never observed half-removed. Evicted pages are closed before `put`
/// returns unless a render still holds them.
#[derive(Debug)]
pub struct PageHandleCache {
    capacity: NonZeroUsize,
    inner: Mutex<CacheInner>,
}

impl Default for PageHandleCache {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_HANDLE_CAPACITY)
    }
}

impl PageHandleCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            capacity,
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                counters: CacheCounters::default(),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, index: usize) -> Option<SharedPage> {
        let mut inner = self.inner();
        match inner.entries.get(&index).cloned() {
            Some(page) => {
                inner.counters.hits += 1;
                Some(page)
            }
            None => {
                inner.counters.misses += 1;
                None
            }
        }
    }

    /// Inserts or replaces the page for `index` and marks it most recently
    /// used. Re-inserting the same lease is a no-op apart from the promotion.
    pub fn put(&self, index: usize, page: SharedPage) {
        let mut inner = self.inner();
        if let Some(existing) = inner.entries.get(&index)
            && Arc::ptr_eq(existing, &page)
        {
            return;
        }

        let Some((displaced_index, displaced)) = inner.entries.push(index, page) else {
            return;
        };
        if displaced_index != index {
            inner.counters.evictions += 1;
            debug!("page cache evicted page {displaced_index}");
        }
        drop(displaced);
    }

    /// Closes every cached page and empties the cache.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner();
        let drained = inner.entries.len();
        inner.entries.clear();
        if drained > 0 {
            debug!("page cache drained {drained} pages");
        }
        drained
    }

    pub fn contains(&self, index: usize) -> bool {
        self.inner().entries.contains(&index)
    }

    /// Cached indices from most to least recently used.
    pub fn indices(&self) -> Vec<usize> {
        self.inner().entries.iter().map(|(index, _)| *index).collect()
    }

    pub fn len(&self) -> usize {
        self.inner().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn counters(&self) -> CacheCounters {
        self.inner().counters
    }

    pub fn hit_rate(&self) -> f64 {
        let counters = self.counters();
        let lookups = counters.hits + counters.misses;
        if lookups == 0 {
            return 0.0;
        }
        counters.hits as f64 / lookups as f64
    }
}
