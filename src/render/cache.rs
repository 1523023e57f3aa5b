use lru::LruCache;

use crate::config::CacheConfig;
use crate::pixel::PixelFormat;

use super::buffer::SharedTile;
use super::request::TileRequest;

const DEFAULT_MEMORY_BUDGET_BYTES: usize = 64 * 1024 * 1024;
const DEFAULT_MAX_ENTRIES: usize = 256;

fn milli(value: f64) -> i64 {
    (value * 1000.0).round() as i64
}

/// Identity of a rendered tile within one open document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub doc_id: u64,
    pub page: usize,
    pub scale_milli: u32,
    pub origin_x_milli: i64,
    pub origin_y_milli: i64,
    pub tile_width: u32,
    pub tile_height: u32,
    pub format: PixelFormat,
}

impl TileKey {
    pub fn new(doc_id: u64, request: &TileRequest) -> Self {
        let (x, y) = request.origin_offset();
        Self {
            doc_id,
            page: request.page_index(),
            scale_milli: scale_milli(request.scale()),
            origin_x_milli: milli(x),
            origin_y_milli: milli(y),
            tile_width: request.tile_width(),
            tile_height: request.tile_height(),
            format: request.pixel_format(),
        }
    }
}

fn scale_milli(scale: f64) -> u32 {
    (scale.max(0.0) * 1000.0).round() as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileCacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Bounded LRU of finished tiles for display code that redraws the same
/// tiles while scrolling. Entries are shared, so an evicted tile stays alive
/// for whoever is still drawing it.
#[derive(Debug)]
pub struct TileCache {
    max_entries: usize,
    memory_budget_bytes: usize,
    memory_bytes: usize,
    entries: LruCache<TileKey, SharedTile>,
    counters: TileCacheCounters,
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_MEMORY_BUDGET_BYTES)
    }
}

impl TileCache {
    pub fn new(max_entries: usize, memory_budget_bytes: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            max_entries,
            memory_budget_bytes: memory_budget_bytes.max(1),
            memory_bytes: 0,
            entries: LruCache::unbounded(),
            counters: TileCacheCounters::default(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            config.tile_cache_max_entries,
            config.tile_cache_memory_budget_bytes(),
        )
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn memory_budget_bytes(&self) -> usize {
        self.memory_budget_bytes
    }

    pub fn get(&mut self, key: &TileKey) -> Option<SharedTile> {
        match self.entries.get(key) {
            Some(tile) => {
                self.counters.hits += 1;
                Some(tile.clone())
            }
            None => {
                self.counters.misses += 1;
                None
            }
        }
    }

    /// Returns `false` when the tile alone exceeds the memory budget.
    pub fn insert(&mut self, key: TileKey, tile: SharedTile) -> bool {
        let tile_bytes = tile.len();
        if tile_bytes > self.memory_budget_bytes {
            return false;
        }

        if let Some(prev) = self.entries.pop(&key) {
            self.memory_bytes = self.memory_bytes.saturating_sub(prev.len());
        }
        self.memory_bytes += tile_bytes;
        self.entries.put(key, tile);
        self.evict_while_needed();
        true
    }

    pub fn remove(&mut self, key: &TileKey) -> bool {
        let Some(tile) = self.entries.pop(key) else {
            return false;
        };
        self.memory_bytes = self.memory_bytes.saturating_sub(tile.len());
        self.counters.evictions += 1;
        true
    }

    fn remove_where(&mut self, doomed: impl Fn(&TileKey) -> bool) -> usize {
        let keys: Vec<_> = self
            .entries
            .iter()
            .filter_map(|(key, _)| doomed(key).then_some(*key))
            .collect();
        keys.iter().filter(|key| self.remove(key)).count()
    }

    pub fn remove_doc(&mut self, doc_id: u64) -> usize {
        self.remove_where(|key| key.doc_id == doc_id)
    }

    pub fn remove_page(&mut self, doc_id: u64, page: usize) -> usize {
        self.remove_where(|key| key.doc_id == doc_id && key.page == page)
    }

    /// Drops tiles of `page` rendered at any scale other than `scale`.
    pub fn retain_scale(&mut self, doc_id: u64, page: usize, scale: f64) -> usize {
        let keep = scale_milli(scale);
        self.remove_where(|key| key.doc_id == doc_id && key.page == page && key.scale_milli != keep)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.memory_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.entries.contains(key)
    }

    pub fn memory_bytes(&self) -> usize {
        self.memory_bytes
    }

    pub fn counters(&self) -> TileCacheCounters {
        self.counters
    }

    pub fn hit_rate(&self) -> f64 {
        let lookups = self.counters.hits + self.counters.misses;
        if lookups == 0 {
            return 0.0;
        }
        self.counters.hits as f64 / lookups as f64
    }

    fn evict_while_needed(&mut self) {
        while self.entries.len() > self.max_entries || self.memory_bytes > self.memory_budget_bytes
        {
            let Some((_key, tile)) = self.entries.pop_lru() else {
                break;
            };
            self.memory_bytes = self.memory_bytes.saturating_sub(tile.len());
            self.counters.evictions += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{TileCache, TileKey};
    use crate::config::CacheConfig;
    use crate::pixel::PixelFormat;
    use crate::render::buffer::{SharedTile, TileBuffer};
    use crate::render::request::{TileOrigin, TileRequest};

    fn key(doc_id: u64, page: usize, row: f64, scale: f64) -> TileKey {
        let request = TileRequest::new(
            page,
            TileOrigin::grid(row, 0.0),
            0.0,
            8,
            8,
            scale,
            PixelFormat::Bgra32,
        )
        .expect("request should be valid");
        TileKey::new(doc_id, &request)
    }

    fn tile(side: u32) -> SharedTile {
        TileBuffer::new(side, side, PixelFormat::Bgra32)
            .expect("buffer should allocate")
            .into_shared()
    }

    #[test]
    fn grid_and_pixel_origins_share_a_key() {
        let grid = TileRequest::new(0, TileOrigin::grid(2.0, 1.0), 0.0, 8, 8, 1.0, PixelFormat::Bgr24)
            .expect("request should be valid");
        let pixel = TileRequest::new(0, TileOrigin::pixel(8.0, 16.0), 0.0, 8, 8, 1.0, PixelFormat::Bgr24)
            .expect("request should be valid");
        assert_eq!(TileKey::new(1, &grid), TileKey::new(1, &pixel));
    }

    #[test]
    fn from_config_applies_entry_and_memory_limits() {
        let config = CacheConfig {
            tile_cache_max_entries: 3,
            tile_cache_memory_budget_mb: 2,
            ..CacheConfig::default()
        };
        let mut cache = TileCache::from_config(&config);
        assert_eq!(cache.max_entries(), 3);
        assert_eq!(cache.memory_budget_bytes(), 2 * 1024 * 1024);

        for row in 0..5 {
            cache.insert(key(1, 0, f64::from(row), 1.0), tile(4));
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.counters().evictions, 2);
    }

    #[test]
    fn tracks_hit_rate() {
        let mut cache = TileCache::new(4, 1024 * 1024);
        let k = key(10, 1, 0.0, 1.0);
        assert!(cache.insert(k, tile(4)));

        assert!(cache.get(&k).is_some());
        assert!(cache.get(&key(10, 2, 0.0, 1.0)).is_none());

        let counters = cache.counters();
        assert_eq!(counters.hits, 1);
        assert_eq!(counters.misses, 1);
        assert_eq!(cache.hit_rate(), 0.5);
    }

    #[test]
    fn evicts_least_recent_over_entry_cap() {
        let mut cache = TileCache::new(2, 1024 * 1024);
        let (a, b, c) = (key(1, 0, 0.0, 1.0), key(1, 0, 1.0, 1.0), key(1, 0, 2.0, 1.0));
        cache.insert(a, tile(4));
        cache.insert(b, tile(4));
        let _ = cache.get(&a);
        cache.insert(c, tile(4));

        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
        assert_eq!(cache.counters().evictions, 1);
    }

    #[test]
    fn evicts_when_over_memory_budget() {
        let mut cache = TileCache::new(8, 10_000);
        cache.insert(key(1, 0, 0.0, 1.0), tile(40));
        cache.insert(key(1, 0, 1.0, 1.0), tile(40));

        assert_eq!(cache.len(), 1);
        assert!(cache.memory_bytes() <= 10_000);
    }

    #[test]
    fn oversize_tile_is_rejected_without_clearing() {
        let mut cache = TileCache::new(4, 100);
        let kept = key(1, 0, 0.0, 1.0);
        cache.insert(kept, tile(4));

        assert!(!cache.insert(key(1, 0, 1.0, 1.0), tile(8)));
        assert!(cache.contains(&kept));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn reinsert_does_not_double_count_memory() {
        let mut cache = TileCache::new(4, 1024 * 1024);
        let k = key(1, 0, 0.0, 1.0);
        cache.insert(k, tile(4));
        cache.insert(k, tile(6));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.memory_bytes(), 6 * 6 * 4);
    }

    #[test]
    fn retain_scale_drops_other_zoom_levels_of_page() {
        let mut cache = TileCache::new(8, 1024 * 1024);
        let keep = key(1, 0, 0.0, 2.0);
        let stale = key(1, 0, 0.0, 1.0);
        let other_page = key(1, 1, 0.0, 1.0);
        for k in [keep, stale, other_page] {
            cache.insert(k, tile(4));
        }

        assert_eq!(cache.retain_scale(1, 0, 2.0), 1);
        assert!(cache.contains(&keep));
        assert!(!cache.contains(&stale));
        assert!(cache.contains(&other_page));
    }

    #[test]
    fn remove_page_and_doc_reduce_memory() {
        let mut cache = TileCache::new(8, 1024 * 1024);
        cache.insert(key(10, 0, 0.0, 1.0), tile(6));
        cache.insert(key(10, 0, 1.0, 1.0), tile(6));
        cache.insert(key(10, 1, 0.0, 1.0), tile(6));
        cache.insert(key(11, 0, 0.0, 1.0), tile(6));

        assert_eq!(cache.remove_page(10, 0), 2);
        assert_eq!(cache.remove_doc(10), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.memory_bytes(), 6 * 6 * 4);
        assert_eq!(cache.counters().evictions, 3);
    }

    #[test]
    fn cached_tile_is_shared_not_copied() {
        let mut cache = TileCache::new(2, 1024 * 1024);
        let k = key(1, 0, 0.0, 1.0);
        let stored = tile(4);
        cache.insert(k, stored.clone());

        let fetched = cache.get(&k).expect("tile should be cached");
        assert!(stored.ptr_eq(&fetched));
    }
}
