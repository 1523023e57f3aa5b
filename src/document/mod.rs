mod page_cache;
mod session;


pub use page_cache::{
    CacheCounters, DEFAULT_PAGE_HANDLE_CAPACITY, PageHandleCache, PageLease, SharedPage,
};
pub use session::{
    DocumentInfo, DocumentSession, PageDimensions, RenderedTile, SessionOptions, SessionPhase,
    TileStatus,
};
