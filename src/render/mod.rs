mod buffer;
mod cache;
mod grid;
mod renderer;
mod request;
mod transform;
mod worker;

pub use buffer::{
    AllocationLedger, LedgerSnapshot, ReleaseHook, ReleasedTile, SharedTile, TileAllocator,
    TileBuffer,
};
pub use cache::{TileCache, TileCacheCounters, TileKey};
pub use grid::{TileCell, TileGrid};
pub use renderer::{RenderTiming, TileRenderer};
pub use request::{MAX_TILE_EDGE, TileOrigin, TileRequest};
pub use transform::{ClipRect, TileTransform, WidthNormalization};
pub use worker::{CompletedTile, TileResult, TileWorker};
