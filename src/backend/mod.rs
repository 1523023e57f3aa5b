use std::sync::Arc;

mod canvas;
mod handle;
mod hayro;
mod traits;

pub use handle::{DocumentHandle, HandleArena, HandleId, PageHandle};
pub use hayro::HayroBackend;
pub use traits::{BitmapMut, PageSize, RasterBackend, RenderFlags};

pub fn default_backend() -> Arc<dyn RasterBackend> {
    Arc::new(HayroBackend::new())
}
