use std::path::PathBuf;

use crate::pixel::PixelFormat;

pub type AppResult<T> = Result<T, AppError>;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("failed to open document {}: {reason}", path.display())]
    DocumentOpen { path: PathBuf, reason: String },
    #[error("page {page} is unavailable: {reason}")]
    PageLoad { page: usize, reason: String },
    #[error("no document open")]
    NoDocumentOpen,
    #[error("invalid tile: {0}")]
    InvalidTile(String),
    #[error("stale handle")]
    StaleHandle,
    #[error("no pixel converter from {from} to {to}")]
    UnsupportedConversion { from: PixelFormat, to: PixelFormat },
    #[error("rasterization failed for page {page}")]
    Rasterize {
        page: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<std::io::Error> for AppError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            source,
            context: "I/O operation failed".to_string(),
        }
    }
}

impl AppError {
    pub fn io_with_context(source: std::io::Error, context: impl Into<String>) -> Self {
        Self::Io {
            source,
            context: context.into(),
        }
    }

    pub fn document_open(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DocumentOpen {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn page_load(page: usize, reason: impl Into<String>) -> Self {
        Self::PageLoad {
            page,
            reason: reason.into(),
        }
    }

    pub fn invalid_tile(message: impl Into<String>) -> Self {
        Self::InvalidTile(message.into())
    }

    pub fn rasterize(page: usize, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Rasterize {
            page,
            source: Box::new(source),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    /// Errors a tile request can recover from by returning a background tile.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Self::PageLoad { .. } | Self::StaleHandle | Self::Rasterize { .. }
        )
    }
}
