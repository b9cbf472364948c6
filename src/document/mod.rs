//! Document handle abstraction
//!
//! A [`DocumentHandle`] is the opaque, stateful capability the engine renders
//! from. It is not reentrant: at most one page may be open at a time, which
//! the trait expresses by tying an [`OpenPage`] to a mutable borrow of its
//! handle. The scheduler owns the handle behind a single lock; nothing else
//! calls into it.

#[cfg(feature = "mupdf")]
pub mod mupdf;
mod source;
mod synthetic;

use crate::pool::PixelBuffer;
use crate::types::{PageIndex, PageSize};

pub use source::{
    DocumentSource, FileResolver, SIGNATURE, SIGNATURE_WINDOW, SourceResolver, ensure_pages,
    find_signature, validate_signature,
};
pub use synthetic::SyntheticDocument;

/// Errors raised by document handles and resolvers
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("{path}: document signature not found")]
    InvalidSignature { path: String },

    #[error("document has no pages")]
    NoPages,

    #[error("page {page} out of range (document has {page_count} pages)")]
    PageOutOfRange { page: PageIndex, page_count: usize },

    #[error("invalid document source: {0}")]
    InvalidSource(String),

    #[error("rendering page {page} failed: {detail}")]
    Render { page: PageIndex, detail: String },

    #[error("document handle is closed")]
    Closed,

    #[error("document backend: {0}")]
    Backend(String),
}

impl DocumentError {
    pub fn render(page: PageIndex, detail: impl Into<String>) -> Self {
        Self::Render {
            page,
            detail: detail.into(),
        }
    }
}

/// A paginated document that renders one page at a time
pub trait DocumentHandle: Send {
    /// Number of pages; fixed for the lifetime of the handle
    fn page_count(&self) -> usize;

    /// Open a page for a single operation. The page borrows the handle, so
    /// no second page can be opened until it is dropped.
    fn open_page(&mut self, page: PageIndex) -> Result<Box<dyn OpenPage + '_>, DocumentError>;

    /// Release backend resources; called once when the owning session closes
    fn close(&mut self) {}
}

/// A page opened on a [`DocumentHandle`]
pub trait OpenPage {
    /// Native page size
    fn size(&self) -> PageSize;

    /// Rasterize the whole page, stretched to the target's dimensions
    fn render(&mut self, target: &mut PixelBuffer) -> Result<(), DocumentError>;
}

/// Bounds check shared by handle implementations
pub(crate) fn check_page(page: PageIndex, page_count: usize) -> Result<(), DocumentError> {
    if page < page_count {
        Ok(())
    } else {
        Err(DocumentError::PageOutOfRange { page, page_count })
    }
}
