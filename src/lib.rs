// Export modules for use in tests
pub mod cache;
pub mod document;
pub mod events;
pub mod pool;
pub mod prefetch;
pub mod render;
pub mod session;
pub mod settings;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use cache::{CachePolicy, CacheStrategy, PageCache};
pub use document::{DocumentError, DocumentHandle, DocumentSource, OpenPage, SourceResolver};
pub use events::{ChannelSink, EventSink, LogSink, NullSink, SessionEvent};
pub use pool::{BufferPool, PixelBuffer, PoolStats};
pub use prefetch::{PrefetchPlanner, ScrollDirection};
pub use render::{Priority, RenderError, RenderTicket};
pub use session::{DocumentSession, SessionError, SessionHost, SessionOptions};
pub use settings::Settings;
pub use types::{PageImage, PageIndex, PageSize, RenderQuality};
