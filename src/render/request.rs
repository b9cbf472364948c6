//! Render request, outcome and ticket types

use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, TryRecvError};

use super::inflight::CancelHandle;
use crate::document::DocumentError;
use crate::types::{PageImage, PageIndex, PageSize};

/// Unique identifier for render requests
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Request class; decides which request wins when two target the same page
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Priority {
    /// The page is visible right now
    OnScreen,
    /// Speculative render of a nearby page
    Prefetch,
}

/// A page to render at a target size
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderRequest {
    pub page: PageIndex,
    pub size: PageSize,
    pub priority: Priority,
}

impl RenderRequest {
    #[must_use]
    pub const fn new(page: PageIndex, size: PageSize, priority: Priority) -> Self {
        Self {
            page,
            size,
            priority,
        }
    }

    #[must_use]
    pub const fn on_screen(page: PageIndex, size: PageSize) -> Self {
        Self::new(page, size, Priority::OnScreen)
    }

    #[must_use]
    pub const fn prefetch(page: PageIndex, size: PageSize) -> Self {
        Self::new(page, size, Priority::Prefetch)
    }
}

/// Why a request produced no image
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("page {page} out of range (document has {page_count} pages)")]
    InvalidPageIndex { page: PageIndex, page_count: usize },

    #[error("invalid target size {}x{}", .size.width, .size.height)]
    InvalidTargetSize { size: PageSize },

    #[error("rendering page {page} failed")]
    RenderFailure {
        page: PageIndex,
        #[source]
        source: DocumentError,
    },

    #[error("session is closed")]
    SessionClosed,

    #[error("request for page {page} was cancelled")]
    Cancelled { page: PageIndex },

    #[error("page {page} already has a request in flight that covers this one")]
    Superseded { page: PageIndex },
}

pub type RenderOutcome = Result<Arc<PageImage>, RenderError>;
pub type DimensionOutcome = Result<PageSize, RenderError>;

/// Pending result of a render request.
///
/// The ticket is the delivery point: whichever thread waits on it (usually
/// the consumer's UI thread) receives the outcome. Dropping a ticket does not
/// cancel the render; use [`RenderTicket::cancel`] for that.
#[derive(Debug)]
pub struct RenderTicket {
    id: RequestId,
    page: PageIndex,
    rx: Receiver<RenderOutcome>,
    cancel: Option<CancelHandle>,
}

impl RenderTicket {
    pub(crate) fn pending(
        id: RequestId,
        page: PageIndex,
        rx: Receiver<RenderOutcome>,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            id,
            page,
            rx,
            cancel: Some(cancel),
        }
    }

    pub(crate) fn ready(id: RequestId, page: PageIndex, outcome: RenderOutcome) -> Self {
        let (tx, rx) = flume::bounded(1);
        let _ = tx.send(outcome);
        Self {
            id,
            page,
            rx,
            cancel: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    #[must_use]
    pub fn page(&self) -> PageIndex {
        self.page
    }

    /// Whether the outcome was known when the request was made (cache hit or
    /// immediate rejection)
    #[must_use]
    pub fn is_ready(&self) -> bool {
        !self.rx.is_empty() || self.cancel.is_none()
    }

    /// Cancel the request. A render that already committed to the cache is
    /// not rolled back.
    pub fn cancel(&self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }

    /// Block until the outcome arrives
    pub fn wait(self) -> RenderOutcome {
        self.rx.recv().unwrap_or(Err(RenderError::SessionClosed))
    }

    /// Block for at most `timeout`; `None` if the outcome is not there yet
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RenderOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(RenderError::SessionClosed)),
        }
    }

    /// Take the outcome if it already arrived
    pub fn try_take(&self) -> Option<RenderOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(RenderError::SessionClosed)),
        }
    }

    /// Await the outcome without blocking a thread
    pub async fn resolve(self) -> RenderOutcome {
        self.rx
            .recv_async()
            .await
            .unwrap_or(Err(RenderError::SessionClosed))
    }
}

/// Pending result of a page dimension lookup
#[derive(Debug)]
pub struct DimensionTicket {
    page: PageIndex,
    rx: Receiver<DimensionOutcome>,
}

impl DimensionTicket {
    pub(crate) fn pending(page: PageIndex, rx: Receiver<DimensionOutcome>) -> Self {
        Self { page, rx }
    }

    pub(crate) fn ready(page: PageIndex, outcome: DimensionOutcome) -> Self {
        let (tx, rx) = flume::bounded(1);
        let _ = tx.send(outcome);
        Self { page, rx }
    }

    #[must_use]
    pub fn page(&self) -> PageIndex {
        self.page
    }

    pub fn wait(self) -> DimensionOutcome {
        self.rx.recv().unwrap_or(Err(RenderError::SessionClosed))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<DimensionOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(RenderError::SessionClosed)),
        }
    }

    pub async fn resolve(self) -> DimensionOutcome {
        self.rx
            .recv_async()
            .await
            .unwrap_or(Err(RenderError::SessionClosed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_ticket_yields_its_outcome_once() {
        let ticket = RenderTicket::ready(RequestId::new(1), 4, Err(RenderError::SessionClosed));
        assert!(ticket.is_ready());
        assert!(matches!(
            ticket.try_take(),
            Some(Err(RenderError::SessionClosed))
        ));
        // the sender is gone, so a second read reports the session as closed
        assert!(matches!(
            ticket.wait_timeout(Duration::from_millis(1)),
            Some(Err(RenderError::SessionClosed))
        ));
    }

    #[test]
    fn dimension_ticket_ready() {
        let ticket = DimensionTicket::ready(0, Ok(PageSize::new(3, 4)));
        assert_eq!(ticket.page(), 0);
        assert_eq!(ticket.wait().unwrap(), PageSize::new(3, 4));
    }

    #[test]
    fn error_messages_name_the_page() {
        let err = RenderError::InvalidPageIndex {
            page: 9,
            page_count: 3,
        };
        assert_eq!(err.to_string(), "page 9 out of range (document has 3 pages)");
        let err = RenderError::InvalidTargetSize {
            size: PageSize::new(0, 10),
        };
        assert_eq!(err.to_string(), "invalid target size 0x10");
    }
}
