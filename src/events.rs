//! Structured session events
//!
//! Sessions report what they do through an injected [`EventSink`] instead
//! of global debug switches. Events are notifications only: nothing in the
//! render path depends on whether a sink consumes them.

use flume::{Receiver, Sender};
use log::{debug, info, warn};

use crate::render::Priority;
use crate::types::{PageIndex, PageSize};

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    LoadStarted {
        identity: String,
    },
    LoadSucceeded {
        identity: String,
        page_count: usize,
    },
    LoadFailed {
        identity: String,
        reason: String,
    },
    PageChanged {
        current: PageIndex,
        total: usize,
    },
    /// A render acquired the document and started drawing
    RenderStarted {
        page: PageIndex,
        priority: Priority,
    },
    RenderCompleted {
        page: PageIndex,
        size: PageSize,
        from_cache: bool,
    },
    RenderCancelled {
        page: PageIndex,
    },
    RenderFailed {
        page: PageIndex,
        reason: String,
    },
    PrefetchPlanned {
        current: PageIndex,
        pages: Vec<PageIndex>,
    },
    SessionClosed {
        identity: String,
        cancelled: usize,
    },
}

/// Receiver of session events; called from worker threads
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

/// Writes events to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: SessionEvent) {
        match &event {
            SessionEvent::LoadFailed { .. } | SessionEvent::RenderFailed { .. } => {
                warn!("{event:?}");
            }
            SessionEvent::LoadSucceeded { .. } | SessionEvent::SessionClosed { .. } => {
                info!("{event:?}");
            }
            _ => debug!("{event:?}"),
        }
    }
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: SessionEvent) {}
}

/// Forwards events to a channel drained by the consumer, typically on its UI
/// thread.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<SessionEvent>,
}

impl ChannelSink {
    #[must_use]
    pub fn new() -> (Self, Receiver<SessionEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }
}

/// Drain every event currently queued on a [`ChannelSink`] receiver
#[must_use]
pub fn drain(events: &Receiver<SessionEvent>) -> Vec<SessionEvent> {
    events.try_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_delivers_in_order() {
        let (sink, rx) = ChannelSink::new();
        sink.emit(SessionEvent::PageChanged {
            current: 1,
            total: 3,
        });
        sink.emit(SessionEvent::RenderCancelled { page: 2 });

        assert_eq!(
            drain(&rx),
            vec![
                SessionEvent::PageChanged {
                    current: 1,
                    total: 3
                },
                SessionEvent::RenderCancelled { page: 2 },
            ]
        );
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn channel_sink_tolerates_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(SessionEvent::RenderCancelled { page: 0 });
    }
}
