//! Per-page in-flight request table
//!
//! Maps a page to the one request allowed to render it. Admitting a newer
//! request cancels and replaces the older one in a single step under the
//! table's own lock, which is separate from the document lock. Committing a
//! finished render to the cache happens under the same lock, so a superseded
//! render can never overwrite the result of the request that replaced it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::debug;

use super::request::{Priority, RenderRequest, RequestId};
use crate::types::{PageIndex, PageSize};

/// Cooperative cancellation flag shared by a request and its job
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct Entry {
    id: RequestId,
    priority: Priority,
    size: PageSize,
    token: CancelToken,
}

#[derive(Debug, Default)]
struct TableState {
    entries: HashMap<PageIndex, Entry>,
    closed: bool,
}

/// Result of admitting a request into the table
#[derive(Debug)]
pub(crate) enum Admission {
    /// The request owns its page now
    Accepted(CancelToken),
    /// A request already in flight covers this one
    Coalesced,
    Closed,
}

#[derive(Debug, Default)]
pub(crate) struct InFlightTable {
    state: Mutex<TableState>,
}

impl InFlightTable {
    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request, superseding whatever was in flight for its page.
    ///
    /// An on-screen request always wins. A prefetch yields to an on-screen
    /// request and to a prefetch of the same size; it replaces a prefetch of a
    /// different size.
    pub(crate) fn admit(&self, id: RequestId, request: &RenderRequest) -> Admission {
        let mut state = self.lock();
        if state.closed {
            return Admission::Closed;
        }

        if let Some(existing) = state.entries.get(&request.page) {
            let covered = request.priority == Priority::Prefetch
                && (existing.priority == Priority::OnScreen || existing.size == request.size);
            if covered {
                return Admission::Coalesced;
            }
            existing.token.cancel();
            debug!(
                "Request {:?} supersedes {:?} for page {}",
                id, existing.id, request.page
            );
        }

        let token = CancelToken::new();
        state.entries.insert(
            request.page,
            Entry {
                id,
                priority: request.priority,
                size: request.size,
                token: token.clone(),
            },
        );
        Admission::Accepted(token)
    }

    /// Settle a request answered from the cache. Under the table lock,
    /// `still_cached` confirms the hit was not overwritten by a commit in the
    /// meantime; if it holds, whatever is in flight for the page at another
    /// size is cancelled, since it would replace the image this request was
    /// given. A prefetch hit leaves an on-screen render alone.
    ///
    /// Returns `false`, changing nothing, when the hit is stale or the table
    /// is closed.
    pub(crate) fn settle_hit(
        &self,
        request: &RenderRequest,
        still_cached: impl FnOnce() -> bool,
    ) -> bool {
        let mut state = self.lock();
        if state.closed || !still_cached() {
            return false;
        }

        let outdated = state.entries.get(&request.page).is_some_and(|existing| {
            existing.size != request.size
                && !(request.priority == Priority::Prefetch
                    && existing.priority == Priority::OnScreen)
        });
        if outdated {
            if let Some(entry) = state.entries.remove(&request.page) {
                entry.token.cancel();
                debug!(
                    "Cached page {} supersedes request {:?}",
                    request.page, entry.id
                );
            }
        }
        true
    }

    /// Run `commit` if `id` still owns `page` and was not cancelled, then
    /// retire the entry. Returns whether `commit` ran.
    pub(crate) fn commit(
        &self,
        page: PageIndex,
        id: RequestId,
        token: &CancelToken,
        commit: impl FnOnce(),
    ) -> bool {
        let mut state = self.lock();
        let owns_page = state.entries.get(&page).is_some_and(|e| e.id == id);
        if state.closed || token.is_cancelled() || !owns_page {
            return false;
        }
        commit();
        state.entries.remove(&page);
        true
    }

    /// Retire `id`'s entry if it still owns `page`
    pub(crate) fn release(&self, page: PageIndex, id: RequestId) -> bool {
        let mut state = self.lock();
        if state.entries.get(&page).is_some_and(|e| e.id == id) {
            state.entries.remove(&page);
            return true;
        }
        false
    }

    /// Cancel whatever request is in flight for `page`
    pub(crate) fn cancel_page(&self, page: PageIndex) -> bool {
        match self.lock().entries.remove(&page) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Refuse further admissions and cancel everything in flight
    pub(crate) fn close(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        let cancelled = state.entries.len();
        for (_, entry) in state.entries.drain() {
            entry.token.cancel();
        }
        cancelled
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub(crate) fn contains(&self, page: PageIndex) -> bool {
        self.lock().entries.contains_key(&page)
    }
}

/// Lets a ticket cancel its own request
#[derive(Debug)]
pub(crate) struct CancelHandle {
    token: CancelToken,
    page: PageIndex,
    id: RequestId,
    table: Weak<InFlightTable>,
}

impl CancelHandle {
    pub(crate) fn new(
        token: CancelToken,
        page: PageIndex,
        id: RequestId,
        table: &Arc<InFlightTable>,
    ) -> Self {
        Self {
            token,
            page,
            id,
            table: Arc::downgrade(table),
        }
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
        if let Some(table) = self.table.upgrade() {
            table.release(self.page, self.id);
        }
    }
}
