//! Render scheduler - owns a document handle and the workers rendering it

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use flume::Sender;
use log::{debug, error};

use super::inflight::{Admission, CancelHandle, InFlightTable};
use super::request::{DimensionTicket, Priority, RenderError, RenderRequest, RenderTicket, RequestId};
use super::worker::{Job, RenderContext, RenderJob, render_worker};
use crate::cache::PageCache;
use crate::document::DocumentHandle;
use crate::events::{EventSink, SessionEvent};
use crate::pool::BufferPool;
use crate::types::{PageIndex, PageSize};

pub const DEFAULT_WORKERS: usize = 2;

struct Queues {
    urgent: Sender<Job>,
    background: Sender<Job>,
}

impl Queues {
    fn send(&self, priority: Priority, job: Job) -> bool {
        let queue = match priority {
            Priority::OnScreen => &self.urgent,
            Priority::Prefetch => &self.background,
        };
        queue.send(job).is_ok()
    }
}

/// Serializes access to one document handle across a small worker pool.
///
/// Requests for different pages render in submission order per priority
/// class, on-screen first. A newer request for a page supersedes the one in
/// flight. Closing cancels everything and waits for the workers to exit.
pub struct RenderScheduler {
    ctx: Arc<RenderContext>,
    queues: Mutex<Option<Queues>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_request_id: AtomicU64,
    closed: AtomicBool,
}

impl RenderScheduler {
    pub fn new(
        identity: impl Into<String>,
        document: Box<dyn DocumentHandle>,
        cache: PageCache,
        pool: BufferPool,
        sink: Arc<dyn EventSink>,
        workers: usize,
    ) -> Self {
        let ctx = Arc::new(RenderContext {
            identity: identity.into(),
            page_count: document.page_count(),
            document: Mutex::new(Some(document)),
            dimensions: Mutex::new(HashMap::new()),
            inflight: Arc::new(InFlightTable::default()),
            cache,
            pool,
            sink,
        });

        let (urgent_tx, urgent_rx) = flume::unbounded();
        let (background_tx, background_rx) = flume::unbounded();

        let mut handles = Vec::new();
        for n in 0..workers.max(1) {
            let ctx = Arc::clone(&ctx);
            let urgent = urgent_rx.clone();
            let background = background_rx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("folio-render-{n}"))
                .spawn(move || render_worker(ctx, urgent, background));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => error!("Failed to spawn render worker {n}: {e}"),
            }
        }
        debug!(
            "Render scheduler for {} started with {} workers",
            ctx.identity,
            handles.len()
        );

        Self {
            ctx,
            queues: Mutex::new(Some(Queues {
                urgent: urgent_tx,
                background: background_tx,
            })),
            workers: Mutex::new(handles),
            next_request_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.ctx.identity
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.ctx.page_count
    }

    #[must_use]
    pub fn cache(&self) -> &PageCache {
        &self.ctx.cache
    }

    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.ctx.pool
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Requests currently waiting for or holding the document
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.ctx.inflight.len()
    }

    #[must_use]
    pub fn is_in_flight(&self, page: PageIndex) -> bool {
        self.ctx.inflight.contains(page)
    }

    /// Submit a render.
    ///
    /// Invalid requests and cache hits resolve immediately without touching
    /// the document. A hit must match the requested size exactly.
    pub fn request_render(&self, request: RenderRequest) -> RenderTicket {
        let id = self.next_id();
        let RenderRequest {
            page,
            size,
            priority,
        } = request;

        if let Err(err) = self.check(page) {
            return RenderTicket::ready(id, page, Err(err));
        }
        if size.is_empty() {
            return RenderTicket::ready(id, page, Err(RenderError::InvalidTargetSize { size }));
        }

        // a hit supersedes renders of this page at other sizes, atomically
        // with respect to their commits
        let hit = self
            .ctx
            .cache
            .get(&self.ctx.identity, page)
            .filter(|image| image.size() == size)
            .filter(|image| {
                self.ctx
                    .inflight
                    .settle_hit(&request, || self.ctx.cache.holds(&self.ctx.identity, image))
            });
        if let Some(image) = hit {
            self.ctx.sink.emit(SessionEvent::RenderCompleted {
                page,
                size,
                from_cache: true,
            });
            return RenderTicket::ready(id, page, Ok(image));
        }

        let token = match self.ctx.inflight.admit(id, &request) {
            Admission::Accepted(token) => token,
            Admission::Coalesced => {
                return RenderTicket::ready(id, page, Err(RenderError::Superseded { page }));
            }
            Admission::Closed => return RenderTicket::ready(id, page, Err(RenderError::SessionClosed)),
        };

        let (reply, rx) = flume::bounded(1);
        let cancel = CancelHandle::new(token.clone(), page, id, &self.ctx.inflight);
        let job = Job::Render(RenderJob {
            id,
            request,
            token,
            reply,
        });
        if !self.enqueue(priority, job) {
            self.ctx.inflight.release(page, id);
            return RenderTicket::ready(id, page, Err(RenderError::SessionClosed));
        }

        RenderTicket::pending(id, page, rx, cancel)
    }

    /// Look up a page's native size, opening the page on a worker if it was
    /// never seen
    pub fn page_dimensions(&self, page: PageIndex) -> DimensionTicket {
        if let Err(err) = self.check(page) {
            return DimensionTicket::ready(page, Err(err));
        }
        if let Some(size) = self.ctx.cached_dimensions(page) {
            return DimensionTicket::ready(page, Ok(size));
        }

        let (reply, rx) = flume::bounded(1);
        if !self.enqueue(Priority::OnScreen, Job::Dimensions { page, reply }) {
            return DimensionTicket::ready(page, Err(RenderError::SessionClosed));
        }
        DimensionTicket::pending(page, rx)
    }

    #[must_use]
    pub fn cached_dimensions(&self, page: PageIndex) -> Option<PageSize> {
        self.ctx.cached_dimensions(page)
    }

    /// Queue background lookups for every page whose size is unknown.
    /// Returns how many were queued.
    pub fn preload_dimensions(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        let mut queued = 0;
        for page in 0..self.ctx.page_count {
            if self.ctx.cached_dimensions(page).is_some() {
                continue;
            }
            // nobody waits on the reply; the worker records the size
            let (reply, _) = flume::bounded(1);
            if !self.enqueue(Priority::Prefetch, Job::Dimensions { page, reply }) {
                break;
            }
            queued += 1;
        }
        queued
    }

    /// Cancel whatever is in flight for `page`
    pub fn cancel(&self, page: PageIndex) -> bool {
        self.ctx.inflight.cancel_page(page)
    }

    /// Cancel everything, release the document and wait for the workers.
    /// Returns how many requests were in flight. Idempotent.
    pub fn close(&self) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let cancelled = self.ctx.inflight.close();
        drop(
            self.queues
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        // waits for a render holding the document to finish
        if let Some(mut document) = self.ctx.lock_document().take() {
            document.close();
        }

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let current = std::thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("Render worker for {} panicked", self.ctx.identity);
            }
        }

        self.ctx.pool.invalidate();
        debug!(
            "Render scheduler for {} closed, {cancelled} requests cancelled",
            self.ctx.identity
        );
        cancelled
    }

    fn check(&self, page: PageIndex) -> Result<(), RenderError> {
        if self.is_closed() {
            return Err(RenderError::SessionClosed);
        }
        if page >= self.ctx.page_count {
            return Err(RenderError::InvalidPageIndex {
                page,
                page_count: self.ctx.page_count,
            });
        }
        Ok(())
    }

    fn enqueue(&self, priority: Priority, job: Job) -> bool {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|queues| queues.send(priority, job))
    }

    fn next_id(&self) -> RequestId {
        RequestId::new(self.next_request_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Drop for RenderScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RenderScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderScheduler")
            .field("identity", &self.ctx.identity)
            .field("page_count", &self.ctx.page_count)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::{CachePolicy, CacheStrategy};
    use crate::document::SyntheticDocument;
    use crate::events::NullSink;

    const WAIT: Duration = Duration::from_secs(5);

    fn scheduler(pages: usize) -> RenderScheduler {
        RenderScheduler::new(
            "synthetic.pdf",
            Box::new(SyntheticDocument::uniform(pages, PageSize::new(60, 80))),
            PageCache::new(CachePolicy::for_strategy(CacheStrategy::MaximizePerformance, 8, 5).in_memory()),
            BufferPool::new(),
            Arc::new(NullSink),
            DEFAULT_WORKERS,
        )
    }

    #[test]
    fn renders_and_caches() {
        let scheduler = scheduler(3);
        let size = PageSize::new(30, 40);
        let image = scheduler
            .request_render(RenderRequest::on_screen(1, size))
            .wait()
            .unwrap();
        assert_eq!(image.size(), size);
        assert!(scheduler.cache().contains("synthetic.pdf", 1));
        assert_eq!(scheduler.cached_dimensions(1), Some(PageSize::new(60, 80)));

        let again = scheduler.request_render(RenderRequest::on_screen(1, size));
        assert!(again.is_ready());
        assert!(Arc::ptr_eq(&image, &again.wait().unwrap()));
    }

    #[test]
    fn rejects_invalid_requests_immediately() {
        let scheduler = scheduler(2);
        let ticket = scheduler.request_render(RenderRequest::on_screen(2, PageSize::new(10, 10)));
        assert!(matches!(
            ticket.wait(),
            Err(RenderError::InvalidPageIndex { page: 2, page_count: 2 })
        ));
        let ticket = scheduler.request_render(RenderRequest::on_screen(0, PageSize::new(0, 10)));
        assert!(matches!(ticket.wait(), Err(RenderError::InvalidTargetSize { .. })));
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[test]
    fn dimensions_are_looked_up_once() {
        let scheduler = scheduler(4);
        let size = scheduler
            .page_dimensions(3)
            .wait_timeout(WAIT)
            .expect("timed out")
            .unwrap();
        assert_eq!(size, PageSize::new(60, 80));
        assert_eq!(scheduler.cached_dimensions(3), Some(size));
    }

    #[test]
    fn close_is_idempotent_and_rejects_new_work() {
        let scheduler = scheduler(2);
        scheduler.close();
        assert_eq!(scheduler.close(), 0);
        assert!(scheduler.is_closed());
        assert!(matches!(
            scheduler
                .request_render(RenderRequest::on_screen(0, PageSize::new(5, 5)))
                .wait(),
            Err(RenderError::SessionClosed)
        ));
        assert!(matches!(
            scheduler.page_dimensions(0).wait(),
            Err(RenderError::SessionClosed)
        ));
        assert!(scheduler.pool().is_invalidated());
    }
}
