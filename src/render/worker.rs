//! Render worker - runs in separate thread(s)
//!
//! Workers share one document handle behind a mutex: only one render touches
//! the handle at a time, while cache commits and disk writes happen after the
//! handle is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use flume::{Receiver, Sender};
use log::{debug, warn};

use super::inflight::{CancelToken, InFlightTable};
use super::request::{DimensionOutcome, RenderError, RenderOutcome, RenderRequest, RequestId};
use crate::cache::PageCache;
use crate::document::DocumentHandle;
use crate::events::{EventSink, SessionEvent};
use crate::pool::BufferPool;
use crate::types::{PageImage, PageIndex, PageSize};

/// State shared between a scheduler and its workers
pub(crate) struct RenderContext {
    pub identity: String,
    pub page_count: usize,
    pub document: Mutex<Option<Box<dyn DocumentHandle>>>,
    pub dimensions: Mutex<HashMap<PageIndex, PageSize>>,
    pub inflight: Arc<InFlightTable>,
    pub cache: PageCache,
    pub pool: BufferPool,
    pub sink: Arc<dyn EventSink>,
}

impl RenderContext {
    pub(crate) fn lock_document(&self) -> MutexGuard<'_, Option<Box<dyn DocumentHandle>>> {
        self.document.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn cached_dimensions(&self, page: PageIndex) -> Option<PageSize> {
        self.dimensions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&page)
            .copied()
    }

    fn remember_dimensions(&self, page: PageIndex, size: PageSize) {
        self.dimensions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(page, size);
    }
}

pub(crate) struct RenderJob {
    pub id: RequestId,
    pub request: RenderRequest,
    pub token: CancelToken,
    pub reply: Sender<RenderOutcome>,
}

pub(crate) enum Job {
    Render(RenderJob),
    Dimensions {
        page: PageIndex,
        reply: Sender<DimensionOutcome>,
    },
}

/// Main worker function - runs in a dedicated thread until both queues close
#[expect(
    clippy::needless_pass_by_value,
    reason = "Values moved into thread, need ownership"
)]
pub(crate) fn render_worker(
    ctx: Arc<RenderContext>,
    urgent: Receiver<Job>,
    background: Receiver<Job>,
) {
    while let Some(job) = next_job(&urgent, &background) {
        match job {
            Job::Render(job) => handle_render(&ctx, job),
            Job::Dimensions { page, reply } => {
                let _ = reply.send(handle_dimensions(&ctx, page));
            }
        }
    }
    debug!("Render worker for {} exiting", ctx.identity);
}

/// On-screen work is taken before prefetch work whenever both are queued
fn next_job(urgent: &Receiver<Job>, background: &Receiver<Job>) -> Option<Job> {
    if let Ok(job) = urgent.try_recv() {
        return Some(job);
    }
    flume::Selector::new()
        .recv(urgent, Result::ok)
        .recv(background, Result::ok)
        .wait()
}

fn handle_render(ctx: &RenderContext, job: RenderJob) {
    let RenderJob {
        id,
        request,
        token,
        reply,
    } = job;
    let page = request.page;

    let outcome = render_exclusive(ctx, &request, &token)
        .and_then(|image| commit(ctx, id, &token, image));

    match &outcome {
        Ok(image) => ctx.sink.emit(SessionEvent::RenderCompleted {
            page,
            size: image.size(),
            from_cache: false,
        }),
        Err(RenderError::Cancelled { .. }) => {
            ctx.inflight.release(page, id);
            ctx.sink.emit(SessionEvent::RenderCancelled { page });
        }
        Err(err) => {
            ctx.inflight.release(page, id);
            warn!("Render of page {page} in {} failed: {err}", ctx.identity);
            ctx.sink.emit(SessionEvent::RenderFailed {
                page,
                reason: error_chain(err),
            });
        }
    }

    let _ = reply.send(outcome);
}

/// Render while holding the document lock. The pixel buffer comes from the
/// pool only once the lock is held, so a queued request costs no memory.
fn render_exclusive(
    ctx: &RenderContext,
    request: &RenderRequest,
    token: &CancelToken,
) -> Result<PageImage, RenderError> {
    let page = request.page;
    if token.is_cancelled() {
        return Err(RenderError::Cancelled { page });
    }

    let mut guard = ctx.lock_document();
    let Some(document) = guard.as_mut() else {
        return Err(RenderError::SessionClosed);
    };
    // the request may have been superseded while waiting for the lock
    if token.is_cancelled() {
        return Err(RenderError::Cancelled { page });
    }

    ctx.sink.emit(SessionEvent::RenderStarted {
        page,
        priority: request.priority,
    });

    let mut open = document
        .open_page(page)
        .map_err(|source| RenderError::RenderFailure { page, source })?;
    ctx.remember_dimensions(page, open.size());

    let mut buffer = ctx.pool.acquire(request.size.width, request.size.height);
    open.render(&mut buffer)
        .map_err(|source| RenderError::RenderFailure { page, source })?;

    Ok(PageImage::new(page, buffer))
}

/// Publish a finished image unless it was superseded or cancelled meanwhile.
/// A rejected image is dropped here and its buffer goes back to the pool.
fn commit(
    ctx: &RenderContext,
    id: RequestId,
    token: &CancelToken,
    image: PageImage,
) -> RenderOutcome {
    let page = image.page();
    let image = Arc::new(image);
    let committed = ctx.inflight.commit(page, id, token, || {
        ctx.cache.put_memory(&ctx.identity, Arc::clone(&image));
    });
    if !committed {
        return Err(RenderError::Cancelled { page });
    }

    ctx.cache.persist(&ctx.identity, &image);
    Ok(image)
}

fn handle_dimensions(ctx: &RenderContext, page: PageIndex) -> DimensionOutcome {
    if let Some(size) = ctx.cached_dimensions(page) {
        return Ok(size);
    }

    let mut guard = ctx.lock_document();
    let Some(document) = guard.as_mut() else {
        return Err(RenderError::SessionClosed);
    };
    let size = document
        .open_page(page)
        .map_err(|source| RenderError::RenderFailure { page, source })?
        .size();
    ctx.remember_dimensions(page, size);
    Ok(size)
}

fn error_chain(err: &RenderError) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
