//! Prefetching of pages near the one being viewed
//!
//! The planner is a pure function of the current page and scroll direction.
//! The scheduler runs plans on a background thread, debounced so that a burst
//! of scroll events only prefetches around the page the user settled on.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error};

use crate::events::{EventSink, SessionEvent};
use crate::render::{RenderRequest, RenderScheduler};
use crate::types::{PageIndex, PageSize};

pub const DEFAULT_PREFETCH_DISTANCE: usize = 2;
pub const DEFAULT_PREFETCH_DEBOUNCE: Duration = Duration::from_millis(100);

/// Which way the user is moving through the document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScrollDirection {
    Forward,
    Backward,
    /// Not moving; prefetch both ways
    #[default]
    Stationary,
}

impl ScrollDirection {
    /// Direction of a scroll delta; positive deltas move forward
    #[must_use]
    pub fn from_delta(delta: i64) -> Self {
        match delta.signum() {
            1 => ScrollDirection::Forward,
            -1 => ScrollDirection::Backward,
            _ => ScrollDirection::Stationary,
        }
    }

    /// Direction of travel from one page to another
    #[must_use]
    pub fn between(from: PageIndex, to: PageIndex) -> Self {
        match to.cmp(&from) {
            std::cmp::Ordering::Greater => ScrollDirection::Forward,
            std::cmp::Ordering::Less => ScrollDirection::Backward,
            std::cmp::Ordering::Equal => ScrollDirection::Stationary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchPlanner {
    distance: usize,
}

impl Default for PrefetchPlanner {
    fn default() -> Self {
        Self::new(DEFAULT_PREFETCH_DISTANCE)
    }
}

impl PrefetchPlanner {
    #[must_use]
    pub fn new(distance: usize) -> Self {
        Self { distance }
    }

    #[must_use]
    pub fn distance(&self) -> usize {
        self.distance
    }

    /// Pages worth prefetching from `current`, nearest first. Pages at the
    /// same distance are ordered lower page first.
    #[must_use]
    pub fn plan(
        &self,
        current: PageIndex,
        page_count: usize,
        direction: ScrollDirection,
    ) -> Vec<PageIndex> {
        if current >= page_count {
            return Vec::new();
        }

        let before = current.saturating_sub(self.distance)..current;
        let after = current + 1..(current + self.distance + 1).min(page_count);
        let mut pages: Vec<PageIndex> = match direction {
            ScrollDirection::Forward => after.collect(),
            ScrollDirection::Backward => before.collect(),
            ScrollDirection::Stationary => before.chain(after).collect(),
        };

        // stable, so equal distances keep ascending page order
        pages.sort_by_key(|page| page.abs_diff(current));
        pages
    }
}

struct PrefetchPlan {
    current: PageIndex,
    direction: ScrollDirection,
    target: PageSize,
}

/// Debounced background prefetcher for one render scheduler
pub struct PrefetchScheduler {
    plans: Mutex<Option<Sender<PrefetchPlan>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PrefetchScheduler {
    pub fn new(
        scheduler: Arc<RenderScheduler>,
        planner: PrefetchPlanner,
        debounce: Duration,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let (tx, rx) = flume::unbounded();
        let spawned = std::thread::Builder::new()
            .name("folio-prefetch".into())
            .spawn(move || prefetch_loop(&scheduler, planner, debounce, &rx, sink.as_ref()));

        let worker = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Failed to spawn prefetch thread: {e}");
                None
            }
        };

        Self {
            plans: Mutex::new(worker.as_ref().map(|_| tx)),
            worker: Mutex::new(worker),
        }
    }

    /// Queue a plan around `current`. `target` is the size on-screen pages
    /// are rendered at; prefetched pages keep its width. Replaces any plan
    /// still waiting out the debounce.
    pub fn schedule(&self, current: PageIndex, direction: ScrollDirection, target: PageSize) {
        if let Some(plans) = self
            .plans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = plans.send(PrefetchPlan {
                current,
                direction,
                target,
            });
        }
    }

    /// Stop the background thread; pending plans are discarded
    pub fn shutdown(&self) {
        drop(
            self.plans
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.thread().id() != std::thread::current().id() && worker.join().is_err() {
                error!("Prefetch thread panicked");
            }
        }
    }
}

impl Drop for PrefetchScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PrefetchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchScheduler").finish_non_exhaustive()
    }
}

fn prefetch_loop(
    scheduler: &RenderScheduler,
    planner: PrefetchPlanner,
    debounce: Duration,
    plans: &Receiver<PrefetchPlan>,
    sink: &dyn EventSink,
) {
    while let Ok(mut plan) = plans.recv() {
        loop {
            match plans.recv_timeout(debounce) {
                Ok(newer) => plan = newer,
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
        issue(scheduler, planner, &plan, plans, sink);
    }
    debug!("Prefetch thread exiting");
}

fn issue(
    scheduler: &RenderScheduler,
    planner: PrefetchPlanner,
    plan: &PrefetchPlan,
    plans: &Receiver<PrefetchPlan>,
    sink: &dyn EventSink,
) {
    if scheduler.is_closed() {
        return;
    }

    let identity = scheduler.identity();
    let pages: Vec<PageIndex> = planner
        .plan(plan.current, scheduler.page_count(), plan.direction)
        .into_iter()
        .filter(|&page| !scheduler.cache().contains(identity, page))
        .collect();

    sink.emit(SessionEvent::PrefetchPlanned {
        current: plan.current,
        pages: pages.clone(),
    });

    for page in pages {
        // a newer plan is waiting; this one is stale
        if !plans.is_empty() || scheduler.is_closed() {
            break;
        }
        let size = prefetch_size(scheduler, page, plan.target);
        // fire and forget; the result lands in the cache
        drop(scheduler.request_render(RenderRequest::prefetch(page, size)));
    }
}

/// Target width with the height taken from the page's aspect ratio, when the
/// page's size is already known
fn prefetch_size(scheduler: &RenderScheduler, page: PageIndex, target: PageSize) -> PageSize {
    scheduler
        .cached_dimensions(page)
        .map_or(target, |native| {
            PageSize::new(target.width, native.height_for_width(target.width))
        })
}
