//! Document sessions
//!
//! A [`DocumentSession`] owns one document handle (through its render
//! scheduler), shares a page cache and runs a prefetcher. A [`SessionHost`]
//! keeps exactly one session active for a consumer and closes the previous
//! one whenever another document is opened.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info};

use crate::cache::{
    CachePolicy, CacheStats, CacheStrategy, DEFAULT_MAX_CACHED_DOCUMENTS,
    DEFAULT_PAGES_PER_DOCUMENT, PageCache,
};
use crate::document::{DocumentError, DocumentHandle, DocumentSource, SourceResolver, ensure_pages};
use crate::events::{EventSink, LogSink, SessionEvent};
use crate::pool::{BufferPool, PoolStats};
use crate::prefetch::{
    DEFAULT_PREFETCH_DEBOUNCE, DEFAULT_PREFETCH_DISTANCE, PrefetchPlanner, PrefetchScheduler,
    ScrollDirection,
};
use crate::render::{
    DEFAULT_WORKERS, DimensionTicket, Priority, RenderRequest, RenderScheduler, RenderTicket,
};
use crate::types::{PageImage, PageIndex, PageSize, RenderQuality};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("document handle unavailable")]
    HandleUnavailable(#[source] DocumentError),
}

/// Everything needed to start a session
#[derive(Clone)]
pub struct SessionOptions {
    pub cache_strategy: CacheStrategy,
    /// Memory-tier capacity under `MaximizePerformance`
    pub memory_pages: usize,
    pub max_cached_documents: usize,
    /// Root of the persistent tier; `None` keeps the cache in memory
    pub cache_dir: Option<PathBuf>,
    pub prefetch_distance: usize,
    pub prefetch_debounce: Duration,
    pub workers: usize,
    pub quality: RenderQuality,
    pub sink: Arc<dyn EventSink>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            cache_strategy: CacheStrategy::default(),
            memory_pages: DEFAULT_MAX_CACHED_DOCUMENTS * DEFAULT_PAGES_PER_DOCUMENT,
            max_cached_documents: DEFAULT_MAX_CACHED_DOCUMENTS,
            cache_dir: None,
            prefetch_distance: DEFAULT_PREFETCH_DISTANCE,
            prefetch_debounce: DEFAULT_PREFETCH_DEBOUNCE,
            workers: DEFAULT_WORKERS,
            quality: RenderQuality::default(),
            sink: Arc::new(LogSink),
        }
    }
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("cache_strategy", &self.cache_strategy)
            .field("memory_pages", &self.memory_pages)
            .field("max_cached_documents", &self.max_cached_documents)
            .field("cache_dir", &self.cache_dir)
            .field("prefetch_distance", &self.prefetch_distance)
            .field("prefetch_debounce", &self.prefetch_debounce)
            .field("workers", &self.workers)
            .field("quality", &self.quality)
            .finish_non_exhaustive()
    }
}

impl SessionOptions {
    #[must_use]
    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.cache_strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy::for_strategy(
            self.cache_strategy,
            self.memory_pages,
            self.max_cached_documents,
        )
    }

    /// A fresh cache for these options
    #[must_use]
    pub fn build_cache(&self) -> PageCache {
        let policy = self.cache_policy();
        match &self.cache_dir {
            Some(dir) => PageCache::with_disk(policy, dir),
            None => PageCache::new(policy.in_memory()),
        }
    }
}

/// One open document
pub struct DocumentSession {
    identity: String,
    page_count: usize,
    scheduler: Arc<RenderScheduler>,
    prefetch: PrefetchScheduler,
    quality: RenderQuality,
    strategy: CacheStrategy,
    sink: Arc<dyn EventSink>,
    /// Target size of the latest on-screen request, after quality scaling
    viewport: Mutex<Option<PageSize>>,
    current_page: AtomicUsize,
    closed: AtomicBool,
}

impl DocumentSession {
    /// Resolve `source` and start a session with its own cache
    pub fn open(
        source: &DocumentSource,
        resolver: &dyn SourceResolver,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let cache = options.build_cache();
        Self::open_with_cache(source, resolver, options, cache)
    }

    /// Resolve `source` and start a session on an existing cache
    pub fn open_with_cache(
        source: &DocumentSource,
        resolver: &dyn SourceResolver,
        options: SessionOptions,
        cache: PageCache,
    ) -> Result<Self, SessionError> {
        Self::load(source.identity(), || resolver.resolve(source), options, cache)
    }

    /// Start a session on an already opened handle
    pub fn from_handle(
        identity: impl Into<String>,
        handle: Box<dyn DocumentHandle>,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let cache = options.build_cache();
        Self::from_handle_with_cache(identity, handle, options, cache)
    }

    pub fn from_handle_with_cache(
        identity: impl Into<String>,
        handle: Box<dyn DocumentHandle>,
        options: SessionOptions,
        cache: PageCache,
    ) -> Result<Self, SessionError> {
        Self::load(identity.into(), || Ok(handle), options, cache)
    }

    fn load(
        identity: String,
        resolve: impl FnOnce() -> Result<Box<dyn DocumentHandle>, DocumentError>,
        options: SessionOptions,
        cache: PageCache,
    ) -> Result<Self, SessionError> {
        let sink = Arc::clone(&options.sink);
        sink.emit(SessionEvent::LoadStarted {
            identity: identity.clone(),
        });

        let handle = match resolve().and_then(|handle| ensure_pages(handle.as_ref()).map(|()| handle)) {
            Ok(handle) => handle,
            Err(e) => {
                sink.emit(SessionEvent::LoadFailed {
                    identity,
                    reason: e.to_string(),
                });
                return Err(SessionError::HandleUnavailable(e));
            }
        };

        let page_count = handle.page_count();
        let scheduler = Arc::new(RenderScheduler::new(
            identity.clone(),
            handle,
            cache,
            BufferPool::new(),
            Arc::clone(&sink),
            options.workers,
        ));
        let prefetch = PrefetchScheduler::new(
            Arc::clone(&scheduler),
            PrefetchPlanner::new(options.prefetch_distance),
            options.prefetch_debounce,
            Arc::clone(&sink),
        );

        info!(
            "Opened {identity}: {page_count} pages, {} cache",
            options.cache_strategy.as_str()
        );
        sink.emit(SessionEvent::LoadSucceeded {
            identity: identity.clone(),
            page_count,
        });

        Ok(Self {
            identity,
            page_count,
            scheduler,
            prefetch,
            quality: options.quality,
            strategy: options.cache_strategy,
            sink,
            viewport: Mutex::new(None),
            current_page: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    #[must_use]
    pub fn cache_strategy(&self) -> CacheStrategy {
        self.strategy
    }

    #[must_use]
    pub fn quality(&self) -> RenderQuality {
        self.quality
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn current_page(&self) -> PageIndex {
        self.current_page.load(Ordering::Acquire)
    }

    /// Render `page` at `width` x `height` (before quality scaling). Never
    /// blocks; the ticket resolves to the image or the reason there is none.
    pub fn request_render(
        &self,
        page: PageIndex,
        width: u32,
        height: u32,
        priority: Priority,
    ) -> RenderTicket {
        let target = PageSize::new(width, height).scaled(self.quality.multiplier());
        let valid = !self.is_closed() && page < self.page_count && !target.is_empty();
        if priority == Priority::OnScreen && valid {
            *self.viewport.lock().unwrap_or_else(PoisonError::into_inner) = Some(target);
        }
        self.scheduler
            .request_render(RenderRequest::new(page, target, priority))
    }

    /// Set the size prefetched pages are rendered at, before quality scaling
    pub fn set_viewport(&self, width: u32, height: u32) {
        let target = PageSize::new(width, height).scaled(self.quality.multiplier());
        if !target.is_empty() {
            *self.viewport.lock().unwrap_or_else(PoisonError::into_inner) = Some(target);
        }
    }

    /// A page already rendered at any size, from memory or disk. Never
    /// renders.
    #[must_use]
    pub fn get_cached_page(&self, page: PageIndex) -> Option<Arc<PageImage>> {
        if self.is_closed() || page >= self.page_count {
            return None;
        }
        self.scheduler.cache().get(&self.identity, page)
    }

    /// Pages of this document currently held in memory, by page index
    #[must_use]
    pub fn cached_pages(&self) -> Vec<Arc<PageImage>> {
        if self.is_closed() {
            return Vec::new();
        }
        self.scheduler.cache().pages(&self.identity)
    }

    /// Native size of a page
    pub fn page_dimensions(&self, page: PageIndex) -> DimensionTicket {
        self.scheduler.page_dimensions(page)
    }

    /// Look up every page's size in the background
    pub fn preload_page_dimensions(&self) -> usize {
        self.scheduler.preload_dimensions()
    }

    /// Prefetch around `current`, debounced. Does nothing until a viewport
    /// size is known from an on-screen request or [`Self::set_viewport`].
    pub fn schedule_prefetch(&self, current: PageIndex, direction: ScrollDirection) {
        if self.is_closed() || current >= self.page_count {
            return;
        }
        let viewport = *self.viewport.lock().unwrap_or_else(PoisonError::into_inner);
        match viewport {
            Some(target) => self.prefetch.schedule(current, direction, target),
            None => debug!("No viewport yet, skipping prefetch around page {current}"),
        }
    }

    /// Record that the user moved to `page` and prefetch ahead of them.
    /// Returns `false` if the page is out of range or the session is closed.
    pub fn set_current_page(&self, page: PageIndex) -> bool {
        if self.is_closed() || page >= self.page_count {
            return false;
        }
        let previous = self.current_page.swap(page, Ordering::AcqRel);
        self.sink.emit(SessionEvent::PageChanged {
            current: page,
            total: self.page_count,
        });
        self.schedule_prefetch(page, ScrollDirection::between(previous, page));
        true
    }

    /// Cancel whatever is in flight for `page`
    pub fn cancel(&self, page: PageIndex) -> bool {
        self.scheduler.cancel(page)
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.scheduler.in_flight()
    }

    #[must_use]
    pub fn buffer_pool_stats(&self) -> PoolStats {
        self.scheduler.pool().stats()
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.scheduler.cache().stats()
    }

    #[must_use]
    pub fn cache(&self) -> &PageCache {
        self.scheduler.cache()
    }

    /// Cancel in-flight work, release the document and flush the cache as
    /// the strategy dictates: `MaximizePerformance` keeps its disk tier for
    /// later sessions, the others drop everything for this document.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.prefetch.shutdown();
        let cancelled = self.scheduler.close();

        let cache = self.scheduler.cache();
        match self.strategy {
            CacheStrategy::MaximizePerformance => {
                cache.clear_memory(&self.identity);
            }
            CacheStrategy::MinimizeMemory | CacheStrategy::Disable => cache.clear(&self.identity),
        }

        info!("Closed {} ({cancelled} requests cancelled)", self.identity);
        self.sink.emit(SessionEvent::SessionClosed {
            identity: self.identity.clone(),
            cancelled,
        });
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("identity", &self.identity)
            .field("page_count", &self.page_count)
            .field("strategy", &self.strategy)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Keeps one session active at a time.
///
/// Sessions opened with the same strategy share one cache, so pages of a
/// document reopened later can still be served from it.
pub struct SessionHost {
    resolver: Box<dyn SourceResolver>,
    options: SessionOptions,
    cache: Option<PageCache>,
    active: Option<DocumentSession>,
}

impl SessionHost {
    pub fn new(resolver: Box<dyn SourceResolver>, options: SessionOptions) -> Self {
        Self {
            resolver,
            options,
            cache: None,
            active: None,
        }
    }

    /// Close the active session, then open `source`
    pub fn open(
        &mut self,
        source: &DocumentSource,
        strategy: CacheStrategy,
    ) -> Result<&DocumentSession, SessionError> {
        self.close();
        let options = self.options.clone().with_strategy(strategy);
        let cache = self.cache_for(&options);
        let session =
            DocumentSession::open_with_cache(source, self.resolver.as_ref(), options, cache)?;
        Ok(self.active.insert(session))
    }

    /// Close the active session, then start one on an opened handle
    pub fn open_handle(
        &mut self,
        identity: impl Into<String>,
        handle: Box<dyn DocumentHandle>,
        strategy: CacheStrategy,
    ) -> Result<&DocumentSession, SessionError> {
        self.close();
        let options = self.options.clone().with_strategy(strategy);
        let cache = self.cache_for(&options);
        let session = DocumentSession::from_handle_with_cache(identity, handle, options, cache)?;
        Ok(self.active.insert(session))
    }

    #[must_use]
    pub fn active(&self) -> Option<&DocumentSession> {
        self.active.as_ref()
    }

    pub fn close(&mut self) {
        if let Some(session) = self.active.take() {
            session.close();
        }
    }

    fn cache_for(&mut self, options: &SessionOptions) -> PageCache {
        let reusable = self
            .cache
            .as_ref()
            .filter(|cache| cache.policy().strategy == options.cache_strategy);
        if let Some(cache) = reusable {
            return cache.clone();
        }
        debug!(
            "Building {} cache for host",
            options.cache_strategy.as_str()
        );
        self.cache.insert(options.build_cache()).clone()
    }
}

impl Drop for SessionHost {
    fn drop(&mut self) {
        self.close();
    }
}
