//! Two-tier page image cache
//!
//! The memory tier is an LRU keyed by (document identity, page index). The
//! persistent tier, enabled by `MaximizePerformance`, stores PNGs on disk;
//! a disk hit is promoted back into memory. Reads never render.

mod disk;
mod strategy;

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use lru::LruCache;

use crate::types::{PageImage, PageIndex};

pub use disk::{CacheError, DiskTier, document_key};
pub use strategy::{
    CachePolicy, CacheStrategy, DEFAULT_MAX_CACHED_DOCUMENTS, DEFAULT_PAGES_PER_DOCUMENT,
};

/// Cache key for rendered pages
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Document identity
    pub document: String,
    /// Page number
    pub page: PageIndex,
}

impl CacheKey {
    #[must_use]
    pub fn new(document: &str, page: PageIndex) -> Self {
        Self {
            document: document.to_string(),
            page,
        }
    }
}

/// Cache counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    /// Entries written to the memory tier
    pub writes: u64,
    pub evictions: u64,
}

struct CacheInner {
    /// `None` when the policy stores nothing
    memory: Option<LruCache<CacheKey, Arc<PageImage>>>,
    stats: CacheStats,
}

/// Page image cache shared between the scheduler (writer) and readers.
///
/// Cloning is cheap; clones share both tiers.
#[derive(Clone)]
pub struct PageCache {
    inner: Arc<Mutex<CacheInner>>,
    policy: CachePolicy,
    disk: Option<Arc<DiskTier>>,
}

impl PageCache {
    /// Memory-only cache for the given policy
    #[must_use]
    pub fn new(policy: CachePolicy) -> Self {
        Self::build(policy, None)
    }

    /// Cache with a persistent tier under `root` when the policy allows one
    #[must_use]
    pub fn with_disk(policy: CachePolicy, root: impl Into<PathBuf>) -> Self {
        let disk = policy
            .persistent
            .then(|| Arc::new(DiskTier::new(root, policy.max_documents)));
        Self::build(policy, disk)
    }

    fn build(policy: CachePolicy, disk: Option<Arc<DiskTier>>) -> Self {
        let memory = NonZeroUsize::new(policy.capacity).map(LruCache::new);
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                memory,
                stats: CacheStats::default(),
            })),
            policy,
            disk,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    #[must_use]
    pub fn disk(&self) -> Option<&DiskTier> {
        self.disk.as_deref()
    }

    /// Look a page up: memory first, then disk (promoting the hit).
    #[must_use]
    pub fn get(&self, document: &str, page: PageIndex) -> Option<Arc<PageImage>> {
        let key = CacheKey::new(document, page);
        {
            let mut inner = self.lock();
            if let Some(hit) = inner.memory.as_mut().and_then(|m| m.get(&key).cloned()) {
                inner.stats.memory_hits += 1;
                return Some(hit);
            }
        }

        let promoted = self.disk.as_ref().and_then(|disk| match disk.load(document, page) {
            Ok(found) => found.map(Arc::new),
            Err(e) => {
                warn!("Failed to read cached page {page} of {document}: {e}");
                None
            }
        });

        let mut inner = self.lock();
        match promoted {
            Some(image) => {
                inner.stats.disk_hits += 1;
                let evicted = inner
                    .memory
                    .as_mut()
                    .and_then(|m| m.push(key.clone(), Arc::clone(&image)))
                    .filter(|(evicted_key, _)| *evicted_key != key);
                if evicted.is_some() {
                    inner.stats.evictions += 1;
                }
                drop(inner);
                drop(evicted);
                Some(image)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Whether a page is stored in either tier, without touching recency
    #[must_use]
    pub fn contains(&self, document: &str, page: PageIndex) -> bool {
        let key = CacheKey::new(document, page);
        let in_memory = self
            .lock()
            .memory
            .as_ref()
            .is_some_and(|m| m.contains(&key));
        in_memory
            || self
                .disk
                .as_ref()
                .is_some_and(|disk| disk.contains(document, page))
    }

    /// Whether the memory tier still holds exactly `image` for its page,
    /// without touching recency
    #[must_use]
    pub fn holds(&self, document: &str, image: &Arc<PageImage>) -> bool {
        let key = CacheKey::new(document, image.page());
        self.lock()
            .memory
            .as_ref()
            .and_then(|m| m.peek(&key))
            .is_some_and(|cached| Arc::ptr_eq(cached, image))
    }

    /// Store a rendered page in memory and, best-effort, on disk
    pub fn put(&self, document: &str, image: Arc<PageImage>) {
        if self.put_memory(document, Arc::clone(&image)) {
            self.persist(document, &image);
        }
    }

    /// Memory-tier half of `put`; returns whether anything was stored
    pub(crate) fn put_memory(&self, document: &str, image: Arc<PageImage>) -> bool {
        let key = CacheKey::new(document, image.page());
        let mut inner = self.lock();
        let Some(memory) = inner.memory.as_mut() else {
            return false;
        };
        let evicted = memory
            .push(key.clone(), image)
            .filter(|(evicted_key, _)| *evicted_key != key);
        inner.stats.writes += 1;
        if let Some((evicted_key, _)) = &evicted {
            inner.stats.evictions += 1;
            debug!(
                "Evicted page {} of {} from memory cache",
                evicted_key.page, evicted_key.document
            );
        }
        drop(inner);
        // the evicted image, if unshared, hands its buffer back to the pool here
        drop(evicted);
        true
    }

    /// Disk-tier half of `put`; failures are logged, never returned
    pub(crate) fn persist(&self, document: &str, image: &PageImage) {
        let Some(disk) = self.disk.as_ref() else {
            return;
        };
        if let Err(e) = disk.store(document, image) {
            warn!(
                "Failed to persist page {} of {document}: {e}",
                image.page()
            );
        }
    }

    /// Drop one page from both tiers
    pub fn remove(&self, document: &str, page: PageIndex) {
        let removed = self
            .lock()
            .memory
            .as_mut()
            .and_then(|m| m.pop(&CacheKey::new(document, page)));
        drop(removed);
        if let Some(disk) = self.disk.as_ref() {
            if let Err(e) = disk.remove_page(document, page) {
                warn!("Failed to remove cached page {page} of {document}: {e}");
            }
        }
    }

    /// Drop a document's pages from the memory tier only
    pub fn clear_memory(&self, document: &str) -> usize {
        let removed: Vec<_> = {
            let mut inner = self.lock();
            let Some(memory) = inner.memory.as_mut() else {
                return 0;
            };
            let keys: Vec<_> = memory
                .iter()
                .filter(|(k, _)| k.document == document)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| memory.pop(k)).collect()
        };
        removed.len()
    }

    /// Drop a document's pages from both tiers
    pub fn clear(&self, document: &str) {
        let removed = self.clear_memory(document);
        debug!("Cleared {removed} cached pages of {document}");
        if let Some(disk) = self.disk.as_ref() {
            if let Err(e) = disk.remove_document(document) {
                warn!("Failed to clear persisted pages of {document}: {e}");
            }
        }
    }

    /// Drop everything from both tiers
    pub fn clear_all(&self) {
        let removed: Vec<_> = {
            let mut inner = self.lock();
            match inner.memory.as_mut() {
                Some(memory) => {
                    let mut drained = Vec::with_capacity(memory.len());
                    while let Some(entry) = memory.pop_lru() {
                        drained.push(entry);
                    }
                    drained
                }
                None => Vec::new(),
            }
        };
        drop(removed);
        if let Some(disk) = self.disk.as_ref() {
            if let Err(e) = disk.clear() {
                warn!("Failed to clear persistent page cache: {e}");
            }
        }
    }

    /// Memory-resident pages of a document, ordered by page index
    #[must_use]
    pub fn pages(&self, document: &str) -> Vec<Arc<PageImage>> {
        let mut pages: Vec<_> = self
            .lock()
            .memory
            .as_ref()
            .map(|m| {
                m.iter()
                    .filter(|(k, _)| k.document == document)
                    .map(|(_, v)| Arc::clone(v))
                    .collect()
            })
            .unwrap_or_default();
        pages.sort_by_key(|image| image.page());
        pages
    }

    /// Number of pages in the memory tier
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().memory.as_ref().map_or(0, |m| m.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Memory-tier capacity in pages
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.policy.capacity
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BufferPool, PixelBuffer};

    fn page(page: PageIndex) -> Arc<PageImage> {
        Arc::new(PageImage::new(
            page,
            PixelBuffer::detached(2, 2, vec![page as u8; 16]),
        ))
    }

    fn maximize(capacity: usize) -> PageCache {
        PageCache::new(CachePolicy::for_strategy(
            CacheStrategy::MaximizePerformance,
            capacity,
            5,
        ))
    }

    #[test]
    fn minimize_memory_keeps_only_the_latest_page() {
        let cache = PageCache::new(CacheStrategy::MinimizeMemory.policy());
        cache.put("doc", page(1));
        cache.put("doc", page(2));

        assert!(cache.get("doc", 1).is_none());
        assert_eq!(cache.get("doc", 2).unwrap().page(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache = PageCache::new(CacheStrategy::Disable.policy());
        cache.put("doc", page(0));
        assert!(cache.get("doc", 0).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().writes, 0);
    }

    #[test]
    fn lru_evicts_least_recently_accessed_entry() {
        let cache = maximize(3);
        cache.put("a", page(0));
        cache.put("a", page(1));
        cache.put("b", page(0));

        // refresh ("a", 0) so ("a", 1) becomes the oldest
        assert!(cache.get("a", 0).is_some());
        cache.put("b", page(1));

        assert!(cache.contains("a", 0));
        assert!(!cache.contains("a", 1));
        assert!(cache.contains("b", 0));
        assert!(cache.contains("b", 1));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn eviction_follows_insertion_order_without_access() {
        let cache = maximize(2);
        cache.put("a", page(0));
        cache.put("a", page(1));
        cache.put("a", page(2));
        assert!(!cache.contains("a", 0));
        assert!(cache.contains("a", 1));
    }

    #[test]
    fn one_entry_per_key() {
        let cache = maximize(4);
        cache.put("a", page(0));
        cache.put("a", page(0));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn contains_does_not_refresh_recency() {
        let cache = maximize(2);
        cache.put("a", page(0));
        cache.put("a", page(1));
        assert!(cache.contains("a", 0));
        cache.put("a", page(2));
        assert!(!cache.contains("a", 0));
    }

    #[test]
    fn clear_removes_only_that_document() {
        let cache = maximize(10);
        cache.put("a", page(0));
        cache.put("a", page(1));
        cache.put("b", page(0));

        cache.clear("a");
        assert!(cache.get("a", 0).is_none());
        assert!(cache.get("b", 0).is_some());

        cache.clear_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn evicted_pages_return_their_buffer_to_the_pool() {
        let pool = BufferPool::new();
        let cache = PageCache::new(CacheStrategy::MinimizeMemory.policy());
        cache.put("a", Arc::new(PageImage::new(0, pool.acquire(4, 4))));
        assert_eq!(pool.stats().outstanding, 1);

        cache.put("a", Arc::new(PageImage::new(1, pool.acquire(4, 4))));
        let stats = pool.stats();
        assert_eq!(stats.outstanding, 1);
        assert_eq!(stats.available, 1);
    }

    #[test]
    fn holds_only_the_stored_image() {
        let cache = maximize(4);
        let first = page(0);
        cache.put("a", Arc::clone(&first));
        assert!(cache.holds("a", &first));
        assert!(!cache.holds("b", &first));

        cache.put("a", page(0));
        assert!(!cache.holds("a", &first));
    }

    #[test]
    fn pages_lists_memory_entries_in_page_order() {
        let cache = maximize(10);
        cache.put("a", page(3));
        cache.put("a", page(1));
        cache.put("b", page(2));
        let pages: Vec<_> = cache.pages("a").iter().map(|p| p.page()).collect();
        assert_eq!(pages, vec![1, 3]);
    }

    #[test]
    fn disk_hit_is_promoted_into_memory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PageCache::with_disk(
            CachePolicy::for_strategy(CacheStrategy::MaximizePerformance, 1, 5),
            dir.path(),
        );
        cache.put("a", page(0));
        // pushes ("a", 0) out of memory; it stays on disk
        cache.put("b", page(0));
        assert_eq!(cache.pages("a").len(), 0);

        let promoted = cache.get("a", 0).unwrap();
        assert_eq!(promoted.page(), 0);
        assert_eq!(cache.pages("a").len(), 1);

        let stats = cache.stats();
        assert_eq!(stats.disk_hits, 1);
        assert_eq!(stats.memory_hits, 0);
        assert!(cache.get("a", 0).is_some());
        assert_eq!(cache.stats().memory_hits, 1);
    }

    #[test]
    fn persistent_tier_survives_a_new_cache_instance() {
        let dir = tempfile::tempdir().unwrap();
        let policy = CacheStrategy::MaximizePerformance.policy();
        PageCache::with_disk(policy, dir.path()).put("a", page(4));

        let reopened = PageCache::with_disk(policy, dir.path());
        assert!(reopened.contains("a", 4));
        assert_eq!(reopened.get("a", 4).unwrap().size(), page(4).size());
    }

    #[test]
    fn minimize_memory_never_writes_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PageCache::with_disk(CacheStrategy::MinimizeMemory.policy(), dir.path());
        assert!(cache.disk().is_none());
        cache.put("a", page(0));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
