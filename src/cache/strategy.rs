//! Cache strategies and the policy values they resolve to

use serde::{Deserialize, Serialize};

/// Documents the persistent tier keeps before evicting the least recently used
pub const DEFAULT_MAX_CACHED_DOCUMENTS: usize = 5;

/// Page budget per document under `MaximizePerformance`
pub const DEFAULT_PAGES_PER_DOCUMENT: usize = 10;

/// How aggressively rendered pages are kept around.
///
/// Chosen once when a session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Keep a single page in memory and nothing on disk
    MinimizeMemory,
    /// Keep several documents' worth of pages in memory and on disk
    #[default]
    MaximizePerformance,
    /// Store nothing; every request renders
    Disable,
}

impl CacheStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStrategy::MinimizeMemory => "minimize_memory",
            CacheStrategy::MaximizePerformance => "maximize_performance",
            CacheStrategy::Disable => "disable",
        }
    }

    /// Policy with the default capacities
    #[must_use]
    pub fn policy(self) -> CachePolicy {
        CachePolicy::for_strategy(
            self,
            DEFAULT_MAX_CACHED_DOCUMENTS * DEFAULT_PAGES_PER_DOCUMENT,
            DEFAULT_MAX_CACHED_DOCUMENTS,
        )
    }
}

/// Capacity, eviction and persistence parameters of one cache instance.
///
/// Every strategy is served by the same LRU implementation; the policy is the
/// only thing that differs between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub strategy: CacheStrategy,
    /// Memory-tier capacity in pages; `0` means nothing is stored
    pub capacity: usize,
    /// Whether rendered pages are also written to disk
    pub persistent: bool,
    /// Documents the persistent tier keeps
    pub max_documents: usize,
}

impl CachePolicy {
    /// Resolve a strategy. `memory_pages` and `max_documents` only apply to
    /// `MaximizePerformance`; the other strategies have fixed shapes.
    #[must_use]
    pub fn for_strategy(
        strategy: CacheStrategy,
        memory_pages: usize,
        max_documents: usize,
    ) -> Self {
        match strategy {
            CacheStrategy::MinimizeMemory => Self {
                strategy,
                capacity: 1,
                persistent: false,
                max_documents: 1,
            },
            CacheStrategy::MaximizePerformance => Self {
                strategy,
                capacity: memory_pages.max(1),
                persistent: true,
                max_documents: max_documents.max(1),
            },
            CacheStrategy::Disable => Self {
                strategy,
                capacity: 0,
                persistent: false,
                max_documents: 0,
            },
        }
    }

    /// Memory-only variant of this policy
    #[must_use]
    pub fn in_memory(mut self) -> Self {
        self.persistent = false;
        self
    }

    #[must_use]
    pub fn stores(&self) -> bool {
        self.capacity > 0
    }
}
