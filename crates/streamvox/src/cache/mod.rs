//! Multi-tier result cache
//!
//! Three independent stores: the backend handle pool, a short-lived primer
//! cache and a longer-lived full-segment inference cache.

mod backend_pool;
mod tier;

pub use backend_pool::{BackendHandle, BackendPool, HandleStats, PoolStats};
pub use tier::{CacheEntry, CacheStats, TtlCache};

use crate::config::CacheTierConfig;
use crate::engine::EngineFactory;
use std::sync::Arc;
use std::time::Instant;

/// The three cache tiers held by the pipeline
pub struct MultiTierCache {
    pub backends: BackendPool,
    pub primer: TtlCache,
    pub inference: TtlCache,
}

impl MultiTierCache {
    pub fn new(
        primer: &CacheTierConfig,
        inference: &CacheTierConfig,
        factory: Option<Arc<dyn EngineFactory>>,
    ) -> Self {
        Self {
            backends: BackendPool::new(factory),
            primer: TtlCache::new(
                "primer",
                primer.capacity,
                primer.ttl(),
                primer.eviction_batch,
            ),
            inference: TtlCache::new(
                "inference",
                inference.capacity,
                inference.ttl(),
                inference.eviction_batch,
            ),
        }
    }

    /// Cache tier for a segment kind
    pub fn tier(&self, is_primer: bool) -> &TtlCache {
        if is_primer {
            &self.primer
        } else {
            &self.inference
        }
    }

    /// Purge expired entries from both TTL tiers; pooled handles never expire
    pub fn sweep(&self, now: Instant) -> usize {
        self.primer.sweep(now) + self.inference.sweep(now)
    }
}
