use crate::fingerprint::Fingerprint;
use log::debug;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Immutable cached synthesis result
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub samples: Arc<[f32]>,
    pub backend_label: String,
    pub created_at: Instant,
}

impl CacheEntry {
    pub fn new(samples: Arc<[f32]>, backend_label: impl Into<String>) -> Self {
        Self {
            samples,
            backend_label: backend_label.into(),
            created_at: Instant::now(),
        }
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) >= ttl
    }
}

/// Cache statistics snapshot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded cache with time-based expiry and oldest-first eviction
pub struct TtlCache {
    name: &'static str,
    capacity: usize,
    ttl: Duration,
    eviction_batch: usize,
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl TtlCache {
    pub fn new(name: &'static str, capacity: usize, ttl: Duration, eviction_batch: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            ttl,
            eviction_batch: eviction_batch.clamp(1, capacity),
            entries: RwLock::new(HashMap::with_capacity(capacity.min(1024))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self, key: &Fingerprint) -> Option<CacheEntry> {
        self.get_at(key, Instant::now())
    }

    /// Lookup relative to `now`; expired entries are purged on the way
    pub fn get_at(&self, key: &Fingerprint, now: Instant) -> Option<CacheEntry> {
        let expired = {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now, self.ttl) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.clone());
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut entries = self.entries.write();
            // Re-check: a concurrent writer may have replaced the entry
            if entries
                .get(key)
                .is_some_and(|entry| entry.is_expired(now, self.ttl))
            {
                entries.remove(key);
                debug!("{} cache: purged expired entry {}", self.name, key);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or replace an entry; last writer wins
    pub fn put(&self, key: Fingerprint, entry: CacheEntry) {
        let mut entries = self.entries.write();
        entries.insert(key, entry);

        if entries.len() > self.capacity {
            let excess = entries.len() - self.capacity;
            let mut by_age: Vec<(Instant, Fingerprint)> = entries
                .iter()
                .filter(|(k, _)| **k != key)
                .map(|(k, e)| (e.created_at, *k))
                .collect();
            by_age.sort_unstable();

            let evict = self.eviction_batch.max(excess).min(by_age.len());
            for (_, old) in by_age.into_iter().take(evict) {
                entries.remove(&old);
            }
            self.evictions.fetch_add(evict as u64, Ordering::Relaxed);
            debug!(
                "{} cache: evicted {} oldest entr{} ({} remain)",
                self.name,
                evict,
                if evict == 1 { "y" } else { "ies" },
                entries.len()
            );
        }
    }

    /// Remove every entry past its TTL, returning how many were removed
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now, self.ttl));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("{} cache: swept {} expired entries", self.name, removed);
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.entries.read().len(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
