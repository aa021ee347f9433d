use crate::engine::{EngineFactory, SynthesisEngine};
use crate::error::SynthesisError;
use crate::types::{Backend, RawOutput, SynthesisInput};
use log::info;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Long-lived engine instance for one backend, shared by every request
pub struct BackendHandle {
    backend: Backend,
    engine: Arc<dyn SynthesisEngine>,
    created_at: Instant,
    requests: AtomicU64,
}

impl BackendHandle {
    pub fn new(backend: Backend, engine: Arc<dyn SynthesisEngine>) -> Self {
        Self {
            backend,
            engine,
            created_at: Instant::now(),
            requests: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Blocking synthesis on this handle's engine
    pub fn synthesize(&self, input: &SynthesisInput) -> Result<RawOutput, SynthesisError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.engine.create(input)
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("backend", &self.backend)
            .field("requests", &self.request_count())
            .finish()
    }
}

/// Usage of one pooled handle
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HandleStats {
    pub backend: Backend,
    pub requests: u64,
    pub age_secs: u64,
}

/// Backend pool statistics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub handles: Vec<HandleStats>,
}

/// Process-lifetime cache of one engine per backend, created lazily
pub struct BackendPool {
    factory: Option<Arc<dyn EngineFactory>>,
    handles: RwLock<HashMap<Backend, Arc<BackendHandle>>>,
    creation: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BackendPool {
    pub fn new(factory: Option<Arc<dyn EngineFactory>>) -> Self {
        Self {
            factory,
            handles: RwLock::new(HashMap::new()),
            creation: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn has_factory(&self) -> bool {
        self.factory.is_some()
    }

    pub fn get(&self, backend: Backend) -> Option<Arc<BackendHandle>> {
        let handle = self.handles.read().get(&backend).cloned();
        match handle {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        handle
    }

    pub fn put(&self, handle: BackendHandle) -> Arc<BackendHandle> {
        let handle = Arc::new(handle);
        self.handles.write().insert(handle.backend, handle.clone());
        handle
    }

    /// Return the pooled handle, creating it through the factory on first use
    ///
    /// Blocks while the engine is built; call from the worker pool.
    pub fn get_or_create(&self, backend: Backend) -> Result<Arc<BackendHandle>, SynthesisError> {
        if let Some(handle) = self.get(backend) {
            return Ok(handle);
        }

        let factory = self.factory.as_ref().ok_or_else(|| {
            SynthesisError::unavailable("no engine factory configured", backend.label())
        })?;

        let _guard = self.creation.lock();
        // Another worker may have finished creating it while we waited
        if let Some(handle) = self.handles.read().get(&backend).cloned() {
            return Ok(handle);
        }

        let started = Instant::now();
        let engine = factory.create_engine(backend)?;
        info!(
            "Created {} engine in {:.1}ms",
            backend,
            started.elapsed().as_secs_f64() * 1000.0
        );
        Ok(self.put(BackendHandle::new(backend, engine)))
    }

    pub fn stats(&self) -> PoolStats {
        let handles = self.handles.read();
        let mut per_handle: Vec<HandleStats> = handles
            .values()
            .map(|h| HandleStats {
                backend: h.backend,
                requests: h.request_count(),
                age_secs: h.age().as_secs(),
            })
            .collect();
        per_handle.sort_by_key(|h| h.backend);

        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: handles.len(),
            handles: per_handle,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
