//! Bounded pool for blocking collaborator calls

use crate::error::{PipelineError, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Runs blocking work on tokio's blocking threads, at most `size` at a time
#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `work` once a permit is free
    ///
    /// The permit travels with the blocking task, so work that is already
    /// running keeps its slot even if the awaiting future is dropped.
    pub async fn run<F, T>(&self, stage: &'static str, work: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::worker("worker pool is closed", stage))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        })
        .await
        .map_err(|e| PipelineError::worker(format!("Task join error: {}", e), stage))
    }

    /// Reject all future work
    pub fn close(&self) {
        self.permits.close();
    }
}
