use crate::cache::{CacheStats, MultiTierCache, PoolStats};
use crate::config::PipelineConfig;
use crate::engine::{Collaborators, UtilizationStats};
use crate::error::{MetricsError, Result};
use crate::metrics::{MetricEvent, MetricsReporter, MetricsSink};
use crate::variation::{TuningOutcome, VariationController};
use crate::worker::WorkerPool;
use log::{debug, info};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Everything shared between requests
///
/// Created once per process (or per test) and handed around in an `Arc`.
pub struct PipelineState {
    pub config: PipelineConfig,
    pub collaborators: Collaborators,
    pub cache: MultiTierCache,
    pub variation: VariationController,
    pub workers: WorkerPool,
    pub metrics: MetricsReporter,
}

/// Point-in-time view of the shared state
#[derive(Clone, Debug, Serialize)]
pub struct PipelineSnapshot {
    pub primer_cache: CacheStats,
    pub inference_cache: CacheStats,
    pub backends: PoolStats,
    pub threshold: f64,
    pub tracked_fingerprints: usize,
    pub pending_health_records: usize,
    pub utilization: Option<UtilizationStats>,
}

/// What one maintenance pass cleaned up
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub cache_entries_removed: usize,
    pub histories_removed: usize,
    pub health_records_removed: usize,
    pub tuning: TuningOutcome,
}

impl PipelineState {
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        config.validate()?;

        let cache = MultiTierCache::new(
            &config.primer_cache,
            &config.inference_cache,
            collaborators.engines.clone(),
        );
        let variation = VariationController::new(config.variation.clone());
        let workers = WorkerPool::new(config.workers.max_blocking_tasks);
        let metrics = MetricsReporter::new(config.metrics.channel_capacity, config.metrics.enabled);

        debug!("Pipeline state created: {:?}", collaborators);
        Ok(Arc::new(Self {
            config,
            collaborators,
            cache,
            variation,
            workers,
            metrics,
        }))
    }

    /// Feed metric events to `sink` on a background task
    pub fn attach_sink(
        &self,
        sink: Arc<dyn MetricsSink>,
    ) -> std::result::Result<JoinHandle<()>, MetricsError> {
        self.metrics.attach(sink)
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            primer_cache: self.cache.primer.stats(),
            inference_cache: self.cache.inference.stats(),
            backends: self.cache.backends.stats(),
            threshold: self.variation.threshold(),
            tracked_fingerprints: self.variation.tracked_fingerprints(),
            pending_health_records: self.variation.pending_health_records(),
            utilization: self
                .collaborators
                .multi_backend
                .as_ref()
                .map(|mb| mb.utilization_stats()),
        }
    }

    /// Sweep caches, purge stale history and run a tuning pass
    pub fn maintain(&self, now: Instant) -> MaintenanceReport {
        let cache_entries_removed = self.cache.sweep(now);
        let (histories_removed, health_records_removed) = self.variation.purge(now);
        let tuning = self.variation.tune(now);

        if let Some((previous, current, success_rate)) = tuning.changed() {
            self.metrics.report(MetricEvent::ThresholdChanged {
                previous,
                current,
                success_rate,
            });
        }

        MaintenanceReport {
            cache_entries_removed,
            histories_removed,
            health_records_removed,
            tuning,
        }
    }

    /// Run [`PipelineState::maintain`] every `interval` until the state is dropped
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(state) = weak.upgrade() else {
                    debug!("Pipeline state dropped, stopping maintenance");
                    break;
                };
                let report = state.maintain(Instant::now());
                if report.cache_entries_removed + report.histories_removed > 0 {
                    info!(
                        "Maintenance: removed {} cache entr(ies), {} size histor(ies), {} health record(s)",
                        report.cache_entries_removed,
                        report.histories_removed,
                        report.health_records_removed
                    );
                }
            }
        })
    }
}

impl std::fmt::Debug for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineState")
            .field("collaborators", &self.collaborators)
            .field("workers", &self.workers)
            .field("metrics", &self.metrics)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEntry;
    use crate::fingerprint::{Fingerprint, Namespace};

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = PipelineConfig::default();
        config.workers.max_blocking_tasks = 0;
        assert!(PipelineState::new(config, Collaborators::new()).is_err());
    }

    #[test]
    fn test_snapshot_of_fresh_state() {
        let state = PipelineState::new(PipelineConfig::default(), Collaborators::new()).unwrap();
        let snapshot = state.snapshot();
        assert_eq!(snapshot.primer_cache.size, 0);
        assert_eq!(snapshot.inference_cache.size, 0);
        assert_eq!(snapshot.backends.size, 0);
        assert_eq!(snapshot.threshold, 0.15);
        assert!(snapshot.utilization.is_none());
    }

    #[test]
    fn test_maintain_sweeps_expired_entries() {
        let state = PipelineState::new(PipelineConfig::default(), Collaborators::new()).unwrap();
        let now = Instant::now();
        let key = Fingerprint::compute(Namespace::Primer, "Good morning", "v", 1.0, "en-us");
        state.cache.primer.put(
            key,
            CacheEntry {
                samples: Arc::from(vec![0.1, 0.2]),
                backend_label: "gpu".to_string(),
                created_at: now,
            },
        );

        let report = state.maintain(now + Duration::from_secs(600));
        assert_eq!(report.cache_entries_removed, 1);
        let expected = TuningOutcome::InsufficientSamples { available: 0 };
        assert_eq!(report.tuning, expected);
    }

    #[tokio::test]
    async fn test_maintenance_task_stops_with_state() {
        let state = PipelineState::new(PipelineConfig::default(), Collaborators::new()).unwrap();
        let handle = state.spawn_maintenance(Duration::from_millis(5));
        drop(state);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("maintenance task should stop")
            .unwrap();
    }
}
