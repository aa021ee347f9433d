//! Fire-and-forget metric events
//!
//! Events are published on a bounded broadcast channel. Each attached sink
//! consumes it on its own task; a sink that falls behind loses the oldest
//! events and never slows the stream down.

use crate::error::MetricsError;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Events emitted by the pipeline
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricEvent {
    /// One segment generated or served from cache
    Inference {
        request_id: String,
        segment_index: usize,
        backend_label: String,
        path: String,
        generation_ms: f64,
        cached: bool,
    },
    SegmentFailed {
        request_id: String,
        segment_index: usize,
        error: String,
    },
    /// Final stream summary
    StreamCompleted {
        request_id: String,
        ttfa_ms: Option<f64>,
        rtf: f64,
        efficiency: f64,
        audio_secs: f64,
        chunks: usize,
        bytes: usize,
        failed_segments: usize,
        success: bool,
    },
    Divergence {
        request_id: String,
        fingerprint: String,
        deviation: f64,
        threshold: f64,
    },
    ThresholdChanged {
        previous: f64,
        current: f64,
        success_rate: f64,
    },
}

impl MetricEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MetricEvent::Inference { .. } => "inference",
            MetricEvent::SegmentFailed { .. } => "segment_failed",
            MetricEvent::StreamCompleted { .. } => "stream_completed",
            MetricEvent::Divergence { .. } => "divergence",
            MetricEvent::ThresholdChanged { .. } => "threshold_changed",
        }
    }
}

/// Destination for metric events
#[async_trait]
pub trait MetricsSink: Send + Sync {
    fn name(&self) -> &str;

    async fn record(&self, event: MetricEvent) -> Result<(), MetricsError>;
}

/// Writes events to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMetricsSink;

#[async_trait]
impl MetricsSink for LogMetricsSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn record(&self, event: MetricEvent) -> Result<(), MetricsError> {
        match &event {
            MetricEvent::StreamCompleted {
                request_id,
                ttfa_ms,
                rtf,
                efficiency,
                chunks,
                success,
                ..
            } => info!(
                "[{}] stream metrics: ttfa={} rtf={:.3} efficiency={:.2} chunks={} success={}",
                request_id,
                ttfa_ms.map_or_else(|| "n/a".to_string(), |ms| format!("{ms:.1}ms")),
                rtf,
                efficiency,
                chunks,
                success
            ),
            MetricEvent::ThresholdChanged {
                previous, current, ..
            } => info!("divergence threshold {:.4} -> {:.4}", previous, current),
            other => debug!("metric {}: {:?}", other.name(), other),
        }
        Ok(())
    }
}

/// Publishes events to every attached sink
#[derive(Clone)]
pub struct MetricsReporter {
    tx: broadcast::Sender<MetricEvent>,
    enabled: bool,
}

impl MetricsReporter {
    pub fn new(capacity: usize, enabled: bool) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, enabled }
    }

    pub fn disabled() -> Self {
        Self::new(1, false)
    }

    /// Publish an event; never blocks and never fails
    pub fn report(&self, event: MetricEvent) {
        if self.enabled {
            // No subscribers is not an error
            let _ = self.tx.send(event);
        }
    }

    /// Spawn a consumer task feeding `sink`
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(&self, sink: Arc<dyn MetricsSink>) -> Result<JoinHandle<()>, MetricsError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| MetricsError::Unavailable(e.to_string()))?;
        let mut rx = self.tx.subscribe();

        Ok(runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = sink.record(event).await {
                            warn!("Metrics sink '{}' failed: {}", sink.name(), e);
                        }
                    }
                    Err(RecvError::Lagged(dropped)) => {
                        warn!(
                            "Metrics sink '{}' lagging, dropped {} oldest event(s)",
                            sink.name(),
                            dropped
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }
}

impl std::fmt::Debug for MetricsReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsReporter")
            .field("enabled", &self.enabled)
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collecting {
        events: Mutex<Vec<MetricEvent>>,
    }

    #[async_trait]
    impl MetricsSink for Collecting {
        fn name(&self) -> &str {
            "collecting"
        }

        async fn record(&self, event: MetricEvent) -> Result<(), MetricsError> {
            self.events.lock().push(event);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl MetricsSink for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn record(&self, _event: MetricEvent) -> Result<(), MetricsError> {
            Err(MetricsError::Rejected("nope".to_string()))
        }
    }

    fn failed(index: usize) -> MetricEvent {
        MetricEvent::SegmentFailed {
            request_id: "req".to_string(),
            segment_index: index,
            error: "boom".to_string(),
        }
    }

    async fn wait_for(sink: &Collecting, count: usize) -> Vec<MetricEvent> {
        for _ in 0..200 {
            if sink.events.lock().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sink.events.lock().clone()
    }

    #[tokio::test]
    async fn test_events_reach_sink_in_order() {
        let reporter = MetricsReporter::new(16, true);
        let sink = Arc::new(Collecting::default());
        reporter.attach(sink.clone()).unwrap();

        reporter.report(failed(0));
        reporter.report(failed(1));

        let events = wait_for(&sink, 2).await;
        assert_eq!(events, vec![failed(0), failed(1)]);
    }

    #[tokio::test]
    async fn test_report_without_sinks_is_noop() {
        let reporter = MetricsReporter::new(4, true);
        for i in 0..10 {
            reporter.report(failed(i));
        }
    }

    #[tokio::test]
    async fn test_disabled_reporter_drops_everything() {
        let reporter = MetricsReporter::disabled();
        let sink = Arc::new(Collecting::default());
        reporter.attach(sink.clone()).unwrap();

        reporter.report(failed(0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sink.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_stop_others() {
        let reporter = MetricsReporter::new(16, true);
        let sink = Arc::new(Collecting::default());
        reporter.attach(Arc::new(Failing)).unwrap();
        reporter.attach(sink.clone()).unwrap();

        reporter.report(failed(3));
        assert_eq!(wait_for(&sink, 1).await, vec![failed(3)]);
    }

    #[test]
    fn test_log_sink_accepts_all_events() {
        let sink = LogMetricsSink;
        let event = MetricEvent::ThresholdChanged {
            previous: 0.15,
            current: 0.18,
            success_rate: 0.7,
        };
        assert!(tokio_test::block_on(sink.record(event)).is_ok());
        assert!(tokio_test::block_on(sink.record(failed(0))).is_ok());
    }

    #[test]
    fn test_attach_outside_runtime_is_unavailable() {
        let reporter = MetricsReporter::new(4, true);
        let err = reporter.attach(Arc::new(LogMetricsSink)).unwrap_err();
        assert!(matches!(err, MetricsError::Unavailable(_)));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(failed(2)).unwrap();
        assert_eq!(json["type"], "segment_failed");
        assert_eq!(json["segment_index"], 2);
    }
}
