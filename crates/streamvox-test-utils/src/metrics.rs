use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use streamvox::error::MetricsError;
use streamvox::{MetricEvent, MetricsSink};

/// Metrics sink that keeps every event it receives
#[derive(Debug, Default)]
pub struct RecordingMetricsSink {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        let events = self.events.lock();
        events.iter().filter(|e| e.name() == name).count()
    }

    /// Poll until at least `count` events named `name` arrived or `timeout` passed
    pub async fn wait_for(&self, name: &str, count: usize, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let seen = self.count(name);
            if seen >= count || tokio::time::Instant::now() >= deadline {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl MetricsSink for RecordingMetricsSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn record(&self, event: MetricEvent) -> Result<(), MetricsError> {
        self.events.lock().push(event);
        Ok(())
    }
}
