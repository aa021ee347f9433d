//! Collaborator doubles for streamvox tests

mod metrics;
mod synthesis;

pub use metrics::RecordingMetricsSink;
pub use synthesis::{MockEngineFactory, MockMultiBackend, MockNormalizer, Script};
