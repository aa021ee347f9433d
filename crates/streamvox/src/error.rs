//! Error types for the streaming pipeline

use thiserror::Error;

/// Top-level pipeline errors
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// Request rejected before any work started
    #[error("Invalid request: {0}\nField: {1}")]
    InvalidRequest(String, String),

    /// No generation path is available at all
    #[error(
        "Pipeline not ready: {0}\nSuggestion: Configure a multi-backend synthesizer or an engine factory"
    )]
    NotReady(String),

    /// Synthesis output failed validation
    #[error("Corrupted synthesis output for segment {0}: {1}")]
    Validation(usize, ValidationError),

    /// A synthesis collaborator failed
    #[error("Backend failure: {0}")]
    Backend(#[from] SynthesisError),

    /// Every generation path for a segment was exhausted
    #[error("Segment {0} failed on every generation path\nLast error: {1}")]
    SegmentFailed(usize, String),

    /// No segment of the request produced audio
    #[error(
        "All {0} segment(s) failed for request {1}\nSuggestion: Check backend availability and model initialization"
    )]
    AllSegmentsFailed(usize, String),

    /// Worker pool was shut down or a blocking task panicked
    #[error("Worker pool error: {0}\nStage: {1}")]
    Worker(String, String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// Create an invalid request error for a named field
    pub fn invalid_request(msg: impl Into<String>, field: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into(), field.into())
    }

    /// Create a worker error with the stage it happened in
    pub fn worker(msg: impl Into<String>, stage: impl Into<String>) -> Self {
        Self::Worker(msg.into(), stage.into())
    }

    /// Whether this error maps to a service-unavailable response
    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, Self::AllSegmentsFailed(..) | Self::NotReady(_))
    }
}

/// Reasons the audio validator rejects raw synthesis output
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("backend returned a scalar ({0}) instead of a sample sequence")]
    Scalar(f32),

    #[error("backend returned no output")]
    Missing,

    #[error("output has {0} element(s), expected more than one")]
    TooShort(usize),
}

/// Failures reported by the external synthesis collaborators
#[derive(Error, Debug, Clone)]
pub enum SynthesisError {
    /// Backend is not available
    #[error("Backend unavailable: {0}\nBackend: {1}")]
    Unavailable(String, String),

    /// Backend raised an error while synthesizing
    #[error("Synthesis failed: {0}\nBackend: {1}\nDetails: {2}")]
    Failed(String, String, String),

    /// Text preprocessing failed
    #[error("Text preprocessing failed: {0}")]
    Preprocess(String),

    /// Resource release failed
    #[error("Backend cleanup failed: {0}")]
    Cleanup(String),
}

impl SynthesisError {
    /// Create a synthesis failure with backend context
    pub fn failed(
        msg: impl Into<String>,
        backend: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self::Failed(msg.into(), backend.into(), details.into())
    }

    /// Create an unavailable-backend error
    pub fn unavailable(msg: impl Into<String>, backend: impl Into<String>) -> Self {
        Self::Unavailable(msg.into(), backend.into())
    }
}

/// Configuration loading and validation errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("IO error reading {0}: {1}")]
    Io(String, String),

    #[error("TOML parse error: {0}")]
    Parse(String),

    #[error("Invalid value for `{0}`: {1}")]
    Invalid(String, String),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid(field.into(), reason.into())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

/// Metrics sink errors, never propagated to the stream
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Metrics sink rejected event: {0}")]
    Rejected(String),

    #[error("Metrics sink unavailable: {0}")]
    Unavailable(String),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
