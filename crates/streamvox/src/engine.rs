//! Interfaces to the external synthesis collaborators
//!
//! The pipeline never runs a model itself. Text normalization, concurrent
//! multi-backend synthesis and single-backend engines are supplied by the
//! host through these traits. All calls are blocking and are executed on the
//! pipeline's worker pool.

use crate::error::SynthesisError;
use crate::types::{Backend, RawOutput, SynthesisInput};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Result of text normalization
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Preprocessed {
    pub normalized_text: String,
    pub method_used: String,
    pub truncated: bool,
    pub from_cache: bool,
}

/// Text normalization collaborator used by the standard generation path
pub trait TextNormalizer: Send + Sync {
    fn preprocess(&self, text: &str) -> Result<Preprocessed, SynthesisError>;
}

/// Per-backend usage reported by the multi-backend collaborator
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtilizationStats {
    pub requests: BTreeMap<Backend, u64>,
    pub available: BTreeMap<Backend, bool>,
}

impl UtilizationStats {
    pub fn total_requests(&self) -> u64 {
        self.requests.values().sum()
    }

    pub fn is_available(&self, backend: Backend) -> bool {
        self.available.get(&backend).copied().unwrap_or(false)
    }
}

/// Scheduler that runs one synthesis across several hardware backends
pub trait MultiBackendSynthesizer: Send + Sync {
    /// Output is untrusted until validated
    fn synthesize_concurrent(&self, input: &SynthesisInput) -> Result<RawOutput, SynthesisError>;

    fn utilization_stats(&self) -> UtilizationStats;

    /// Release backend resources held for the last request
    fn cleanup(&self) -> Result<(), SynthesisError>;
}

/// A synthesis engine bound to a single backend
pub trait SynthesisEngine: Send + Sync {
    /// Output is untrusted until validated
    fn create(&self, input: &SynthesisInput) -> Result<RawOutput, SynthesisError>;
}

/// Builds the long-lived engine instance for a backend
pub trait EngineFactory: Send + Sync {
    fn create_engine(&self, backend: Backend) -> Result<Arc<dyn SynthesisEngine>, SynthesisError>;
}

/// The collaborators wired into a pipeline
///
/// At least one of `multi_backend` or `engines` must be present for the
/// pipeline to accept requests.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub normalizer: Option<Arc<dyn TextNormalizer>>,
    pub multi_backend: Option<Arc<dyn MultiBackendSynthesizer>>,
    pub engines: Option<Arc<dyn EngineFactory>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_normalizer(mut self, normalizer: Arc<dyn TextNormalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn with_multi_backend(mut self, synthesizer: Arc<dyn MultiBackendSynthesizer>) -> Self {
        self.multi_backend = Some(synthesizer);
        self
    }

    pub fn with_engines(mut self, factory: Arc<dyn EngineFactory>) -> Self {
        self.engines = Some(factory);
        self
    }

    pub fn is_ready(&self) -> bool {
        self.multi_backend.is_some() || self.engines.is_some()
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("normalizer", &self.normalizer.is_some())
            .field("multi_backend", &self.multi_backend.is_some())
            .field("engines", &self.engines.is_some())
            .finish()
    }
}
