//! # streamvox
//!
//! Low-latency streaming core for text-to-speech serving.
//!
//! Given a request, the pipeline starts emitting audio bytes as soon as the
//! first short "primer" fragment of text is synthesized, while the rest of
//! the text is generated concurrently and delivered strictly in order.
//!
//! ## Architecture
//!
//! - [`segmenter`]: sentence segmentation and primer extraction
//! - [`validator`]: boundary checks on untrusted backend output
//! - [`cache`]: backend handle pool, primer cache and inference cache
//! - [`orchestrator`]: per-segment generation with multi-backend fallback
//! - [`delivery`]: WAV/PCM chunked streaming with TTFA and RTF tracking
//! - [`variation`]: output-size consistency checks and threshold self-tuning
//!
//! Synthesis itself is supplied by the host through the traits in
//! [`engine`]. Every blocking collaborator call runs on a bounded
//! [`worker::WorkerPool`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use std::sync::Arc;
//! use streamvox::{Collaborators, EngineFactory, PipelineConfig, PipelineState, StreamRequest, StreamingEngine};
//!
//! async fn speak(factory: Arc<dyn EngineFactory>) -> streamvox::Result<Vec<u8>> {
//!     let state = PipelineState::new(
//!         PipelineConfig::default(),
//!         Collaborators::new().with_engines(factory),
//!     )?;
//!     let engine = StreamingEngine::new(state);
//!
//!     let mut stream = engine
//!         .stream(StreamRequest::new("Hello there. How are you today?", "af_heart"))
//!         .await?;
//!     let mut wav = Vec::new();
//!     while let Some(chunk) = stream.next().await {
//!         wav.extend_from_slice(&chunk?);
//!     }
//!     Ok(wav)
//! }
//! ```

pub mod cache;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod metrics;
pub mod orchestrator;
pub mod segmenter;
pub mod state;
pub mod types;
pub mod validator;
pub mod variation;
pub mod worker;

pub use config::PipelineConfig;
pub use delivery::{AudioStream, StreamReport, StreamingEngine};
pub use engine::{
    Collaborators, EngineFactory, MultiBackendSynthesizer, Preprocessed, SynthesisEngine,
    TextNormalizer, UtilizationStats,
};
pub use error::{PipelineError, Result, SynthesisError, ValidationError};
pub use metrics::{LogMetricsSink, MetricEvent, MetricsSink};
pub use state::{PipelineSnapshot, PipelineState};
pub use types::{Backend, OutputFormat, RawOutput, Segment, StreamRequest, SynthesisInput};
pub use variation::{Consistency, TuningOutcome};
