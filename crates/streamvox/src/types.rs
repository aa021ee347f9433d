use crate::config::RequestLimits;
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Hardware execution context for synthesis
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Dedicated neural accelerator (lowest latency for short inputs)
    NeuralEngine,
    Gpu,
    Cpu,
}

impl Backend {
    pub fn all() -> &'static [Backend] {
        &[Backend::NeuralEngine, Backend::Gpu, Backend::Cpu]
    }

    pub fn label(&self) -> &'static str {
        match self {
            Backend::NeuralEngine => "neural_engine",
            Backend::Gpu => "gpu",
            Backend::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "neural_engine" | "ane" => Ok(Backend::NeuralEngine),
            "gpu" => Ok(Backend::Gpu),
            "cpu" => Ok(Backend::Cpu),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// Output encoding requested by the client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// RIFF/WAVE container with open-ended length
    #[default]
    Wav,
    /// Headerless 16-bit little-endian samples
    Pcm,
}

impl OutputFormat {
    pub fn has_container_header(&self) -> bool {
        matches!(self, OutputFormat::Wav)
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wav" => Ok(OutputFormat::Wav),
            "pcm" | "raw" => Ok(OutputFormat::Pcm),
            other => Err(format!("unsupported output format '{other}'")),
        }
    }
}

/// A client request for streamed speech
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamRequest {
    pub text: String,
    pub voice_id: String,
    pub speed: f32,
    pub language: String,
    pub output_format: OutputFormat,
    pub bypass_cache: bool,
    /// Correlation id for logging only
    pub request_id: String,
}

impl StreamRequest {
    pub fn new(text: impl Into<String>, voice_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice_id: voice_id.into(),
            speed: 1.0,
            language: "en-us".to_string(),
            output_format: OutputFormat::default(),
            bypass_cache: false,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn with_bypass_cache(mut self, bypass: bool) -> Self {
        self.bypass_cache = bypass;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Reject requests before any work starts
    pub fn validate(&self, limits: &RequestLimits) -> Result<()> {
        let trimmed = self.text.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::invalid_request("text is empty", "text"));
        }
        let chars = trimmed.chars().count();
        if chars < limits.min_text_chars {
            return Err(PipelineError::invalid_request(
                format!(
                    "text has {chars} character(s), at least {} required",
                    limits.min_text_chars
                ),
                "text",
            ));
        }
        if self.voice_id.trim().is_empty() {
            return Err(PipelineError::invalid_request("voice id is empty", "voice_id"));
        }
        let speed_range = limits.min_speed..=limits.max_speed;
        if !self.speed.is_finite() || !speed_range.contains(&self.speed) {
            return Err(PipelineError::invalid_request(
                format!(
                    "speed {} outside [{}, {}]",
                    self.speed, limits.min_speed, limits.max_speed
                ),
                "speed",
            ));
        }
        Ok(())
    }
}

/// One unit of text scheduled for synthesis
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub text: String,
    pub is_primer: bool,
}

impl Segment {
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
            is_primer: false,
        }
    }

    pub fn primer(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
            is_primer: true,
        }
    }
}

/// Parameters handed to a synthesis collaborator
#[derive(Clone, Debug, PartialEq)]
pub struct SynthesisInput {
    pub text: String,
    pub voice_id: String,
    pub speed: f32,
    pub language: String,
}

impl SynthesisInput {
    pub fn from_request(request: &StreamRequest, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice_id: request.voice_id.clone(),
            speed: request.speed,
            language: request.language.clone(),
        }
    }
}

/// Untrusted output from a synthesis backend
///
/// Backends are bound through loosely typed runtimes and have been observed
/// returning scalars, nested arrays or wide floats under load. Nothing here
/// is used before it passes through [`crate::validator::validate`].
#[derive(Clone, Debug, PartialEq)]
pub enum RawOutput {
    Scalar(f32),
    Flat(Vec<f32>),
    Nested(Vec<Vec<f32>>),
    Wide(Vec<f64>),
    Missing,
}

/// Result of generating one segment
#[derive(Clone, Debug)]
pub struct GenerationOutcome {
    pub segment_index: usize,
    pub is_primer: bool,
    /// Validated samples or the error that exhausted every path
    pub outcome: std::result::Result<Arc<[f32]>, PipelineError>,
    pub backend_label: String,
    pub processing_note: String,
    /// Time spent generating, zero for cache hits
    pub generation_ms: f64,
}

impl GenerationOutcome {
    pub fn samples(&self) -> Option<&Arc<[f32]>> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&PipelineError> {
        self.outcome.as_ref().err()
    }

    pub fn is_cached(&self) -> bool {
        self.backend_label.contains(CACHED_MARKER)
    }
}

/// Marker appended to backend labels for cache hits
pub const CACHED_MARKER: &str = "cached";
