//! Pipeline configuration

use crate::error::ConfigError;
use crate::types::Backend;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for the streaming pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub limits: RequestLimits,

    #[serde(default)]
    pub segmenter: SegmenterConfig,

    #[serde(default = "CacheTierConfig::primer")]
    pub primer_cache: CacheTierConfig,

    #[serde(default = "CacheTierConfig::inference")]
    pub inference_cache: CacheTierConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub variation: VariationConfig,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub backends: BackendSelectionConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl PipelineConfig {
    /// Parse a configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML configuration file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.validate()?;
        self.segmenter.validate()?;
        self.primer_cache.validate("primer_cache")?;
        self.inference_cache.validate("inference_cache")?;
        self.delivery.validate()?;
        self.variation.validate()?;
        if self.workers.max_blocking_tasks == 0 {
            return Err(ConfigError::invalid(
                "workers.max_blocking_tasks",
                "must be greater than zero",
            ));
        }
        if self.metrics.channel_capacity == 0 {
            return Err(ConfigError::invalid(
                "metrics.channel_capacity",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            limits: RequestLimits::default(),
            segmenter: SegmenterConfig::default(),
            primer_cache: CacheTierConfig::primer(),
            inference_cache: CacheTierConfig::inference(),
            delivery: DeliveryConfig::default(),
            variation: VariationConfig::default(),
            workers: WorkerConfig::default(),
            backends: BackendSelectionConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Inbound request bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLimits {
    /// Minimum number of characters after trimming
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,

    #[serde(default = "default_min_speed")]
    pub min_speed: f32,

    #[serde(default = "default_max_speed")]
    pub max_speed: f32,
}

impl RequestLimits {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.min_speed > 0.0 && self.min_speed <= self.max_speed) {
            return Err(ConfigError::invalid(
                "limits.min_speed",
                format!(
                    "expected 0 < min_speed <= max_speed, got {} / {}",
                    self.min_speed, self.max_speed
                ),
            ));
        }
        Ok(())
    }
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            min_text_chars: default_min_text_chars(),
            min_speed: default_min_speed(),
            max_speed: default_max_speed(),
        }
    }
}

/// Text segmentation and primer extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterConfig {
    /// Upper bound on characters per segment
    #[serde(default = "default_max_segment_chars")]
    pub max_segment_chars: usize,

    /// Segments at or below this length are never split for a primer
    #[serde(default = "default_primer_min_chars")]
    pub primer_min_chars: usize,

    /// Preferred primer cut as a fraction of the segment length
    #[serde(default = "default_primer_target_ratio")]
    pub primer_target_ratio: f32,

    /// Whether the first segment gets a primer at all
    #[serde(default = "default_true")]
    pub enable_primer: bool,

    /// Allowed character drift when checking that segments reconstruct the input
    #[serde(default = "default_reconstruction_tolerance")]
    pub reconstruction_tolerance: usize,
}

impl SegmenterConfig {
    pub fn with_max_segment_chars(mut self, chars: usize) -> Self {
        self.max_segment_chars = chars;
        self
    }

    pub fn with_primer(mut self, enabled: bool) -> Self {
        self.enable_primer = enabled;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_segment_chars < 16 {
            return Err(ConfigError::invalid(
                "segmenter.max_segment_chars",
                "must be at least 16",
            ));
        }
        if !(0.05..=0.5).contains(&self.primer_target_ratio) {
            return Err(ConfigError::invalid(
                "segmenter.primer_target_ratio",
                "must be within [0.05, 0.5]",
            ));
        }
        Ok(())
    }
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            max_segment_chars: default_max_segment_chars(),
            primer_min_chars: default_primer_min_chars(),
            primer_target_ratio: default_primer_target_ratio(),
            enable_primer: true,
            reconstruction_tolerance: default_reconstruction_tolerance(),
        }
    }
}

/// Bounds for one TTL cache tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTierConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
    /// Entries removed per eviction pass when over capacity
    #[serde(default = "default_eviction_batch")]
    pub eviction_batch: usize,
}

impl CacheTierConfig {
    /// Small, short-lived tier for primer audio
    pub fn primer() -> Self {
        Self {
            capacity: 64,
            ttl_secs: 300,
            eviction_batch: 1,
        }
    }

    /// Larger, longer-lived tier for full segments
    pub fn inference() -> Self {
        Self {
            capacity: 1000,
            ttl_secs: 3600,
            eviction_batch: 100,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid(
                format!("{name}.capacity"),
                "must be greater than zero",
            ));
        }
        if self.eviction_batch == 0 || self.eviction_batch > self.capacity {
            return Err(ConfigError::invalid(
                format!("{name}.eviction_batch"),
                "must be within 1..=capacity",
            ));
        }
        Ok(())
    }
}

/// Chunked delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Output sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Maximum bytes per emitted chunk
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,

    /// Maximum bytes per chunk for primer audio
    #[serde(default = "default_primer_chunk_bytes")]
    pub primer_chunk_bytes: usize,

    /// Silence emitted after the container header
    #[serde(default = "default_silence_primer_ms")]
    pub silence_primer_ms: u32,

    /// Segments dispatched ahead of the delivery cursor
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Chunks buffered between the pipeline and the client
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,
}

impl DeliveryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::invalid(
                "delivery.sample_rate",
                "must be greater than zero",
            ));
        }
        for (field, value) in [
            ("delivery.chunk_bytes", self.chunk_bytes),
            ("delivery.primer_chunk_bytes", self.primer_chunk_bytes),
        ] {
            if value < 2 || value % 2 != 0 {
                return Err(ConfigError::invalid(
                    field,
                    "must be a positive multiple of 2 (16-bit samples)",
                ));
            }
        }
        if self.max_in_flight == 0 || self.output_buffer == 0 {
            return Err(ConfigError::invalid(
                "delivery.max_in_flight",
                "max_in_flight and output_buffer must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            chunk_bytes: default_chunk_bytes(),
            primer_chunk_bytes: default_primer_chunk_bytes(),
            silence_primer_ms: default_silence_primer_ms(),
            max_in_flight: default_max_in_flight(),
            output_buffer: default_output_buffer(),
        }
    }
}

/// Adaptive variation controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariationConfig {
    #[serde(default = "default_initial_threshold")]
    pub initial_threshold: f64,
    #[serde(default = "default_min_threshold")]
    pub min_threshold: f64,
    #[serde(default = "default_max_threshold")]
    pub max_threshold: f64,

    /// Size observations older than this are purged
    #[serde(default = "default_history_ttl_secs")]
    pub history_ttl_secs: u64,
    #[serde(default = "default_max_fingerprints")]
    pub max_fingerprints: usize,
    #[serde(default = "default_max_history_per_fingerprint")]
    pub max_history_per_fingerprint: usize,

    /// Health records older than this are purged
    #[serde(default = "default_history_ttl_secs")]
    pub health_ttl_secs: u64,
    #[serde(default = "default_min_tuning_samples")]
    pub min_tuning_samples: usize,
    #[serde(default = "default_tuning_window")]
    pub tuning_window: usize,

    #[serde(default = "default_low_success_rate")]
    pub low_success_rate: f64,
    #[serde(default = "default_high_success_rate")]
    pub high_success_rate: f64,
    #[serde(default = "default_increase_factor")]
    pub increase_factor: f64,
    #[serde(default = "default_decrease_factor")]
    pub decrease_factor: f64,
}

impl VariationConfig {
    pub fn history_ttl(&self) -> Duration {
        Duration::from_secs(self.history_ttl_secs)
    }

    pub fn health_ttl(&self) -> Duration {
        Duration::from_secs(self.health_ttl_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.min_threshold > 0.0 && self.min_threshold <= self.max_threshold) {
            return Err(ConfigError::invalid(
                "variation.min_threshold",
                "expected 0 < min_threshold <= max_threshold",
            ));
        }
        if !(self.min_threshold..=self.max_threshold).contains(&self.initial_threshold) {
            return Err(ConfigError::invalid(
                "variation.initial_threshold",
                "must lie within [min_threshold, max_threshold]",
            ));
        }
        if self.low_success_rate >= self.high_success_rate {
            return Err(ConfigError::invalid(
                "variation.low_success_rate",
                "must be below high_success_rate",
            ));
        }
        if self.increase_factor <= 1.0 {
            return Err(ConfigError::invalid(
                "variation.increase_factor",
                "expected a factor greater than 1.0",
            ));
        }
        if self.decrease_factor <= 0.0 || self.decrease_factor >= 1.0 {
            return Err(ConfigError::invalid(
                "variation.decrease_factor",
                "expected a factor within (0, 1)",
            ));
        }
        if self.min_tuning_samples == 0 || self.tuning_window < self.min_tuning_samples {
            return Err(ConfigError::invalid(
                "variation.tuning_window",
                "must be at least min_tuning_samples (> 0)",
            ));
        }
        Ok(())
    }
}

impl Default for VariationConfig {
    fn default() -> Self {
        Self {
            initial_threshold: default_initial_threshold(),
            min_threshold: default_min_threshold(),
            max_threshold: default_max_threshold(),
            history_ttl_secs: default_history_ttl_secs(),
            max_fingerprints: default_max_fingerprints(),
            max_history_per_fingerprint: default_max_history_per_fingerprint(),
            health_ttl_secs: default_history_ttl_secs(),
            min_tuning_samples: default_min_tuning_samples(),
            tuning_window: default_tuning_window(),
            low_success_rate: default_low_success_rate(),
            high_success_rate: default_high_success_rate(),
            increase_factor: default_increase_factor(),
            decrease_factor: default_decrease_factor(),
        }
    }
}

/// Blocking worker pool bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_max_blocking_tasks")]
    pub max_blocking_tasks: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_blocking_tasks: default_max_blocking_tasks(),
        }
    }
}

/// Single-backend selection heuristic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSelectionConfig {
    /// Backend used for short text
    #[serde(default = "default_low_latency_backend")]
    pub low_latency: Backend,

    /// Backend used for longer text
    #[serde(default = "default_throughput_backend")]
    pub throughput: Backend,

    /// Texts up to this many characters go to the low-latency backend
    #[serde(default = "default_short_text_chars")]
    pub short_text_chars: usize,
}

impl BackendSelectionConfig {
    pub fn select(&self, text: &str) -> Backend {
        if text.chars().count() <= self.short_text_chars {
            self.low_latency
        } else {
            self.throughput
        }
    }
}

impl Default for BackendSelectionConfig {
    fn default() -> Self {
        Self {
            low_latency: default_low_latency_backend(),
            throughput: default_throughput_backend(),
            short_text_chars: default_short_text_chars(),
        }
    }
}

/// Metrics reporting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Events buffered before the oldest are dropped
    #[serde(default = "default_metrics_capacity")]
    pub channel_capacity: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_capacity: default_metrics_capacity(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_min_text_chars() -> usize {
    3
}

fn default_min_speed() -> f32 {
    0.1
}

fn default_max_speed() -> f32 {
    10.0
}

fn default_max_segment_chars() -> usize {
    400
}

fn default_primer_min_chars() -> usize {
    50
}

fn default_primer_target_ratio() -> f32 {
    0.12
}

fn default_reconstruction_tolerance() -> usize {
    3
}

fn default_eviction_batch() -> usize {
    1
}

fn default_sample_rate() -> u32 {
    24_000
}

fn default_chunk_bytes() -> usize {
    4_800
}

fn default_primer_chunk_bytes() -> usize {
    1_200
}

fn default_silence_primer_ms() -> u32 {
    10
}

fn default_max_in_flight() -> usize {
    3
}

fn default_output_buffer() -> usize {
    32
}

fn default_initial_threshold() -> f64 {
    0.15
}

fn default_min_threshold() -> f64 {
    0.05
}

fn default_max_threshold() -> f64 {
    0.5
}

fn default_history_ttl_secs() -> u64 {
    3600
}

fn default_max_fingerprints() -> usize {
    1000
}

fn default_max_history_per_fingerprint() -> usize {
    32
}

fn default_min_tuning_samples() -> usize {
    10
}

fn default_tuning_window() -> usize {
    50
}

fn default_low_success_rate() -> f64 {
    0.85
}

fn default_high_success_rate() -> f64 {
    0.98
}

fn default_increase_factor() -> f64 {
    1.2
}

fn default_decrease_factor() -> f64 {
    0.9
}

fn default_max_blocking_tasks() -> usize {
    4
}

fn default_low_latency_backend() -> Backend {
    Backend::NeuralEngine
}

fn default_throughput_backend() -> Backend {
    Backend::Gpu
}

fn default_short_text_chars() -> usize {
    100
}

fn default_metrics_capacity() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.primer_cache.capacity, 64);
        assert_eq!(config.inference_cache.capacity, 1000);
        assert_eq!(config.inference_cache.ttl(), Duration::from_secs(3600));
        assert_eq!(config.variation.initial_threshold, 0.15);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml = r#"
[delivery]
sample_rate = 22050
chunk_bytes = 2048

[backends]
low_latency = "cpu"
short_text_chars = 40

[variation]
max_threshold = 0.3
"#;
        let config = PipelineConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.delivery.sample_rate, 22_050);
        assert_eq!(config.delivery.chunk_bytes, 2048);
        assert_eq!(config.delivery.primer_chunk_bytes, 1_200);
        assert_eq!(config.backends.low_latency, Backend::Cpu);
        assert_eq!(config.backends.throughput, Backend::Gpu);
        assert_eq!(config.variation.max_threshold, 0.3);
        assert_eq!(config.variation.min_threshold, 0.05);
        assert_eq!(config.primer_cache.ttl_secs, 300);
    }

    #[test]
    fn test_rejects_odd_chunk_size() {
        let toml = "[delivery]\nchunk_bytes = 1001\n";
        let err = PipelineConfig::from_toml_str(toml).unwrap_err();
        match err {
            ConfigError::Invalid(field, _) => assert_eq!(field, "delivery.chunk_bytes"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_threshold_outside_bounds() {
        let toml = "[variation]\ninitial_threshold = 0.9\n";
        assert!(PipelineConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_rejects_zero_decrease_factor() {
        for factor in ["0.0", "1.0"] {
            let toml = format!("[variation]\ndecrease_factor = {factor}\n");
            match PipelineConfig::from_toml_str(&toml).unwrap_err() {
                ConfigError::Invalid(field, _) => assert_eq!(field, "variation.decrease_factor"),
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[test]
    fn test_malformed_toml() {
        let err = PipelineConfig::from_toml_str("[delivery\nsample_rate = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streamvox.toml");
        std::fs::write(&path, "[workers]\nmax_blocking_tasks = 8\n").unwrap();
        let config = PipelineConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.workers.max_blocking_tasks, 8);

        let missing = PipelineConfig::from_toml_file(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Io(..))));
    }

    #[test]
    fn test_backend_selection_by_length() {
        let selection = BackendSelectionConfig::default();
        assert_eq!(selection.select("short text"), Backend::NeuralEngine);
        assert_eq!(selection.select(&"x".repeat(101)), Backend::Gpu);
    }
}
