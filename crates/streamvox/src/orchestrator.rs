//! Per-segment generation
//!
//! Each segment walks the same state machine: cache lookup, the concurrent
//! multi-backend attempt, then a single-backend fallback. Every attempt's
//! output goes through [`crate::validator::validate`] before it is trusted,
//! and the first valid result is written back to the cache.

use crate::cache::CacheEntry;
use crate::error::{PipelineError, SynthesisError};
use crate::fingerprint::{Fingerprint, Namespace};
use crate::metrics::MetricEvent;
use crate::state::PipelineState;
use crate::types::{
    Backend, CACHED_MARKER, GenerationOutcome, RawOutput, Segment, StreamRequest, SynthesisInput,
};
use crate::validator;
use log::{debug, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// How the segment text is prepared
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerationPath {
    /// Text normalized by the preprocessing collaborator first
    Standard,
    /// Raw text, used for primers and single-segment requests
    Fast,
}

impl GenerationPath {
    pub fn for_segment(segment: &Segment, total_segments: usize) -> Self {
        if segment.is_primer || total_segments == 1 {
            GenerationPath::Fast
        } else {
            GenerationPath::Standard
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            GenerationPath::Standard => "standard",
            GenerationPath::Fast => "fast",
        }
    }
}

/// One synthesis attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attempt {
    Concurrent,
    SingleBackend(Backend),
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attempt::Concurrent => f.write_str("concurrent"),
            Attempt::SingleBackend(backend) => write!(f, "single:{}", backend),
        }
    }
}

/// Runs the generation state machine against shared pipeline state
#[derive(Clone, Debug)]
pub struct Orchestrator {
    state: Arc<PipelineState>,
}

impl Orchestrator {
    pub fn new(state: Arc<PipelineState>) -> Self {
        Self { state }
    }

    /// Produce samples for one segment
    ///
    /// Never returns an error directly: failures are carried in the outcome.
    pub async fn generate(
        &self,
        request: &StreamRequest,
        segment: &Segment,
        path: GenerationPath,
    ) -> GenerationOutcome {
        let started = Instant::now();
        let namespace = if segment.is_primer {
            Namespace::Primer
        } else {
            Namespace::Inference
        };
        let key = Fingerprint::for_text(namespace, request, &segment.text);
        let tier = self.state.cache.tier(segment.is_primer);

        if !request.bypass_cache {
            if let Some(entry) = tier.get(&key) {
                debug!(
                    "[{}] segment {}: {} cache hit ({})",
                    request.request_id,
                    segment.index,
                    tier.name(),
                    entry.backend_label
                );
                let label = format!("{}:{}", CACHED_MARKER, entry.backend_label);
                self.report_inference(request, segment, &label, path, 0.0, true);
                return GenerationOutcome {
                    segment_index: segment.index,
                    is_primer: segment.is_primer,
                    outcome: Ok(entry.samples),
                    backend_label: label,
                    processing_note: format!("{} cache hit", tier.name()),
                    generation_ms: 0.0,
                };
            }
            debug!(
                "[{}] segment {}: {} cache miss",
                request.request_id,
                segment.index,
                tier.name()
            );
        }

        if !self.state.collaborators.is_ready() {
            return self.failed(
                segment,
                PipelineError::NotReady("no synthesis collaborator configured".to_string()),
                started,
            );
        }

        let (text, mut note) = self.prepare_text(request, segment, path).await;
        let input = SynthesisInput::from_request(request, text);

        let mut last_error: Option<PipelineError> = None;
        for attempt in self.attempts(&input.text) {
            match self.run_attempt(attempt, &input, segment.index).await {
                Ok(samples) => {
                    let samples: Arc<[f32]> = Arc::from(samples);
                    let label = attempt_label(attempt);
                    tier.put(key, CacheEntry::new(samples.clone(), label.clone()));

                    let generation_ms = started.elapsed().as_secs_f64() * 1000.0;
                    if last_error.is_some() {
                        note.push_str("; recovered by fallback");
                    }
                    debug!(
                        "[{}] segment {}: {} samples via {} in {:.1}ms",
                        request.request_id,
                        segment.index,
                        samples.len(),
                        attempt,
                        generation_ms
                    );
                    self.report_inference(request, segment, &label, path, generation_ms, false);
                    return GenerationOutcome {
                        segment_index: segment.index,
                        is_primer: segment.is_primer,
                        outcome: Ok(samples),
                        backend_label: label,
                        processing_note: note,
                        generation_ms,
                    };
                }
                Err(e) => {
                    warn!(
                        "[{}] segment {}: {} attempt failed: {}",
                        request.request_id, segment.index, attempt, e
                    );
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error.map_or_else(
            || "no generation path available".to_string(),
            |e| e.to_string(),
        );
        self.failed(
            segment,
            PipelineError::SegmentFailed(segment.index, reason),
            started,
        )
    }

    fn attempts(&self, text: &str) -> Vec<Attempt> {
        let mut attempts = Vec::with_capacity(2);
        if self.state.collaborators.multi_backend.is_some() {
            attempts.push(Attempt::Concurrent);
        }
        if self.state.cache.backends.has_factory() {
            attempts.push(Attempt::SingleBackend(
                self.state.config.backends.select(text),
            ));
        }
        attempts
    }

    async fn prepare_text(
        &self,
        request: &StreamRequest,
        segment: &Segment,
        path: GenerationPath,
    ) -> (String, String) {
        let raw = segment.text.clone();
        let normalizer = match (path, &self.state.collaborators.normalizer) {
            (GenerationPath::Standard, Some(normalizer)) => normalizer.clone(),
            _ => return (raw, format!("{} path, raw text", path.label())),
        };

        let text = raw.clone();
        let result = self
            .state
            .workers
            .run("preprocess", move || normalizer.preprocess(&text))
            .await;

        match result {
            Ok(Ok(processed)) if !processed.normalized_text.trim().is_empty() => {
                let mut note = format!("standard path, normalized by {}", processed.method_used);
                if processed.truncated {
                    note.push_str(", truncated");
                }
                if processed.from_cache {
                    note.push_str(", cached");
                }
                (processed.normalized_text, note)
            }
            Ok(Ok(_)) => {
                warn!(
                    "[{}] segment {}: normalizer returned empty text, using raw text",
                    request.request_id, segment.index
                );
                (raw, "standard path, raw text fallback".to_string())
            }
            Ok(Err(e)) => {
                warn!(
                    "[{}] segment {}: preprocessing failed, using raw text: {}",
                    request.request_id, segment.index, e
                );
                (raw, "standard path, raw text fallback".to_string())
            }
            Err(e) => {
                warn!(
                    "[{}] segment {}: preprocessing worker failed, using raw text: {}",
                    request.request_id, segment.index, e
                );
                (raw, "standard path, raw text fallback".to_string())
            }
        }
    }

    async fn run_attempt(
        &self,
        attempt: Attempt,
        input: &SynthesisInput,
        segment_index: usize,
    ) -> Result<Vec<f32>, PipelineError> {
        let input = input.clone();
        let raw: Result<RawOutput, SynthesisError> = match attempt {
            Attempt::Concurrent => {
                let Some(synthesizer) = self.state.collaborators.multi_backend.clone() else {
                    return Err(SynthesisError::unavailable(
                        "no multi-backend synthesizer configured",
                        "concurrent",
                    )
                    .into());
                };
                self.state
                    .workers
                    .run("concurrent_synthesis", move || {
                        synthesizer.synthesize_concurrent(&input)
                    })
                    .await?
            }
            Attempt::SingleBackend(backend) => {
                let state = self.state.clone();
                self.state
                    .workers
                    .run("single_backend_synthesis", move || {
                        let handle = state.cache.backends.get_or_create(backend)?;
                        handle.synthesize(&input)
                    })
                    .await?
            }
        };

        validator::validate(raw?, segment_index)
            .map_err(|e| PipelineError::Validation(segment_index, e))
    }

    fn failed(
        &self,
        segment: &Segment,
        error: PipelineError,
        started: Instant,
    ) -> GenerationOutcome {
        GenerationOutcome {
            segment_index: segment.index,
            is_primer: segment.is_primer,
            processing_note: error.to_string(),
            outcome: Err(error),
            backend_label: "none".to_string(),
            generation_ms: started.elapsed().as_secs_f64() * 1000.0,
        }
    }

    fn report_inference(
        &self,
        request: &StreamRequest,
        segment: &Segment,
        label: &str,
        path: GenerationPath,
        generation_ms: f64,
        cached: bool,
    ) {
        self.state.metrics.report(MetricEvent::Inference {
            request_id: request.request_id.clone(),
            segment_index: segment.index,
            backend_label: label.to_string(),
            path: path.label().to_string(),
            generation_ms,
            cached,
        });
    }
}

fn attempt_label(attempt: Attempt) -> String {
    match attempt {
        Attempt::Concurrent => "multi_backend".to_string(),
        Attempt::SingleBackend(backend) => backend.label().to_string(),
    }
}
