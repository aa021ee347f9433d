//! Streaming delivery engine
//!
//! [`StreamingEngine::stream`] validates a request, plans its segments and
//! returns an [`AudioStream`] right away. A driver task dispatches segment
//! generation ahead of the delivery cursor and emits audio strictly in
//! segment order as chunks of 16-bit PCM, optionally framed as WAV.

mod timing;
pub mod wav;

pub use timing::StreamTimer;

use crate::error::{PipelineError, Result};
use crate::fingerprint::Fingerprint;
use crate::metrics::MetricEvent;
use crate::orchestrator::{GenerationPath, Orchestrator};
use crate::segmenter;
use crate::state::PipelineState;
use crate::types::{Backend, GenerationOutcome, Segment, StreamRequest};
use crate::variation::{Consistency, StreamHealthRecord};
use bytes::Bytes;
use futures::Stream;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

/// Summary of a finished stream
#[derive(Clone, Debug, Serialize)]
pub struct StreamReport {
    pub request_id: String,
    pub segments: usize,
    pub ttfa_ms: Option<f64>,
    pub rtf: f64,
    pub efficiency: f64,
    pub audio_secs: f64,
    pub elapsed_ms: f64,
    /// Audio chunks emitted, excluding header and silence primer
    pub chunk_count: usize,
    /// Every byte sent to the client
    pub bytes_emitted: usize,
    /// PCM bytes of segment audio only
    pub audio_bytes: usize,
    pub failed_segments: Vec<usize>,
    pub backend_labels: Vec<String>,
    pub consistency: Option<Consistency>,
    pub disconnected: bool,
    pub success: bool,
}

impl StreamReport {
    pub fn cache_hits(&self) -> usize {
        self.backend_labels
            .iter()
            .filter(|label| label.contains(crate::types::CACHED_MARKER))
            .count()
    }
}

/// Client-facing audio byte stream
///
/// Yields audio chunks in order, or a single error when no segment could be
/// generated. Dropping it stops dispatch of further segments.
pub struct AudioStream {
    request_id: String,
    inner: ReceiverStream<Result<Bytes>>,
    report: oneshot::Receiver<StreamReport>,
}

impl AudioStream {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Drain the remaining chunks and wait for the final report
    pub async fn collect_all(mut self) -> (Vec<Result<Bytes>>, Option<StreamReport>) {
        use futures::StreamExt;

        let mut items = Vec::new();
        while let Some(item) = self.inner.next().await {
            items.push(item);
        }
        (items, self.report.await.ok())
    }

    /// Stop reading and wait for the final report
    pub async fn finish(self) -> Option<StreamReport> {
        let AudioStream { inner, report, .. } = self;
        drop(inner);
        report.await.ok()
    }
}

impl Stream for AudioStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Entry point for streaming synthesis
#[derive(Clone, Debug)]
pub struct StreamingEngine {
    state: Arc<PipelineState>,
    orchestrator: Orchestrator,
}

impl StreamingEngine {
    pub fn new(state: Arc<PipelineState>) -> Self {
        Self {
            orchestrator: Orchestrator::new(state.clone()),
            state,
        }
    }

    pub fn state(&self) -> &Arc<PipelineState> {
        &self.state
    }

    /// Start streaming audio for `request`
    ///
    /// Errors here are returned before any byte is produced.
    pub async fn stream(&self, request: StreamRequest) -> Result<AudioStream> {
        request.validate(&self.state.config.limits)?;
        if !self.state.collaborators.is_ready() {
            return Err(PipelineError::NotReady(
                "no synthesis collaborator configured".to_string(),
            ));
        }

        let config = &self.state.config.segmenter;
        let segments = segmenter::plan_segments(&request.text, config);
        if segments.is_empty() {
            return Err(PipelineError::invalid_request(
                "text produced no segments",
                "text",
            ));
        }
        if !segmenter::is_valid_utf8_preserving(
            &request.text,
            &segments,
            config.reconstruction_tolerance,
        ) {
            warn!(
                "[{}] segmentation drifted from the input text",
                request.request_id
            );
        }

        info!(
            "[{}] streaming {} segment(s) ({} chars, voice={}, format={:?})",
            request.request_id,
            segments.len(),
            request.text.chars().count(),
            request.voice_id,
            request.output_format
        );

        let (tx, rx) = mpsc::channel(self.state.config.delivery.output_buffer.max(1));
        let (report_tx, report_rx) = oneshot::channel();
        let request_id = request.request_id.clone();

        let driver = StreamDriver {
            state: self.state.clone(),
            orchestrator: self.orchestrator.clone(),
            request: Arc::new(request),
            segments,
            tx,
        };
        tokio::spawn(async move {
            let report = driver.run().await;
            let _ = report_tx.send(report);
        });

        Ok(AudioStream {
            request_id,
            inner: ReceiverStream::new(rx),
            report: report_rx,
        })
    }

    /// Create backend handles ahead of the first request
    ///
    /// Returns how many of `backends` are ready.
    pub async fn warm_up(&self, backends: &[Backend]) -> Result<usize> {
        if !self.state.cache.backends.has_factory() {
            return Err(PipelineError::NotReady(
                "no engine factory configured".to_string(),
            ));
        }

        let mut ready = 0;
        for &backend in backends {
            let state = self.state.clone();
            let created = self
                .state
                .workers
                .run("warm_up", move || {
                    state.cache.backends.get_or_create(backend).map(|_| ())
                })
                .await?;
            match created {
                Ok(()) => ready += 1,
                Err(e) => warn!("Warm-up of {} failed: {}", backend, e),
            }
        }
        info!("Warm-up: {}/{} backend(s) ready", ready, backends.len());
        Ok(ready)
    }
}

enum Delivery {
    Delivered,
    Disconnected,
}

struct StreamDriver {
    state: Arc<PipelineState>,
    orchestrator: Orchestrator,
    request: Arc<StreamRequest>,
    segments: Vec<Segment>,
    tx: mpsc::Sender<Result<Bytes>>,
}

struct Emission {
    timer: StreamTimer,
    header_sent: bool,
    chunk_count: usize,
    bytes_emitted: usize,
    audio_bytes: usize,
}

impl StreamDriver {
    async fn run(self) -> StreamReport {
        let delivery = &self.state.config.delivery;
        let request_id = self.request.request_id.clone();
        let total = self.segments.len();
        let max_in_flight = delivery.max_in_flight.max(1);

        let mut emission = Emission {
            timer: StreamTimer::start(delivery.sample_rate),
            header_sent: false,
            chunk_count: 0,
            bytes_emitted: 0,
            audio_bytes: 0,
        };
        let mut in_flight: BTreeMap<usize, JoinHandle<GenerationOutcome>> = BTreeMap::new();
        let mut next_dispatch = 0;
        let mut failed = Vec::new();
        let mut labels = Vec::new();
        let mut disconnected = false;

        for cursor in 0..total {
            while next_dispatch < total && next_dispatch < cursor + max_in_flight {
                in_flight.insert(next_dispatch, self.dispatch(next_dispatch));
                next_dispatch += 1;
            }
            let Some(mut handle) = in_flight.remove(&cursor) else {
                continue;
            };

            let outcome = tokio::select! {
                joined = &mut handle => joined.unwrap_or_else(|e| GenerationOutcome {
                    segment_index: cursor,
                    is_primer: self.segments[cursor].is_primer,
                    outcome: Err(PipelineError::worker(e.to_string(), "generation")),
                    backend_label: "none".to_string(),
                    processing_note: "generation task aborted".to_string(),
                    generation_ms: 0.0,
                }),
                _ = self.tx.closed() => {
                    disconnected = true;
                    break;
                }
            };

            match &outcome.outcome {
                Ok(samples) => {
                    labels.push(outcome.backend_label.clone());
                    emission
                        .timer
                        .add_segment(samples.len(), outcome.generation_ms);
                    if let Delivery::Disconnected =
                        self.emit(&outcome, samples, &mut emission).await
                    {
                        disconnected = true;
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        "[{}] segment {} dropped from stream: {}",
                        request_id, cursor, e
                    );
                    failed.push(cursor);
                    self.state.metrics.report(MetricEvent::SegmentFailed {
                        request_id: request_id.clone(),
                        segment_index: cursor,
                        error: e.to_string(),
                    });
                }
            }
        }

        if disconnected {
            info!(
                "[{}] client disconnected after {} chunk(s); {} generation task(s) left to finish",
                request_id,
                emission.chunk_count,
                in_flight.len()
            );
        } else if labels.is_empty() {
            error!("[{}] all {} segment(s) failed", request_id, total);
            let err = PipelineError::AllSegmentsFailed(total, request_id.clone());
            let _ = self.tx.send(Err(err)).await;
        }
        // Remaining handles are detached; those tasks still populate the cache
        drop(in_flight);

        self.cleanup().await;
        self.finalize(emission, failed, labels, disconnected)
    }

    fn dispatch(&self, index: usize) -> JoinHandle<GenerationOutcome> {
        let orchestrator = self.orchestrator.clone();
        let request = self.request.clone();
        let segment = self.segments[index].clone();
        let path = GenerationPath::for_segment(&segment, self.segments.len());
        debug!(
            "[{}] dispatching segment {} ({} path{})",
            request.request_id,
            index,
            path.label(),
            if segment.is_primer { ", primer" } else { "" }
        );
        tokio::spawn(async move { orchestrator.generate(&request, &segment, path).await })
    }

    async fn emit(
        &self,
        outcome: &GenerationOutcome,
        samples: &[f32],
        emission: &mut Emission,
    ) -> Delivery {
        let delivery = &self.state.config.delivery;

        if !emission.header_sent {
            emission.header_sent = true;
            if self.request.output_format.has_container_header() {
                for preamble in [
                    wav::wav_header(delivery.sample_rate),
                    wav::silence(delivery.sample_rate, delivery.silence_primer_ms),
                ] {
                    if preamble.is_empty() {
                        continue;
                    }
                    emission.bytes_emitted += preamble.len();
                    if self.tx.send(Ok(preamble)).await.is_err() {
                        return Delivery::Disconnected;
                    }
                }
            }
        }

        let chunk_bytes = if outcome.is_primer {
            delivery.primer_chunk_bytes
        } else {
            delivery.chunk_bytes
        };
        for chunk in wav::chunk_pcm(wav::encode_pcm16(samples), chunk_bytes) {
            let len = chunk.len();
            if self.tx.send(Ok(chunk)).await.is_err() {
                return Delivery::Disconnected;
            }
            emission.timer.mark_first_audio(Instant::now());
            emission.chunk_count += 1;
            emission.bytes_emitted += len;
            emission.audio_bytes += len;
        }
        Delivery::Delivered
    }

    async fn cleanup(&self) {
        let Some(synthesizer) = self.state.collaborators.multi_backend.clone() else {
            return;
        };
        let request_id = &self.request.request_id;
        match self
            .state
            .workers
            .run("cleanup", move || synthesizer.cleanup())
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[{}] backend cleanup failed: {}", request_id, e),
            Err(e) => warn!("[{}] backend cleanup failed: {}", request_id, e),
        }
    }

    fn finalize(
        &self,
        emission: Emission,
        failed: Vec<usize>,
        labels: Vec<String>,
        disconnected: bool,
    ) -> StreamReport {
        let now = Instant::now();
        let request_id = self.request.request_id.clone();
        let fingerprint = Fingerprint::for_request(&self.request);
        let variation = &self.state.variation;

        let complete = !disconnected && failed.is_empty() && !labels.is_empty();
        let audio_bytes = emission.audio_bytes as u64;
        let consistency = if complete {
            Some(variation.check_consistency(fingerprint, audio_bytes, now))
        } else {
            None
        };
        if let Some(Consistency::Divergent {
            deviation,
            threshold,
        }) = consistency
        {
            self.state.metrics.report(MetricEvent::Divergence {
                request_id: request_id.clone(),
                fingerprint: fingerprint.to_string(),
                deviation,
                threshold,
            });
        }

        let divergent = consistency.is_some_and(|c| c.is_divergent());
        let success = complete && !divergent;
        let ttfa_ms = emission.timer.ttfa().map(|d| d.as_secs_f64() * 1000.0);
        let error_detail = if disconnected {
            Some("client disconnected".to_string())
        } else if labels.is_empty() {
            Some("all segments failed".to_string())
        } else if !failed.is_empty() {
            Some(format!("segments {:?} failed", failed))
        } else if divergent {
            Some("output size diverged from baseline".to_string())
        } else {
            None
        };

        variation.record_health(StreamHealthRecord {
            fingerprint,
            success,
            error_detail,
            latency_ms: ttfa_ms,
            chunk_count: emission.chunk_count,
            threshold_at_observation: variation.threshold(),
            recorded_at: now,
        });
        if let Some((previous, current, success_rate)) = variation.tune(now).changed() {
            self.state.metrics.report(MetricEvent::ThresholdChanged {
                previous,
                current,
                success_rate,
            });
        }

        let report = StreamReport {
            request_id: request_id.clone(),
            segments: self.segments.len(),
            ttfa_ms,
            rtf: emission.timer.rtf(),
            efficiency: emission.timer.efficiency(now),
            audio_secs: emission.timer.audio_secs(),
            elapsed_ms: emission.timer.elapsed(now).as_secs_f64() * 1000.0,
            chunk_count: emission.chunk_count,
            bytes_emitted: emission.bytes_emitted,
            audio_bytes: emission.audio_bytes,
            failed_segments: failed,
            backend_labels: labels,
            consistency,
            disconnected,
            success,
        };

        self.state.metrics.report(MetricEvent::StreamCompleted {
            request_id: request_id.clone(),
            ttfa_ms: report.ttfa_ms,
            rtf: report.rtf,
            efficiency: report.efficiency,
            audio_secs: report.audio_secs,
            chunks: report.chunk_count,
            bytes: report.bytes_emitted,
            failed_segments: report.failed_segments.len(),
            success,
        });
        info!(
            "[{}] stream finished: {} chunk(s), {:.2}s audio, ttfa={}, rtf={:.3}, success={}",
            request_id,
            report.chunk_count,
            report.audio_secs,
            ttfa_ms.map_or_else(|| "n/a".to_string(), |ms| format!("{ms:.1}ms")),
            report.rtf,
            success
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::engine::{Collaborators, MultiBackendSynthesizer, UtilizationStats};
    use crate::error::SynthesisError;
    use crate::types::{OutputFormat, RawOutput, SynthesisInput};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Constant {
        cleanups: AtomicUsize,
    }

    impl MultiBackendSynthesizer for Constant {
        fn synthesize_concurrent(
            &self,
            input: &SynthesisInput,
        ) -> std::result::Result<RawOutput, SynthesisError> {
            Ok(RawOutput::Flat(vec![0.2; input.text.len() * 10]))
        }

        fn utilization_stats(&self) -> UtilizationStats {
            UtilizationStats::default()
        }

        fn cleanup(&self) -> std::result::Result<(), SynthesisError> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Err(SynthesisError::Cleanup("device busy".to_string()))
        }
    }

    fn engine() -> (StreamingEngine, Arc<Constant>) {
        let multi = Arc::new(Constant {
            cleanups: AtomicUsize::new(0),
        });
        let state = PipelineState::new(
            PipelineConfig::default(),
            Collaborators::new().with_multi_backend(multi.clone()),
        )
        .unwrap();
        (StreamingEngine::new(state), multi)
    }

    #[tokio::test]
    async fn test_rejects_invalid_request_before_bytes() {
        let (engine, _) = engine();
        let err = engine
            .stream(StreamRequest::new("  ", "af_heart"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::InvalidRequest(..)));

        let err = engine
            .stream(StreamRequest::new("Hello there.", "af_heart").with_speed(0.0))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::InvalidRequest(_, ref field) if field == "speed"));
    }

    #[tokio::test]
    async fn test_not_ready_without_collaborators() {
        let state = PipelineState::new(PipelineConfig::default(), Collaborators::new()).unwrap();
        let engine = StreamingEngine::new(state);
        let err = engine
            .stream(StreamRequest::new("Hello there.", "af_heart"))
            .await
            .err()
            .unwrap();
        assert!(err.is_service_unavailable());
        assert!(engine.warm_up(Backend::all()).await.is_err());
    }

    #[tokio::test]
    async fn test_pcm_stream_has_no_header() {
        let (engine, multi) = engine();
        let request = StreamRequest::new("Hello there.", "af_heart").with_format(OutputFormat::Pcm);
        let (items, report) = engine.stream(request).await.unwrap().collect_all().await;
        let report = report.unwrap();

        let bytes: usize = items.iter().map(|i| i.as_ref().unwrap().len()).sum();
        // 12 chars * 10 samples * 2 bytes
        assert_eq!(bytes, 240);
        assert_eq!(report.audio_bytes, 240);
        assert_eq!(report.bytes_emitted, 240);
        assert!(report.success);
        assert_eq!(report.consistency, Some(Consistency::FirstSeen));
        // Cleanup failure is logged, not surfaced
        assert_eq!(multi.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wav_preamble_precedes_audio() {
        let (engine, _) = engine();
        let (items, report) = engine
            .stream(StreamRequest::new("Hello there.", "af_heart"))
            .await
            .unwrap()
            .collect_all()
            .await;
        let report = report.unwrap();

        let first = items[0].as_ref().unwrap();
        assert_eq!(first.len(), wav::WAV_HEADER_LEN);
        assert_eq!(&first[0..4], b"RIFF");
        let silence = items[1].as_ref().unwrap();
        assert_eq!(silence.len(), 480);
        assert_eq!(report.bytes_emitted, 44 + 480 + 240);
        assert_eq!(report.chunk_count, items.len() - 2);
    }

    #[tokio::test]
    async fn test_repeat_request_is_consistent() {
        let (engine, _) = engine();
        for expected in [
            Consistency::FirstSeen,
            Consistency::Consistent { deviation: 0.0 },
        ] {
            let stream = engine
                .stream(StreamRequest::new("Hello there.", "af_heart"))
                .await
                .unwrap();
            let (_, report) = stream.collect_all().await;
            assert_eq!(report.unwrap().consistency, Some(expected));
        }
        assert_eq!(engine.state().variation.pending_health_records(), 2);
    }
}
