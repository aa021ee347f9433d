use super::wav::duration_secs;
use std::time::{Duration, Instant};

/// Latency and throughput bookkeeping for one stream
#[derive(Debug, Clone)]
pub struct StreamTimer {
    started: Instant,
    first_audio: Option<Instant>,
    sample_rate: u32,
    audio_samples: usize,
    generation_ms: f64,
}

impl StreamTimer {
    pub fn start(sample_rate: u32) -> Self {
        Self::start_at(Instant::now(), sample_rate)
    }

    pub fn start_at(started: Instant, sample_rate: u32) -> Self {
        Self {
            started,
            first_audio: None,
            sample_rate,
            audio_samples: 0,
            generation_ms: 0.0,
        }
    }

    /// Record the first audio chunk; later calls are ignored
    pub fn mark_first_audio(&mut self, at: Instant) {
        self.first_audio.get_or_insert(at);
    }

    pub fn add_segment(&mut self, samples: usize, generation_ms: f64) {
        self.audio_samples += samples;
        self.generation_ms += generation_ms.max(0.0);
    }

    pub fn ttfa(&self) -> Option<Duration> {
        self.first_audio
            .map(|at| at.saturating_duration_since(self.started))
    }

    pub fn audio_secs(&self) -> f64 {
        duration_secs(self.audio_samples, self.sample_rate)
    }

    /// Generation time per second of emitted audio
    pub fn rtf(&self) -> f64 {
        let audio = self.audio_secs();
        if audio > 0.0 {
            self.generation_ms / 1000.0 / audio
        } else {
            0.0
        }
    }

    /// Seconds of audio emitted per second of wall-clock time
    pub fn efficiency(&self, now: Instant) -> f64 {
        let wall = now.saturating_duration_since(self.started).as_secs_f64();
        if wall > 0.0 {
            self.audio_secs() / wall
        } else {
            0.0
        }
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }
}
