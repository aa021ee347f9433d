//! Adaptive variation controller
//!
//! Hardware backends do not produce byte-identical audio for identical
//! requests. The controller remembers the output size of every request
//! fingerprint, flags streams whose size strays too far from the first
//! observation, and widens or narrows that tolerance based on recent stream
//! health.

use crate::config::VariationConfig;
use crate::fingerprint::Fingerprint;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Verdict of a consistency check
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Consistency {
    /// No baseline existed; this observation became it
    FirstSeen,
    Consistent {
        deviation: f64,
    },
    Divergent {
        deviation: f64,
        threshold: f64,
    },
}

impl Consistency {
    pub fn is_divergent(&self) -> bool {
        matches!(self, Consistency::Divergent { .. })
    }
}

/// Outcome of a completed stream, fed back into tuning
#[derive(Clone, Debug)]
pub struct StreamHealthRecord {
    pub fingerprint: Fingerprint,
    pub success: bool,
    pub error_detail: Option<String>,
    pub latency_ms: Option<f64>,
    pub chunk_count: usize,
    pub threshold_at_observation: f64,
    pub recorded_at: Instant,
}

/// Result of one tuning pass
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TuningOutcome {
    InsufficientSamples {
        available: usize,
    },
    /// Another tuning pass was already running
    Busy,
    Unchanged {
        success_rate: f64,
        threshold: f64,
    },
    Increased {
        from: f64,
        to: f64,
        success_rate: f64,
    },
    Decreased {
        from: f64,
        to: f64,
        success_rate: f64,
    },
}

impl TuningOutcome {
    pub fn changed(&self) -> Option<(f64, f64, f64)> {
        match *self {
            TuningOutcome::Increased {
                from,
                to,
                success_rate,
            }
            | TuningOutcome::Decreased {
                from,
                to,
                success_rate,
            } => Some((from, to, success_rate)),
            _ => None,
        }
    }
}

struct SizeHistory {
    baseline: u64,
    observations: VecDeque<(u64, Instant)>,
    last_seen: Instant,
}

pub struct VariationController {
    config: VariationConfig,
    threshold: AtomicU64,
    histories: Mutex<HashMap<Fingerprint, SizeHistory>>,
    health: Mutex<VecDeque<StreamHealthRecord>>,
    tuning: Mutex<()>,
}

impl VariationController {
    pub fn new(config: VariationConfig) -> Self {
        let initial = config
            .initial_threshold
            .clamp(config.min_threshold, config.max_threshold);
        Self {
            config,
            threshold: AtomicU64::new(initial.to_bits()),
            histories: Mutex::new(HashMap::new()),
            health: Mutex::new(VecDeque::new()),
            tuning: Mutex::new(()),
        }
    }

    pub fn threshold(&self) -> f64 {
        f64::from_bits(self.threshold.load(Ordering::Acquire))
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.config.min_threshold, self.config.max_threshold)
    }

    /// Compare a stream's total size against the fingerprint's baseline
    pub fn check_consistency(
        &self,
        fingerprint: Fingerprint,
        size: u64,
        now: Instant,
    ) -> Consistency {
        let ttl = self.config.history_ttl();
        let mut histories = self.histories.lock();

        let stale = histories
            .get(&fingerprint)
            .is_some_and(|h| now.saturating_duration_since(h.last_seen) >= ttl);
        if stale {
            histories.remove(&fingerprint);
        }

        let Some(history) = histories.get_mut(&fingerprint) else {
            histories.insert(
                fingerprint,
                SizeHistory {
                    baseline: size,
                    observations: VecDeque::from([(size, now)]),
                    last_seen: now,
                },
            );
            self.evict_oldest_fingerprints(&mut histories);
            debug!("variation: baseline {} bytes for {}", size, fingerprint);
            return Consistency::FirstSeen;
        };

        history.observations.push_back((size, now));
        while history.observations.len() > self.config.max_history_per_fingerprint.max(1) {
            history.observations.pop_front();
        }
        history.last_seen = now;

        let deviation = relative_deviation(size, history.baseline);
        let threshold = self.threshold();
        if deviation > threshold {
            warn!(
                "variation: output for {} is {} bytes, baseline {} (deviation {:.3} > {:.3})",
                fingerprint, size, history.baseline, deviation, threshold
            );
            Consistency::Divergent {
                deviation,
                threshold,
            }
        } else {
            Consistency::Consistent { deviation }
        }
    }

    fn evict_oldest_fingerprints(&self, histories: &mut HashMap<Fingerprint, SizeHistory>) {
        let max = self.config.max_fingerprints.max(1);
        while histories.len() > max {
            let oldest = histories
                .iter()
                .min_by_key(|(_, h)| h.last_seen)
                .map(|(fp, _)| *fp);
            match oldest {
                Some(fp) => {
                    histories.remove(&fp);
                }
                None => break,
            }
        }
    }

    /// Append a stream health record
    pub fn record_health(&self, record: StreamHealthRecord) {
        let mut health = self.health.lock();
        prune_health(&mut health, record.recorded_at, &self.config);
        health.push_back(record);
    }

    /// Adjust the threshold from the most recent health records
    ///
    /// Records are consumed by the pass that evaluates them.
    pub fn tune(&self, now: Instant) -> TuningOutcome {
        let Some(_guard) = self.tuning.try_lock() else {
            return TuningOutcome::Busy;
        };

        let evaluated: Vec<StreamHealthRecord> = {
            let mut health = self.health.lock();
            prune_health(&mut health, now, &self.config);
            if health.len() < self.config.min_tuning_samples {
                return TuningOutcome::InsufficientSamples {
                    available: health.len(),
                };
            }
            let skip = health.len().saturating_sub(self.config.tuning_window);
            health.drain(..).skip(skip).collect()
        };

        let successes = evaluated.iter().filter(|r| r.success).count();
        let success_rate = successes as f64 / evaluated.len() as f64;
        let current = self.threshold();
        let (min, max) = self.bounds();

        let widened = (current * self.config.increase_factor).min(max);
        let narrowed = (current * self.config.decrease_factor).max(min);

        // Already pinned at a bound: nothing changes
        let outcome = if success_rate < self.config.low_success_rate && widened > current {
            TuningOutcome::Increased {
                from: current,
                to: widened,
                success_rate,
            }
        } else if success_rate > self.config.high_success_rate && narrowed < current {
            TuningOutcome::Decreased {
                from: current,
                to: narrowed,
                success_rate,
            }
        } else {
            TuningOutcome::Unchanged {
                success_rate,
                threshold: current,
            }
        };

        if let Some((from, to, rate)) = outcome.changed() {
            self.threshold.store(to.to_bits(), Ordering::Release);
            info!(
                "variation: threshold {:.4} -> {:.4} over {} stream(s), success rate {:.1}%",
                from,
                to,
                evaluated.len(),
                rate * 100.0
            );
        } else {
            debug!(
                "variation: threshold unchanged at {:.4}, success rate {:.1}%",
                current,
                success_rate * 100.0
            );
        }
        outcome
    }

    /// Drop stale size histories and health records
    pub fn purge(&self, now: Instant) -> (usize, usize) {
        let ttl = self.config.history_ttl();
        let histories_removed = {
            let mut histories = self.histories.lock();
            let before = histories.len();
            histories.retain(|_, h| {
                h.observations
                    .retain(|(_, at)| now.saturating_duration_since(*at) < ttl);
                now.saturating_duration_since(h.last_seen) < ttl
            });
            before - histories.len()
        };

        let health_removed = {
            let mut health = self.health.lock();
            let before = health.len();
            prune_health(&mut health, now, &self.config);
            before - health.len()
        };

        (histories_removed, health_removed)
    }

    pub fn tracked_fingerprints(&self) -> usize {
        self.histories.lock().len()
    }

    pub fn pending_health_records(&self) -> usize {
        self.health.lock().len()
    }

    /// Baseline size recorded for a fingerprint
    pub fn baseline(&self, fingerprint: &Fingerprint) -> Option<u64> {
        self.histories.lock().get(fingerprint).map(|h| h.baseline)
    }
}

fn relative_deviation(size: u64, baseline: u64) -> f64 {
    if baseline == 0 {
        return if size == 0 { 0.0 } else { f64::INFINITY };
    }
    size.abs_diff(baseline) as f64 / baseline as f64
}

fn prune_health(health: &mut VecDeque<StreamHealthRecord>, now: Instant, config: &VariationConfig) {
    let ttl = config.health_ttl();
    while health
        .front()
        .is_some_and(|r| now.saturating_duration_since(r.recorded_at) >= ttl)
    {
        health.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Namespace;
    use std::sync::Arc;
    use std::time::Duration;

    fn fp(text: &str) -> Fingerprint {
        Fingerprint::compute(Namespace::Variation, text, "voice", 1.0, "en-us")
    }

    fn record(controller: &VariationController, success: bool, at: Instant) -> StreamHealthRecord {
        StreamHealthRecord {
            fingerprint: fp("x"),
            success,
            error_detail: (!success).then(|| "divergent".to_string()),
            latency_ms: Some(120.0),
            chunk_count: 4,
            threshold_at_observation: controller.threshold(),
            recorded_at: at,
        }
    }

    fn feed(controller: &VariationController, successes: usize, failures: usize, at: Instant) {
        for i in 0..successes + failures {
            controller.record_health(record(controller, i < successes, at));
        }
    }

    #[test]
    fn test_first_observation_is_baseline() {
        let controller = VariationController::new(VariationConfig::default());
        let now = Instant::now();
        assert_eq!(
            controller.check_consistency(fp("a"), 1000, now),
            Consistency::FirstSeen
        );
        assert_eq!(controller.baseline(&fp("a")), Some(1000));

        match controller.check_consistency(fp("a"), 1100, now) {
            Consistency::Consistent { deviation } => assert!((deviation - 0.1).abs() < 1e-9),
            other => panic!("unexpected verdict {other:?}"),
        }

        let verdict = controller.check_consistency(fp("a"), 1300, now);
        assert!(verdict.is_divergent());
        // Divergent observations never replace the baseline
        assert_eq!(controller.baseline(&fp("a")), Some(1000));
    }

    #[test]
    fn test_zero_byte_baseline() {
        let controller = VariationController::new(VariationConfig::default());
        let now = Instant::now();
        controller.check_consistency(fp("z"), 0, now);
        let empty_again = controller.check_consistency(fp("z"), 0, now);
        assert!(!empty_again.is_divergent());
        let nonempty = controller.check_consistency(fp("z"), 10, now);
        assert!(nonempty.is_divergent());
    }

    #[test]
    fn test_stale_history_restarts_baseline() {
        let config = VariationConfig {
            history_ttl_secs: 10,
            ..VariationConfig::default()
        };
        let controller = VariationController::new(config);
        let now = Instant::now();
        controller.check_consistency(fp("a"), 1000, now);

        let later = now + Duration::from_secs(11);
        assert_eq!(
            controller.check_consistency(fp("a"), 5000, later),
            Consistency::FirstSeen
        );
        assert_eq!(controller.baseline(&fp("a")), Some(5000));
    }

    #[test]
    fn test_fingerprint_map_is_bounded() {
        let config = VariationConfig {
            max_fingerprints: 3,
            ..VariationConfig::default()
        };
        let controller = VariationController::new(config);
        let now = Instant::now();
        for i in 0..5u64 {
            controller.check_consistency(
                fp(&format!("req{i}")),
                100,
                now + Duration::from_millis(i),
            );
        }
        assert_eq!(controller.tracked_fingerprints(), 3);
        assert_eq!(controller.baseline(&fp("req0")), None);
        assert_eq!(controller.baseline(&fp("req4")), Some(100));
    }

    #[test]
    fn test_purge_drops_stale_state() {
        let config = VariationConfig {
            history_ttl_secs: 10,
            health_ttl_secs: 10,
            ..VariationConfig::default()
        };
        let controller = VariationController::new(config);
        let now = Instant::now();
        controller.check_consistency(fp("old"), 10, now);
        controller.check_consistency(fp("new"), 10, now + Duration::from_secs(8));
        feed(&controller, 2, 0, now);

        let (histories, health) = controller.purge(now + Duration::from_secs(12));
        assert_eq!(histories, 1);
        assert_eq!(health, 2);
        assert_eq!(controller.tracked_fingerprints(), 1);
    }

    #[test]
    fn test_tuning_needs_minimum_samples() {
        let controller = VariationController::new(VariationConfig::default());
        let now = Instant::now();
        feed(&controller, 9, 0, now);
        assert_eq!(
            controller.tune(now),
            TuningOutcome::InsufficientSamples { available: 9 }
        );
        assert_eq!(controller.threshold(), 0.15);
        assert_eq!(controller.pending_health_records(), 9);
    }

    #[test]
    fn test_low_success_rate_widens_threshold() {
        let controller = VariationController::new(VariationConfig::default());
        let now = Instant::now();
        // 8 of 12 successful, roughly 70%
        feed(&controller, 8, 4, now);

        let outcome = controller.tune(now);
        assert!(matches!(outcome, TuningOutcome::Increased { .. }));
        assert!((controller.threshold() - 0.18).abs() < 1e-9);
        assert_eq!(controller.pending_health_records(), 0);
    }

    #[test]
    fn test_increase_is_capped() {
        let config = VariationConfig {
            initial_threshold: 0.45,
            ..VariationConfig::default()
        };
        let controller = VariationController::new(config);
        let now = Instant::now();
        feed(&controller, 8, 4, now);
        controller.tune(now);
        assert_eq!(controller.threshold(), 0.5);
    }

    #[test]
    fn test_threshold_at_max_reports_no_change() {
        let config = VariationConfig {
            initial_threshold: 0.5,
            ..VariationConfig::default()
        };
        let controller = VariationController::new(config);
        let now = Instant::now();
        feed(&controller, 8, 4, now);

        let outcome = controller.tune(now);
        assert!(matches!(outcome, TuningOutcome::Unchanged { threshold, .. } if threshold == 0.5));
        assert_eq!(outcome.changed(), None);
        assert_eq!(controller.threshold(), 0.5);
        assert_eq!(controller.pending_health_records(), 0);
    }

    #[test]
    fn test_threshold_at_min_reports_no_change() {
        let config = VariationConfig {
            initial_threshold: 0.05,
            ..VariationConfig::default()
        };
        let controller = VariationController::new(config);
        let now = Instant::now();
        feed(&controller, 20, 0, now);

        let outcome = controller.tune(now);
        assert_eq!(outcome.changed(), None);
        assert_eq!(controller.threshold(), 0.05);
    }

    #[test]
    fn test_high_success_rate_narrows_threshold() {
        let controller = VariationController::new(VariationConfig::default());
        let now = Instant::now();
        feed(&controller, 20, 0, now);
        assert!(matches!(controller.tune(now), TuningOutcome::Decreased { .. }));
        assert!((controller.threshold() - 0.135).abs() < 1e-9);
    }

    #[test]
    fn test_middling_success_rate_keeps_threshold() {
        let controller = VariationController::new(VariationConfig::default());
        let now = Instant::now();
        feed(&controller, 18, 2, now);
        assert!(matches!(
            controller.tune(now),
            TuningOutcome::Unchanged { success_rate, .. } if (success_rate - 0.9).abs() < 1e-9
        ));
        assert_eq!(controller.threshold(), 0.15);
    }

    #[test]
    fn test_only_recent_window_is_evaluated() {
        let controller = VariationController::new(VariationConfig::default());
        let now = Instant::now();
        // 50 old failures followed by 50 successes: only the successes count
        feed(&controller, 0, 50, now);
        feed(&controller, 50, 0, now);
        assert!(matches!(controller.tune(now), TuningOutcome::Decreased { .. }));
    }

    #[test]
    fn test_threshold_stays_bounded() {
        let controller = VariationController::new(VariationConfig::default());
        let (min, max) = controller.bounds();
        let now = Instant::now();
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;

        for _ in 0..200 {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let batch = 10 + (seed >> 60) as usize;
            let successes = (seed >> 33) as usize % (batch + 1);
            feed(&controller, successes, batch - successes, now);
            controller.tune(now);

            let threshold = controller.threshold();
            assert!(threshold >= min && threshold <= max, "{threshold}");
        }
    }

    #[test]
    fn test_concurrent_tuning_is_serialized() {
        let controller = Arc::new(VariationController::new(VariationConfig::default()));
        let now = Instant::now();
        feed(&controller, 8, 4, now);

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let controller = controller.clone();
                std::thread::spawn(move || controller.tune(now))
            })
            .collect();
        let outcomes: Vec<TuningOutcome> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        let increased = outcomes
            .iter()
            .filter(|o| matches!(o, TuningOutcome::Increased { .. }))
            .count();
        assert_eq!(increased, 1);
        assert!((controller.threshold() - 0.18).abs() < 1e-9);
    }
}
