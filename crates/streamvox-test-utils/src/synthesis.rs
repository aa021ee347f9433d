use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use streamvox::engine::{EngineFactory, Preprocessed, SynthesisEngine, TextNormalizer};
use streamvox::{
    Backend, MultiBackendSynthesizer, RawOutput, SynthesisError, SynthesisInput, UtilizationStats,
};

/// Scripted synthesis behavior shared by the mocks
///
/// Unscripted inputs produce `samples_per_char` samples per input character,
/// so identical text always yields identical audio.
#[derive(Debug)]
pub struct Script {
    samples_per_char: usize,
    outputs: Mutex<HashMap<String, RawOutput>>,
    delays: Mutex<HashMap<String, Duration>>,
    default_delay: Mutex<Duration>,
    failures: Mutex<HashSet<String>>,
    fail_all: Mutex<bool>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            samples_per_char: 40,
            outputs: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            default_delay: Mutex::new(Duration::ZERO),
            failures: Mutex::new(HashSet::new()),
            fail_all: Mutex::new(false),
        }
    }
}

impl Script {
    pub fn set_output(&self, text: &str, output: RawOutput) {
        self.outputs.lock().insert(text.to_string(), output);
    }

    pub fn set_delay(&self, text: &str, delay: Duration) {
        self.delays.lock().insert(text.to_string(), delay);
    }

    pub fn set_default_delay(&self, delay: Duration) {
        *self.default_delay.lock() = delay;
    }

    pub fn set_failure(&self, text: &str) {
        self.failures.lock().insert(text.to_string());
    }

    pub fn set_fail_all(&self, fail: bool) {
        *self.fail_all.lock() = fail;
    }

    /// Samples an unscripted input produces
    pub fn expected_samples(&self, text: &str) -> Vec<f32> {
        let count = (text.chars().count() * self.samples_per_char).max(2);
        (0..count)
            .map(|i| ((i % 100) as f32 - 50.0) / 100.0)
            .collect()
    }

    /// Blocking: sleeps for the scripted delay
    pub fn run(&self, text: &str, backend: &str) -> Result<RawOutput, SynthesisError> {
        let delay = self
            .delays
            .lock()
            .get(text)
            .copied()
            .unwrap_or(*self.default_delay.lock());
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        if *self.fail_all.lock() || self.failures.lock().contains(text) {
            return Err(SynthesisError::failed(
                "scripted failure",
                backend,
                format!("input: {text}"),
            ));
        }
        if let Some(output) = self.outputs.lock().get(text) {
            return Ok(output.clone());
        }
        Ok(RawOutput::Flat(self.expected_samples(text)))
    }
}

/// Multi-backend synthesizer double with call counters
#[derive(Debug, Default)]
pub struct MockMultiBackend {
    pub script: Script,
    calls: AtomicUsize,
    cleanups: AtomicUsize,
    fail_cleanup: Mutex<bool>,
    inputs: Mutex<Vec<String>>,
}

impl MockMultiBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_script(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().clone()
    }

    pub fn set_fail_cleanup(&self, fail: bool) {
        *self.fail_cleanup.lock() = fail;
    }
}

impl MultiBackendSynthesizer for MockMultiBackend {
    fn synthesize_concurrent(&self, input: &SynthesisInput) -> Result<RawOutput, SynthesisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().push(input.text.clone());
        self.script.run(&input.text, "multi_backend")
    }

    fn utilization_stats(&self) -> UtilizationStats {
        let mut stats = UtilizationStats::default();
        stats.requests.insert(Backend::Gpu, self.calls() as u64);
        for backend in Backend::all() {
            stats.available.insert(*backend, true);
        }
        stats
    }

    fn cleanup(&self) -> Result<(), SynthesisError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        if *self.fail_cleanup.lock() {
            return Err(SynthesisError::Cleanup("cleanup failure".to_string()));
        }
        Ok(())
    }
}

/// Single-backend engine double built by [`MockEngineFactory`]
#[derive(Debug)]
struct MockEngine {
    backend: Backend,
    script: Arc<Script>,
    calls: Arc<AtomicUsize>,
}

impl SynthesisEngine for MockEngine {
    fn create(&self, input: &SynthesisInput) -> Result<RawOutput, SynthesisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script.run(&input.text, self.backend.label())
    }
}

/// Engine factory double recording which backends were built
#[derive(Debug, Default)]
pub struct MockEngineFactory {
    pub script: Arc<Script>,
    created: Mutex<Vec<Backend>>,
    unavailable: Mutex<HashSet<Backend>>,
    engine_calls: Arc<AtomicUsize>,
}

impl MockEngineFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_unavailable(&self, backend: Backend) {
        self.unavailable.lock().insert(backend);
    }

    pub fn created(&self) -> Vec<Backend> {
        self.created.lock().clone()
    }

    /// Synthesis calls across every engine this factory built
    pub fn engine_calls(&self) -> usize {
        self.engine_calls.load(Ordering::SeqCst)
    }
}

impl EngineFactory for MockEngineFactory {
    fn create_engine(&self, backend: Backend) -> Result<Arc<dyn SynthesisEngine>, SynthesisError> {
        if self.unavailable.lock().contains(&backend) {
            return Err(SynthesisError::unavailable(
                "backend not present on this host",
                backend.label(),
            ));
        }
        self.created.lock().push(backend);
        Ok(Arc::new(MockEngine {
            backend,
            script: self.script.clone(),
            calls: self.engine_calls.clone(),
        }))
    }
}

/// Normalizer double that collapses whitespace and lowercases
#[derive(Debug, Default)]
pub struct MockNormalizer {
    fail: Mutex<bool>,
    calls: AtomicUsize,
}

impl MockNormalizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextNormalizer for MockNormalizer {
    fn preprocess(&self, text: &str) -> Result<Preprocessed, SynthesisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail.lock() {
            return Err(SynthesisError::Preprocess("scripted failure".to_string()));
        }
        let words: Vec<&str> = text.split_whitespace().collect();
        Ok(Preprocessed {
            normalized_text: words.join(" ").to_lowercase(),
            method_used: "mock".to_string(),
            truncated: false,
            from_cache: false,
        })
    }
}
