#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use grimoire_engine::{DiceRoll, DiceRoller, NameGenerator, NameGeneratorFactory, NameGeneratorSpec};
use grimoire_types::{FlowDefinition, ModelDefinition, SystemCatalog, TableDefinition};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

/// Routes engine logs to the test harness; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Runs `body` with warnings and errors rendered into a buffer on this thread.
pub fn capture_warnings<T>(body: impl FnOnce() -> T) -> (T, String) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let sink = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || LogSink(sink.clone()))
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .finish();
    let output = tracing::subscriber::with_default(subscriber, body);
    let logs = String::from_utf8_lossy(&buffer.lock().expect("log buffer")).into_owned();
    (output, logs)
}

struct LogSink(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogSink {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("log buffer").extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn flow_yaml(source: &str) -> FlowDefinition {
    serde_yaml::from_str(source).expect("flow fixture")
}

pub fn table_yaml(source: &str) -> TableDefinition {
    serde_yaml::from_str(source).expect("table fixture")
}

pub fn model_yaml(source: &str) -> ModelDefinition {
    serde_yaml::from_str(source).expect("model fixture")
}

pub fn catalog(flows: Vec<FlowDefinition>) -> SystemCatalog {
    flows.into_iter().fold(SystemCatalog::new("test-system"), SystemCatalog::with_flow)
}

pub fn inputs(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("inputs must be a mapping")
}

/// Always rolls the same total and counts calls.
pub struct FixedDice {
    pub total: i64,
    pub calls: AtomicUsize,
}

impl FixedDice {
    pub fn new(total: i64) -> Self {
        Self {
            total,
            calls: AtomicUsize::new(0),
        }
    }
}

impl DiceRoller for FixedDice {
    fn roll(&self, expression: &str) -> Result<DiceRoll> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(DiceRoll {
            total: self.total,
            detail: format!("{expression}: [{}] = {}", self.total, self.total),
            rolls: vec![self.total],
        })
    }
}

/// Fails the first `failures` rolls, then rolls `total`.
pub struct FlakyDice {
    pub failures: usize,
    pub total: i64,
    pub calls: Arc<AtomicUsize>,
}

impl DiceRoller for FlakyDice {
    fn roll(&self, expression: &str) -> Result<DiceRoll> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            bail!("dice server unavailable while rolling '{expression}'");
        }
        Ok(DiceRoll {
            total: self.total,
            detail: format!("{expression} = {}", self.total),
            rolls: vec![self.total],
        })
    }
}

/// Records every generator request and returns a fixed name.
#[derive(Default)]
pub struct RecordingNames {
    pub requests: Arc<Mutex<Vec<(NameGeneratorSpec, usize, String)>>>,
}

struct FixedName {
    spec: NameGeneratorSpec,
    requests: Arc<Mutex<Vec<(NameGeneratorSpec, usize, String)>>>,
}

impl NameGenerator for FixedName {
    fn generate(&self, max_length: usize, algorithm: &str) -> Result<String> {
        self.requests
            .lock()
            .expect("requests lock")
            .push((self.spec.clone(), max_length, algorithm.to_string()));
        Ok("Thalindra".to_string())
    }
}

impl NameGeneratorFactory for RecordingNames {
    fn create(&self, spec: &NameGeneratorSpec) -> Result<Box<dyn NameGenerator>> {
        Ok(Box::new(FixedName {
            spec: spec.clone(),
            requests: self.requests.clone(),
        }))
    }
}
