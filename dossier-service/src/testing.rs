// Test Doubles
// Scripted workers and providers shared by the unit tests

use crate::execution::context::ContextView;
use crate::providers::{Provider, ProviderError, ProviderRequest, ProviderResponse};
use crate::workers::{Worker, WorkerError, WorkerOutput};

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Provider that replays a fixed list of results, one per call
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Result<Value, ProviderError>>>,
    latency: Duration,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: &str, script: Vec<Result<Value, ProviderError>>) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result.map(ProviderResponse::new),
            None => Err(ProviderError::external("script exhausted")),
        }
    }
}

/// Worker that does nothing and produces nothing
#[derive(Debug, Default)]
pub struct NoopWorker;

#[async_trait::async_trait]
impl Worker for NoopWorker {
    async fn run(&self, _entity_id: &str, _context: &ContextView) -> Result<WorkerOutput, WorkerError> {
        Ok(WorkerOutput::new())
    }
}

/// Worker that only counts its invocations
pub struct CountingWorker {
    calls: Arc<AtomicUsize>,
}

impl CountingWorker {
    pub fn new(calls: Arc<AtomicUsize>) -> Self {
        Self { calls }
    }
}

#[async_trait::async_trait]
impl Worker for CountingWorker {
    async fn run(&self, _entity_id: &str, _context: &ContextView) -> Result<WorkerOutput, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(WorkerOutput::new())
    }
}

/// Worker that panics on every call
#[derive(Debug, Default)]
pub struct PanickingWorker;

#[async_trait::async_trait]
impl Worker for PanickingWorker {
    async fn run(&self, _entity_id: &str, _context: &ContextView) -> Result<WorkerOutput, WorkerError> {
        panic!("worker blew up");
    }
}

/// Start and end of one worker invocation
#[derive(Debug, Clone)]
pub struct Invocation {
    pub worker: String,
    pub started: Instant,
    pub ended: Instant,
}

/// Shared record of invocations across several scripted workers
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    entries: Arc<Mutex<Vec<Invocation>>>,
}

impl Timeline {
    fn record(&self, worker: &str, started: Instant, ended: Instant) {
        self.entries.lock().unwrap().push(Invocation {
            worker: worker.to_string(),
            started,
            ended,
        });
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.entries.lock().unwrap().clone()
    }

    /// Last invocation of `worker`
    pub fn span(&self, worker: &str) -> Option<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|i| i.worker == worker)
            .last()
    }

    /// Highest number of invocations that were in flight at the same time
    pub fn max_overlap(&self) -> usize {
        let invocations = self.invocations();
        invocations
            .iter()
            .map(|probe| {
                invocations
                    .iter()
                    .filter(|other| other.started <= probe.started && probe.started < other.ended)
                    .count()
            })
            .max()
            .unwrap_or(0)
    }
}

/// Configurable worker for engine tests
pub struct ScriptedWorker {
    name: String,
    outputs: WorkerOutput,
    reads: Vec<String>,
    optional_reads: Vec<String>,
    failures: Mutex<VecDeque<WorkerError>>,
    always: Option<WorkerError>,
    delay: Duration,
    timeline: Option<Timeline>,
    calls: AtomicUsize,
    seen: Mutex<Vec<(String, Option<Value>)>>,
}

impl ScriptedWorker {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            outputs: WorkerOutput::new(),
            reads: Vec::new(),
            optional_reads: Vec::new(),
            failures: Mutex::new(VecDeque::new()),
            always: None,
            delay: Duration::ZERO,
            timeline: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn output(mut self, key: &str, value: Value) -> Self {
        self.outputs.insert(key.to_string(), value);
        self
    }

    /// Keys that must be readable; a failed read fails the invocation
    pub fn reads(mut self, keys: &[&str]) -> Self {
        self.reads.extend(keys.iter().map(|k| k.to_string()));
        self
    }

    /// Keys read with `read_optional`
    pub fn reads_optional(mut self, keys: &[&str]) -> Self {
        self.optional_reads.extend(keys.iter().map(|k| k.to_string()));
        self
    }

    /// Fail the next invocations with these errors, in order
    pub fn fail_with(self, errors: Vec<WorkerError>) -> Self {
        self.failures.lock().unwrap().extend(errors);
        self
    }

    pub fn fail_always(mut self, error: WorkerError) -> Self {
        self.always = Some(error);
        self
    }

    pub fn sleep(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn timeline(mut self, timeline: &Timeline) -> Self {
        self.timeline = Some(timeline.clone());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Values observed through the context view, in read order
    pub fn seen(&self) -> Vec<(String, Option<Value>)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Worker for ScriptedWorker {
    async fn run(&self, _entity_id: &str, context: &ContextView) -> Result<WorkerOutput, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        for key in &self.reads {
            let value = context.read(key)?.clone();
            self.seen.lock().unwrap().push((key.clone(), Some(value)));
        }
        for key in &self.optional_reads {
            let value = context.read_optional(key)?.cloned();
            self.seen.lock().unwrap().push((key.clone(), value));
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(timeline) = &self.timeline {
            timeline.record(&self.name, started, Instant::now());
        }

        let scripted = self.failures.lock().unwrap().pop_front();
        if let Some(error) = scripted.or_else(|| self.always.clone()) {
            return Err(error);
        }

        Ok(self.outputs.clone())
    }
}
