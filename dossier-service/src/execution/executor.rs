// Orchestrator
// Runs a worker plan layer by layer with bounded concurrency, retries and cancellation

use crate::execution::context::{ContextView, RunContext};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::{ExecutionPlan, GraphError};
use crate::execution::task::{ErrorKind, ExecutionTask, SkipReason, TaskError, TaskStatus};
use crate::registry::{RegisteredWorker, WorkerRegistry, WorkerSpec};
use crate::report::{overall_status, summarize, OrchestrationResult, OverallStatus};
use crate::workers::WorkerOutput;

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Workers allowed in flight when neither the request nor the config says otherwise
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum workers in flight when a request does not set its own limit
    pub default_concurrency: usize,
    /// Deadline applied to runs whose request does not carry one
    pub run_deadline: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_concurrency: DEFAULT_CONCURRENCY,
            run_deadline: None,
        }
    }
}

/// One orchestration request
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Entity the run researches (e.g. a property id)
    pub entity_id: String,
    /// Workers to run; empty means every registered worker
    pub requested_workers: Vec<String>,
    /// Seed values readable by every worker
    pub input_data: BTreeMap<String, Value>,
    /// Overrides [`ExecutorConfig::default_concurrency`]; zero is treated as one
    pub concurrency_limit: Option<usize>,
    /// Cancel the run once this much time has passed
    pub deadline: Option<Duration>,
}

impl RunRequest {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            ..Self::default()
        }
    }

    pub fn workers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requested_workers.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.input_data.insert(key.into(), value);
        self
    }

    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Drives runs against a shared, read-only registry
pub struct Orchestrator {
    registry: Arc<WorkerRegistry>,
    config: ExecutorConfig,
    event_tx: Option<ProgressSender>,
}

impl Orchestrator {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self {
            registry,
            config: ExecutorConfig::default(),
            event_tx: None,
        }
    }

    /// Set orchestrator configuration
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Build the plan a request would execute, without running anything
    pub fn plan(&self, requested: &[String]) -> Result<ExecutionPlan, GraphError> {
        ExecutionPlan::build(&self.registry, requested)
    }

    /// Execute a run to completion
    pub async fn run(&self, request: RunRequest) -> OrchestrationResult {
        self.run_with_cancel(request, CancellationToken::new()).await
    }

    /// Execute a run that stops early once `cancel` fires.
    ///
    /// Workers in flight are interrupted and recorded as failed with [`ErrorKind::Cancelled`];
    /// workers that never started are skipped with [`SkipReason::RunCancelled`].
    pub async fn run_with_cancel(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> OrchestrationResult {
        let run_id = Uuid::new_v4();
        let start = Instant::now();
        let RunRequest {
            entity_id,
            requested_workers,
            input_data,
            concurrency_limit,
            deadline,
        } = request;
        let mut context = RunContext::seeded(input_data);

        let plan = match self.plan(&requested_workers) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(%run_id, entity_id = %entity_id, error = %err, "run rejected during planning");
                self.event_tx.send_event(ExecutionEvent::PlanningFailed {
                    run_id,
                    message: err.to_string(),
                });
                return self.finish(
                    run_id,
                    entity_id,
                    BTreeMap::new(),
                    context,
                    Vec::new(),
                    Some(err),
                    false,
                    start,
                );
            }
        };

        let limit = concurrency_limit
            .unwrap_or(self.config.default_concurrency)
            .clamp(1, Semaphore::MAX_PERMITS);
        let cancel = cancel.child_token();
        let deadline_timer = deadline.or(self.config.run_deadline).map(|after| {
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                token.cancel();
            })
        });

        info!(
            %run_id,
            entity_id = %entity_id,
            workers = plan.worker_count(),
            layers = plan.layers().len(),
            concurrency = limit,
            "starting orchestration run"
        );
        self.event_tx.send_event(ExecutionEvent::RunStarted {
            run_id,
            entity_id: entity_id.clone(),
            total_workers: plan.worker_count(),
            total_layers: plan.layers().len(),
        });

        let mut tasks: BTreeMap<String, ExecutionTask> = plan
            .workers()
            .map(|name| (name.to_string(), ExecutionTask::new(name)))
            .collect();
        let semaphore = Arc::new(Semaphore::new(limit));

        for (index, layer) in plan.layers().iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            self.execute_layer(
                index,
                layer,
                &entity_id,
                &mut context,
                &mut tasks,
                &semaphore,
                &cancel,
            )
            .await;
        }

        if let Some(timer) = deadline_timer {
            timer.abort();
        }

        if cancel.is_cancelled() {
            let never_started: Vec<String> = tasks
                .iter()
                .filter(|(_, task)| task.status == TaskStatus::Pending)
                .map(|(name, _)| name.clone())
                .collect();
            for name in never_started {
                self.skip(&mut tasks, &name, SkipReason::RunCancelled);
            }
        }

        let cancelled = tasks.values().any(interrupted_by_cancel);
        if cancelled {
            warn!(%run_id, entity_id = %entity_id, "run cancelled");
            self.event_tx.send_event(ExecutionEvent::RunCancelled { run_id });
        }

        let layers = plan.layers().to_vec();
        let requested = plan.requested().clone();
        let mut result = self.finish(
            run_id, entity_id, tasks, context, layers, None, cancelled, start,
        );
        result.overall_status = overall_status(&result.tasks, &requested, cancelled);
        self.event_tx.send_event(ExecutionEvent::RunCompleted {
            run_id,
            status: result.overall_status,
            duration: result.duration,
        });
        info!(
            %run_id,
            status = %result.overall_status,
            succeeded = result.summary.counts.succeeded,
            failed = result.summary.counts.failed,
            skipped = result.summary.counts.skipped,
            duration_ms = result.duration.as_millis() as u64,
            "orchestration run finished"
        );
        result
    }

    /// Assemble the terminal snapshot. Overall status defaults to `Failure` and is
    /// recomputed by the caller for runs that got past planning.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        run_id: Uuid,
        entity_id: String,
        tasks: BTreeMap<String, ExecutionTask>,
        context: RunContext,
        layers: Vec<Vec<String>>,
        planning_error: Option<GraphError>,
        cancelled: bool,
        start: Instant,
    ) -> OrchestrationResult {
        let context_snapshot = context.into_snapshot();
        let summary = summarize(&tasks, &context_snapshot);
        let duration = start.elapsed();

        if planning_error.is_some() {
            self.event_tx.send_event(ExecutionEvent::RunCompleted {
                run_id,
                status: OverallStatus::Failure,
                duration,
            });
        }

        OrchestrationResult {
            run_id,
            entity_id,
            overall_status: OverallStatus::Failure,
            tasks,
            context_snapshot,
            summary,
            layers,
            planning_error,
            cancelled,
            duration,
        }
    }

    /// Run one layer: skip blocked workers, launch the rest, commit their outputs
    #[allow(clippy::too_many_arguments)]
    async fn execute_layer(
        &self,
        index: usize,
        layer: &[String],
        entity_id: &str,
        context: &mut RunContext,
        tasks: &mut BTreeMap<String, ExecutionTask>,
        semaphore: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) {
        let layer_start = Instant::now();
        let mut runnable: Vec<RegisteredWorker> = Vec::new();

        for name in layer {
            let Some(entry) = self.registry.get(name) else {
                error!(worker = %name, "planned worker missing from registry");
                if let Some(task) = tasks.get_mut(name) {
                    task.mark_failed(
                        TaskError::new(ErrorKind::Internal, "worker is not registered"),
                        0,
                        None,
                        Utc::now(),
                    );
                }
                continue;
            };

            if let Some(dependency) = self.blocking_dependency(&entry.spec, tasks) {
                let reason = SkipReason::DependencyFailed { dependency };
                info!(worker = %name, %reason, "skipping worker");
                self.skip(tasks, name, reason);
                continue;
            }

            runnable.push(entry.clone());
        }

        self.event_tx.send_event(ExecutionEvent::LayerStarted {
            index,
            workers: runnable.iter().map(|w| w.spec.name.clone()).collect(),
        });
        debug!(layer = index, workers = runnable.len(), "launching layer");

        let mut join_set = JoinSet::new();
        let mut launched = Vec::with_capacity(runnable.len());
        for entry in runnable {
            let name = entry.spec.name.clone();
            let view = Arc::new(context.view_for(&name, &entry.spec.dependencies));
            if let Some(task) = tasks.get_mut(&name) {
                task.mark_running();
            }
            join_set.spawn(invoke_worker(WorkerCall {
                entry,
                entity_id: entity_id.to_string(),
                view,
                semaphore: Arc::clone(semaphore),
                cancel: cancel.clone(),
                events: self.event_tx.clone(),
            }));
            launched.push(name);
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => self.settle(outcome, context, tasks),
                Err(err) => error!(layer = index, error = %err, "worker task ended abnormally"),
            }
        }

        for name in &launched {
            if let Some(task) = tasks.get_mut(name) {
                if !task.status.is_terminal() {
                    task.mark_failed(
                        TaskError::new(ErrorKind::Internal, "worker task ended without reporting"),
                        task.attempts,
                        task.started_at,
                        Utc::now(),
                    );
                }
            }
        }

        self.event_tx.send_event(ExecutionEvent::LayerSettled {
            index,
            duration: layer_start.elapsed(),
        });
    }

    /// First required dependency (by name) that did not succeed
    fn blocking_dependency(
        &self,
        spec: &WorkerSpec,
        tasks: &BTreeMap<String, ExecutionTask>,
    ) -> Option<String> {
        let mut dependencies: Vec<&String> = spec.dependencies.iter().collect();
        dependencies.sort();
        dependencies
            .into_iter()
            .find(|dep| {
                let succeeded = tasks
                    .get(dep.as_str())
                    .map(|task| task.status == TaskStatus::Succeeded)
                    .unwrap_or(false);
                let optional = self
                    .registry
                    .spec(dep)
                    .map(|spec| spec.optional)
                    .unwrap_or(false);
                !succeeded && !optional
            })
            .cloned()
    }

    fn skip(&self, tasks: &mut BTreeMap<String, ExecutionTask>, name: &str, reason: SkipReason) {
        if let Some(task) = tasks.get_mut(name) {
            task.mark_skipped(reason.clone());
            self.event_tx
                .send_event(ExecutionEvent::worker_skipped(name, reason));
        }
    }

    /// Record an invocation outcome and commit its outputs
    fn settle(
        &self,
        outcome: WorkerOutcome,
        context: &mut RunContext,
        tasks: &mut BTreeMap<String, ExecutionTask>,
    ) {
        let (name, result, attempts, started_at, ended_at, elapsed) = match outcome {
            WorkerOutcome::NotStarted { name } => {
                debug!(worker = %name, "worker never started before cancellation");
                self.skip(tasks, &name, SkipReason::RunCancelled);
                return;
            }
            WorkerOutcome::Finished {
                name,
                result,
                attempts,
                started_at,
                ended_at,
                elapsed,
            } => (name, result, attempts, started_at, ended_at, elapsed),
        };

        let committed = result.and_then(|output| self.commit(&name, output, context));
        let Some(task) = tasks.get_mut(&name) else {
            return;
        };
        match committed {
            Ok(()) => {
                task.mark_succeeded(attempts, started_at, ended_at);
                info!(
                    worker = %name,
                    attempts,
                    duration_ms = elapsed.as_millis() as u64,
                    "worker succeeded"
                );
            }
            Err(err) => {
                warn!(
                    worker = %name,
                    attempts,
                    kind = %err.kind,
                    error = %err.message,
                    "worker failed"
                );
                task.mark_failed(err, attempts, Some(started_at), ended_at);
            }
        }

        self.event_tx.send_event(ExecutionEvent::worker_completed(
            &name,
            task.status,
            attempts,
            elapsed,
            task.error.clone(),
        ));
    }

    /// Check declared outputs and write them all-or-nothing
    fn commit(
        &self,
        name: &str,
        output: WorkerOutput,
        context: &mut RunContext,
    ) -> Result<(), TaskError> {
        if let Some(spec) = self.registry.spec(name) {
            if let Some(key) = output.keys().find(|key| !spec.declares_output(key)) {
                return Err(TaskError::new(
                    ErrorKind::ValidationError,
                    format!("worker '{}' produced undeclared output key '{}'", name, key),
                ));
            }
        }

        context
            .write_all(output, name)
            .map_err(|err| TaskError::new(err.kind(), err.to_string()))
    }
}

/// Run a request against `registry` with default configuration
pub async fn run_orchestration(
    registry: Arc<WorkerRegistry>,
    request: RunRequest,
) -> OrchestrationResult {
    Orchestrator::new(registry).run(request).await
}

fn interrupted_by_cancel(task: &ExecutionTask) -> bool {
    let cancelled_error = task
        .error
        .as_ref()
        .map(|err| err.kind == ErrorKind::Cancelled)
        .unwrap_or(false);
    cancelled_error || task.skip_reason == Some(SkipReason::RunCancelled)
}

/// Everything a spawned invocation needs
struct WorkerCall {
    entry: RegisteredWorker,
    entity_id: String,
    view: Arc<ContextView>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    events: Option<ProgressSender>,
}

enum WorkerOutcome {
    /// Cancelled while waiting for a concurrency slot
    NotStarted { name: String },
    Finished {
        name: String,
        result: Result<WorkerOutput, TaskError>,
        attempts: u32,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        elapsed: Duration,
    },
}

struct AttemptFailure {
    error: TaskError,
    retry_after: Option<Duration>,
}

impl AttemptFailure {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: TaskError::new(kind, message),
            retry_after: None,
        }
    }
}

/// Wait for a concurrency slot unless the run is cancelled first
async fn acquire_slot(
    semaphore: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Option<OwnedSemaphorePermit> {
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = Arc::clone(semaphore).acquire_owned() => permit.ok(),
    };
    permit.filter(|_| !cancel.is_cancelled())
}

/// Attempt the worker until it succeeds or the retry policy gives up.
/// A slot is held only while an attempt runs, never during backoff.
async fn invoke_worker(call: WorkerCall) -> WorkerOutcome {
    let WorkerCall {
        entry,
        entity_id,
        view,
        semaphore,
        cancel,
        events,
    } = call;
    let name = entry.spec.name.clone();

    let Some(mut permit) = acquire_slot(&semaphore, &cancel).await else {
        return WorkerOutcome::NotStarted { name };
    };

    let started_at = Utc::now();
    let clock = Instant::now();
    let policy = &entry.spec.retry;
    let mut attempt = 0;

    let result = loop {
        attempt += 1;
        events.send_event(ExecutionEvent::worker_started(&name, attempt));
        debug!(worker = %name, attempt, "invoking worker");

        let outcome = run_attempt(&entry, &entity_id, &view, &cancel).await;
        drop(permit);
        let failure = match outcome {
            Ok(output) => break Ok(output),
            Err(failure) => failure,
        };
        if !failure.error.kind.is_retryable() || !policy.allows_retry(attempt) {
            break Err(failure.error);
        }

        let delay = failure
            .retry_after
            .unwrap_or_else(|| policy.delay_for(attempt));
        warn!(
            worker = %name,
            attempt,
            error = %failure.error,
            delay_ms = delay.as_millis() as u64,
            "retrying worker"
        );
        events.send_event(ExecutionEvent::WorkerRetrying {
            worker_name: name.clone(),
            attempt,
            error: failure.error.clone(),
            delay,
        });

        let interrupted = tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = cancel.cancelled() => true,
        };
        if interrupted {
            break Err(TaskError::new(
                ErrorKind::Cancelled,
                "run cancelled while waiting to retry",
            ));
        }

        permit = match acquire_slot(&semaphore, &cancel).await {
            Some(permit) => permit,
            None => {
                break Err(TaskError::new(
                    ErrorKind::Cancelled,
                    "run cancelled while waiting to retry",
                ))
            }
        };
    };

    WorkerOutcome::Finished {
        name,
        result,
        attempts: attempt,
        started_at,
        ended_at: Utc::now(),
        elapsed: clock.elapsed(),
    }
}

/// One invocation, bounded by the worker's timeout and the run's cancellation
async fn run_attempt(
    entry: &RegisteredWorker,
    entity_id: &str,
    view: &Arc<ContextView>,
    cancel: &CancellationToken,
) -> Result<WorkerOutput, AttemptFailure> {
    let worker = Arc::clone(&entry.worker);
    let entity_id = entity_id.to_string();
    let view = Arc::clone(view);
    let mut handle = tokio::spawn(async move { worker.run(&entity_id, &view).await });
    let limit = entry.spec.timeout;

    let raced = tokio::select! {
        biased;
        joined = tokio::time::timeout(limit, &mut handle) => Some(joined),
        _ = cancel.cancelled() => None,
    };

    let Some(joined) = raced else {
        handle.abort();
        return Err(AttemptFailure::new(
            ErrorKind::Cancelled,
            "run cancelled while worker was running",
        ));
    };

    match joined {
        Ok(Ok(Ok(output))) => Ok(output),
        Ok(Ok(Err(err))) => Err(AttemptFailure {
            error: err.to_task_error(),
            retry_after: err.retry_after(),
        }),
        Ok(Err(join_err)) if join_err.is_panic() => {
            Err(AttemptFailure::new(ErrorKind::Internal, "worker panicked"))
        }
        Ok(Err(join_err)) => Err(AttemptFailure::new(
            ErrorKind::Internal,
            format!("worker task failed: {}", join_err),
        )),
        Err(_) => {
            handle.abort();
            Err(AttemptFailure::new(
                ErrorKind::TimeoutError,
                format!("exceeded timeout of {}ms", limit.as_millis()),
            ))
        }
    }
}
