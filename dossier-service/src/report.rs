// Result Aggregation
// Terminal run snapshot and the deterministic summary handed to presentation layers

use crate::execution::context::{ContextSnapshot, SEED_PRODUCER};
use crate::execution::graph::GraphError;
use crate::execution::task::{ErrorKind, ExecutionTask, SkipReason, TaskStatus};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Outcome of a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverallStatus {
    /// Every task succeeded
    Success,
    /// Something failed or was skipped, but at least one requested worker succeeded
    PartialSuccess,
    /// No requested worker succeeded, planning failed, or the run was cancelled
    Failure,
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OverallStatus::Success => "Success",
            OverallStatus::PartialSuccess => "PartialSuccess",
            OverallStatus::Failure => "Failure",
        };
        f.write_str(label)
    }
}

/// Number of tasks per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.succeeded + self.failed + self.skipped
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedWorker {
    pub name: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedWorker {
    pub name: String,
    pub reason: SkipReason,
}

/// A context key as seen by downstream consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WrittenKey {
    pub key: String,
    pub producer: String,
    pub value: Value,
}

/// Aggregated view of a run; identical inputs always give an identical summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub counts: StatusCounts,
    /// Failed workers ordered by name
    pub failed: Vec<FailedWorker>,
    /// Skipped workers ordered by name
    pub skipped: Vec<SkippedWorker>,
    /// Every context entry ordered by key
    pub entries: Vec<WrittenKey>,
}

impl RunSummary {
    /// Entries written by workers, excluding seed input
    pub fn produced(&self) -> impl Iterator<Item = &WrittenKey> {
        self.entries.iter().filter(|e| e.producer != SEED_PRODUCER)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counts;
        writeln!(
            f,
            "{} workers: {} succeeded, {} failed, {} skipped",
            c.total(),
            c.succeeded,
            c.failed,
            c.skipped
        )?;
        if c.pending + c.running > 0 {
            writeln!(f, "  {} pending, {} running", c.pending, c.running)?;
        }

        if !self.failed.is_empty() {
            writeln!(f, "Failed:")?;
            for failure in &self.failed {
                writeln!(f, "  - {} [{}] {}", failure.name, failure.kind, failure.message)?;
            }
        }

        if !self.skipped.is_empty() {
            writeln!(f, "Skipped:")?;
            for skipped in &self.skipped {
                writeln!(f, "  - {} ({})", skipped.name, skipped.reason)?;
            }
        }

        let produced: Vec<_> = self.produced().collect();
        if !produced.is_empty() {
            writeln!(f, "Context:")?;
            for entry in produced {
                writeln!(f, "  {} <- {}", entry.key, entry.producer)?;
            }
        }

        Ok(())
    }
}

/// Pure aggregation over the task map and the final context
pub fn summarize(tasks: &BTreeMap<String, ExecutionTask>, context: &ContextSnapshot) -> RunSummary {
    let mut counts = StatusCounts::default();
    let mut failed = Vec::new();
    let mut skipped = Vec::new();

    for (name, task) in tasks {
        match task.status {
            TaskStatus::Pending => counts.pending += 1,
            TaskStatus::Running => counts.running += 1,
            TaskStatus::Succeeded => counts.succeeded += 1,
            TaskStatus::Failed => {
                counts.failed += 1;
                let (kind, message) = task
                    .error
                    .as_ref()
                    .map(|e| (e.kind, e.message.clone()))
                    .unwrap_or((ErrorKind::Internal, String::new()));
                failed.push(FailedWorker {
                    name: name.clone(),
                    kind,
                    message,
                });
            }
            TaskStatus::Skipped => {
                counts.skipped += 1;
                skipped.push(SkippedWorker {
                    name: name.clone(),
                    reason: task
                        .skip_reason
                        .clone()
                        .unwrap_or(SkipReason::RunCancelled),
                });
            }
        }
    }

    let entries = context
        .iter()
        .map(|(key, entry)| WrittenKey {
            key: key.clone(),
            producer: entry.producer.clone(),
            value: entry.value.clone(),
        })
        .collect();

    RunSummary {
        counts,
        failed,
        skipped,
        entries,
    }
}

/// Classify a finished run
pub fn overall_status(
    tasks: &BTreeMap<String, ExecutionTask>,
    requested: &BTreeSet<String>,
    cancelled: bool,
) -> OverallStatus {
    if cancelled {
        return OverallStatus::Failure;
    }

    let all_succeeded = tasks
        .values()
        .all(|task| task.status == TaskStatus::Succeeded);
    if all_succeeded {
        return OverallStatus::Success;
    }

    let requested_succeeded = requested.iter().any(|name| {
        tasks
            .get(name)
            .map(|task| task.status == TaskStatus::Succeeded)
            .unwrap_or(false)
    });
    if requested_succeeded {
        OverallStatus::PartialSuccess
    } else {
        OverallStatus::Failure
    }
}

/// Immutable terminal snapshot of one run
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult {
    pub run_id: Uuid,
    pub entity_id: String,
    pub overall_status: OverallStatus,
    /// One task per requested or transitively required worker
    pub tasks: BTreeMap<String, ExecutionTask>,
    /// Final run context contents
    pub context_snapshot: ContextSnapshot,
    pub summary: RunSummary,
    /// Layers as planned (empty if planning failed)
    pub layers: Vec<Vec<String>>,
    /// Set when the run was rejected before any worker executed
    pub planning_error: Option<GraphError>,
    pub cancelled: bool,
    pub duration: Duration,
}

impl OrchestrationResult {
    pub fn task(&self, name: &str) -> Option<&ExecutionTask> {
        self.tasks.get(name)
    }

    pub fn status_of(&self, name: &str) -> Option<TaskStatus> {
        self.tasks.get(name).map(|t| t.status)
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.context_snapshot.get(key).map(|e| &e.value)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
