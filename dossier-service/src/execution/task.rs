// Execution Tasks
// Per-worker, per-run status records mutated only by the orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a worker within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// Terminal statuses never change again within a run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// Error taxonomy shared by workers, providers and the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad input to a worker, including contract violations
    ValidationError,
    /// Transient failure of an external collaborator
    ExternalServiceError,
    /// External collaborator asked us to slow down
    RateLimitError,
    /// Worker exceeded its allotted time
    TimeoutError,
    /// Assigned by the engine to dependents of a failed worker
    DependencyFailedError,
    /// Second write to an existing context key
    DuplicateKeyError,
    /// Read of a context key nobody wrote
    MissingKeyError,
    /// Read of a key produced by an undeclared dependency
    UndeclaredReadError,
    /// Worker was interrupted by run cancellation
    Cancelled,
    /// Worker panicked or the engine lost track of it
    Internal,
}

impl ErrorKind {
    /// Whether the engine may re-invoke the whole worker after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ExternalServiceError | ErrorKind::RateLimitError | ErrorKind::TimeoutError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error recorded on a failed task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Why a worker was never invoked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// A required dependency failed or was itself skipped
    DependencyFailed { dependency: String },
    /// The run was cancelled before the worker started
    RunCancelled,
}

impl SkipReason {
    /// Error kind this skip corresponds to in the taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            SkipReason::DependencyFailed { .. } => ErrorKind::DependencyFailedError,
            SkipReason::RunCancelled => ErrorKind::Cancelled,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DependencyFailed { dependency } => {
                write!(f, "dependency '{}' did not succeed", dependency)
            }
            SkipReason::RunCancelled => write!(f, "RunCancelled"),
        }
    }
}

/// Per-worker record for one orchestration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTask {
    /// Registered worker name
    pub worker_name: String,
    /// Current status
    pub status: TaskStatus,
    /// Number of worker invocations made
    pub attempts: u32,
    /// When the first attempt started
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status
    pub ended_at: Option<DateTime<Utc>>,
    /// Present only when `status == Failed`
    pub error: Option<TaskError>,
    /// Present only when `status == Skipped`
    pub skip_reason: Option<SkipReason>,
}

impl ExecutionTask {
    pub fn new(worker_name: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
            status: TaskStatus::Pending,
            attempts: 0,
            started_at: None,
            ended_at: None,
            error: None,
            skip_reason: None,
        }
    }

    pub(crate) fn mark_running(&mut self) {
        debug_assert_eq!(self.status, TaskStatus::Pending);
        self.status = TaskStatus::Running;
    }

    pub(crate) fn mark_succeeded(
        &mut self,
        attempts: u32,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) {
        debug_assert!(!self.status.is_terminal());
        self.status = TaskStatus::Succeeded;
        self.attempts = attempts;
        self.started_at = Some(started_at);
        self.ended_at = Some(ended_at);
    }

    pub(crate) fn mark_failed(
        &mut self,
        error: TaskError,
        attempts: u32,
        started_at: Option<DateTime<Utc>>,
        ended_at: DateTime<Utc>,
    ) {
        debug_assert!(!self.status.is_terminal());
        self.status = TaskStatus::Failed;
        self.attempts = attempts;
        self.started_at = started_at;
        self.ended_at = Some(ended_at);
        self.error = Some(error);
    }

    pub(crate) fn mark_skipped(&mut self, reason: SkipReason) {
        debug_assert!(!self.status.is_terminal());
        self.status = TaskStatus::Skipped;
        self.ended_at = Some(Utc::now());
        self.skip_reason = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::ExternalServiceError.is_retryable());
        assert!(ErrorKind::RateLimitError.is_retryable());
        assert!(ErrorKind::TimeoutError.is_retryable());
        assert!(!ErrorKind::ValidationError.is_retryable());
        assert!(!ErrorKind::DuplicateKeyError.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_skip_keeps_error_empty() {
        let mut task = ExecutionTask::new("valuation");
        task.mark_skipped(SkipReason::DependencyFailed {
            dependency: "property_details".to_string(),
        });

        assert_eq!(task.status, TaskStatus::Skipped);
        assert!(task.error.is_none());
        assert_eq!(
            task.skip_reason.as_ref().map(SkipReason::kind),
            Some(ErrorKind::DependencyFailedError)
        );
        assert_eq!(task.attempts, 0);
    }

    #[test]
    fn test_skip_reason_display_names_dependency() {
        let reason = SkipReason::DependencyFailed {
            dependency: "A".to_string(),
        };
        assert!(reason.to_string().contains("'A'"));
        assert_eq!(SkipReason::RunCancelled.to_string(), "RunCancelled");
    }
}
