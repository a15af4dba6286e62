// Execution Events
// Progress reporting for orchestration runs

use crate::execution::task::{SkipReason, TaskError, TaskStatus};
use crate::report::OverallStatus;

use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during an orchestration run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Plan built, first layer about to start
    RunStarted {
        run_id: Uuid,
        entity_id: String,
        total_workers: usize,
        total_layers: usize,
    },

    /// Planning failed; no worker was invoked
    PlanningFailed { run_id: Uuid, message: String },

    /// Run finished (successfully or not)
    RunCompleted {
        run_id: Uuid,
        status: OverallStatus,
        duration: Duration,
    },

    /// Run was cancelled by the caller or its deadline
    RunCancelled { run_id: Uuid },

    /// A layer's runnable workers are being launched
    LayerStarted { index: usize, workers: Vec<String> },

    /// Every task in the layer reached a terminal status
    LayerSettled { index: usize, duration: Duration },

    /// A worker attempt began
    WorkerStarted { worker_name: String, attempt: u32 },

    /// An attempt failed with a retryable error; another follows after `delay`
    WorkerRetrying {
        worker_name: String,
        attempt: u32,
        error: TaskError,
        delay: Duration,
    },

    /// A worker reached `Succeeded` or `Failed`
    WorkerCompleted {
        worker_name: String,
        status: TaskStatus,
        attempts: u32,
        duration: Duration,
        error: Option<TaskError>,
    },

    /// A worker was skipped without being invoked
    WorkerSkipped {
        worker_name: String,
        reason: SkipReason,
    },
}

impl ExecutionEvent {
    pub fn worker_started(worker_name: impl Into<String>, attempt: u32) -> Self {
        Self::WorkerStarted {
            worker_name: worker_name.into(),
            attempt,
        }
    }

    pub fn worker_skipped(worker_name: impl Into<String>, reason: SkipReason) -> Self {
        Self::WorkerSkipped {
            worker_name: worker_name.into(),
            reason,
        }
    }

    pub fn worker_completed(
        worker_name: impl Into<String>,
        status: TaskStatus,
        attempts: u32,
        duration: Duration,
        error: Option<TaskError>,
    ) -> Self {
        Self::WorkerCompleted {
            worker_name: worker_name.into(),
            status,
            attempts,
            duration,
            error,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::worker_started("valuation", 1));
        tx.send_event(ExecutionEvent::worker_skipped(
            "dossier",
            SkipReason::RunCancelled,
        ));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ExecutionEvent::WorkerStarted { attempt: 1, .. }));

        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second,
            ExecutionEvent::WorkerSkipped {
                reason: SkipReason::RunCancelled,
                ..
            }
        ));
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        // Should not panic
        sender.send_event(ExecutionEvent::worker_started("x", 1));
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (tx, rx) = progress_channel();
        drop(rx);
        tx.send_event(ExecutionEvent::worker_started("x", 1));
    }
}
