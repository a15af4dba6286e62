// Dossier Service Library
// Dependency-aware worker orchestration for entity research runs

//! Runs a catalog of research workers against one entity.
//!
//! Workers are registered once with their dependencies, resolved into layers, and executed
//! layer by layer with bounded concurrency. Each run owns a write-once [`RunContext`]; the
//! terminal [`OrchestrationResult`] reports every task and the final context.

pub mod config;
pub mod error;
pub mod execution;
pub mod providers;
pub mod registry;
pub mod report;
pub mod retry;
pub mod workers;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{EngineConfig, ProviderConfig, WorkerOverride};
pub use error::{ServiceError, ServiceResult};

// Re-export execution types
pub use execution::{
    progress_channel, run_orchestration, ContextView, ErrorKind, ExecutionEvent, ExecutionPlan,
    ExecutionTask, ExecutorConfig, GraphError, GraphErrorKind, Orchestrator, ProgressSender,
    RunContext, RunRequest, SkipReason, TaskError, TaskStatus,
};

// Re-export registry and worker types
pub use registry::{WorkerRegistry, WorkerSpec};
pub use workers::{builtin_registry, builtin_specs, Worker, WorkerError, WorkerOutput};

// Re-export provider types
pub use providers::{Provider, ProviderError, ProviderRequest, ProviderResponse, ProviderSet};

// Re-export result types
pub use report::{OrchestrationResult, OverallStatus, RunSummary};
pub use retry::{Backoff, RetryPolicy};
