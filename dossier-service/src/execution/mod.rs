// Execution Engine Module
// Handles plan construction, run orchestration, task bookkeeping and the run context

pub mod context;
pub mod events;
pub mod executor;
pub mod graph;
pub mod task;

// Re-export key types
pub use context::{ContextEntry, ContextError, ContextSnapshot, ContextView, RunContext};
pub use events::{progress_channel, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use executor::{run_orchestration, ExecutorConfig, Orchestrator, RunRequest};
pub use graph::{build_layers, ExecutionPlan, GraphError, GraphErrorKind};
pub use task::{ErrorKind, ExecutionTask, SkipReason, TaskError, TaskStatus};
