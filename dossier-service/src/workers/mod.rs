// Workers Module
// Worker contract and the built-in property research catalog

pub mod research;

// Re-export key types
pub use research::{builtin_registry, builtin_specs};

use crate::execution::context::{ContextError, ContextView};
use crate::execution::task::{ErrorKind, TaskError};
use crate::providers::ProviderError;

use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Context keys produced by one successful invocation
pub type WorkerOutput = BTreeMap<String, Value>;

/// Typed failure a worker may return
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("external service error: {0}")]
    ExternalService(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("dependency failed: {0}")]
    DependencyFailed(String),

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl WorkerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::ExternalService(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::Validation(_) => ErrorKind::ValidationError,
            WorkerError::ExternalService(_) => ErrorKind::ExternalServiceError,
            WorkerError::RateLimited { .. } => ErrorKind::RateLimitError,
            WorkerError::Timeout(_) => ErrorKind::TimeoutError,
            WorkerError::DependencyFailed(_) => ErrorKind::DependencyFailedError,
            WorkerError::Context(err) => err.kind(),
        }
    }

    /// Delay suggested by a rate-limited collaborator
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            WorkerError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn to_task_error(&self) -> TaskError {
        TaskError::new(self.kind(), self.to_string())
    }
}

impl From<ProviderError> for WorkerError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::ExternalService { message } => WorkerError::ExternalService(message),
            ProviderError::RateLimited {
                message,
                retry_after,
            } => WorkerError::RateLimited {
                message,
                retry_after,
            },
            ProviderError::InvalidRequest { message } => WorkerError::Validation(message),
        }
    }
}

/// A named unit of work. Implementations read their inputs from the view and return the
/// keys they produce; the orchestrator commits them to the run context.
#[async_trait::async_trait]
pub trait Worker: Send + Sync {
    async fn run(&self, entity_id: &str, context: &ContextView) -> Result<WorkerOutput, WorkerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_errors_map_onto_worker_kinds() {
        let cases = [
            (ProviderError::external("x"), ErrorKind::ExternalServiceError),
            (
                ProviderError::rate_limited("x", Some(Duration::from_secs(1))),
                ErrorKind::RateLimitError,
            ),
            (ProviderError::invalid("x"), ErrorKind::ValidationError),
        ];

        for (provider_err, kind) in cases {
            let err = WorkerError::from(provider_err);
            assert_eq!(err.kind(), kind);
        }
    }

    #[test]
    fn test_context_errors_keep_their_kind() {
        let err = WorkerError::from(ContextError::MissingKey {
            key: "k".to_string(),
        });
        assert_eq!(err.kind(), ErrorKind::MissingKeyError);
        assert!(!err.kind().is_retryable());
    }

    #[test]
    fn test_task_error_carries_message() {
        let err = WorkerError::validation("address is empty");
        let task_error = err.to_task_error();
        assert_eq!(task_error.kind, ErrorKind::ValidationError);
        assert!(task_error.message.contains("address is empty"));
    }
}
