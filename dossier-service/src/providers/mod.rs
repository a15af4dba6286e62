// Provider Adapters
// Uniform request/response contract for external services and text generation backends

pub mod fixture;
pub mod http;
pub mod retrying;

// Re-export key types
pub use fixture::{FixtureProvider, FixtureSet};
pub use http::HttpProvider;
pub use retrying::RetryingProvider;

use crate::execution::task::ErrorKind;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A single call to an external collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// Operation name understood by the provider (e.g. `valuation.estimate`)
    pub operation: String,
    /// Operation parameters
    pub params: Value,
}

impl ProviderRequest {
    pub fn new(operation: impl Into<String>, params: Value) -> Self {
        Self {
            operation: operation.into(),
            params,
        }
    }
}

/// Observability data attached to every response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallMetadata {
    /// Wall time spent including retries
    pub latency: Duration,
    /// Attempts made to obtain the response
    pub attempts: u32,
}

/// Successful provider response
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub body: Value,
    pub metadata: CallMetadata,
}

impl ProviderResponse {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            metadata: CallMetadata {
                latency: Duration::ZERO,
                attempts: 1,
            },
        }
    }
}

/// Failures a provider may report
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("external service error: {message}")]
    ExternalService { message: String },

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl ProviderError {
    pub fn external(message: impl Into<String>) -> Self {
        Self::ExternalService {
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::InvalidRequest { .. })
    }

    /// Delay suggested by the service, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::ExternalService { .. } => ErrorKind::ExternalServiceError,
            ProviderError::RateLimited { .. } => ErrorKind::RateLimitError,
            ProviderError::InvalidRequest { .. } => ErrorKind::ValidationError,
        }
    }
}

/// Trait implemented by every external-service adapter
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Name used in logs and in the [`ProviderSet`]
    fn name(&self) -> &str;

    /// Perform one logical call
    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}

/// Named providers handed to the worker catalog
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider under `name`, replacing any previous one
    pub fn with(mut self, name: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.insert(name, provider);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Wrap every provider with the same retry policy and per-call timeout
    pub fn with_retries(self, policy: crate::retry::RetryPolicy, call_timeout: Option<Duration>) -> Self {
        let providers = self
            .providers
            .into_iter()
            .map(|(name, provider)| {
                let wrapped: Arc<dyn Provider> = Arc::new(
                    RetryingProvider::new(provider, policy.clone()).with_call_timeout(call_timeout),
                );
                (name, wrapped)
            })
            .collect();
        Self { providers }
    }
}

impl fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.providers.keys()).finish()
    }
}
