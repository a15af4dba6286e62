// Fixture Provider
// Canned responses per operation, for offline runs and tests

use crate::error::{ServiceError, ServiceResult};
use crate::providers::{
    CallMetadata, Provider, ProviderError, ProviderRequest, ProviderResponse, ProviderSet,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Error a fixture should answer with instead of a body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureErrorKind {
    ExternalService,
    RateLimited,
    InvalidRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureError {
    pub kind: FixtureErrorKind,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub retry_after_ms: Option<u64>,
}

/// Canned answer for one operation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FixtureResponse {
    /// JSON body returned on success
    #[serde(default)]
    pub body: Value,
    /// If set, the call fails with this error
    #[serde(default)]
    pub error: Option<FixtureError>,
    /// Simulated latency
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

/// Provider serving canned responses keyed by operation name
#[derive(Debug, Clone)]
pub struct FixtureProvider {
    name: String,
    responses: BTreeMap<String, FixtureResponse>,
}

impl FixtureProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            responses: BTreeMap::new(),
        }
    }

    /// Answer `operation` with `body`
    pub fn respond(mut self, operation: impl Into<String>, body: Value) -> Self {
        self.responses.insert(
            operation.into(),
            FixtureResponse {
                body,
                ..Default::default()
            },
        );
        self
    }

    pub fn with_response(mut self, operation: impl Into<String>, response: FixtureResponse) -> Self {
        self.responses.insert(operation.into(), response);
        self
    }
}

#[async_trait::async_trait]
impl Provider for FixtureProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let start = Instant::now();
        let fixture = self.responses.get(&request.operation).ok_or_else(|| {
            ProviderError::invalid(format!(
                "provider '{}' has no fixture for operation '{}'",
                self.name, request.operation
            ))
        })?;

        if let Some(ms) = fixture.latency_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        if let Some(error) = &fixture.error {
            let message = if error.message.is_empty() {
                format!("fixture error for '{}'", request.operation)
            } else {
                error.message.clone()
            };
            return Err(match error.kind {
                FixtureErrorKind::ExternalService => ProviderError::external(message),
                FixtureErrorKind::RateLimited => ProviderError::rate_limited(
                    message,
                    error.retry_after_ms.map(Duration::from_millis),
                ),
                FixtureErrorKind::InvalidRequest => ProviderError::invalid(message),
            });
        }

        Ok(ProviderResponse {
            body: fixture.body.clone(),
            metadata: CallMetadata {
                latency: start.elapsed(),
                attempts: 1,
            },
        })
    }
}

/// A fixture file: provider name -> operation -> response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FixtureSet {
    pub providers: BTreeMap<String, BTreeMap<String, FixtureResponse>>,
}

impl FixtureSet {
    pub fn from_yaml_str(content: &str) -> ServiceResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ServiceResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServiceError::Config(format!("cannot read fixtures {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// One [`FixtureProvider`] per top-level entry
    pub fn into_providers(self) -> ProviderSet {
        let mut set = ProviderSet::new();
        for (name, responses) in self.providers {
            let provider = FixtureProvider {
                name: name.clone(),
                responses,
            };
            set.insert(name, Arc::new(provider));
        }
        set
    }
}
