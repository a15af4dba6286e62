// Retrying Provider
// Owns retries within a single worker invocation: per-call timeout plus backoff

use crate::providers::{CallMetadata, Provider, ProviderError, ProviderRequest, ProviderResponse};
use crate::retry::RetryPolicy;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Wraps a provider with its own retry policy, independent of the engine's worker retries
pub struct RetryingProvider {
    inner: Arc<dyn Provider>,
    policy: RetryPolicy,
    call_timeout: Option<Duration>,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn Provider>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            call_timeout: None,
        }
    }

    /// Limit each individual call; an expired call counts as an external service error
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    async fn attempt(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.inner.call(request)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::external(format!(
                    "call to '{}' timed out after {}ms",
                    self.inner.name(),
                    limit.as_millis()
                ))),
            },
            None => self.inner.call(request).await,
        }
    }
}

#[async_trait::async_trait]
impl Provider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let start = Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.attempt(request.clone()).await {
                Ok(mut response) => {
                    debug!(
                        provider = self.inner.name(),
                        operation = %request.operation,
                        attempts,
                        "provider call succeeded"
                    );
                    response.metadata = CallMetadata {
                        latency: start.elapsed(),
                        attempts,
                    };
                    return Ok(response);
                }
                Err(err) if err.is_retryable() && self.policy.allows_retry(attempts) => {
                    let delay = err
                        .retry_after()
                        .unwrap_or_else(|| self.policy.delay_for(attempts));
                    warn!(
                        provider = self.inner.name(),
                        operation = %request.operation,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "provider call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(
                        provider = self.inner.name(),
                        operation = %request.operation,
                        attempts,
                        error = %err,
                        "provider call failed"
                    );
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;
    use serde_json::json;

    #[tokio::test]
    async fn test_retries_transient_errors_then_succeeds() {
        let inner = Arc::new(ScriptedProvider::new(
            "records",
            vec![
                Err(ProviderError::external("502")),
                Err(ProviderError::rate_limited("429", Some(Duration::from_millis(5)))),
                Ok(json!({"ok": true})),
            ],
        ));
        let provider = RetryingProvider::new(
            inner.clone(),
            RetryPolicy::fixed(3, Duration::from_millis(1)),
        );

        let response = provider
            .call(ProviderRequest::new("property.details", json!({})))
            .await
            .unwrap();

        assert_eq!(response.body, json!({"ok": true}));
        assert_eq!(response.metadata.attempts, 3);
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_retried() {
        let inner = Arc::new(ScriptedProvider::new(
            "records",
            vec![
                Err(ProviderError::invalid("unknown parcel")),
                Ok(json!({})),
            ],
        ));
        let provider = RetryingProvider::new(
            inner.clone(),
            RetryPolicy::fixed(5, Duration::from_millis(1)),
        );

        let err = provider
            .call(ProviderRequest::new("property.details", json!({})))
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::InvalidRequest { .. }));
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_policy_limit() {
        let inner = Arc::new(ScriptedProvider::new(
            "records",
            vec![
                Err(ProviderError::external("1")),
                Err(ProviderError::external("2")),
                Err(ProviderError::external("3")),
            ],
        ));
        let provider = RetryingProvider::new(
            inner.clone(),
            RetryPolicy::fixed(2, Duration::from_millis(1)),
        );

        let err = provider
            .call(ProviderRequest::new("op", json!(null)))
            .await
            .unwrap_err();

        assert_eq!(err, ProviderError::external("2"));
        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_external_error() {
        let inner = Arc::new(
            ScriptedProvider::new("slow", vec![Ok(json!(1)), Ok(json!(2))])
                .with_latency(Duration::from_millis(200)),
        );
        let provider = RetryingProvider::new(inner.clone(), RetryPolicy::none())
            .with_call_timeout(Some(Duration::from_millis(20)));

        let err = provider
            .call(ProviderRequest::new("op", json!(null)))
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::ExternalService { ref message } if message.contains("timed out")));
    }
}
