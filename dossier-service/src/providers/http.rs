// HTTP Provider
// JSON-over-HTTP adapter for external record, valuation and owner services

use crate::providers::{CallMetadata, Provider, ProviderError, ProviderRequest, ProviderResponse};

use reqwest::header::RETRY_AFTER;
use serde_json::Value;
use std::time::{Duration, Instant};

/// Posts `params` as JSON to `{base_url}/{operation}` and returns the JSON body
pub struct HttpProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: None,
            client: reqwest::Client::new(),
        }
    }

    /// Send a bearer token with every request
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    fn endpoint(&self, operation: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            operation.trim_start_matches('/')
        )
    }
}

#[async_trait::async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let start = Instant::now();
        let url = self.endpoint(&request.operation);

        let mut builder = self.client.post(&url).json(&request.params);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::external(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), retry_after, &body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::external(format!("invalid JSON from {}: {}", url, e)))?;

        Ok(ProviderResponse {
            body,
            metadata: CallMetadata {
                latency: start.elapsed(),
                attempts: 1,
            },
        })
    }
}

/// Map a non-success HTTP status onto the provider error taxonomy
pub fn classify_status(status: u16, retry_after: Option<Duration>, body: &str) -> ProviderError {
    let message = if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, truncate(body, 200))
    };

    match status {
        429 => ProviderError::rate_limited(message, retry_after),
        408 | 500..=599 => ProviderError::external(message),
        _ => ProviderError::invalid(message),
    }
}

/// Only the delta-seconds form of `Retry-After` is honoured
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    /// Read one request (headers plus Content-Length body) off the socket
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);

            let text = String::from_utf8_lossy(&raw);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&raw).into_owned()
    }

    /// Answer each incoming connection with the next canned response; yields the requests seen
    async fn serve(responses: Vec<String>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                requests.push(read_request(&mut socket).await);
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
            requests
        });
        (base_url, handle)
    }

    fn http_response(status: &str, extra_headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\n{}Content-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            extra_headers,
            body.len(),
            body
        )
    }

    #[tokio::test]
    async fn test_call_posts_json_and_returns_body() {
        let (base_url, server) =
            serve(vec![http_response("200 OK", "", r#"{"beds":3}"#)]).await;
        let provider = HttpProvider::new("records", format!("{}/records", base_url))
            .with_api_key(Some("secret-token".to_string()));

        let response = provider
            .call(ProviderRequest::new("property.details", json!({"address": "12 Elm St"})))
            .await
            .unwrap();

        assert_eq!(response.body, json!({"beds": 3}));
        assert_eq!(response.metadata.attempts, 1);

        let requests = server.await.unwrap();
        let request = &requests[0];
        assert!(request.starts_with("POST /records/property.details "));
        assert!(request
            .to_ascii_lowercase()
            .contains("authorization: bearer secret-token"));
        assert!(request.ends_with(r#"{"address":"12 Elm St"}"#));
    }

    #[tokio::test]
    async fn test_call_reads_retry_after_on_429() {
        let (base_url, server) = serve(vec![http_response(
            "429 Too Many Requests",
            "Retry-After: 2\r\n",
            r#"{"error":"busy"}"#,
        )])
        .await;
        let provider = HttpProvider::new("valuation", base_url);

        let err = provider
            .call(ProviderRequest::new("valuation.estimate", json!({})))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProviderError::RateLimited { retry_after: Some(d), .. } if d == Duration::from_secs(2)
        ));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_maps_bad_status_and_body() {
        let (base_url, server) = serve(vec![
            http_response("400 Bad Request", "", r#"{"error":"no address"}"#),
            http_response("200 OK", "", "not json"),
        ])
        .await;
        let provider = HttpProvider::new("records", base_url);

        let err = provider
            .call(ProviderRequest::new("property.details", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest { .. }));

        let err = provider
            .call(ProviderRequest::new("property.details", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ExternalService { .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_failure_is_external_service_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = HttpProvider::new("owners", base_url)
            .call(ProviderRequest::new("owner.lookup", json!({})))
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::ExternalService { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(429, Some(Duration::from_secs(3)), ""),
            ProviderError::RateLimited { retry_after: Some(d), .. } if d == Duration::from_secs(3)
        ));
        assert!(matches!(
            classify_status(503, None, "down"),
            ProviderError::ExternalService { .. }
        ));
        assert!(matches!(
            classify_status(404, None, "no such parcel"),
            ProviderError::InvalidRequest { .. }
        ));
    }

    #[test]
    fn test_endpoint_joins_cleanly() {
        let provider = HttpProvider::new("records", "https://records.example.com/api/");
        assert_eq!(
            provider.endpoint("property.details"),
            "https://records.example.com/api/property.details"
        );
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(" 7 "), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_message_is_truncated() {
        let long = "x".repeat(500);
        let err = classify_status(500, None, &long);
        assert!(err.to_string().len() < 260);
    }
}
