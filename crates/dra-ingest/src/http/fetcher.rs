//! Rate-limited, retrying JSON fetcher

use reqwest::{Client, StatusCode};
use serde_json::Value as Json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::rate_limit::RateLimiter;
use super::retry::RetryPolicy;
use crate::config::HttpConfig;
use crate::error::{IngestError, IngestResult};

/// Upstream error bodies are truncated to this many characters in errors
const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One HTTP call. Query parameters and headers are kept apart from the URL
/// so credentials never end up in log lines.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            ..Self::get(url)
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, key: &str, value: impl ToString) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }
}

/// Build the shared HTTP client
pub fn build_client(config: &HttpConfig) -> IngestResult<Client> {
    Client::builder()
        .timeout(config.request_timeout())
        .user_agent(config.user_agent.as_str())
        .build()
        .map_err(|e| IngestError::config(format!("Failed to build HTTP client: {}", e)))
}

/// Wraps single HTTP calls with throttling, classification and retry.
///
/// Every attempt first waits on the source's [`RateLimiter`], so retries are
/// throttled like any other request.
#[derive(Clone)]
pub struct RetryingFetcher {
    source: String,
    client: Client,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryingFetcher {
    pub fn new(
        source: impl Into<String>,
        client: Client,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source: source.into(),
            client,
            limiter,
            policy,
            cancel,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fetch and decode a JSON body.
    ///
    /// Transient failures are retried per the policy; on exhaustion the last
    /// transient error is returned as-is.
    pub async fn fetch(&self, request: &FetchRequest) -> IngestResult<Json> {
        self.fetch_with(request, Ok).await
    }

    /// Fetch and hand the body to `interpret` within the same attempt, so a
    /// transient error reported inside a 200 body is retried like a 5xx.
    pub async fn fetch_with<T, F>(&self, request: &FetchRequest, interpret: F) -> IngestResult<T>
    where
        F: Fn(Json) -> IngestResult<T>,
    {
        let interpret = &interpret;
        self.policy
            .run(&self.cancel, |attempt| async move {
                let body = self.attempt(request, attempt).await?;
                interpret(body).inspect_err(|e| {
                    warn!(
                        source = %self.source,
                        url = %request.url,
                        attempt,
                        transient = e.is_transient(),
                        error = %e,
                        "Response body reported an error"
                    )
                })
            })
            .await
    }

    async fn attempt(&self, request: &FetchRequest, attempt: u32) -> IngestResult<Json> {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(IngestError::Cancelled),
            result = self.send(request) => result,
        };

        match &result {
            Ok(_) => debug!(
                source = %self.source,
                url = %request.url,
                attempt,
                outcome = "ok",
                "Fetch attempt succeeded"
            ),
            Err(e) => warn!(
                source = %self.source,
                url = %request.url,
                attempt,
                outcome = if e.is_transient() { "transient" } else { "permanent" },
                error = %e,
                "Fetch attempt failed"
            ),
        }

        result
    }

    async fn send(&self, request: &FetchRequest) -> IngestResult<Json> {
        self.limiter.acquire().await;

        let builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        let builder = request
            .headers
            .iter()
            .fold(builder.query(&request.query), |b, (k, v)| b.header(k, v));

        let response = builder
            .send()
            .await
            .map_err(|e| classify_transport(&request.url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&request.url, status, &body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| IngestError::transient(&request.url, Some(status.as_u16()), e))?;

        serde_json::from_slice(&bytes).map_err(|e| {
            IngestError::permanent(
                &request.url,
                Some(status.as_u16()),
                format!("malformed JSON body: {}", e),
            )
        })
    }
}

/// 5xx and 429 are worth retrying; every other non-success status is final.
pub fn classify_status(url: &str, status: StatusCode, body: &str) -> IngestError {
    let reason = match status.canonical_reason() {
        Some(canonical) if body.trim().is_empty() => canonical.to_string(),
        _ => truncate(body.trim(), MAX_ERROR_BODY_CHARS),
    };

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        IngestError::transient(url, Some(status.as_u16()), reason)
    } else {
        IngestError::permanent(url, Some(status.as_u16()), reason)
    }
}

fn classify_transport(url: &str, err: reqwest::Error) -> IngestError {
    if err.is_builder() || err.is_decode() || err.is_redirect() {
        IngestError::permanent(url, None, err)
    } else {
        // timeouts, refused or reset connections, truncated bodies
        IngestError::transient(url, None, err)
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        let url = "https://api.example/x";
        assert!(classify_status(url, StatusCode::INTERNAL_SERVER_ERROR, "").is_transient());
        assert!(classify_status(url, StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(classify_status(url, StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(!classify_status(url, StatusCode::NOT_FOUND, "").is_transient());
        assert!(!classify_status(url, StatusCode::UNAUTHORIZED, "").is_transient());
        assert!(!classify_status(url, StatusCode::BAD_REQUEST, "").is_transient());
    }

    #[test]
    fn test_classify_status_reason() {
        let err = classify_status("u", StatusCode::NOT_FOUND, "");
        assert!(err.to_string().contains("Not Found"));

        let err = classify_status("u", StatusCode::BAD_REQUEST, &"x".repeat(500));
        assert!(err.to_string().ends_with("..."));
    }

    #[test]
    fn test_request_builder() {
        let req = FetchRequest::post("https://api.dune.com/api/v1/query/1/execute")
            .header("X-Dune-API-Key", "k")
            .query("limit", 10);
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.query, vec![("limit".to_string(), "10".to_string())]);
        assert_eq!(req.headers.len(), 1);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
