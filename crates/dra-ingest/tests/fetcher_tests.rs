//! Retry and classification behavior of `RetryingFetcher` against a mock upstream

mod common;

use dra_ingest::http::{FetchRequest, RateLimiter, RetryPolicy, RetryingFetcher};
use dra_ingest::IngestError;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn fetcher(max_attempts: u32) -> RetryingFetcher {
    RetryingFetcher::new(
        "test",
        reqwest::Client::new(),
        Arc::new(RateLimiter::new(1000.0).unwrap()),
        RetryPolicy::new(max_attempts, Duration::from_millis(10), Duration::from_millis(40)),
        CancellationToken::new(),
    )
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.unwrap_or_default().len()
}

#[tokio::test]
async fn test_succeeds_on_third_attempt() {
    common::init_test_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/prices"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/prices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let body = fetcher(3)
        .fetch(&FetchRequest::get(format!("{}/prices", server.uri())))
        .await
        .unwrap();

    assert_eq!(body, json!({"ok": true}));
    assert_eq!(request_count(&server).await, 3);
}

#[tokio::test]
async fn test_exhaustion_returns_last_transient_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;

    let err = fetcher(3)
        .fetch(&FetchRequest::get(server.uri()))
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::TransientNetwork { status: Some(500), .. }));
    assert!(err.to_string().contains("upstream exploded"));
    assert_eq!(request_count(&server).await, 3);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = fetcher(5)
        .fetch(&FetchRequest::get(server.uri()))
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::PermanentRequest { status: Some(404), .. }));
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn test_too_many_requests_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    fetcher(3).fetch(&FetchRequest::get(server.uri())).await.unwrap();
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn test_malformed_json_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let err = fetcher(3)
        .fetch(&FetchRequest::get(server.uri()))
        .await
        .unwrap_err();

    assert!(!err.is_transient());
    assert!(err.to_string().contains("malformed JSON"));
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn test_sends_query_and_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query/7/execute"))
        .and(query_param("limit", "10"))
        .and(header("X-Dune-API-Key", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"execution_id": "e1"})))
        .expect(1)
        .mount(&server)
        .await;

    let body = fetcher(1)
        .fetch(
            &FetchRequest::post(format!("{}/query/7/execute", server.uri()))
                .query("limit", 10)
                .header("X-Dune-API-Key", "secret"),
        )
        .await
        .unwrap();

    assert_eq!(body["execution_id"], "e1");
}

#[tokio::test]
async fn test_connection_refused_is_transient() {
    // nothing listens on the discard port
    let err = fetcher(2)
        .fetch(&FetchRequest::get("http://127.0.0.1:9/"))
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::TransientNetwork { status: None, .. }));
}

#[tokio::test]
async fn test_cancelled_fetch_stops_retrying() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let fetcher = RetryingFetcher::new(
        "test",
        reqwest::Client::new(),
        Arc::new(RateLimiter::new(1000.0).unwrap()),
        RetryPolicy::new(10, Duration::from_secs(30), Duration::from_secs(30)),
        cancel.clone(),
    );

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let err = fetcher.fetch(&FetchRequest::get(server.uri())).await.unwrap_err();
    assert!(matches!(err, IngestError::Cancelled));
    assert_eq!(request_count(&server).await, 1);
}
