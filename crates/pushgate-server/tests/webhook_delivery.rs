//! End-to-end admission -> pump -> HTTP delivery for the webhook provider,
//! exercised through the real HTTP API router against a mock endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pushgate_server::adapter::Adapter;
use pushgate_server::adapters::webhook::WebhookAdapter;
use pushgate_server::api::{router, AppState};
use pushgate_server::feedback::FeedbackBuffer;
use pushgate_server::registry::Registry;

async fn wait_for_request_count(mock: &MockServer, count: usize, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if mock.received_requests().await.unwrap().len() >= count {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("mock did not receive {count} request(s) within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn admitted_message_is_delivered_and_removed() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock)
        .await;

    let registry = Arc::new(Registry::new(None, "pushgate-test".into()));
    let feedback = Arc::new(FeedbackBuffer::new());
    let adapter: Arc<dyn Adapter> = Arc::new(WebhookAdapter);
    registry
        .add_service(adapter.clone(), 1, None, feedback.clone())
        .await
        .unwrap();

    let mut adapters: HashMap<String, Arc<dyn Adapter>> = HashMap::new();
    adapters.insert("webhook".into(), adapter);
    let state = Arc::new(AppState {
        registry: registry.clone(),
        adapters,
        feedback,
        metrics_handle: pushgate_server::metrics::install(),
    });
    let app = router(state);

    let body = serde_json::json!({
        "url": format!("{}/hook", mock.uri()),
        "data": {"hello": "world"},
    });
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/push/webhook")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    wait_for_request_count(&mock, 1, Duration::from_secs(2)).await;
    mock.verify().await;

    registry.shutdown_all().await;
}

#[tokio::test]
async fn unconvertible_admission_is_rejected_before_enqueue() {
    let registry = Arc::new(Registry::new(None, "pushgate-test".into()));
    let feedback = Arc::new(FeedbackBuffer::new());
    let adapter: Arc<dyn Adapter> = Arc::new(WebhookAdapter);
    registry
        .add_service(adapter.clone(), 1, None, feedback.clone())
        .await
        .unwrap();

    let mut adapters: HashMap<String, Arc<dyn Adapter>> = HashMap::new();
    adapters.insert("webhook".into(), adapter);
    let state = Arc::new(AppState {
        registry: registry.clone(),
        adapters,
        feedback,
        metrics_handle: pushgate_server::metrics::install(),
    });
    let app = router(state);

    // Missing `url` entirely - validate() must reject this at admission
    // time so it never reaches the queue or a worker.
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/push/webhook")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"data":{"a":1}}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    registry.shutdown_all().await;
}
