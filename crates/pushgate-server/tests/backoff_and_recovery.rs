//! A transiently-failing provider eventually succeeds once its HTTP
//! dependency recovers, driven entirely through requeue + backoff - no
//! message is lost and none is delivered twice.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request as WireRequest, Respond, ResponseTemplate};

use pushgate_core::{FeedbackCollector, PushStatus, ServiceMessage};
use pushgate_server::adapter::{Adapter, Client};
use pushgate_server::api::{router, AppState};
use pushgate_server::error::DispatchError;
use pushgate_server::feedback::FeedbackBuffer;
use pushgate_server::registry::Registry;

struct OpaqueMessage;
impl ServiceMessage for OpaqueMessage {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Posts to a fixed endpoint and maps non-2xx to `TempFail` - just enough
/// of a provider shape to drive the pump's requeue/backoff path against a
/// mock endpoint that fails a fixed number of times before recovering.
struct FlakyAdapter {
    endpoint: String,
}

#[async_trait]
impl Adapter for FlakyAdapter {
    fn id(&self) -> &str {
        "flaky"
    }

    fn validate(&self, _bytes: &[u8]) -> Result<(), DispatchError> {
        Ok(())
    }

    fn convert(&self, _bytes: &[u8]) -> Result<Box<dyn ServiceMessage>, DispatchError> {
        Ok(Box::new(OpaqueMessage))
    }

    async fn new_client(&self) -> Result<Client, DispatchError> {
        Ok(Client::Http(reqwest::Client::new()))
    }

    async fn push_message(
        &self,
        client: &Client,
        _msg: &dyn ServiceMessage,
        feedback: &dyn FeedbackCollector,
    ) -> PushStatus {
        let status = match client.http().post(&self.endpoint).send().await {
            Ok(resp) if resp.status().is_success() => PushStatus::Success,
            Ok(_) => PushStatus::TempFail,
            Err(_) => PushStatus::TempFail,
        };
        feedback.count_push("flaky", matches!(status, PushStatus::Success));
        status
    }
}

struct FlakyResponder {
    remaining_failures: Arc<AtomicUsize>,
    hits: Arc<AtomicUsize>,
}

impl Respond for FlakyResponder {
    fn respond(&self, _req: &WireRequest) -> ResponseTemplate {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let remaining = self.remaining_failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            if n == 0 {
                None
            } else {
                Some(n - 1)
            }
        });
        match remaining {
            Ok(_) => ResponseTemplate::new(503),
            Err(_) => ResponseTemplate::new(200),
        }
    }
}

#[tokio::test]
async fn temp_failure_retries_until_delivered_exactly_once() {
    let mock = MockServer::start().await;
    let hits = Arc::new(AtomicUsize::new(0));
    Mock::given(method("POST"))
        .respond_with(FlakyResponder {
            remaining_failures: Arc::new(AtomicUsize::new(2)),
            hits: hits.clone(),
        })
        .mount(&mock)
        .await;

    let registry = Arc::new(Registry::new(None, "pushgate-test".into()));
    let feedback = Arc::new(FeedbackBuffer::new());
    let adapter: Arc<dyn Adapter> = Arc::new(FlakyAdapter {
        endpoint: mock.uri(),
    });
    registry
        .add_service(adapter.clone(), 1, None, feedback.clone())
        .await
        .unwrap();

    let mut adapters: HashMap<String, Arc<dyn Adapter>> = HashMap::new();
    adapters.insert("flaky".into(), adapter);
    let state = Arc::new(AppState {
        registry: registry.clone(),
        adapters,
        feedback,
        metrics_handle: pushgate_server::metrics::install(),
    });
    let app = router(state);

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/push/flaky")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    // backoff_for(0) == 1s, backoff_for(1) == 2s; two failures then a
    // success needs to clear comfortably within this window.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    registry.shutdown_all().await;
}
