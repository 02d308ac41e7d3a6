//! HTTP surface: admission, feedback drain, Prometheus metrics, health.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::warn;

use crate::adapter::Adapter;
use crate::error::DispatchError;
use crate::feedback::FeedbackBuffer;
use crate::registry::Registry;

pub struct AppState {
    pub registry: Arc<Registry>,
    pub adapters: std::collections::HashMap<String, Arc<dyn Adapter>>,
    pub feedback: Arc<FeedbackBuffer>,
    pub metrics_handle: PrometheusHandle,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/push/:service_id", post(push_admission))
        .route("/api/feedback", post(feedback_drain))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state)
}

async fn push_admission(
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<String>,
    body: axum::body::Bytes,
) -> Response {
    let Some(adapter) = state.adapters.get(&service_id) else {
        return (StatusCode::BAD_REQUEST, format!("unknown service: {service_id}")).into_response();
    };
    if let Err(e) = adapter.validate(&body) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    let Some(queue) = state.registry.queue_for(&service_id) else {
        return (StatusCode::BAD_REQUEST, format!("unknown service: {service_id}")).into_response();
    };
    match queue.enqueue(body.to_vec()).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            warn!(service = %service_id, error = %e, "enqueue failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

async fn feedback_drain(State(state): State<Arc<AppState>>) -> Response {
    Json(state.feedback.drain()).into_response()
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    state.metrics_handle.render().into_response()
}

async fn health() -> &'static str {
    "ok"
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            DispatchError::UnknownService(_) => StatusCode::NOT_FOUND,
            DispatchError::DuplicateService(_) => StatusCode::CONFLICT,
            DispatchError::Validation(_) | DispatchError::Conversion(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_returns_ok() {
        let state = Arc::new(AppState {
            registry: Arc::new(Registry::new(None, "pushgate".into())),
            adapters: Default::default(),
            feedback: Arc::new(FeedbackBuffer::new()),
            metrics_handle: crate::metrics::install(),
        });
        let app = router(state);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn push_to_unknown_service_is_400() {
        let state = Arc::new(AppState {
            registry: Arc::new(Registry::new(None, "pushgate".into())),
            adapters: Default::default(),
            feedback: Arc::new(FeedbackBuffer::new()),
            metrics_handle: crate::metrics::install(),
        });
        let app = router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/push/nonexistent")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
