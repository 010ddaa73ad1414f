// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP surface.
//!
//! | Route          | Success                                  | Failure                  |
//! |----------------|------------------------------------------|--------------------------|
//! | `POST /event`  | `202 {"status":"accepted","id":"<id>"}`  | `400` bad body, `503` + `Retry-After` |
//! | `GET /health`  | `200 {"status":"healthy","state":"..."}` |                          |
//!
//! A `202` only promises the event is in the buffer. Delivery failures after
//! that point are never reported back to the caller.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::debug;

use crate::event::Event;
use crate::ingress::{Acceptor, Rejection};
use crate::worker::WorkerState;

#[derive(Clone)]
pub struct AppState {
    pub acceptor: Arc<Acceptor>,
    pub worker_state: watch::Receiver<WorkerState>,
}

#[derive(Debug, Serialize)]
struct AcceptedResponse {
    status: &'static str,
    id: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    state: String,
    accepting: bool,
}

/// Rejection rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Rejection);

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        Self(rejection)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        let body = Json(json!({ "error": self.0.to_string() }));

        let mut response = (status, body).into_response();
        if let Some(secs) = self.0.retry_after_secs() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/event", post(post_event))
        .route("/health", get(health))
        .with_state(state)
}

async fn post_event(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let event = Event::decode(&body).map_err(|e| {
        debug!(error = %e, "Rejecting unparseable event");
        state.acceptor.reject_invalid(e.to_string())
    })?;

    let id = state.acceptor.accept(&event).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted",
            id: id.to_string(),
        }),
    ))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let worker_state = *state.worker_state.borrow();
    Json(HealthResponse {
        status: "healthy",
        state: worker_state.to_string(),
        accepting: state.acceptor.is_accepting(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::memory::InMemoryBuffer;
    use crate::buffer::traits::DurableBuffer;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        acceptor: Arc<Acceptor>,
        buffer: Arc<InMemoryBuffer>,
        drain: CancellationToken,
        state_tx: watch::Sender<WorkerState>,
    }

    async fn harness() -> Harness {
        let buffer = Arc::new(InMemoryBuffer::new());
        buffer.ensure_group("g").await.unwrap();
        let drain = CancellationToken::new();
        let acceptor = Arc::new(Acceptor::new(buffer.clone(), drain.clone()));
        let (state_tx, worker_state) = watch::channel(WorkerState::ReadNew);
        let app = build_router(AppState { acceptor: acceptor.clone(), worker_state });
        Harness { app, acceptor, buffer, drain, state_tx }
    }

    fn post(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/event")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const VALID: &str = r#"{"user_id": 42, "timestamp": "2024-05-01T12:00:00Z", "metadata": {"page": "/home"}}"#;

    #[tokio::test]
    async fn test_post_event_accepted() {
        let h = harness().await;

        let response = h.app.clone().oneshot(post(VALID)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = json_body(response).await;
        assert_eq!(body["status"], "accepted");
        let id = body["id"].as_str().unwrap().to_string();

        let claimed = h.buffer.claim_new("g", "c", 10, Duration::ZERO).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id.to_string(), id);
        assert_eq!(claimed[0].decode().unwrap().user_id, 42);
    }

    #[tokio::test]
    async fn test_post_event_bad_body_is_400() {
        let h = harness().await;

        for body in ["not json", r#"{"user_id": "abc"}"#, r#"{"timestamp": "2024-05-01T12:00:00Z"}"#] {
            let response = h.app.clone().oneshot(post(body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {}", body);
            assert!(response.headers().get(header::RETRY_AFTER).is_none());
        }
        assert!(h.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_bad_body_counts_as_acceptor_rejection() {
        let h = harness().await;

        h.app.clone().oneshot(post("not json")).await.unwrap();
        h.app.clone().oneshot(post(VALID)).await.unwrap();
        h.drain.cancel();
        h.app.clone().oneshot(post(VALID)).await.unwrap();

        let stats = h.acceptor.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 2);
    }

    #[tokio::test]
    async fn test_post_event_buffer_down_is_503() {
        let h = harness().await;
        h.buffer.set_available(false);

        let response = h.app.clone().oneshot(post(VALID)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get(header::RETRY_AFTER).is_some());
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("unavailable"));
    }

    #[tokio::test]
    async fn test_post_event_while_draining_is_503() {
        let h = harness().await;
        h.drain.cancel();

        let response = h.app.clone().oneshot(post(VALID)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(h.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_health_reports_worker_state() {
        let h = harness().await;
        h.state_tx.send_replace(WorkerState::Persist);

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = h.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["state"], "persist");
        assert_eq!(body["accepting"], true);
    }
}
