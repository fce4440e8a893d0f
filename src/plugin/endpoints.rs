// src/plugin/endpoints.rs

//! HTTP endpoints every plugin serves: liveness, self-description, the
//! registry event webhook, and the Prometheus exporter. Also the TLS gate
//! applied to the repository-management API.

use crate::core::{BeskarError, metrics};
use crate::mux::ClientConn;
use crate::repository::event::{Event, EventEnvelope};
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::error;

/// Type-erased path from the webhook into the repository manager.
pub type EventSink =
    Arc<dyn Fn(Event) -> BoxFuture<'static, Result<(), BeskarError>> + Send + Sync>;

/// State behind the core endpoints.
#[derive(Clone)]
pub struct CoreState {
    /// Pre-encoded plugin descriptor served on `/info`.
    pub info: Arc<Vec<u8>>,
    pub events: EventSink,
    pub profiling: bool,
}

/// Error wrapper mapping the taxonomy onto HTTP statuses. Server errors are
/// logged; client errors are not.
pub struct ApiError(pub BeskarError);

impl From<BeskarError> for ApiError {
    fn from(e: BeskarError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("API error: {}", self.0);
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Middleware rejecting plaintext requests with 401. Applied to every
/// repository-management route.
pub async fn require_tls(
    ConnectInfo(conn): ConnectInfo<ClientConn>,
    request: Request,
    next: Next,
) -> Response {
    if !conn.is_tls() {
        return ApiError(BeskarError::Unauthorized("TLS required".to_string())).into_response();
    }
    next.run(request).await
}

pub fn core_router(state: CoreState) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/event", any(event_handler))
        .route("/info", get(info_handler));
    if state.profiling {
        router = router.route("/metrics", get(metrics_handler));
    }
    router.with_state(state)
}

async fn healthz_handler() -> &'static str {
    "OK"
}

/// The registry event webhook: a length-prefixed binary envelope. 2xx acks
/// the event only after it has been durably recorded.
async fn event_handler(
    State(state): State<CoreState>,
    ConnectInfo(conn): ConnectInfo<ClientConn>,
    method: Method,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return StatusCode::NOT_IMPLEMENTED.into_response();
    }
    if !conn.is_tls() {
        return ApiError(BeskarError::Unauthorized("TLS required".to_string())).into_response();
    }

    let envelope = match EventEnvelope::decode_framed(&body) {
        Ok(envelope) => envelope,
        Err(e) => return ApiError(BeskarError::Internal(e.to_string())).into_response(),
    };
    match (state.events)(envelope.into_event()).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

/// Plugin self-description, binary-encoded.
async fn info_handler(
    State(state): State<CoreState>,
    ConnectInfo(conn): ConnectInfo<ClientConn>,
) -> Response {
    if !conn.is_tls() {
        return ApiError(BeskarError::Unauthorized("TLS required".to_string())).into_response();
    }
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        state.info.as_ref().clone(),
    )
        .into_response()
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}
