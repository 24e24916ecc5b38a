//! HTTP surface for health checks, counters, and webhook intake.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness plus degraded-source summary |
//! | `GET`  | `/stats` | Full counter snapshot ([`RuntimeStats`]) |
//! | `POST` | `/webhooks` | Signed change notification intake |
//! | `POST` | `/cache/invalidate` | Manual invalidation by key, tag, or scope |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "invalid_signature", "message": "webhook signature rejected" } }
//! ```
//!
//! Error codes: `bad_request` (400), `invalid_signature` (401),
//! `webhook_disabled` (503), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::circuit_breaker::CircuitState;
use crate::error::SyncError;
use crate::models::ChangeEvent;
use crate::runtime::{ConnectorRuntime, RuntimeStats};

/// Signature headers checked in order.
const SIGNATURE_HEADERS: [&str; 2] = ["x-hub-signature-256", "x-signature"];

#[derive(Clone)]
struct AppState {
    runtime: Arc<ConnectorRuntime>,
}

/// Build the router. Exposed separately from [`run_server`] so tests can
/// serve it on an ephemeral port.
pub fn router(runtime: Arc<ConnectorRuntime>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .route("/webhooks", post(handle_webhook))
        .route("/cache/invalidate", post(handle_invalidate))
        .layer(cors)
        .with_state(AppState { runtime })
}

/// Serve on `[server].bind` until ctrl-c, then shut the runtime down.
pub async fn run_server(runtime: Arc<ConnectorRuntime>) -> anyhow::Result<()> {
    let bind_addr = runtime.config().server.bind.clone();
    let app = router(runtime.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    runtime.shutdown().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        let (status, code) = match &err {
            SyncError::InvalidWebhookSignature => (StatusCode::UNAUTHORIZED, "invalid_signature"),
            SyncError::WebhookSecretMissing => {
                (StatusCode::SERVICE_UNAVAILABLE, "webhook_disabled")
            }
            SyncError::MalformedPayload(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    /// `"ok"`, or `"degraded"` while any endpoint breaker is not closed.
    status: String,
    version: String,
    open_circuits: Vec<String>,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let open_circuits: Vec<String> = state
        .runtime
        .executor()
        .breakers()
        .into_iter()
        .filter(|b| b.state != CircuitState::Closed)
        .map(|b| b.endpoint)
        .collect();
    let status = if open_circuits.is_empty() { "ok" } else { "degraded" };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        open_circuits,
    })
}

// ============ GET /stats ============

async fn handle_stats(State(state): State<AppState>) -> Json<RuntimeStats> {
    Json(state.runtime.stats())
}

// ============ POST /webhooks ============

#[derive(Serialize)]
struct WebhookResponse {
    accepted: usize,
    events: Vec<ChangeEvent>,
}

async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, AppError> {
    let signature = SIGNATURE_HEADERS
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|v| v.to_str().ok());

    let events = state
        .runtime
        .sync()
        .process_webhook_payload(&body, signature)
        .await?;
    Ok(Json(WebhookResponse {
        accepted: events.len(),
        events,
    }))
}

// ============ POST /cache/invalidate ============

#[derive(Deserialize)]
struct InvalidateRequest {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Serialize)]
struct InvalidateResponse {
    removed: usize,
}

async fn handle_invalidate(
    State(state): State<AppState>,
    Json(req): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>, AppError> {
    if req.key.is_none() && req.scope.is_none() && req.tags.is_empty() {
        return Err(bad_request("one of key, scope, or tags is required"));
    }

    let cache = state.runtime.cache();
    let mut removed = 0;
    if let Some(key) = &req.key {
        if cache.delete(key).await {
            removed += 1;
        }
    }
    if let Some(scope) = &req.scope {
        removed += cache.invalidate_by_scope(scope).await;
    }
    if !req.tags.is_empty() {
        removed += cache.invalidate_by_tag(req.tags.as_slice()).await;
    }
    Ok(Json(InvalidateResponse { removed }))
}
