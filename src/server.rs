//! HTTP surface for the analysis pipeline.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/analyze` | Analyze one file; body is an [`AnalyzeRequest`] |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/cache/stats` | Per-backend cache counters |
//! | `POST` | `/cache/flush` | Remove every cached analysis |
//!
//! `POST /analyze` answers with the serialized [`AnalysisResponse`] exactly as
//! it was stored, so a cache hit is byte-identical to the original miss.
//! Two headers accompany it: `x-cache: hit|miss` and `x-request-id`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "content must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `internal` (500). Internal details are
//! logged, not returned.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.
//!
//! [`AnalysisResponse`]: crate::models::AnalysisResponse

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::AnalysisError;
use crate::models::AnalyzeRequest;
use crate::pipeline::Analyzer;

/// Shared state for all handlers.
#[derive(Clone)]
struct AppState {
    analyzer: Arc<Analyzer>,
}

/// Builds the router with all endpoints and CORS applied.
pub fn router(analyzer: Arc<Analyzer>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/analyze", post(handle_analyze))
        .route("/health", get(handle_health))
        .route("/cache/stats", get(handle_cache_stats))
        .route("/cache/flush", post(handle_cache_flush))
        .layer(cors)
        .with_state(AppState { analyzer })
}

/// Starts the server on `config.server.bind`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let analyzer = Arc::new(Analyzer::from_config(config.clone()).await?);
    run_server_with(analyzer, &bind_addr).await
}

/// Serves `analyzer` on `bind_addr`, running cache maintenance alongside.
pub async fn run_server_with(analyzer: Arc<Analyzer>, bind_addr: &str) -> anyhow::Result<()> {
    let sweep = Duration::from_secs(analyzer.config().cache.sweep_interval_secs);
    let _maintenance = analyzer.cache().map(|c| c.start_maintenance(sweep));

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    log::info!("structlint listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(analyzer)).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (`"bad_request"`, `"internal"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
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

/// Logs `detail` and returns a generic 500.
fn internal_error(detail: impl std::fmt::Display) -> AppError {
    log::error!("request failed: {}", detail);
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: "internal server error".to_string(),
    }
}

impl From<AnalysisError> for AppError {
    fn from(e: AnalysisError) -> Self {
        match e {
            AnalysisError::BadRequest(msg) => bad_request(msg),
            AnalysisError::Internal(msg) => internal_error(msg),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /analyze ============

/// Handler for `POST /analyze`.
///
/// The body is parsed by hand so malformed JSON gets the same error
/// envelope as every other client error.
async fn handle_analyze(State(state): State<AppState>, body: Bytes) -> Result<Response, AppError> {
    let request: AnalyzeRequest = serde_json::from_slice(&body)
        .map_err(|e| bad_request(format!("invalid request body: {}", e)))?;

    let outcome = state.analyzer.analyze(request).await?;

    let request_id = HeaderValue::from_str(&outcome.response.metadata.request_id)
        .map_err(internal_error)?;
    let cache_status = if outcome.cache_hit { "hit" } else { "miss" };

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/json")),
            (header::HeaderName::from_static("x-cache"), HeaderValue::from_static(cache_status)),
            (header::HeaderName::from_static("x-request-id"), request_id),
        ],
        outcome.body,
    )
        .into_response())
}

// ============ GET /cache/stats ============

async fn handle_cache_stats(State(state): State<AppState>) -> Response {
    match state.analyzer.cache() {
        Some(cache) => {
            let enabled = state.analyzer.config().cache.enabled;
            Json(cache.stats(enabled).await).into_response()
        }
        None => Json(serde_json::json!({ "enabled": false })).into_response(),
    }
}

// ============ POST /cache/flush ============

#[derive(Serialize)]
struct FlushResponse {
    flushed: u64,
}

async fn handle_cache_flush(State(state): State<AppState>) -> Result<Json<FlushResponse>, AppError> {
    let flushed = match state.analyzer.cache() {
        Some(cache) => cache.flush().await.map_err(internal_error)?,
        None => 0,
    };
    Ok(Json(FlushResponse { flushed }))
}
