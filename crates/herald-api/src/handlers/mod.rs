//! HTTP request handlers for the Herald API.
//!
//! Handlers are grouped by functionality:
//! - `campaigns` - enqueue, pause, resume, reconcile and status
//! - `health` - health check and readiness probes
//! - `workers` - worker lock and queue statistics
//!
//! # Error Handling
//!
//! Failures return `{"error": {"code", "message"}}` with the HTTP status
//! and stable code of the underlying [`HeraldError`].

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use herald_core::HeraldError;
use serde::Serialize;
use tracing::error;

pub mod campaigns;
pub mod health;
pub mod workers;

pub use campaigns::{
    campaign_status, enqueue_campaign, pause_campaign, reconcile_campaign, resume_campaign,
};
pub use health::{health_check, liveness_check, readiness_check};
pub use workers::worker_status;

/// Error response with code and message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Stable error code, e.g. `INSUFFICIENT_CREDITS`
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

/// Renders a caller-facing error. Server-side failures keep their code but
/// hide the internal message.
pub fn error_response(err: &HeraldError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let message = if status.is_server_error() {
        error!(code = err.code(), error = %err, "request failed");
        "internal error, see server logs".to_string()
    } else {
        err.to_string()
    };

    let body = ErrorResponse { error: ErrorDetail { code: err.code().to_string(), message } };
    (status, Json(body)).into_response()
}
