//! `/health`, `/ready` and `/live`.
//!
//! Health and readiness both ping pipeline storage; liveness answers
//! without touching it.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use herald_pipeline::PipelineStorage;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::AppState;

/// Body of `/health` and `/ready`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `healthy` when storage answered the ping.
    pub status: HealthStatus,
    /// Clock time of the check.
    pub checked_at: DateTime<Utc>,
    /// Per-dependency results.
    pub checks: Checks,
    /// Crate version of the running binary.
    pub version: &'static str,
}

/// Overall verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Per-dependency results.
#[derive(Debug, Serialize)]
pub struct Checks {
    /// Campaign, recipient, ledger and queue tables.
    pub database: DependencyCheck,
}

/// Outcome of pinging one dependency.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyCheck {
    /// `up` or `down`.
    pub status: CheckStatus,
    /// Error text when the ping failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Time spent on the ping.
    pub latency_ms: u64,
}

/// Dependency state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum CheckStatus {
    Up,
    Down,
}

async fn ping_storage(
    storage: &dyn PipelineStorage,
    started: std::time::Instant,
) -> DependencyCheck {
    let (status, error) = match storage.ping().await {
        Ok(()) => (CheckStatus::Up, None),
        Err(err) => {
            warn!(error = %err, "storage ping failed");
            (CheckStatus::Down, Some(err.to_string()))
        },
    };
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    DependencyCheck { status, error, latency_ms }
}

/// Pings storage and reports the result.
pub async fn report(state: &AppState) -> HealthReport {
    let checked_at = state.clock.now_utc();
    let database = ping_storage(state.storage.as_ref(), state.clock.now()).await;
    let status = match database.status {
        CheckStatus::Up => HealthStatus::Healthy,
        CheckStatus::Down => HealthStatus::Unhealthy,
    };

    HealthReport { status, checked_at, checks: Checks { database }, version: env!("CARGO_PKG_VERSION") }
}

fn respond(report: HealthReport) -> Response {
    let code = match report.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report)).into_response()
}

/// 200 with the report while storage answers, 503 otherwise.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let report = report(&state).await;
    debug!(status = ?report.status, latency_ms = report.checks.database.latency_ms, "health checked");
    respond(report)
}

/// Same check as `/health`; load balancers route on this one.
#[instrument(name = "readiness_check", skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Response {
    respond(report(&state).await)
}

/// Always 200 while the process serves HTTP.
#[instrument(name = "liveness_check", skip(state))]
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    let body = serde_json::json!({
        "status": "alive",
        "service": "herald",
        "timestamp": state.clock.now_utc(),
    });
    (StatusCode::OK, Json(body)).into_response()
}
