//! Worker lock and queue statistics.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use herald_core::HeraldError;
use herald_pipeline::{EngineStats, LockStatus};
use serde::Serialize;
use tracing::instrument;

use super::error_response;
use crate::AppState;

/// `GET /workers/status` body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatusResponse {
    /// True while this process runs queue workers.
    pub running: bool,
    /// Leader lock, absent when this process does not compete for it.
    pub lock: Option<LockStatus>,
    /// Queue worker counters of this process.
    pub stats: EngineStats,
}

/// Reports whether this process holds the worker lock and what its
/// workers have done.
#[instrument(name = "worker_status", skip(state))]
pub async fn worker_status(State(state): State<AppState>) -> Response {
    let lock = match &state.worker_lock {
        Some(lock) => match lock.status().await {
            Ok(status) => Some(status),
            Err(err) => return error_response(&HeraldError::Internal(err.to_string())),
        },
        None => None,
    };
    let stats = state.engine_stats.read().await.clone();

    let body = WorkerStatusResponse { running: stats.active_workers > 0, lock, stats };
    (StatusCode::OK, Json(body)).into_response()
}
