//! Campaign endpoints: enqueue, operator controls and status.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use herald_core::{Campaign, CampaignId, CampaignStatus, HeraldError};
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use super::error_response;
use crate::AppState;

/// Header carrying the client's retry key for enqueue.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Campaign state after pause or resume.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignStateResponse {
    /// Campaign id.
    pub campaign_id: CampaignId,
    /// Status after the transition.
    pub status: CampaignStatus,
}

impl From<Campaign> for CampaignStateResponse {
    fn from(campaign: Campaign) -> Self {
        Self { campaign_id: campaign.id, status: campaign.status }
    }
}

fn idempotency_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

/// Enqueues a campaign for sending.
///
/// Replays with the same `Idempotency-Key` return the original answer
/// without reserving credits again.
///
/// # Errors
///
/// - 400 `MISSING_IDEMPOTENCY_KEY`
/// - 402 `INSUFFICIENT_CREDITS`
/// - 404 `CAMPAIGN_NOT_FOUND`
/// - 409 `ALREADY_SENDING` or `INVALID_STATUS`
/// - 422 `NO_RECIPIENTS`
#[instrument(
    name = "enqueue_campaign",
    skip(state, headers),
    fields(
        campaign_id = %campaign_id,
        idempotency_key = idempotency_key(&headers).unwrap_or("none"),
    )
)]
pub async fn enqueue_campaign(
    Path(campaign_id): Path<Uuid>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let Some(key) = idempotency_key(&headers) else {
        return error_response(&HeraldError::MissingIdempotencyKey);
    };

    match state.enqueue.enqueue(CampaignId::from(campaign_id), key).await {
        Ok(outcome) => {
            info!(queued = outcome.queued, replayed = outcome.replayed, "campaign enqueued");
            (StatusCode::OK, Json(outcome)).into_response()
        },
        Err(err) => error_response(&err),
    }
}

/// Stops fan-out of a sending campaign.
#[instrument(name = "pause_campaign", skip(state), fields(campaign_id = %campaign_id))]
pub async fn pause_campaign(Path(campaign_id): Path<Uuid>, State(state): State<AppState>) -> Response {
    state_response(state.campaigns.pause(CampaignId::from(campaign_id)).await)
}

/// Restarts fan-out of a paused campaign.
#[instrument(name = "resume_campaign", skip(state), fields(campaign_id = %campaign_id))]
pub async fn resume_campaign(Path(campaign_id): Path<Uuid>, State(state): State<AppState>) -> Response {
    state_response(state.campaigns.resume(CampaignId::from(campaign_id)).await)
}

fn state_response(result: Result<Campaign, HeraldError>) -> Response {
    match result {
        Ok(campaign) => (StatusCode::OK, Json(CampaignStateResponse::from(campaign))).into_response(),
        Err(err) => error_response(&err),
    }
}

/// Requests an immediate delivery poll, at most once per cooldown.
///
/// Always answers 200 for an existing campaign; `queued: false` carries
/// the seconds to wait in `retryAfterSeconds`.
#[instrument(name = "reconcile_campaign", skip(state), fields(campaign_id = %campaign_id))]
pub async fn reconcile_campaign(
    Path(campaign_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Response {
    match state.campaigns.request_reconcile(CampaignId::from(campaign_id)).await {
        Ok(request) => (StatusCode::OK, Json(request)).into_response(),
        Err(err) => error_response(&err),
    }
}

/// Returns recipient tallies in the canonical and legacy shapes.
#[instrument(name = "campaign_status", skip(state), fields(campaign_id = %campaign_id))]
pub async fn campaign_status(
    Path(campaign_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Response {
    match state.campaigns.status(CampaignId::from(campaign_id)).await {
        Ok(document) => (StatusCode::OK, Json(document)).into_response(),
        Err(err) => error_response(&err),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn blank_idempotency_key_counts_as_missing() {
        let mut headers = HeaderMap::new();
        assert_eq!(idempotency_key(&headers), None);

        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static("   "));
        assert_eq!(idempotency_key(&headers), None);

        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static(" retry-1 "));
        assert_eq!(idempotency_key(&headers), Some("retry-1"));
    }
}
