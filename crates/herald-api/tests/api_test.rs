//! HTTP surface tests: routes, status codes and response bodies, served
//! from the in-memory pipeline.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use herald_api::{create_router, AppState};
use herald_core::{CampaignId, Clock};
use herald_pipeline::{lock::mock::MemoryLeaseStore, LockConfig, WorkerLock};
use herald_testing::{FailPoint, TestHarness};
use serde_json::Value;
use tower::ServiceExt;

fn app(harness: &TestHarness) -> Router {
    create_router(state(harness))
}

fn state(harness: &TestHarness) -> AppState {
    AppState::new(harness.engine(), Arc::new(harness.clock.clone()))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn send_json(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(app, request).await;
    (status, serde_json::from_str(&body).unwrap())
}

fn post(uri: &str) -> Request<Body> {
    Request::post(uri).body(Body::empty()).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn enqueue_request(campaign_id: CampaignId, key: &str) -> Request<Body> {
    Request::post(format!("/campaigns/{campaign_id}/enqueue"))
        .header("Idempotency-Key", key)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn enqueue_returns_queued_count_and_replays_it() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    harness.add_contacts(owner, 3, &["vip"]).await;
    let campaign = harness.draft_campaign(owner, &["vip"]).await;

    let (status, body) = send_json(app(&harness), enqueue_request(campaign.id, "req-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({ "queued": 3 }));

    let (status, replay) = send_json(app(&harness), enqueue_request(campaign.id, "req-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay, body);

    assert_eq!(harness.backend.reservations_for(owner).await.len(), 1);
}

#[tokio::test]
async fn enqueue_without_idempotency_key_is_rejected() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    let campaign = harness.draft_campaign(owner, &[]).await;

    let (status, body) =
        send_json(app(&harness), post(&format!("/campaigns/{}/enqueue", campaign.id))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "MISSING_IDEMPOTENCY_KEY");
}

#[tokio::test]
async fn enqueue_errors_carry_stable_codes() {
    let harness = TestHarness::new();
    let poor = harness.owner_with_credits(1).await;
    harness.add_contacts(poor, 2, &[]).await;
    let unaffordable = harness.draft_campaign(poor, &[]).await;

    let (status, body) = send_json(app(&harness), enqueue_request(unaffordable.id, "k")).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"]["code"], "INSUFFICIENT_CREDITS");
    assert!(body["error"]["message"].as_str().unwrap().contains("2 required"));

    let owner = harness.owner_with_credits(10).await;
    let empty = harness.draft_campaign(owner, &["nobody"]).await;
    let (status, body) = send_json(app(&harness), enqueue_request(empty.id, "k")).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "NO_RECIPIENTS");

    let (status, body) = send_json(app(&harness), enqueue_request(CampaignId::new(), "k")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "CAMPAIGN_NOT_FOUND");
}

#[tokio::test]
async fn second_key_while_sending_conflicts() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    harness.add_contacts(owner, 2, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;

    send_json(app(&harness), enqueue_request(campaign.id, "first")).await;
    let (status, body) = send_json(app(&harness), enqueue_request(campaign.id, "second")).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "ALREADY_SENDING");
    assert_eq!(harness.backend.reservations_for(owner).await.len(), 1);
}

#[tokio::test]
async fn storage_failures_hide_internal_details() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    harness.add_contacts(owner, 2, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;
    harness.backend.fail_next(FailPoint::CountAudience, "relation contacts is locked").await;

    let (status, body) = send_json(app(&harness), enqueue_request(campaign.id, "k")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "DATABASE");
    assert!(!body["error"]["message"].as_str().unwrap().contains("locked"));
}

#[tokio::test]
async fn status_document_serves_both_shapes() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    let contacts = harness.add_contacts(owner, 3, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;

    harness.enqueue(campaign.id, "req-1").await.unwrap();
    harness.drain().await.unwrap();
    harness.provider.set_status_for_phone(&contacts[0].phone, "DELIVRD").await;
    harness.provider.set_status_for_phone(&contacts[1].phone, "undelivered").await;
    harness.advance(Duration::from_secs(61));
    harness.drain().await.unwrap();

    let (status, body) = send(app(&harness), get(&format!("/campaigns/{}/status", campaign.id))).await;
    assert_eq!(status, StatusCode::OK);

    let body = body.replace(&campaign.id.to_string(), "[campaign-id]");
    insta::assert_snapshot!(body, @r#"{"campaignId":"[campaign-id]","status":"completed","queued":0,"totals":{"recipients":3,"accepted":3,"sent":3,"delivered":1,"failed":1},"delivery":{"pendingDelivery":1,"delivered":1,"failedDelivery":1},"sent":3,"failed":1,"processed":3}"#);
}

#[tokio::test]
async fn pause_and_resume_flip_status() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    harness.add_contacts(owner, 2, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;
    harness.enqueue(campaign.id, "req-1").await.unwrap();

    let (status, body) = send_json(app(&harness), post(&format!("/campaigns/{}/pause", campaign.id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "paused");
    assert_eq!(body["campaignId"], campaign.id.to_string());

    let (status, body) = send_json(app(&harness), post(&format!("/campaigns/{}/pause", campaign.id))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "INVALID_STATUS");

    let (status, body) = send_json(app(&harness), post(&format!("/campaigns/{}/resume", campaign.id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "sending");
}

#[tokio::test]
async fn reconcile_is_rate_limited_per_campaign() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    harness.add_contacts(owner, 1, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;
    harness.enqueue(campaign.id, "req-1").await.unwrap();
    let uri = format!("/campaigns/{}/reconcile", campaign.id);

    let (status, first) = send_json(app(&harness), post(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first, serde_json::json!({ "queued": true, "retryAfterSeconds": 0 }));

    harness.advance(Duration::from_secs(30));
    let (_, second) = send_json(app(&harness), post(&uri)).await;
    assert_eq!(second, serde_json::json!({ "queued": false, "retryAfterSeconds": 150 }));

    let (status, body) = send_json(app(&harness), post(&format!("/campaigns/{}/reconcile", CampaignId::new()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "CAMPAIGN_NOT_FOUND");
}

#[tokio::test]
async fn health_reports_database_state() {
    let harness = TestHarness::new();

    let (status, body) = send_json(app(&harness), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["database"]["status"], "up");
    assert!(body["checks"]["database"].get("error").is_none());
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

    harness.backend.fail_next(FailPoint::Ping, "connection refused").await;
    let (status, body) = send_json(app(&harness), get("/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["checks"]["database"]["status"], "down");
    assert!(body["checks"]["database"]["error"].is_string());

    let (status, body) = send_json(app(&harness), get("/live")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "alive");
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let harness = TestHarness::new();

    let response = app(&harness).oneshot(get("/live")).await.unwrap();

    let request_id = response.headers().get("x-request-id").expect("request id header");
    assert_eq!(request_id.to_str().unwrap().len(), 36);
}

#[tokio::test]
async fn worker_status_reports_lock_and_stats() {
    let harness = TestHarness::new();

    let (status, body) = send_json(app(&harness), get("/workers/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], false);
    assert!(body["lock"].is_null());
    assert_eq!(body["stats"]["activeWorkers"], 0);

    let clock: Arc<dyn Clock> = Arc::new(harness.clock.clone());
    let lock = Arc::new(WorkerLock::new(
        Arc::new(MemoryLeaseStore::new(clock.clone())),
        LockConfig::default(),
        clock,
    ));
    let guard = lock.acquire().await.unwrap().expect("lock is free");
    let app = create_router(state(&harness).with_worker_lock(lock));

    let (_, body) = send_json(app, get("/workers/status")).await;
    assert_eq!(body["lock"]["key"], "locks:workers:herald:development");
    assert_eq!(body["lock"]["exists"], true);
    assert_eq!(body["lock"]["ownedByThisProcess"], true);

    guard.release().await.unwrap();
}
