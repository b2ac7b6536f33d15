//! End-to-end campaign flows against the in-memory backend.
//!
//! Each test enqueues a campaign through the gateway and steps the queues
//! with a virtual clock, then checks recipient rows, campaign status and
//! the credit ledger.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::time::Duration;

use herald_core::{CampaignStatus, HeraldError, RecipientStatus, ReservationStatus};
use herald_pipeline::{
    maintenance::ReservationSweeper, provider::mock::ScriptedSend, send::RESERVATION_INACTIVE,
    storage::PipelineStorage, CreditLedger, PipelineError, QueueName, ReconcileReport,
};
use herald_testing::{invariants, CampaignBuilder, ContactBuilder, FailPoint, TestHarness};

#[tokio::test]
async fn campaign_reaches_every_matching_contact() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(100).await;
    harness.add_contacts(owner, 5, &["vip"]).await;
    harness.add_contacts(owner, 2, &["churned"]).await;
    harness.add_contact(ContactBuilder::new(owner).tags(&["vip"]).opted_out()).await;
    let campaign = harness.draft_campaign(owner, &["vip"]).await;

    let outcome = harness.enqueue(campaign.id, "req-1").await.expect("enqueue accepted");
    assert_eq!(outcome.queued, 5);
    assert!(!outcome.replayed);

    harness.drain().await.unwrap();

    let campaign = harness.campaign(campaign.id).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Completed);
    assert_eq!(campaign.total_recipients, 5);
    assert!(campaign.fanout_completed_at.is_some());

    let rows = harness.backend.recipients(campaign.id).await;
    assert_eq!(rows.len(), 5);
    assert!(rows.iter().all(|row| row.status == RecipientStatus::Accepted));
    assert!(rows.iter().all(|row| row.credits_charged == 1));
    assert_eq!(harness.provider.sent().await.len(), 5);

    let balance = harness.backend.balance(owner).await.unwrap();
    assert_eq!(balance.balance, 95);
    assert_eq!(balance.reserved, 0);

    invariants::check_ledger(&harness.backend, owner, 100).await.unwrap();
    invariants::check_campaign(&harness.backend, campaign.id).await.unwrap();
}

#[tokio::test]
async fn delivery_receipts_resolve_accepted_rows() {
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

    let rows = harness.backend.recipients(campaign.id).await;
    let status_of = |phone: &str| rows.iter().find(|row| row.phone == phone).unwrap().status;
    assert_eq!(status_of(&contacts[0].phone), RecipientStatus::Delivered);
    assert_eq!(status_of(&contacts[1].phone), RecipientStatus::FailedDelivery);
    assert_eq!(status_of(&contacts[2].phone), RecipientStatus::Accepted);

    let status = harness.engine().campaign_service().status(campaign.id).await.unwrap();
    assert_eq!(status.status, CampaignStatus::Completed);
    assert_eq!(status.totals.recipients, 3);
    assert_eq!(status.totals.sent, 3);
    assert_eq!(status.totals.delivered, 1);
    assert_eq!(status.totals.failed, 1);
    assert_eq!(status.delivery.pending_delivery, 1);
    assert_eq!(status.processed, 3);

    // Delivery failures are still charged.
    let balance = harness.backend.balance(owner).await.unwrap();
    assert_eq!(balance.balance, 7);
}

#[tokio::test]
async fn failed_poll_batch_does_not_abort_the_pass() {
    let mut config = TestHarness::default_config();
    config.reconcile.batch_size = 2;
    let harness = TestHarness::with_config(config);
    let owner = harness.owner_with_credits(10).await;
    harness.add_contacts(owner, 4, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;

    harness.enqueue(campaign.id, "req-1").await.unwrap();
    harness.drain().await.unwrap();
    harness.provider.deliver_all("DELIVRD").await;
    harness.provider.fail_next_poll(PipelineError::server_error(502, "bad gateway")).await;

    let reconciler = harness.engine().reconciler();
    let report = reconciler.poll(Some(campaign.id)).await.unwrap();
    assert_eq!(
        report,
        ReconcileReport { checked: 4, delivered: 2, failed: 0, unchanged: 2, failed_batches: 1 }
    );
    let rows = harness.backend.recipients(campaign.id).await;
    assert_eq!(rows.iter().filter(|row| row.status == RecipientStatus::Accepted).count(), 2);

    let report = reconciler.poll(Some(campaign.id)).await.unwrap();
    assert_eq!((report.checked, report.delivered, report.failed_batches), (2, 2, 0));
    let rows = harness.backend.recipients(campaign.id).await;
    assert!(rows.iter().all(|row| row.status == RecipientStatus::Delivered));
}

#[tokio::test]
async fn follow_up_polls_stop_once_nothing_is_pending() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    harness.add_contacts(owner, 2, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;

    harness.enqueue(campaign.id, "req-1").await.unwrap();
    harness.drain().await.unwrap();
    harness.provider.deliver_all("delivered").await;

    harness.run_until_idle().await.unwrap();

    let rows = harness.backend.recipients(campaign.id).await;
    assert!(rows.iter().all(|row| row.status == RecipientStatus::Delivered));
    assert_eq!(harness.backend.open_jobs(QueueName::DeliveryStatusUpdate).await, 0);
}

#[tokio::test]
async fn enqueue_replays_the_first_answer_for_a_key() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    harness.add_contacts(owner, 4, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;

    let first = harness.enqueue(campaign.id, "req-1").await.unwrap();
    let replay = harness.enqueue(campaign.id, "  req-1  ").await.unwrap();

    assert!(replay.replayed);
    assert_eq!(replay.queued, first.queued);
    assert_eq!(replay.reservation_id, first.reservation_id);
    assert_eq!(harness.backend.jobs(QueueName::CampaignSend).await.len(), 1);
    assert_eq!(harness.backend.reservations_for(owner).await.len(), 1);

    let err = harness.enqueue(campaign.id, "req-2").await.unwrap_err();
    assert!(matches!(err, HeraldError::AlreadySending { .. }));
}

#[tokio::test]
async fn enqueue_rejections_leave_no_side_effects() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(2).await;
    harness.add_contacts(owner, 3, &["vip"]).await;

    let campaign = harness.draft_campaign(owner, &["vip"]).await;
    let err = harness.enqueue(campaign.id, "   ").await.unwrap_err();
    assert!(matches!(err, HeraldError::MissingIdempotencyKey));

    let err = harness.enqueue(campaign.id, "req-1").await.unwrap_err();
    assert!(
        matches!(err, HeraldError::InsufficientCredits { required: 3, available: 2 }),
        "got {err:?}"
    );
    assert_eq!(err.status_code(), 402);

    let nobody = harness.draft_campaign(owner, &["nobody"]).await;
    let err = harness.enqueue(nobody.id, "req-1").await.unwrap_err();
    assert!(matches!(err, HeraldError::NoRecipients { .. }));

    let missing = CampaignBuilder::new(owner).build(chrono::Utc::now());
    let err = harness.enqueue(missing.id, "req-1").await.unwrap_err();
    assert!(matches!(err, HeraldError::CampaignNotFound { .. }));

    let done = harness
        .add_campaign(CampaignBuilder::new(owner).audience(&["vip"]).status(CampaignStatus::Completed))
        .await;
    let err = harness.enqueue(done.id, "req-1").await.unwrap_err();
    assert!(matches!(err, HeraldError::InvalidStatus { status: CampaignStatus::Completed, .. }));

    assert_eq!(harness.campaign(campaign.id).await.unwrap().status, CampaignStatus::Draft);
    assert!(harness.backend.jobs(QueueName::CampaignSend).await.is_empty());
    assert_eq!(harness.backend.balance(owner).await.unwrap().reserved, 0);
}

#[tokio::test]
async fn permanent_rejection_releases_the_slice() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(100).await;
    let contacts = harness.add_contacts(owner, 3, &[]).await;
    harness
        .provider
        .script(
            contacts[0].phone.clone(),
            vec![ScriptedSend::Fail(PipelineError::rejected("INVALID_NUMBER", false))],
        )
        .await;
    let campaign = harness.draft_campaign(owner, &[]).await;

    harness.enqueue(campaign.id, "req-1").await.unwrap();
    harness.drain().await.unwrap();

    let rows = harness.backend.recipients(campaign.id).await;
    let rejected = rows.iter().find(|row| row.phone == contacts[0].phone).unwrap();
    assert_eq!(rejected.status, RecipientStatus::FailedSend);
    assert_eq!(rejected.last_error.as_deref(), Some("INVALID_NUMBER"));
    assert_eq!(rejected.credits_charged, 0);
    assert_eq!(harness.provider.attempt_count(), 3);

    assert_eq!(harness.campaign(campaign.id).await.unwrap().status, CampaignStatus::Completed);
    let balance = harness.backend.balance(owner).await.unwrap();
    assert_eq!(balance.balance, 98);
    assert_eq!(balance.reserved, 0);
    invariants::check_ledger(&harness.backend, owner, 100).await.unwrap();
}

#[tokio::test]
async fn transient_failures_retry_with_backoff() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    let contacts = harness.add_contacts(owner, 3, &[]).await;
    harness
        .provider
        .script(
            contacts[0].phone.clone(),
            vec![
                ScriptedSend::Fail(PipelineError::server_error(502, "bad gateway")),
                ScriptedSend::Fail(PipelineError::timeout(10)),
            ],
        )
        .await;
    let campaign = harness.draft_campaign(owner, &[]).await;

    harness.enqueue(campaign.id, "req-1").await.unwrap();
    harness.drain().await.unwrap();

    let row = harness
        .backend
        .recipients(campaign.id)
        .await
        .into_iter()
        .find(|row| row.phone == contacts[0].phone)
        .unwrap();
    assert_eq!(row.status, RecipientStatus::Queued);
    assert_eq!(row.send_attempts, 1);
    assert_eq!(harness.campaign(campaign.id).await.unwrap().status, CampaignStatus::Sending);

    harness.run_until_idle().await.unwrap();

    let rows = harness.backend.recipients(campaign.id).await;
    assert!(rows.iter().all(|row| row.status == RecipientStatus::Accepted));
    assert_eq!(harness.provider.attempt_count(), 5);
    assert_eq!(harness.campaign(campaign.id).await.unwrap().status, CampaignStatus::Completed);
    invariants::check_campaign(&harness.backend, campaign.id).await.unwrap();
}

#[tokio::test]
async fn exhausted_retries_fail_the_campaign() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    let contacts = harness.add_contacts(owner, 1, &[]).await;
    let failures = (0..5).map(|_| ScriptedSend::Fail(PipelineError::server_error(500, ""))).collect();
    harness.provider.script(contacts[0].phone.clone(), failures).await;
    let campaign = harness.draft_campaign(owner, &[]).await;

    let outcome = harness.enqueue(campaign.id, "req-1").await.unwrap();
    harness.run_until_idle().await.unwrap();

    let rows = harness.backend.recipients(campaign.id).await;
    assert_eq!(rows[0].status, RecipientStatus::FailedSend);
    assert_eq!(harness.provider.attempt_count(), 5);

    let campaign = harness.campaign(campaign.id).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Failed);
    assert!(campaign.finished_at.is_some());

    let reservation = harness.backend.find_reservation(outcome.reservation_id).await.unwrap().unwrap();
    assert_eq!(reservation.status, ReservationStatus::Released);
    let balance = harness.backend.balance(owner).await.unwrap();
    assert_eq!((balance.balance, balance.reserved), (10, 0));
}

#[tokio::test]
async fn paused_campaign_resumes_without_duplicates() {
    let mut config = TestHarness::default_config();
    config.fanout.batch_size = 4;
    let harness = TestHarness::with_config(config);
    let owner = harness.owner_with_credits(20).await;
    harness.add_contacts(owner, 10, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;
    let service = harness.engine().campaign_service();

    let err = service.pause(campaign.id).await.unwrap_err();
    assert!(matches!(err, HeraldError::InvalidStatus { status: CampaignStatus::Draft, .. }));

    harness.enqueue(campaign.id, "req-1").await.unwrap();
    let paused = service.pause(campaign.id).await.unwrap();
    assert_eq!(paused.status, CampaignStatus::Paused);

    harness.drain().await.unwrap();
    assert!(harness.backend.recipients(campaign.id).await.is_empty());

    let resumed = service.resume(campaign.id).await.unwrap();
    assert_eq!(resumed.status, CampaignStatus::Sending);
    assert!(matches!(service.resume(campaign.id).await, Err(HeraldError::InvalidStatus { .. })));

    harness.drain().await.unwrap();

    assert_eq!(harness.backend.recipients(campaign.id).await.len(), 10);
    assert_eq!(harness.backend.jobs(QueueName::SmsSend).await.len(), 10);
    assert_eq!(harness.campaign(campaign.id).await.unwrap().status, CampaignStatus::Completed);
    invariants::check_ledger(&harness.backend, owner, 20).await.unwrap();
}

#[tokio::test]
async fn resume_after_reservation_lapse_reserves_again() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    harness.add_contacts(owner, 3, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;
    let service = harness.engine().campaign_service();

    let first = harness.enqueue(campaign.id, "req-1").await.unwrap();
    service.pause(campaign.id).await.unwrap();
    harness.drain().await.unwrap();
    assert!(harness.backend.recipients(campaign.id).await.is_empty());

    harness.advance(Duration::from_secs(25 * 3600));
    let expired = ReservationSweeper::new(harness.backend.clone()).sweep().await.unwrap();
    assert_eq!(expired, vec![first.reservation_id]);

    let resumed = service.resume(campaign.id).await.unwrap();
    assert_eq!(resumed.status, CampaignStatus::Sending);
    let replacement = resumed.reservation_id.unwrap();
    assert_ne!(replacement, first.reservation_id);

    harness.drain().await.unwrap();

    let rows = harness.backend.recipients(campaign.id).await;
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|row| row.status == RecipientStatus::Accepted && row.credits_charged == 1));

    let reservation = harness.backend.find_reservation(replacement).await.unwrap().unwrap();
    assert_eq!((reservation.amount, reservation.committed), (3, 3));
    let balance = harness.backend.balance(owner).await.unwrap();
    assert_eq!((balance.balance, balance.reserved), (7, 0));
    assert_eq!(harness.campaign(campaign.id).await.unwrap().status, CampaignStatus::Completed);
    invariants::check_ledger(&harness.backend, owner, 10).await.unwrap();
    invariants::check_campaign(&harness.backend, campaign.id).await.unwrap();
}

#[tokio::test]
async fn resume_is_refused_when_a_lapsed_reservation_cannot_be_replaced() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(3).await;
    harness.add_contacts(owner, 3, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;
    let service = harness.engine().campaign_service();

    harness.enqueue(campaign.id, "req-1").await.unwrap();
    service.pause(campaign.id).await.unwrap();
    harness.drain().await.unwrap();
    harness.add_contacts(owner, 2, &[]).await;

    harness.advance(Duration::from_secs(25 * 3600));
    ReservationSweeper::new(harness.backend.clone()).sweep().await.unwrap();

    let err = service.resume(campaign.id).await.unwrap_err();
    assert!(matches!(err, HeraldError::InsufficientCredits { required: 5, available: 3 }));
    assert_eq!(harness.campaign(campaign.id).await.unwrap().status, CampaignStatus::Paused);
    assert!(harness.provider.sent().await.is_empty());
    assert_eq!(harness.backend.reservations_for(owner).await.len(), 1);
}

#[tokio::test]
async fn sends_queued_before_a_pause_charge_the_current_reservation() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    harness.add_contacts(owner, 3, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;
    let service = harness.engine().campaign_service();

    let first = harness.enqueue(campaign.id, "req-1").await.unwrap();
    harness.run_queue(QueueName::CampaignSend).await.unwrap();
    service.pause(campaign.id).await.unwrap();

    harness.advance(Duration::from_secs(25 * 3600));
    ReservationSweeper::new(harness.backend.clone()).sweep().await.unwrap();

    let second = harness.enqueue(campaign.id, "req-2").await.unwrap();
    assert_ne!(second.reservation_id, first.reservation_id);
    harness.drain().await.unwrap();

    assert_eq!(harness.provider.sent().await.len(), 3);
    let reservation = harness.backend.find_reservation(second.reservation_id).await.unwrap().unwrap();
    assert_eq!(reservation.committed, 3);
    assert_eq!(harness.backend.balance(owner).await.unwrap().balance, 7);
    invariants::check_ledger(&harness.backend, owner, 10).await.unwrap();
    invariants::check_campaign(&harness.backend, campaign.id).await.unwrap();
}

#[tokio::test]
async fn sends_without_an_active_reservation_never_reach_the_provider() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    harness.add_contacts(owner, 2, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;

    harness.enqueue(campaign.id, "req-1").await.unwrap();
    harness.run_queue(QueueName::CampaignSend).await.unwrap();

    harness.advance(Duration::from_secs(25 * 3600));
    ReservationSweeper::new(harness.backend.clone()).sweep().await.unwrap();
    harness.drain().await.unwrap();

    assert_eq!(harness.provider.attempt_count(), 0);
    let rows = harness.backend.recipients(campaign.id).await;
    assert!(rows.iter().all(|row| {
        row.status == RecipientStatus::FailedSend && row.last_error.as_deref() == Some(RESERVATION_INACTIVE)
    }));
    assert_eq!(harness.campaign(campaign.id).await.unwrap().status, CampaignStatus::Failed);
    assert_eq!(harness.backend.balance(owner).await.unwrap().balance, 10);
    invariants::check_ledger(&harness.backend, owner, 10).await.unwrap();
    invariants::check_campaign(&harness.backend, campaign.id).await.unwrap();
}

#[tokio::test]
async fn fanout_crash_resumes_from_checkpoint() {
    let mut config = TestHarness::default_config();
    config.fanout.batch_size = 4;
    let harness = TestHarness::with_config(config);
    let owner = harness.owner_with_credits(20).await;
    let mut contacts = harness.add_contacts(owner, 10, &[]).await;
    contacts.sort_by_key(|contact| contact.id);
    let campaign = harness.draft_campaign(owner, &[]).await;

    harness.enqueue(campaign.id, "req-1").await.unwrap();
    harness.backend.fail_nth(FailPoint::FanOutChunk, 2, "connection reset").await;
    harness.run_queue(QueueName::CampaignSend).await.unwrap();

    assert_eq!(harness.backend.recipients(campaign.id).await.len(), 4);
    let fanout = harness.backend.jobs(QueueName::CampaignSend).await;
    assert_eq!(fanout.len(), 1);
    assert_eq!(fanout[0].payload["cursor"], contacts[3].id.to_string());
    assert!(fanout[0].last_error.is_some());

    harness.run_until_idle().await.unwrap();

    assert_eq!(harness.backend.recipients(campaign.id).await.len(), 10);
    let mut phones: Vec<_> = harness.provider.sent().await.into_iter().map(|m| m.phone).collect();
    phones.sort();
    phones.dedup();
    assert_eq!(phones.len(), 10);
    assert_eq!(harness.campaign(campaign.id).await.unwrap().status, CampaignStatus::Completed);
    invariants::check_campaign(&harness.backend, campaign.id).await.unwrap();
}

#[tokio::test]
async fn commit_failure_is_retried_without_double_charge() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    harness.add_contacts(owner, 1, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;

    harness.enqueue(campaign.id, "req-1").await.unwrap();
    harness.backend.fail_next(FailPoint::Commit, "ledger unavailable").await;
    harness.run_until_idle().await.unwrap();

    assert_eq!(harness.provider.attempt_count(), 2);
    let rows = harness.backend.recipients(campaign.id).await;
    assert_eq!(rows[0].status, RecipientStatus::Accepted);
    assert_eq!(harness.backend.balance(owner).await.unwrap().balance, 9);
    invariants::check_ledger(&harness.backend, owner, 10).await.unwrap();
}

#[tokio::test]
async fn lost_acceptance_write_charges_once() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    harness.add_contacts(owner, 1, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;

    let outcome = harness.enqueue(campaign.id, "req-1").await.unwrap();
    harness.backend.fail_next(FailPoint::MarkAccepted, "write lost").await;
    harness.run_until_idle().await.unwrap();

    // The provider saw the message twice; the ledger charged it once.
    assert_eq!(harness.provider.attempt_count(), 2);
    let rows = harness.backend.recipients(campaign.id).await;
    assert_eq!(rows[0].status, RecipientStatus::Accepted);
    assert_eq!(rows[0].credits_charged, 1);
    assert_eq!(harness.backend.settlements(outcome.reservation_id).await.len(), 1);
    assert_eq!(harness.backend.balance(owner).await.unwrap().balance, 9);
    invariants::check_campaign(&harness.backend, campaign.id).await.unwrap();
}

#[tokio::test]
async fn manual_reconcile_is_rate_limited() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    harness.add_contacts(owner, 1, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;
    harness.enqueue(campaign.id, "req-1").await.unwrap();
    harness.drain().await.unwrap();

    let service = harness.engine().campaign_service();
    let first = service.request_reconcile(campaign.id).await.unwrap();
    assert!(first.queued);
    assert_eq!(first.retry_after_seconds, 0);

    harness.advance(Duration::from_secs(30));
    let second = service.request_reconcile(campaign.id).await.unwrap();
    assert!(!second.queued);
    assert_eq!(second.retry_after_seconds, 150);

    harness.advance(Duration::from_secs(151));
    assert!(service.request_reconcile(campaign.id).await.unwrap().queued);

    let polls = harness.backend.jobs(QueueName::DeliveryStatusUpdate).await;
    let manual = polls.iter().filter(|job| job.payload["campaignId"] == campaign.id.to_string());
    assert!(manual.count() >= 3, "fan-out poll plus two manual polls");
}

#[tokio::test]
async fn enqueue_publish_failure_leaves_campaign_for_the_stuck_scan() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    harness.add_contacts(owner, 2, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;

    harness.backend.fail_next(FailPoint::Publish, "queue down").await;
    let err = harness.enqueue(campaign.id, "req-1").await.unwrap_err();
    assert!(matches!(err, HeraldError::Internal(_)));
    assert_eq!(harness.campaign(campaign.id).await.unwrap().status, CampaignStatus::Sending);
    assert!(harness.backend.find_idempotency(campaign.id, "req-1".into()).await.unwrap().is_none());
    assert_eq!(harness.backend.balance(owner).await.unwrap().reserved, 2);

    // The reservation outlives its TTL and the maintenance job returns it.
    harness.advance(Duration::from_secs(25 * 3600));
    harness
        .backend
        .insert_raw_job(QueueName::Reconciliation, serde_json::json!({ "kind": "reconciliation" }))
        .await;
    harness.drain().await.unwrap();

    assert_eq!(harness.backend.balance(owner).await.unwrap().reserved, 0);
    let reservations = harness.backend.reservations_for(owner).await;
    assert_eq!(reservations[0].status, ReservationStatus::Expired);
    assert_eq!(harness.campaign(campaign.id).await.unwrap().status, CampaignStatus::Sending);
}
