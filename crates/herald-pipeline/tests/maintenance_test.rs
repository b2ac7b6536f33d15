//! Stuck-campaign detection and reservation expiry.

#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use herald_core::{CampaignStatus, Clock};
use herald_pipeline::{
    finalize::CampaignFinalizer,
    maintenance::{ReservationSweeper, StuckCampaignDetector},
    QueueName,
};
use herald_testing::{CampaignBuilder, TestHarness};

fn detector(harness: &TestHarness) -> StuckCampaignDetector {
    let finalizer = Arc::new(CampaignFinalizer::new(harness.backend.clone(), harness.backend.clone()));
    let clock: Arc<dyn Clock> = Arc::new(harness.clock.clone());
    StuckCampaignDetector::new(harness.backend.clone(), finalizer, clock, chrono::Duration::minutes(15))
}

#[tokio::test]
async fn idle_campaign_with_queued_rows_is_reported_not_mutated() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    harness.add_contacts(owner, 3, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;
    harness.enqueue(campaign.id, "req-1").await.unwrap();
    // Fan-out runs but the send workers never pick anything up.
    harness.run_queue(QueueName::CampaignSend).await.unwrap();

    harness.advance(Duration::from_secs(10 * 60));
    assert!(detector(&harness).scan().await.unwrap().stuck.is_empty());

    harness.advance(Duration::from_secs(6 * 60));
    let scan = detector(&harness).scan().await.unwrap();

    assert!(scan.finalized.is_empty());
    assert_eq!(scan.stuck.len(), 1);
    let stuck = &scan.stuck[0];
    assert_eq!(stuck.campaign_id, campaign.id);
    assert!(stuck.fanout_complete);
    assert_eq!(stuck.counts.queued, 3);
    assert!(stuck.idle_seconds >= 15 * 60);

    let unchanged = harness.campaign(campaign.id).await.unwrap();
    assert_eq!(unchanged.status, CampaignStatus::Sending);
    assert_eq!(harness.backend.reservations_for(owner).await[0].unsettled(), 3);
}

#[tokio::test]
async fn idle_campaign_with_resolved_rows_is_finalized() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    let campaign = harness.add_campaign(CampaignBuilder::new(owner).status(CampaignStatus::Sending)).await;
    let now = harness.now();
    harness.backend.update_campaign(campaign.id, |c| c.fanout_completed_at = Some(now)).await;

    harness.advance(Duration::from_secs(20 * 60));
    let scan = detector(&harness).scan().await.unwrap();

    assert_eq!(scan.finalized, vec![campaign.id]);
    assert!(scan.stuck.is_empty());
    let finished = harness.campaign(campaign.id).await.unwrap();
    assert_eq!(finished.status, CampaignStatus::Failed);
    assert!(finished.finished_at.is_some());
}

#[tokio::test]
async fn sweeper_expires_only_overdue_reservations() {
    let harness = TestHarness::new();
    let owner = harness.owner_with_credits(10).await;
    harness.add_contacts(owner, 4, &[]).await;
    let campaign = harness.draft_campaign(owner, &[]).await;
    harness.enqueue(campaign.id, "req-1").await.unwrap();
    let sweeper = ReservationSweeper::new(harness.backend.clone());

    harness.advance(Duration::from_secs(23 * 3600));
    assert!(sweeper.sweep().await.unwrap().is_empty());

    harness.advance(Duration::from_secs(2 * 3600));
    let expired = sweeper.sweep().await.unwrap();

    let reservation = &harness.backend.reservations_for(owner).await[0];
    assert_eq!(expired, vec![reservation.id]);
    assert_eq!(reservation.released, 4);
    assert!(sweeper.sweep().await.unwrap().is_empty());
}
