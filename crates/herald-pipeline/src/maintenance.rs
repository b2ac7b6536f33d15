//! Periodic maintenance for the `reconciliation` queue.
//!
//! Finds campaigns stuck in `sending`, finalizing those whose sends are all
//! resolved and alerting on the rest, then expires credit reservations that
//! outlived their TTL.

use std::sync::Arc;

use herald_core::{CampaignId, Clock, RecipientCounts, ReservationId};
use serde::Serialize;
use tracing::{error, info};

use crate::{
    error::Result,
    finalize::CampaignFinalizer,
    ledger::CreditLedger,
    queue::{BoxFuture, ClaimedJob, Job, JobHandler, JobOutcome},
    storage::PipelineStorage,
};

/// A sending campaign that made no progress within the stuck threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckCampaign {
    /// Campaign id.
    pub campaign_id: CampaignId,
    /// Seconds since the last recipient activity.
    pub idle_seconds: i64,
    /// Recipient tallies at detection time.
    pub counts: RecipientCounts,
    /// Whether fan-out had finished.
    pub fanout_complete: bool,
}

/// Outcome of one stuck-campaign scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckScan {
    /// Campaigns finalized because every send had resolved.
    pub finalized: Vec<CampaignId>,
    /// Campaigns reported for attention.
    pub stuck: Vec<StuckCampaign>,
}

/// Scans sending campaigns for missing progress.
pub struct StuckCampaignDetector {
    storage: Arc<dyn PipelineStorage>,
    finalizer: Arc<CampaignFinalizer>,
    clock: Arc<dyn Clock>,
    threshold: chrono::Duration,
}

impl StuckCampaignDetector {
    /// Creates a detector that flags campaigns idle for `threshold`.
    pub fn new(
        storage: Arc<dyn PipelineStorage>,
        finalizer: Arc<CampaignFinalizer>,
        clock: Arc<dyn Clock>,
        threshold: chrono::Duration,
    ) -> Self {
        Self { storage, finalizer, clock, threshold }
    }

    /// Runs one scan.
    ///
    /// # Errors
    ///
    /// Returns error if storage or finalization fails.
    pub async fn scan(&self) -> Result<StuckScan> {
        let now = self.clock.now_utc();
        let mut scan = StuckScan::default();

        for campaign in self.storage.list_sending_campaigns().await? {
            let last_activity = self
                .storage
                .last_activity(campaign.id)
                .await?
                .map_or(campaign.updated_at, |row_activity| row_activity.max(campaign.updated_at));
            let idle = now - last_activity;
            if idle < self.threshold {
                continue;
            }

            let counts = self.storage.recipient_counts(campaign.id).await?;
            let fanout_complete = campaign.fanout_completed_at.is_some();

            if fanout_complete && counts.queued == 0 {
                if let Some(status) = self.finalizer.try_finalize(campaign.id).await? {
                    info!(campaign_id = %campaign.id, status = %status, "finalized idle campaign");
                    scan.finalized.push(campaign.id);
                }
                continue;
            }

            error!(
                campaign_id = %campaign.id,
                idle_seconds = idle.num_seconds(),
                fanout_complete,
                queued = counts.queued,
                accepted = counts.accepted,
                delivered = counts.delivered,
                failed_delivery = counts.failed_delivery,
                failed_send = counts.failed_send,
                "campaign stuck in sending"
            );
            scan.stuck.push(StuckCampaign {
                campaign_id: campaign.id,
                idle_seconds: idle.num_seconds(),
                counts,
                fanout_complete,
            });
        }

        Ok(scan)
    }
}

/// Expires reservations past their deadline.
pub struct ReservationSweeper {
    ledger: Arc<dyn CreditLedger>,
}

impl ReservationSweeper {
    /// Creates a new sweeper.
    pub fn new(ledger: Arc<dyn CreditLedger>) -> Self {
        Self { ledger }
    }

    /// Expires every due reservation.
    ///
    /// # Errors
    ///
    /// Returns error if the ledger fails.
    pub async fn sweep(&self) -> Result<Vec<ReservationId>> {
        let expired = self.ledger.expire_due().await?;
        for reservation_id in &expired {
            info!(reservation_id = %reservation_id, "reservation expired");
        }
        Ok(expired)
    }
}

/// Handler for `reconciliation` jobs.
pub struct MaintenanceHandler {
    detector: Arc<StuckCampaignDetector>,
    sweeper: Arc<ReservationSweeper>,
}

impl MaintenanceHandler {
    /// Creates a new maintenance handler.
    pub fn new(detector: Arc<StuckCampaignDetector>, sweeper: Arc<ReservationSweeper>) -> Self {
        Self { detector, sweeper }
    }
}

impl JobHandler for MaintenanceHandler {
    fn handle<'a>(&'a self, _claimed: &'a ClaimedJob, job: Job) -> BoxFuture<'a, Result<JobOutcome>> {
        Box::pin(async move {
            if !matches!(job, Job::Reconciliation(_)) {
                return Ok(JobOutcome::Failed {
                    reason: format!("unexpected {} payload on reconciliation", job.queue()),
                });
            }

            let scan = self.detector.scan().await?;
            let expired = self.sweeper.sweep().await?;
            info!(
                finalized = scan.finalized.len(),
                stuck = scan.stuck.len(),
                expired = expired.len(),
                "maintenance sweep finished"
            );
            Ok(JobOutcome::Completed)
        })
    }
}
