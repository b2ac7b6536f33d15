//! Delivery reconciliation for the `delivery-status-update` queue.
//!
//! Pages through `accepted` rows that carry a provider id, asks the provider
//! for their status and moves them to `delivered` or `failedDelivery`. Only
//! `accepted` rows are ever touched and credits are never moved here. A
//! failed provider batch is logged and skipped.

use std::{collections::HashMap, sync::Arc, time::Duration};

use herald_core::{CampaignId, CampaignStatus, Clock, RecipientMessageId, RecipientStatus};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    provider::SmsProvider,
    queue::{BoxFuture, ClaimedJob, DeliveryStatusJob, Job, JobHandler, JobOutcome, JobQueue},
    storage::PipelineStorage,
};

const DELIVERED_CODES: [&str; 5] = ["delivered", "delivrd", "completed", "ok", "success"];
const FAILED_CODES: [&str; 6] = ["failed", "failure", "undelivered", "expired", "rejected", "error"];

/// Maps a provider status code to a recipient status.
///
/// Matching ignores case and surrounding whitespace. Codes outside both
/// vocabularies (`sent`, `queued`, `unknown`, ...) return `None` and leave
/// the row alone.
pub fn classify_provider_code(code: &str) -> Option<RecipientStatus> {
    let code = code.trim().to_ascii_lowercase();
    if DELIVERED_CODES.contains(&code.as_str()) {
        Some(RecipientStatus::Delivered)
    } else if FAILED_CODES.contains(&code.as_str()) {
        Some(RecipientStatus::FailedDelivery)
    } else {
        None
    }
}

/// Reconciliation tuning.
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// Provider ids per status request.
    pub batch_size: usize,
    /// Delay between per-campaign polls.
    pub poll_interval: Duration,
    /// How long after finishing a campaign keeps polling for receipts.
    pub recent_window: chrono::Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(60),
            recent_window: chrono::Duration::minutes(30),
        }
    }
}

/// Tallies from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Accepted rows examined.
    pub checked: usize,
    /// Rows moved to delivered.
    pub delivered: usize,
    /// Rows moved to failedDelivery.
    pub failed: usize,
    /// Rows left accepted.
    pub unchanged: usize,
    /// Provider batches that errored.
    pub failed_batches: usize,
}

/// Polls the provider and applies delivery receipts.
pub struct DeliveryReconciler {
    storage: Arc<dyn PipelineStorage>,
    queue: Arc<dyn JobQueue>,
    provider: Arc<dyn SmsProvider>,
    clock: Arc<dyn Clock>,
    settings: ReconcileSettings,
}

impl DeliveryReconciler {
    /// Creates a new reconciler.
    pub fn new(
        storage: Arc<dyn PipelineStorage>,
        queue: Arc<dyn JobQueue>,
        provider: Arc<dyn SmsProvider>,
        clock: Arc<dyn Clock>,
        settings: ReconcileSettings,
    ) -> Self {
        Self { storage, queue, provider, clock, settings }
    }

    /// Reconciles one campaign, or every accepted row when `campaign_id`
    /// is `None`.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails. Provider failures are counted in
    /// the report instead.
    pub async fn poll(&self, campaign_id: Option<CampaignId>) -> Result<ReconcileReport> {
        let batch_size = self.settings.batch_size.max(1);
        let mut report = ReconcileReport::default();
        let mut after: Option<RecipientMessageId> = None;

        loop {
            let page = self.storage.accepted_page(campaign_id, after, batch_size).await?;
            let Some(last) = page.last().map(|row| row.id) else {
                break;
            };
            after = Some(last);
            report.checked += page.len();

            let by_provider_id: HashMap<String, RecipientMessageId> = page
                .iter()
                .filter_map(|row| row.provider_message_id.clone().map(|pid| (pid, row.id)))
                .collect();
            let ids: Vec<String> = by_provider_id.keys().cloned().collect();

            let mut updated = 0;
            match self.provider.poll_status(ids).await {
                Ok(statuses) => {
                    for status in statuses {
                        let Some(row_id) = by_provider_id.get(&status.provider_message_id) else {
                            continue;
                        };
                        let Some(next) = classify_provider_code(&status.code) else {
                            continue;
                        };
                        if self.storage.apply_delivery_status(*row_id, next).await? {
                            updated += 1;
                            match next {
                                RecipientStatus::Delivered => report.delivered += 1,
                                _ => report.failed += 1,
                            }
                        }
                    }
                },
                Err(err) => {
                    warn!(
                        campaign_id = ?campaign_id,
                        batch = page.len(),
                        error = %err,
                        "delivery status batch failed, continuing"
                    );
                    report.failed_batches += 1;
                },
            }
            report.unchanged += page.len() - updated;

            if page.len() < batch_size {
                break;
            }
        }

        info!(
            campaign_id = ?campaign_id,
            checked = report.checked,
            delivered = report.delivered,
            failed = report.failed,
            unchanged = report.unchanged,
            failed_batches = report.failed_batches,
            "delivery reconciliation pass finished"
        );

        Ok(report)
    }

    /// Publishes the next per-campaign poll if receipts are still expected.
    ///
    /// Returns true when a follow-up was published.
    ///
    /// # Errors
    ///
    /// Returns error if storage or the queue fails.
    pub async fn schedule_follow_up(&self, campaign_id: CampaignId) -> Result<bool> {
        let Some(campaign) = self.storage.find_campaign(campaign_id).await? else {
            return Ok(false);
        };
        let counts = self.storage.recipient_counts(campaign_id).await?;
        let now = self.clock.now_utc();

        let keep_polling = match campaign.status {
            CampaignStatus::Sending => counts.accepted > 0 || counts.queued > 0,
            status if status.is_terminal() => {
                counts.accepted > 0
                    && campaign
                        .finished_at
                        .is_some_and(|finished| now - finished <= self.settings.recent_window)
            },
            _ => false,
        };
        if !keep_polling {
            debug!(campaign_id = %campaign_id, status = %campaign.status, "no further delivery polls");
            return Ok(false);
        }

        let run_at = now
            + chrono::Duration::from_std(self.settings.poll_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.queue
            .publish(Job::DeliveryStatusUpdate(DeliveryStatusJob { campaign_id: Some(campaign_id) }), run_at)
            .await?;
        debug!(campaign_id = %campaign_id, run_at = %run_at, "delivery poll rescheduled");
        Ok(true)
    }
}

/// Handler for `delivery-status-update` jobs.
pub struct DeliveryStatusHandler {
    reconciler: Arc<DeliveryReconciler>,
}

impl DeliveryStatusHandler {
    /// Creates a new handler.
    pub fn new(reconciler: Arc<DeliveryReconciler>) -> Self {
        Self { reconciler }
    }
}

impl JobHandler for DeliveryStatusHandler {
    fn handle<'a>(&'a self, _claimed: &'a ClaimedJob, job: Job) -> BoxFuture<'a, Result<JobOutcome>> {
        Box::pin(async move {
            let Job::DeliveryStatusUpdate(job) = job else {
                return Ok(JobOutcome::Failed {
                    reason: format!("unexpected {} payload on delivery-status-update", job.queue()),
                });
            };

            self.reconciler.poll(job.campaign_id).await?;
            if let Some(campaign_id) = job.campaign_id {
                self.reconciler.schedule_follow_up(campaign_id).await?;
            }
            Ok(JobOutcome::Completed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivered_vocabulary() {
        for code in ["delivered", "DELIVRD", " Completed ", "ok", "SUCCESS"] {
            assert_eq!(classify_provider_code(code), Some(RecipientStatus::Delivered), "{code}");
        }
    }

    #[test]
    fn failed_vocabulary() {
        for code in ["failed", "FAILURE", "undelivered", "Expired", "rejected", "error"] {
            assert_eq!(classify_provider_code(code), Some(RecipientStatus::FailedDelivery), "{code}");
        }
    }

    #[test]
    fn unknown_codes_leave_rows_alone() {
        for code in ["sent", "queued", "ACCEPTD", "", "deliver"] {
            assert_eq!(classify_provider_code(code), None, "{code}");
        }
    }
}
