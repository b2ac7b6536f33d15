//! Fan-out worker for the `campaign-send` queue.
//!
//! Walks the campaign audience in chunks ordered by contact id. Each chunk
//! inserts its recipient rows, publishes their `sms-send` jobs and stores
//! the new cursor on the fan-out job in one transaction, so a restarted job
//! resumes where the last committed chunk ended.

use std::{sync::Arc, time::Duration};

use herald_core::{CampaignStatus, Clock};
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    finalize::CampaignFinalizer,
    queue::{BoxFuture, CampaignSendJob, ClaimedJob, DeliveryStatusJob, Job, JobHandler, JobOutcome, JobQueue},
    storage::{FanoutChunk, PipelineStorage},
};

/// Fan-out tuning.
#[derive(Debug, Clone)]
pub struct FanoutSettings {
    /// Contacts per chunk.
    pub batch_size: usize,
    /// Delay before the first per-campaign delivery poll.
    pub delivery_poll_interval: Duration,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self { batch_size: 500, delivery_poll_interval: Duration::from_secs(60) }
    }
}

/// Handler for `campaign-send` jobs.
pub struct FanoutHandler {
    storage: Arc<dyn PipelineStorage>,
    queue: Arc<dyn JobQueue>,
    finalizer: Arc<CampaignFinalizer>,
    clock: Arc<dyn Clock>,
    settings: FanoutSettings,
}

impl FanoutHandler {
    /// Creates a new fan-out handler.
    pub fn new(
        storage: Arc<dyn PipelineStorage>,
        queue: Arc<dyn JobQueue>,
        finalizer: Arc<CampaignFinalizer>,
        clock: Arc<dyn Clock>,
        settings: FanoutSettings,
    ) -> Self {
        Self { storage, queue, finalizer, clock, settings }
    }

    async fn fan_out(&self, claimed: &ClaimedJob, mut job: CampaignSendJob) -> Result<JobOutcome> {
        let campaign_id = job.campaign_id;
        let batch_size = self.settings.batch_size.max(1);

        loop {
            let Some(campaign) = self.storage.find_campaign(campaign_id).await? else {
                warn!(campaign_id = %campaign_id, job_id = %claimed.id, "fan-out for unknown campaign");
                return Ok(JobOutcome::Completed);
            };
            if campaign.status != CampaignStatus::Sending {
                info!(campaign_id = %campaign_id, status = %campaign.status, "fan-out stopped");
                return Ok(JobOutcome::Completed);
            }

            let contacts = self
                .storage
                .page_audience(campaign.owner_id, campaign.audience.clone(), job.cursor, batch_size)
                .await?;
            let Some(last) = contacts.last().map(|contact| contact.id) else {
                break;
            };
            let exhausted = contacts.len() < batch_size;

            let next = CampaignSendJob { cursor: Some(last), ..job.clone() };
            let chunk_len = contacts.len();
            let inserted = self
                .storage
                .fan_out_chunk(FanoutChunk {
                    job_id: claimed.id,
                    campaign_id,
                    reservation_id: job.reservation_id,
                    body: campaign.body.clone(),
                    contacts,
                    checkpoint: Job::CampaignSend(next.clone()),
                })
                .await?;

            debug!(
                campaign_id = %campaign_id,
                job_id = %claimed.id,
                chunk = chunk_len,
                inserted,
                cursor = %last,
                "fan-out chunk committed"
            );

            job = next;
            if exhausted {
                break;
            }
        }

        let total = self.storage.recipient_counts(campaign_id).await?.total();
        let total = i32::try_from(total).unwrap_or(i32::MAX);
        if !self.storage.complete_fanout(campaign_id, total).await? {
            info!(campaign_id = %campaign_id, "campaign left sending before fan-out finished");
            return Ok(JobOutcome::Completed);
        }
        info!(campaign_id = %campaign_id, total_recipients = total, "fan-out complete");

        let first_poll = self.clock.now_utc()
            + chrono::Duration::from_std(self.settings.delivery_poll_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.queue
            .publish(
                Job::DeliveryStatusUpdate(DeliveryStatusJob { campaign_id: Some(campaign_id) }),
                first_poll,
            )
            .await?;

        self.finalizer.try_finalize(campaign_id).await?;

        Ok(JobOutcome::Completed)
    }
}

impl JobHandler for FanoutHandler {
    fn handle<'a>(&'a self, claimed: &'a ClaimedJob, job: Job) -> BoxFuture<'a, Result<JobOutcome>> {
        Box::pin(async move {
            match job {
                Job::CampaignSend(job) => self.fan_out(claimed, job).await,
                other => Ok(JobOutcome::Failed {
                    reason: format!("unexpected {} payload on campaign-send", other.queue()),
                }),
            }
        })
    }
}
