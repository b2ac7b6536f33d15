//! Idempotent campaign enqueue.
//!
//! Turns "send this campaign" into a credit reservation, a status flip and
//! one `campaign-send` job. The order is fixed: reserve before flipping to
//! `sending`, flip before publishing. A repeated request with the same
//! idempotency key is answered from the stored record without side effects.

use std::sync::Arc;

use herald_core::{
    Campaign, CampaignId, CampaignStatus, Clock, CreditReservation, HeraldError,
    IdempotencyRecord, ReservationId, ReserveOutcome,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    ledger::CreditLedger,
    queue::{CampaignSendJob, Job, JobQueue},
    storage::PipelineStorage,
};

/// Settings that price and hold a campaign.
#[derive(Debug, Clone)]
pub struct EnqueueSettings {
    /// Credits charged per accepted message.
    pub per_message_cost: i64,
    /// How long a reservation may stay active before the expiry sweep.
    pub reservation_ttl: chrono::Duration,
}

impl Default for EnqueueSettings {
    fn default() -> Self {
        Self { per_message_cost: 1, reservation_ttl: chrono::Duration::hours(24) }
    }
}

/// Result of a successful enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOutcome {
    /// Recipients counted when the campaign was first enqueued.
    pub queued: i64,
    /// Reservation backing the send.
    #[serde(skip)]
    pub reservation_id: ReservationId,
    /// True when answered from the idempotency record.
    #[serde(skip)]
    pub replayed: bool,
}

impl From<IdempotencyRecord> for EnqueueOutcome {
    fn from(record: IdempotencyRecord) -> Self {
        Self {
            queued: i64::from(record.queued),
            reservation_id: record.reservation_id,
            replayed: true,
        }
    }
}

/// Enqueue gateway.
pub struct EnqueueService {
    storage: Arc<dyn PipelineStorage>,
    ledger: Arc<dyn CreditLedger>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    settings: EnqueueSettings,
}

impl EnqueueService {
    /// Creates a new enqueue service.
    pub fn new(
        storage: Arc<dyn PipelineStorage>,
        ledger: Arc<dyn CreditLedger>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        settings: EnqueueSettings,
    ) -> Self {
        Self { storage, ledger, queue, clock, settings }
    }

    /// Enqueues a campaign for sending.
    ///
    /// # Errors
    ///
    /// - `MissingIdempotencyKey` for an empty key
    /// - `CampaignNotFound` if the campaign does not exist
    /// - `AlreadySending` if the campaign is sending or another request won
    ///   the status flip
    /// - `InvalidStatus` if the campaign is completed or failed
    /// - `NoRecipients` if the audience is empty
    /// - `InsufficientCredits` if the balance cannot cover the estimate
    /// - `Storage`/`Internal` on backend failures
    pub async fn enqueue(
        &self,
        campaign_id: CampaignId,
        idempotency_key: &str,
    ) -> Result<EnqueueOutcome, HeraldError> {
        let key = idempotency_key.trim();
        if key.is_empty() {
            return Err(HeraldError::MissingIdempotencyKey);
        }

        if let Some(record) = self.storage.find_idempotency(campaign_id, key.to_string()).await? {
            info!(campaign_id = %campaign_id, queued = record.queued, "enqueue replayed from idempotency record");
            return Ok(record.into());
        }

        let campaign = self
            .storage
            .find_campaign(campaign_id)
            .await?
            .ok_or(HeraldError::CampaignNotFound { id: campaign_id })?;

        if campaign.status == CampaignStatus::Sending {
            return Err(HeraldError::AlreadySending { id: campaign_id });
        }
        if !campaign.status.can_enqueue() {
            return Err(HeraldError::InvalidStatus { id: campaign_id, status: campaign.status });
        }

        let count = self.storage.count_audience(campaign.owner_id, campaign.audience.clone()).await?;
        if count == 0 {
            return Err(HeraldError::NoRecipients { id: campaign_id });
        }

        // A paused campaign already settled its sent and failed rows.
        let billable = if campaign.status == CampaignStatus::Paused {
            let counts = self.storage.recipient_counts(campaign_id).await?;
            (count - (counts.total() - counts.queued)).max(0)
        } else {
            count
        };
        let reservation = self.reserve(&campaign, billable).await?;
        let estimated = i32::try_from(count).unwrap_or(i32::MAX);

        if !self.storage.begin_sending(campaign_id, reservation.id, estimated).await? {
            warn!(campaign_id = %campaign_id, "lost status flip to a concurrent enqueue");
            return Err(HeraldError::AlreadySending { id: campaign_id });
        }

        let job = Job::CampaignSend(CampaignSendJob {
            campaign_id,
            reservation_id: reservation.id,
            cursor: None,
        });
        self.queue.publish(job, self.clock.now_utc()).await.map_err(|e| {
            HeraldError::Internal(format!("campaign {campaign_id} is sending but fan-out was not published: {e}"))
        })?;

        let record = self
            .storage
            .store_idempotency(IdempotencyRecord {
                campaign_id,
                idempotency_key: key.to_string(),
                queued: estimated,
                reservation_id: reservation.id,
                created_at: self.clock.now_utc(),
            })
            .await?;

        info!(
            campaign_id = %campaign_id,
            reservation_id = %reservation.id,
            queued = count,
            "campaign enqueued"
        );

        Ok(EnqueueOutcome {
            queued: i64::from(record.queued),
            reservation_id: record.reservation_id,
            replayed: false,
        })
    }

    async fn reserve(&self, campaign: &Campaign, count: i64) -> Result<CreditReservation, HeraldError> {
        let cost = count.saturating_mul(self.settings.per_message_cost);
        let outcome = self
            .ledger
            .reserve(
                campaign.owner_id,
                CreditReservation::key_for_campaign(campaign.id),
                cost,
                self.settings.reservation_ttl,
            )
            .await?;

        match outcome {
            ReserveOutcome::Reserved(reservation) => {
                info!(campaign_id = %campaign.id, reservation_id = %reservation.id, amount = cost, "credits reserved");
                Ok(reservation)
            },
            ReserveOutcome::Existing(reservation) => {
                info!(campaign_id = %campaign.id, reservation_id = %reservation.id, "reusing active reservation");
                Ok(reservation)
            },
            ReserveOutcome::Insufficient { required, available } => {
                warn!(campaign_id = %campaign.id, required, available, "insufficient credits for campaign");
                Err(HeraldError::InsufficientCredits { required, available })
            },
        }
    }
}
