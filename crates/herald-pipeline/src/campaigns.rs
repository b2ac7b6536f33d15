//! Operator controls: pause, resume, manual reconcile and status.

use std::sync::Arc;

use herald_core::{
    Campaign, CampaignId, CampaignStatus, Clock, CreditReservation, HeraldError, ReservationId,
    ReservationStatus, ReserveOutcome,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    enqueue::EnqueueSettings,
    ledger::CreditLedger,
    queue::{CampaignSendJob, DeliveryStatusJob, Job, JobQueue},
    status::CampaignStatusDocument,
    storage::PipelineStorage,
};

/// Answer to a manual reconcile request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    /// Whether a poll was published.
    pub queued: bool,
    /// Seconds until another request will be accepted; zero when queued.
    pub retry_after_seconds: i64,
}

/// Campaign controls exposed over HTTP.
pub struct CampaignService {
    storage: Arc<dyn PipelineStorage>,
    ledger: Arc<dyn CreditLedger>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    pricing: EnqueueSettings,
    reconcile_cooldown: chrono::Duration,
}

impl CampaignService {
    /// Creates a new service.
    pub fn new(
        storage: Arc<dyn PipelineStorage>,
        ledger: Arc<dyn CreditLedger>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        pricing: EnqueueSettings,
        reconcile_cooldown: chrono::Duration,
    ) -> Self {
        Self { storage, ledger, queue, clock, pricing, reconcile_cooldown }
    }

    async fn load(&self, id: CampaignId) -> Result<Campaign, HeraldError> {
        self.storage.find_campaign(id).await?.ok_or(HeraldError::CampaignNotFound { id })
    }

    /// Stops further fan-out. Send jobs already published still run.
    ///
    /// # Errors
    ///
    /// `CampaignNotFound`, or `InvalidStatus` unless the campaign is sending.
    pub async fn pause(&self, id: CampaignId) -> Result<Campaign, HeraldError> {
        if !self.storage.transition_campaign(id, CampaignStatus::Sending, CampaignStatus::Paused).await? {
            let campaign = self.load(id).await?;
            return Err(HeraldError::InvalidStatus { id, status: campaign.status });
        }
        info!(campaign_id = %id, "campaign paused");
        self.load(id).await
    }

    /// Resumes a paused campaign. Fan-out restarts from the first contact;
    /// rows that already exist are skipped. A reservation that lapsed while
    /// the campaign was paused is replaced before the status flips.
    ///
    /// # Errors
    ///
    /// `CampaignNotFound`, `InvalidStatus` unless the campaign is paused,
    /// `InsufficientCredits` if a lapsed reservation cannot be replaced, or
    /// `Internal` if it has no reservation or the fan-out job cannot be
    /// published.
    pub async fn resume(&self, id: CampaignId) -> Result<Campaign, HeraldError> {
        let campaign = self.load(id).await?;
        if campaign.status != CampaignStatus::Paused {
            return Err(HeraldError::InvalidStatus { id, status: campaign.status });
        }
        let Some(reservation_id) = campaign.reservation_id else {
            return Err(HeraldError::Internal(format!("paused campaign {id} has no reservation")));
        };

        let active = self
            .ledger
            .find_reservation(reservation_id)
            .await?
            .is_some_and(|r| r.status == ReservationStatus::Active);

        let (reservation_id, flipped) = if active {
            let flipped =
                self.storage.transition_campaign(id, CampaignStatus::Paused, CampaignStatus::Sending).await?;
            (reservation_id, flipped)
        } else {
            let replacement = self.replace_reservation(&campaign, reservation_id).await?;
            let flipped = self.storage.begin_sending(id, replacement, campaign.total_recipients).await?;
            (replacement, flipped)
        };
        if !flipped {
            let campaign = self.load(id).await?;
            return Err(HeraldError::InvalidStatus { id, status: campaign.status });
        }

        let job = Job::CampaignSend(CampaignSendJob { campaign_id: id, reservation_id, cursor: None });
        self.queue.publish(job, self.clock.now_utc()).await.map_err(|e| {
            HeraldError::Internal(format!("campaign {id} resumed but fan-out was not published: {e}"))
        })?;

        info!(campaign_id = %id, reservation_id = %reservation_id, "campaign resumed");
        self.load(id).await
    }

    /// Reserves credits for every recipient not yet sent or failed.
    async fn replace_reservation(
        &self,
        campaign: &Campaign,
        lapsed: ReservationId,
    ) -> Result<ReservationId, HeraldError> {
        let audience = self.storage.count_audience(campaign.owner_id, campaign.audience.clone()).await?;
        let counts = self.storage.recipient_counts(campaign.id).await?;
        let unsettled = (audience - (counts.total() - counts.queued)).max(0);
        let cost = unsettled.saturating_mul(self.pricing.per_message_cost);

        let outcome = self
            .ledger
            .reserve(
                campaign.owner_id,
                CreditReservation::key_for_campaign(campaign.id),
                cost,
                self.pricing.reservation_ttl,
            )
            .await?;

        match outcome {
            ReserveOutcome::Reserved(reservation) | ReserveOutcome::Existing(reservation) => {
                info!(
                    campaign_id = %campaign.id,
                    lapsed = %lapsed,
                    reservation_id = %reservation.id,
                    amount = reservation.amount,
                    "replaced lapsed reservation"
                );
                Ok(reservation.id)
            },
            ReserveOutcome::Insufficient { required, available } => {
                warn!(campaign_id = %campaign.id, required, available, "cannot resume without credits");
                Err(HeraldError::InsufficientCredits { required, available })
            },
        }
    }

    /// Publishes a per-campaign delivery poll, rate limited by the
    /// reconcile cooldown.
    ///
    /// # Errors
    ///
    /// `CampaignNotFound`, or `Storage` on backend failures.
    pub async fn request_reconcile(&self, id: CampaignId) -> Result<ReconcileRequest, HeraldError> {
        let campaign = self.load(id).await?;
        let now = self.clock.now_utc();

        if !self.storage.claim_reconcile_slot(id, self.reconcile_cooldown).await? {
            let elapsed = campaign
                .last_reconcile_requested_at
                .map_or(self.reconcile_cooldown, |last| now - last);
            let remaining = (self.reconcile_cooldown - elapsed).num_seconds().max(1);
            return Ok(ReconcileRequest { queued: false, retry_after_seconds: remaining });
        }

        self.queue
            .publish(Job::DeliveryStatusUpdate(DeliveryStatusJob { campaign_id: Some(id) }), now)
            .await?;
        info!(campaign_id = %id, "manual reconcile queued");

        Ok(ReconcileRequest { queued: true, retry_after_seconds: 0 })
    }

    /// Builds the status document.
    ///
    /// # Errors
    ///
    /// `CampaignNotFound`, or `Storage` on backend failures.
    pub async fn status(&self, id: CampaignId) -> Result<CampaignStatusDocument, HeraldError> {
        let campaign = self.load(id).await?;
        let counts = self.storage.recipient_counts(id).await?;
        Ok(CampaignStatusDocument::build(&campaign, counts))
    }
}
