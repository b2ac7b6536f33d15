//! Storage abstraction layer for the pipeline.
//!
//! Workers and services depend on [`PipelineStorage`] and [`JobQueue`]
//! rather than on PostgreSQL directly. Production wraps
//! `herald_core::storage::Storage`; tests use [`mock::MemoryBackend`], which
//! keeps the same guarded-transition semantics in memory.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use herald_core::{
    error::Result,
    storage::Storage,
    Campaign, CampaignId, CampaignStatus, Clock, Contact, ContactId, IdempotencyRecord, JobId,
    JobRecord, OwnerId, RecipientCounts, RecipientMessage, RecipientMessageId, RecipientStatus,
    ReservationId,
};

use crate::queue::{BoxFuture, Job, JobQueue, QueueName, SmsSendJob};

pub mod mock;

/// One fan-out step, applied atomically.
#[derive(Debug, Clone)]
pub struct FanoutChunk {
    /// The `campaign-send` job being processed.
    pub job_id: JobId,
    /// Campaign being fanned out.
    pub campaign_id: CampaignId,
    /// Reservation the sends settle against.
    pub reservation_id: ReservationId,
    /// Message body copied into every send job.
    pub body: String,
    /// Contacts in this chunk.
    pub contacts: Vec<Contact>,
    /// Payload stored on the fan-out job once the chunk is committed.
    pub checkpoint: Job,
}

impl FanoutChunk {
    /// Builds queued rows for the chunk's contacts.
    pub fn rows(&self, now: DateTime<Utc>) -> Vec<RecipientMessage> {
        self.contacts
            .iter()
            .map(|contact| RecipientMessage {
                id: RecipientMessageId::new(),
                campaign_id: self.campaign_id,
                contact_id: contact.id,
                phone: contact.phone.clone(),
                status: RecipientStatus::Queued,
                provider_message_id: None,
                credits_charged: 0,
                send_attempts: 0,
                last_error: None,
                created_at: now,
                updated_at: now,
                accepted_at: None,
            })
            .collect()
    }

    /// Send job for a newly inserted row.
    pub fn send_job(&self, row: &RecipientMessage) -> Job {
        Job::SmsSend(SmsSendJob {
            campaign_id: self.campaign_id,
            recipient_message_id: row.id,
            reservation_id: self.reservation_id,
            phone: row.phone.clone(),
            body: self.body.clone(),
        })
    }
}

/// Storage operations required by the pipeline.
pub trait PipelineStorage: Send + Sync + 'static {
    /// Finds a campaign.
    fn find_campaign(&self, id: CampaignId) -> BoxFuture<'_, Result<Option<Campaign>>>;

    /// Counts the audience selected by `tags`.
    fn count_audience(&self, owner_id: OwnerId, tags: Vec<String>) -> BoxFuture<'_, Result<i64>>;

    /// Next page of the audience after `after`, ordered by contact id.
    fn page_audience(
        &self,
        owner_id: OwnerId,
        tags: Vec<String>,
        after: Option<ContactId>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Contact>>>;

    /// CAS draft/scheduled/paused → sending.
    fn begin_sending(
        &self,
        id: CampaignId,
        reservation_id: ReservationId,
        estimated_recipients: i32,
    ) -> BoxFuture<'_, Result<bool>>;

    /// CAS `from` → `to`.
    fn transition_campaign(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Records fan-out completion and the actual recipient count.
    fn complete_fanout(&self, id: CampaignId, total_recipients: i32) -> BoxFuture<'_, Result<bool>>;

    /// CAS sending → completed/failed once fan-out is complete.
    fn finalize_campaign(&self, id: CampaignId, status: CampaignStatus) -> BoxFuture<'_, Result<bool>>;

    /// Campaigns currently sending.
    fn list_sending_campaigns(&self) -> BoxFuture<'_, Result<Vec<Campaign>>>;

    /// Stamps a manual reconcile request unless one happened within
    /// `cooldown`.
    fn claim_reconcile_slot(
        &self,
        id: CampaignId,
        cooldown: chrono::Duration,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Inserts the chunk's rows, publishes one send job per new row and
    /// checkpoints the fan-out job, all or nothing. Returns the number of
    /// rows inserted.
    fn fan_out_chunk(&self, chunk: FanoutChunk) -> BoxFuture<'_, Result<usize>>;

    /// Finds a recipient row.
    fn find_recipient(&self, id: RecipientMessageId) -> BoxFuture<'_, Result<Option<RecipientMessage>>>;

    /// Lists every row of a campaign.
    fn list_recipients(&self, campaign_id: CampaignId) -> BoxFuture<'_, Result<Vec<RecipientMessage>>>;

    /// queued → accepted.
    fn mark_accepted(
        &self,
        id: RecipientMessageId,
        provider_message_id: String,
        credits_charged: i32,
    ) -> BoxFuture<'_, Result<bool>>;

    /// queued → failedSend.
    fn mark_failed_send(&self, id: RecipientMessageId, error: String) -> BoxFuture<'_, Result<bool>>;

    /// Counts a retryable failure on a queued row.
    fn record_send_error(&self, id: RecipientMessageId, error: String) -> BoxFuture<'_, Result<()>>;

    /// accepted → delivered/failedDelivery.
    fn apply_delivery_status(
        &self,
        id: RecipientMessageId,
        status: RecipientStatus,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Accepted rows with a provider id, ordered by row id.
    fn accepted_page(
        &self,
        campaign_id: Option<CampaignId>,
        after: Option<RecipientMessageId>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<RecipientMessage>>>;

    /// Per-status tallies.
    fn recipient_counts(&self, campaign_id: CampaignId) -> BoxFuture<'_, Result<RecipientCounts>>;

    /// Most recent change to any row of the campaign.
    fn last_activity(&self, campaign_id: CampaignId) -> BoxFuture<'_, Result<Option<DateTime<Utc>>>>;

    /// Looks up an enqueue idempotency record.
    fn find_idempotency(
        &self,
        campaign_id: CampaignId,
        key: String,
    ) -> BoxFuture<'_, Result<Option<IdempotencyRecord>>>;

    /// Stores an idempotency record, returning the winner on a race.
    fn store_idempotency(&self, record: IdempotencyRecord) -> BoxFuture<'_, Result<IdempotencyRecord>>;

    /// Verifies the backend is reachable.
    fn ping(&self) -> BoxFuture<'_, Result<()>>;
}

/// Production adapter over `herald_core::storage::Storage`.
pub struct PostgresPipelineStorage {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresPipelineStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }
}

impl PipelineStorage for PostgresPipelineStorage {
    fn find_campaign(&self, id: CampaignId) -> BoxFuture<'_, Result<Option<Campaign>>> {
        Box::pin(async move { self.storage.campaigns.find_by_id(id).await })
    }

    fn count_audience(&self, owner_id: OwnerId, tags: Vec<String>) -> BoxFuture<'_, Result<i64>> {
        Box::pin(async move { self.storage.contacts.count_audience(owner_id, &tags).await })
    }

    fn page_audience(
        &self,
        owner_id: OwnerId,
        tags: Vec<String>,
        after: Option<ContactId>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Contact>>> {
        Box::pin(async move {
            self.storage.contacts.page_audience(owner_id, &tags, after, limit).await
        })
    }

    fn begin_sending(
        &self,
        id: CampaignId,
        reservation_id: ReservationId,
        estimated_recipients: i32,
    ) -> BoxFuture<'_, Result<bool>> {
        let now = self.now();
        Box::pin(async move {
            self.storage.campaigns.begin_sending(id, reservation_id, estimated_recipients, now).await
        })
    }

    fn transition_campaign(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> BoxFuture<'_, Result<bool>> {
        let now = self.now();
        Box::pin(async move { self.storage.campaigns.transition(id, from, to, now).await })
    }

    fn complete_fanout(&self, id: CampaignId, total_recipients: i32) -> BoxFuture<'_, Result<bool>> {
        let now = self.now();
        Box::pin(async move { self.storage.campaigns.complete_fanout(id, total_recipients, now).await })
    }

    fn finalize_campaign(&self, id: CampaignId, status: CampaignStatus) -> BoxFuture<'_, Result<bool>> {
        let now = self.now();
        Box::pin(async move { self.storage.campaigns.finalize(id, status, now).await })
    }

    fn list_sending_campaigns(&self) -> BoxFuture<'_, Result<Vec<Campaign>>> {
        Box::pin(async move { self.storage.campaigns.list_sending().await })
    }

    fn claim_reconcile_slot(
        &self,
        id: CampaignId,
        cooldown: chrono::Duration,
    ) -> BoxFuture<'_, Result<bool>> {
        let now = self.now();
        Box::pin(async move { self.storage.campaigns.claim_reconcile_slot(id, now, cooldown).await })
    }

    fn fan_out_chunk(&self, chunk: FanoutChunk) -> BoxFuture<'_, Result<usize>> {
        let now = self.now();
        Box::pin(async move {
            let checkpoint = serde_json::to_value(&chunk.checkpoint)?;
            let rows = chunk.rows(now);

            let mut tx = self.storage.begin().await?;

            let inserted = self.storage.recipient_messages.insert_batch_in_tx(&mut tx, &rows).await?;
            for row in &inserted {
                let payload = serde_json::to_value(chunk.send_job(row))?;
                self.storage
                    .jobs
                    .enqueue_in_tx(&mut tx, QueueName::SmsSend.as_str(), &payload, now, now)
                    .await?;
            }
            self.storage.jobs.checkpoint_in_tx(&mut tx, chunk.job_id, &checkpoint, now).await?;

            tx.commit().await?;

            Ok(inserted.len())
        })
    }

    fn find_recipient(&self, id: RecipientMessageId) -> BoxFuture<'_, Result<Option<RecipientMessage>>> {
        Box::pin(async move { self.storage.recipient_messages.find_by_id(id).await })
    }

    fn list_recipients(&self, campaign_id: CampaignId) -> BoxFuture<'_, Result<Vec<RecipientMessage>>> {
        Box::pin(async move { self.storage.recipient_messages.list_by_campaign(campaign_id).await })
    }

    fn mark_accepted(
        &self,
        id: RecipientMessageId,
        provider_message_id: String,
        credits_charged: i32,
    ) -> BoxFuture<'_, Result<bool>> {
        let now = self.now();
        Box::pin(async move {
            self.storage
                .recipient_messages
                .mark_accepted(id, &provider_message_id, credits_charged, now)
                .await
        })
    }

    fn mark_failed_send(&self, id: RecipientMessageId, error: String) -> BoxFuture<'_, Result<bool>> {
        let now = self.now();
        Box::pin(async move { self.storage.recipient_messages.mark_failed_send(id, &error, now).await })
    }

    fn record_send_error(&self, id: RecipientMessageId, error: String) -> BoxFuture<'_, Result<()>> {
        let now = self.now();
        Box::pin(async move { self.storage.recipient_messages.record_send_error(id, &error, now).await })
    }

    fn apply_delivery_status(
        &self,
        id: RecipientMessageId,
        status: RecipientStatus,
    ) -> BoxFuture<'_, Result<bool>> {
        let now = self.now();
        Box::pin(async move {
            self.storage.recipient_messages.apply_delivery_status(id, status, now).await
        })
    }

    fn accepted_page(
        &self,
        campaign_id: Option<CampaignId>,
        after: Option<RecipientMessageId>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<RecipientMessage>>> {
        Box::pin(async move {
            self.storage.recipient_messages.accepted_page(campaign_id, after, limit).await
        })
    }

    fn recipient_counts(&self, campaign_id: CampaignId) -> BoxFuture<'_, Result<RecipientCounts>> {
        Box::pin(async move { self.storage.recipient_messages.counts(campaign_id).await })
    }

    fn last_activity(&self, campaign_id: CampaignId) -> BoxFuture<'_, Result<Option<DateTime<Utc>>>> {
        Box::pin(async move { self.storage.recipient_messages.last_activity(campaign_id).await })
    }

    fn find_idempotency(
        &self,
        campaign_id: CampaignId,
        key: String,
    ) -> BoxFuture<'_, Result<Option<IdempotencyRecord>>> {
        Box::pin(async move { self.storage.idempotency.find(campaign_id, &key).await })
    }

    fn store_idempotency(&self, record: IdempotencyRecord) -> BoxFuture<'_, Result<IdempotencyRecord>> {
        Box::pin(async move { self.storage.idempotency.insert(&record).await })
    }

    fn ping(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.storage.health_check().await })
    }
}

impl JobQueue for PostgresPipelineStorage {
    fn publish(&self, job: Job, run_at: DateTime<Utc>) -> BoxFuture<'_, Result<JobId>> {
        let now = self.now();
        Box::pin(async move {
            let payload = serde_json::to_value(&job)?;
            self.storage.jobs.enqueue(job.queue().as_str(), &payload, run_at, now).await
        })
    }

    fn claim(
        &self,
        queue: QueueName,
        batch_size: usize,
        visibility: chrono::Duration,
    ) -> BoxFuture<'_, Result<Vec<JobRecord>>> {
        let now = self.now();
        Box::pin(async move {
            self.storage.jobs.claim(queue.as_str(), batch_size, now, visibility).await
        })
    }

    fn complete(&self, id: JobId) -> BoxFuture<'_, Result<()>> {
        let now = self.now();
        Box::pin(async move { self.storage.jobs.complete(id, now).await })
    }

    fn retry(
        &self,
        id: JobId,
        run_at: DateTime<Utc>,
        reason: Option<String>,
    ) -> BoxFuture<'_, Result<()>> {
        let now = self.now();
        Box::pin(async move { self.storage.jobs.reschedule(id, run_at, reason.as_deref(), now).await })
    }

    fn fail(&self, id: JobId, reason: String) -> BoxFuture<'_, Result<()>> {
        let now = self.now();
        Box::pin(async move { self.storage.jobs.fail(id, &reason, now).await })
    }
}
