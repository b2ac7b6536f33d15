//! In-memory backend for testing.
//!
//! [`MemoryBackend`] implements [`PipelineStorage`], [`JobQueue`] and
//! [`CreditLedger`] over one shared state so tests can observe rows, jobs
//! and balances together. Every guarded transition mirrors the SQL `WHERE`
//! clause of the PostgreSQL repositories, and time comes from the injected
//! `Clock`.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use herald_core::{
    error::{CoreError, Result},
    Campaign, CampaignId, CampaignStatus, Clock, Contact, ContactId, CreditBalance,
    CreditReservation, IdempotencyRecord, JobId, JobRecord, JobStatus, OwnerId, RecipientCounts,
    RecipientMessage, RecipientMessageId, RecipientStatus, ReservationId, ReservationStatus,
    ReserveOutcome, SettleOutcome, SettlementKind,
};
use tokio::sync::RwLock;

use super::{FanoutChunk, PipelineStorage};
use crate::{
    ledger::CreditLedger,
    queue::{BoxFuture, Job, JobQueue, QueueName},
};

/// Operations that can be told to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    /// `JobQueue::publish`
    Publish,
    /// `JobQueue::claim`
    Claim,
    /// `PipelineStorage::fan_out_chunk`
    FanOutChunk,
    /// `PipelineStorage::mark_accepted`
    MarkAccepted,
    /// `PipelineStorage::count_audience`
    CountAudience,
    /// `CreditLedger::commit`
    Commit,
    /// `PipelineStorage::ping`
    Ping,
}

/// One settled slice of a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    /// Slice key (recipient message id).
    pub slice_key: String,
    /// Commit or release.
    pub kind: SettlementKind,
    /// Credits settled.
    pub amount: i64,
}

#[derive(Debug, Default)]
struct State {
    campaigns: HashMap<CampaignId, Campaign>,
    contacts: BTreeMap<ContactId, Contact>,
    recipients: BTreeMap<RecipientMessageId, RecipientMessage>,
    recipient_keys: HashSet<(CampaignId, ContactId)>,
    idempotency: HashMap<(CampaignId, String), IdempotencyRecord>,
    jobs: Vec<JobRecord>,
    balances: HashMap<OwnerId, CreditBalance>,
    reservations: HashMap<ReservationId, CreditReservation>,
    settlements: HashMap<ReservationId, Vec<SettlementRecord>>,
    failures: HashMap<FailPoint, (usize, String)>,
}

impl State {
    fn take_failure(&mut self, point: FailPoint) -> Result<()> {
        let Some((remaining, _)) = self.failures.get_mut(&point) else {
            return Ok(());
        };
        if *remaining > 1 {
            *remaining -= 1;
            return Ok(());
        }
        match self.failures.remove(&point) {
            Some((_, message)) => Err(CoreError::Database(message)),
            None => Ok(()),
        }
    }

    fn push_job(&mut self, job: &Job, run_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<JobId> {
        let record = JobRecord {
            id: JobId::new(),
            queue: job.queue().as_str().to_string(),
            payload: serde_json::to_value(job)?,
            status: JobStatus::Pending,
            attempts: 0,
            run_at,
            locked_until: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        let id = record.id;
        self.jobs.push(record);
        Ok(id)
    }

    fn job_mut(&mut self, id: JobId) -> Result<&mut JobRecord> {
        self.jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("job {id}")))
    }

    fn recipient_mut(
        &mut self,
        id: RecipientMessageId,
        expected: RecipientStatus,
    ) -> Option<&mut RecipientMessage> {
        self.recipients.get_mut(&id).filter(|row| row.status == expected)
    }

    fn balance_mut(&mut self, owner_id: OwnerId) -> &mut CreditBalance {
        self.balances.entry(owner_id).or_insert(CreditBalance { owner_id, balance: 0, reserved: 0 })
    }

    fn apply_settlement(
        &mut self,
        reservation_id: ReservationId,
        committed: i64,
        released: i64,
        closing_status: Option<ReservationStatus>,
    ) {
        let Some(reservation) = self.reservations.get_mut(&reservation_id) else {
            return;
        };
        reservation.committed += committed;
        reservation.released += released;
        reservation.status = match closing_status {
            Some(status) => status,
            None if reservation.unsettled() == 0 => reservation.settled_status(),
            None => ReservationStatus::Active,
        };
        let owner_id = reservation.owner_id;

        let balance = self.balance_mut(owner_id);
        balance.balance -= committed;
        balance.reserved -= committed + released;
    }
}

/// In-memory storage, queue and ledger.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<RwLock<State>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend").finish_non_exhaustive()
    }
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { state: Arc::new(RwLock::new(State::default())), clock }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }

    /// Stores a campaign as-is.
    pub async fn insert_campaign(&self, campaign: Campaign) {
        self.state.write().await.campaigns.insert(campaign.id, campaign);
    }

    /// Mutates a stored campaign in place.
    pub async fn update_campaign(&self, id: CampaignId, update: impl FnOnce(&mut Campaign)) {
        if let Some(campaign) = self.state.write().await.campaigns.get_mut(&id) {
            update(campaign);
        }
    }

    /// Stores a contact.
    pub async fn insert_contact(&self, contact: Contact) {
        self.state.write().await.contacts.insert(contact.id, contact);
    }

    /// Adds purchased credits to an owner.
    pub async fn credit(&self, owner_id: OwnerId, amount: i64) -> CreditBalance {
        let mut state = self.state.write().await;
        let balance = state.balance_mut(owner_id);
        balance.balance += amount;
        *balance
    }

    /// Makes the next call to `point` fail with a database error.
    pub async fn fail_next(&self, point: FailPoint, message: impl Into<String>) {
        self.fail_nth(point, 1, message).await;
    }

    /// Lets `nth - 1` calls to `point` through, then fails the next one.
    pub async fn fail_nth(&self, point: FailPoint, nth: usize, message: impl Into<String>) {
        self.state.write().await.failures.insert(point, (nth.max(1), message.into()));
    }

    /// Stores a job row with an arbitrary payload, bypassing encoding.
    pub async fn insert_raw_job(&self, queue: QueueName, payload: serde_json::Value) -> JobId {
        let now = self.now();
        let record = JobRecord {
            id: JobId::new(),
            queue: queue.as_str().to_string(),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            run_at: now,
            locked_until: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        let id = record.id;
        self.state.write().await.jobs.push(record);
        id
    }

    /// Current copy of a campaign.
    pub async fn campaign(&self, id: CampaignId) -> Option<Campaign> {
        self.state.read().await.campaigns.get(&id).cloned()
    }

    /// Every recipient row of a campaign.
    pub async fn recipients(&self, campaign_id: CampaignId) -> Vec<RecipientMessage> {
        self.state
            .read()
            .await
            .recipients
            .values()
            .filter(|row| row.campaign_id == campaign_id)
            .cloned()
            .collect()
    }

    /// Every job ever published to `queue`, in publish order.
    pub async fn jobs(&self, queue: QueueName) -> Vec<JobRecord> {
        self.state
            .read()
            .await
            .jobs
            .iter()
            .filter(|job| job.queue == queue.as_str())
            .cloned()
            .collect()
    }

    /// Jobs on `queue` that have not completed or failed.
    pub async fn open_jobs(&self, queue: QueueName) -> usize {
        self.state
            .read()
            .await
            .jobs
            .iter()
            .filter(|job| {
                job.queue == queue.as_str()
                    && matches!(job.status, JobStatus::Pending | JobStatus::Running)
            })
            .count()
    }

    /// Earliest `run_at` among pending jobs on any queue.
    pub async fn next_run_at(&self) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .await
            .jobs
            .iter()
            .filter(|job| job.status == JobStatus::Pending)
            .map(|job| job.run_at)
            .min()
    }

    /// Settlements recorded against a reservation.
    pub async fn settlements(&self, reservation_id: ReservationId) -> Vec<SettlementRecord> {
        self.state.read().await.settlements.get(&reservation_id).cloned().unwrap_or_default()
    }

    /// Every reservation held by an owner.
    pub async fn reservations_for(&self, owner_id: OwnerId) -> Vec<CreditReservation> {
        self.state
            .read()
            .await
            .reservations
            .values()
            .filter(|reservation| reservation.owner_id == owner_id)
            .cloned()
            .collect()
    }
}

impl PipelineStorage for MemoryBackend {
    fn find_campaign(&self, id: CampaignId) -> BoxFuture<'_, Result<Option<Campaign>>> {
        Box::pin(async move { Ok(self.state.read().await.campaigns.get(&id).cloned()) })
    }

    fn count_audience(&self, owner_id: OwnerId, tags: Vec<String>) -> BoxFuture<'_, Result<i64>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.take_failure(FailPoint::CountAudience)?;
            let count = state
                .contacts
                .values()
                .filter(|contact| contact.matches_audience(owner_id, &tags))
                .count();
            Ok(i64::try_from(count).unwrap_or(i64::MAX))
        })
    }

    fn page_audience(
        &self,
        owner_id: OwnerId,
        tags: Vec<String>,
        after: Option<ContactId>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Contact>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .contacts
                .values()
                .filter(|contact| after.is_none_or(|after| contact.id > after))
                .filter(|contact| contact.matches_audience(owner_id, &tags))
                .take(limit)
                .cloned()
                .collect())
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
            let mut state = self.state.write().await;
            let Some(campaign) = state.campaigns.get_mut(&id) else {
                return Ok(false);
            };
            if !campaign.status.can_enqueue() {
                return Ok(false);
            }
            campaign.status = CampaignStatus::Sending;
            campaign.reservation_id = Some(reservation_id);
            campaign.total_recipients = estimated_recipients;
            campaign.started_at = campaign.started_at.or(Some(now));
            campaign.fanout_completed_at = None;
            campaign.finished_at = None;
            campaign.updated_at = now;
            Ok(true)
        })
    }

    fn transition_campaign(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> BoxFuture<'_, Result<bool>> {
        let now = self.now();
        Box::pin(async move {
            let mut state = self.state.write().await;
            match state.campaigns.get_mut(&id) {
                Some(campaign) if campaign.status == from => {
                    campaign.status = to;
                    campaign.updated_at = now;
                    Ok(true)
                },
                _ => Ok(false),
            }
        })
    }

    fn complete_fanout(&self, id: CampaignId, total_recipients: i32) -> BoxFuture<'_, Result<bool>> {
        let now = self.now();
        Box::pin(async move {
            let mut state = self.state.write().await;
            match state.campaigns.get_mut(&id) {
                Some(campaign) if campaign.status == CampaignStatus::Sending => {
                    campaign.fanout_completed_at = Some(now);
                    campaign.total_recipients = total_recipients;
                    campaign.updated_at = now;
                    Ok(true)
                },
                _ => Ok(false),
            }
        })
    }

    fn finalize_campaign(&self, id: CampaignId, status: CampaignStatus) -> BoxFuture<'_, Result<bool>> {
        let now = self.now();
        Box::pin(async move {
            let mut state = self.state.write().await;
            match state.campaigns.get_mut(&id) {
                Some(campaign)
                    if campaign.status == CampaignStatus::Sending
                        && campaign.fanout_completed_at.is_some() =>
                {
                    campaign.status = status;
                    campaign.finished_at = Some(now);
                    campaign.updated_at = now;
                    Ok(true)
                },
                _ => Ok(false),
            }
        })
    }

    fn list_sending_campaigns(&self) -> BoxFuture<'_, Result<Vec<Campaign>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut sending: Vec<Campaign> = state
                .campaigns
                .values()
                .filter(|campaign| campaign.status == CampaignStatus::Sending)
                .cloned()
                .collect();
            sending.sort_by_key(|campaign| campaign.started_at);
            Ok(sending)
        })
    }

    fn claim_reconcile_slot(
        &self,
        id: CampaignId,
        cooldown: chrono::Duration,
    ) -> BoxFuture<'_, Result<bool>> {
        let now = self.now();
        Box::pin(async move {
            let mut state = self.state.write().await;
            let Some(campaign) = state.campaigns.get_mut(&id) else {
                return Ok(false);
            };
            if campaign.last_reconcile_requested_at.is_some_and(|last| last > now - cooldown) {
                return Ok(false);
            }
            campaign.last_reconcile_requested_at = Some(now);
            Ok(true)
        })
    }

    fn fan_out_chunk(&self, chunk: FanoutChunk) -> BoxFuture<'_, Result<usize>> {
        let now = self.now();
        Box::pin(async move {
            let checkpoint = serde_json::to_value(&chunk.checkpoint)?;
            let mut state = self.state.write().await;
            state.take_failure(FailPoint::FanOutChunk)?;
            state.job_mut(chunk.job_id)?;

            let mut inserted = 0;
            for row in chunk.rows(now) {
                if !state.recipient_keys.insert((row.campaign_id, row.contact_id)) {
                    continue;
                }
                state.push_job(&chunk.send_job(&row), now, now)?;
                state.recipients.insert(row.id, row);
                inserted += 1;
            }

            let job = state.job_mut(chunk.job_id)?;
            job.payload = checkpoint;
            job.updated_at = now;

            Ok(inserted)
        })
    }

    fn find_recipient(&self, id: RecipientMessageId) -> BoxFuture<'_, Result<Option<RecipientMessage>>> {
        Box::pin(async move { Ok(self.state.read().await.recipients.get(&id).cloned()) })
    }

    fn list_recipients(&self, campaign_id: CampaignId) -> BoxFuture<'_, Result<Vec<RecipientMessage>>> {
        Box::pin(async move { Ok(self.recipients(campaign_id).await) })
    }

    fn mark_accepted(
        &self,
        id: RecipientMessageId,
        provider_message_id: String,
        credits_charged: i32,
    ) -> BoxFuture<'_, Result<bool>> {
        let now = self.now();
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.take_failure(FailPoint::MarkAccepted)?;
            let Some(row) = state.recipient_mut(id, RecipientStatus::Queued) else {
                return Ok(false);
            };
            row.status = RecipientStatus::Accepted;
            row.provider_message_id = Some(provider_message_id);
            row.credits_charged = credits_charged;
            row.accepted_at = Some(now);
            row.updated_at = now;
            Ok(true)
        })
    }

    fn mark_failed_send(&self, id: RecipientMessageId, error: String) -> BoxFuture<'_, Result<bool>> {
        let now = self.now();
        Box::pin(async move {
            let mut state = self.state.write().await;
            let Some(row) = state.recipient_mut(id, RecipientStatus::Queued) else {
                return Ok(false);
            };
            row.status = RecipientStatus::FailedSend;
            row.last_error = Some(error);
            row.updated_at = now;
            Ok(true)
        })
    }

    fn record_send_error(&self, id: RecipientMessageId, error: String) -> BoxFuture<'_, Result<()>> {
        let now = self.now();
        Box::pin(async move {
            let mut state = self.state.write().await;
            if let Some(row) = state.recipient_mut(id, RecipientStatus::Queued) {
                row.send_attempts += 1;
                row.last_error = Some(error);
                row.updated_at = now;
            }
            Ok(())
        })
    }

    fn apply_delivery_status(
        &self,
        id: RecipientMessageId,
        status: RecipientStatus,
    ) -> BoxFuture<'_, Result<bool>> {
        let now = self.now();
        Box::pin(async move {
            let mut state = self.state.write().await;
            let Some(row) = state.recipient_mut(id, RecipientStatus::Accepted) else {
                return Ok(false);
            };
            row.status = status;
            row.updated_at = now;
            Ok(true)
        })
    }

    fn accepted_page(
        &self,
        campaign_id: Option<CampaignId>,
        after: Option<RecipientMessageId>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<RecipientMessage>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .recipients
                .values()
                .filter(|row| after.is_none_or(|after| row.id > after))
                .filter(|row| {
                    row.status == RecipientStatus::Accepted && row.provider_message_id.is_some()
                })
                .filter(|row| campaign_id.is_none_or(|campaign_id| row.campaign_id == campaign_id))
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn recipient_counts(&self, campaign_id: CampaignId) -> BoxFuture<'_, Result<RecipientCounts>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut counts = RecipientCounts::default();
            for row in state.recipients.values().filter(|row| row.campaign_id == campaign_id) {
                counts.record(row.status);
            }
            Ok(counts)
        })
    }

    fn last_activity(&self, campaign_id: CampaignId) -> BoxFuture<'_, Result<Option<DateTime<Utc>>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .recipients
                .values()
                .filter(|row| row.campaign_id == campaign_id)
                .map(|row| row.updated_at)
                .max())
        })
    }

    fn find_idempotency(
        &self,
        campaign_id: CampaignId,
        key: String,
    ) -> BoxFuture<'_, Result<Option<IdempotencyRecord>>> {
        Box::pin(async move {
            Ok(self.state.read().await.idempotency.get(&(campaign_id, key)).cloned())
        })
    }

    fn store_idempotency(&self, record: IdempotencyRecord) -> BoxFuture<'_, Result<IdempotencyRecord>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let stored = state
                .idempotency
                .entry((record.campaign_id, record.idempotency_key.clone()))
                .or_insert(record);
            Ok(stored.clone())
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.state.write().await.take_failure(FailPoint::Ping) })
    }
}

impl JobQueue for MemoryBackend {
    fn publish(&self, job: Job, run_at: DateTime<Utc>) -> BoxFuture<'_, Result<JobId>> {
        let now = self.now();
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.take_failure(FailPoint::Publish)?;
            state.push_job(&job, run_at, now)
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
            let mut state = self.state.write().await;
            state.take_failure(FailPoint::Claim)?;

            let mut due: Vec<usize> = state
                .jobs
                .iter()
                .enumerate()
                .filter(|(_, job)| job.queue == queue.as_str())
                .filter(|(_, job)| match job.status {
                    JobStatus::Pending => job.run_at <= now,
                    JobStatus::Running => job.locked_until.is_some_and(|until| until <= now),
                    JobStatus::Completed | JobStatus::Failed => false,
                })
                .map(|(index, _)| index)
                .collect();
            due.sort_by_key(|index| state.jobs[*index].run_at);
            due.truncate(batch_size);

            let mut claimed = Vec::with_capacity(due.len());
            for index in due {
                let job = &mut state.jobs[index];
                job.status = JobStatus::Running;
                job.attempts += 1;
                job.locked_until = Some(now + visibility);
                job.updated_at = now;
                claimed.push(job.clone());
            }
            Ok(claimed)
        })
    }

    fn complete(&self, id: JobId) -> BoxFuture<'_, Result<()>> {
        let now = self.now();
        Box::pin(async move {
            let mut state = self.state.write().await;
            let job = state.job_mut(id)?;
            job.status = JobStatus::Completed;
            job.locked_until = None;
            job.updated_at = now;
            Ok(())
        })
    }

    fn retry(
        &self,
        id: JobId,
        run_at: DateTime<Utc>,
        reason: Option<String>,
    ) -> BoxFuture<'_, Result<()>> {
        let now = self.now();
        Box::pin(async move {
            let mut state = self.state.write().await;
            let job = state.job_mut(id)?;
            job.status = JobStatus::Pending;
            job.run_at = run_at;
            job.locked_until = None;
            if reason.is_some() {
                job.last_error = reason;
            }
            job.updated_at = now;
            Ok(())
        })
    }

    fn fail(&self, id: JobId, reason: String) -> BoxFuture<'_, Result<()>> {
        let now = self.now();
        Box::pin(async move {
            let mut state = self.state.write().await;
            let job = state.job_mut(id)?;
            job.status = JobStatus::Failed;
            job.locked_until = None;
            job.last_error = Some(reason);
            job.updated_at = now;
            Ok(())
        })
    }
}

impl MemoryBackend {
    fn settle(
        &self,
        reservation_id: ReservationId,
        slice: RecipientMessageId,
        kind: SettlementKind,
        amount: i64,
    ) -> BoxFuture<'_, Result<SettleOutcome>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if kind == SettlementKind::Commit {
                state.take_failure(FailPoint::Commit)?;
            }

            let Some(reservation) = state.reservations.get(&reservation_id).cloned() else {
                return Ok(SettleOutcome::Inactive);
            };
            let slice_key = slice.to_string();
            let already = state
                .settlements
                .get(&reservation_id)
                .is_some_and(|slices| slices.iter().any(|s| s.slice_key == slice_key));
            if already {
                return Ok(SettleOutcome::AlreadySettled);
            }
            if reservation.status != ReservationStatus::Active {
                return Ok(SettleOutcome::Inactive);
            }
            if amount > reservation.unsettled() {
                return Ok(SettleOutcome::Exceeded);
            }

            state
                .settlements
                .entry(reservation_id)
                .or_default()
                .push(SettlementRecord { slice_key, kind, amount });
            let (committed, released) = match kind {
                SettlementKind::Commit => (amount, 0),
                SettlementKind::Release => (0, amount),
            };
            state.apply_settlement(reservation_id, committed, released, None);

            Ok(SettleOutcome::Applied)
        })
    }
}

impl CreditLedger for MemoryBackend {
    fn reserve(
        &self,
        owner_id: OwnerId,
        key: String,
        amount: i64,
        ttl: chrono::Duration,
    ) -> BoxFuture<'_, Result<ReserveOutcome>> {
        let now = self.now();
        Box::pin(async move {
            let mut state = self.state.write().await;

            let existing = state.reservations.values().find(|reservation| {
                reservation.reservation_key == key && reservation.status == ReservationStatus::Active
            });
            if let Some(existing) = existing {
                return Ok(ReserveOutcome::Existing(existing.clone()));
            }

            let available = state.balances.get(&owner_id).map_or(0, CreditBalance::available);
            if available < amount {
                return Ok(ReserveOutcome::Insufficient { required: amount, available });
            }

            state.balance_mut(owner_id).reserved += amount;
            let reservation = CreditReservation {
                id: ReservationId::new(),
                owner_id,
                reservation_key: key,
                amount,
                committed: 0,
                released: 0,
                status: ReservationStatus::Active,
                created_at: now,
                expires_at: now + ttl,
            };
            state.reservations.insert(reservation.id, reservation.clone());

            Ok(ReserveOutcome::Reserved(reservation))
        })
    }

    fn commit(
        &self,
        reservation_id: ReservationId,
        slice: RecipientMessageId,
        amount: i64,
    ) -> BoxFuture<'_, Result<SettleOutcome>> {
        self.settle(reservation_id, slice, SettlementKind::Commit, amount)
    }

    fn release(
        &self,
        reservation_id: ReservationId,
        slice: RecipientMessageId,
        amount: i64,
    ) -> BoxFuture<'_, Result<SettleOutcome>> {
        self.settle(reservation_id, slice, SettlementKind::Release, amount)
    }

    fn release_remaining(&self, reservation_id: ReservationId) -> BoxFuture<'_, Result<i64>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let Some(reservation) = state.reservations.get(&reservation_id) else {
                return Ok(0);
            };
            if reservation.status != ReservationStatus::Active {
                return Ok(0);
            }
            let remaining = reservation.unsettled();
            state.apply_settlement(reservation_id, 0, remaining, None);
            Ok(remaining)
        })
    }

    fn expire_due(&self) -> BoxFuture<'_, Result<Vec<ReservationId>>> {
        let now = self.now();
        Box::pin(async move {
            let mut state = self.state.write().await;
            let mut due: Vec<(DateTime<Utc>, ReservationId, i64)> = state
                .reservations
                .values()
                .filter(|r| r.status == ReservationStatus::Active && r.expires_at < now)
                .map(|r| (r.expires_at, r.id, r.unsettled()))
                .collect();
            due.sort();

            let mut expired = Vec::with_capacity(due.len());
            for (_, id, remaining) in due {
                state.apply_settlement(id, 0, remaining, Some(ReservationStatus::Expired));
                expired.push(id);
            }
            Ok(expired)
        })
    }

    fn find_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> BoxFuture<'_, Result<Option<CreditReservation>>> {
        Box::pin(async move { Ok(self.state.read().await.reservations.get(&reservation_id).cloned()) })
    }

    fn balance(&self, owner_id: OwnerId) -> BoxFuture<'_, Result<CreditBalance>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .balances
                .get(&owner_id)
                .copied()
                .unwrap_or(CreditBalance { owner_id, balance: 0, reserved: 0 }))
        })
    }
}

#[cfg(test)]
mod tests {
    use herald_core::TestClock;

    use super::*;
    use crate::queue::ReconciliationJob;

    fn backend() -> MemoryBackend {
        MemoryBackend::new(Arc::new(TestClock::new()))
    }

    #[tokio::test]
    async fn reserve_settle_and_release_remaining() {
        let backend = backend();
        let owner = OwnerId::new();
        backend.credit(owner, 10).await;

        let ReserveOutcome::Reserved(reservation) = backend
            .reserve(owner, "campaign:a".into(), 4, chrono::Duration::hours(1))
            .await
            .unwrap()
        else {
            panic!("expected a new reservation");
        };
        assert_eq!(backend.balance(owner).await.unwrap().available(), 6);

        let slice = RecipientMessageId::new();
        assert_eq!(backend.commit(reservation.id, slice, 1).await.unwrap(), SettleOutcome::Applied);
        assert_eq!(
            backend.commit(reservation.id, slice, 1).await.unwrap(),
            SettleOutcome::AlreadySettled
        );
        assert_eq!(
            backend.release(reservation.id, RecipientMessageId::new(), 9).await.unwrap(),
            SettleOutcome::Exceeded
        );

        assert_eq!(backend.release_remaining(reservation.id).await.unwrap(), 3);
        let balance = backend.balance(owner).await.unwrap();
        assert_eq!(balance.balance, 9);
        assert_eq!(balance.reserved, 0);

        let closed = backend.find_reservation(reservation.id).await.unwrap().unwrap();
        assert_eq!(closed.status, ReservationStatus::Committed);
    }

    #[tokio::test]
    async fn second_reserve_with_same_key_returns_existing() {
        let backend = backend();
        let owner = OwnerId::new();
        backend.credit(owner, 10).await;

        backend.reserve(owner, "k".into(), 5, chrono::Duration::hours(1)).await.unwrap();
        let again = backend.reserve(owner, "k".into(), 5, chrono::Duration::hours(1)).await.unwrap();

        assert!(matches!(again, ReserveOutcome::Existing(_)));
        assert_eq!(backend.balance(owner).await.unwrap().reserved, 5);
    }

    #[tokio::test]
    async fn claimed_jobs_are_hidden_until_visibility_lapses() {
        let clock = Arc::new(TestClock::new());
        let backend = MemoryBackend::new(clock.clone());
        backend
            .publish(Job::Reconciliation(ReconciliationJob {}), clock.now_utc())
            .await
            .unwrap();

        let visibility = chrono::Duration::seconds(30);
        let first = backend.claim(QueueName::Reconciliation, 10, visibility).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(backend.claim(QueueName::Reconciliation, 10, visibility).await.unwrap().is_empty());

        clock.advance(std::time::Duration::from_secs(31));
        let again = backend.claim(QueueName::Reconciliation, 10, visibility).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 2);
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let backend = backend();
        backend.fail_next(FailPoint::Publish, "queue down").await;

        let job = Job::Reconciliation(ReconciliationJob {});
        assert!(backend.publish(job.clone(), Utc::now()).await.is_err());
        assert!(backend.publish(job, Utc::now()).await.is_ok());
    }
}
