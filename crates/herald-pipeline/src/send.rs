//! SMS send worker for the `sms-send` queue.
//!
//! One job sends one recipient message. Acceptance commits the message's
//! credit slice before the row flips to `accepted`, so the finalizer never
//! releases credits that a concurrent acceptance is about to commit. Failure
//! flips the row first and releases the slice only if this call won the
//! flip. Nothing reaches the provider unless an active reservation backs it.

use std::{sync::Arc, time::Duration};

use herald_core::{Clock, RecipientStatus, ReservationId, ReservationStatus, SettleOutcome};
use tracing::{debug, error, info, warn};

use crate::{
    error::{PipelineError, Result},
    finalize::CampaignFinalizer,
    ledger::CreditLedger,
    provider::{SendReceipt, SendRequest, SmsProvider},
    queue::{BoxFuture, ClaimedJob, Job, JobHandler, JobOutcome, SmsSendJob},
    rate_limit::RateLimiter,
    retry::{RetryContext, RetryDecision, RetryPolicy},
    storage::PipelineStorage,
};

/// Send tuning.
#[derive(Debug, Clone)]
pub struct SendSettings {
    /// Credits committed per accepted message.
    pub per_message_cost: i64,
    /// Upper bound on one provider call.
    pub provider_timeout: Duration,
    /// Backoff for retryable provider errors.
    pub retry_policy: RetryPolicy,
}

impl Default for SendSettings {
    fn default() -> Self {
        Self {
            per_message_cost: 1,
            provider_timeout: Duration::from_secs(10),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Error code recorded when no active reservation can pay for a message.
pub const RESERVATION_INACTIVE: &str = "RESERVATION_INACTIVE";

/// Handler for `sms-send` jobs.
pub struct SendHandler {
    storage: Arc<dyn PipelineStorage>,
    ledger: Arc<dyn CreditLedger>,
    provider: Arc<dyn SmsProvider>,
    finalizer: Arc<CampaignFinalizer>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    settings: SendSettings,
}

impl SendHandler {
    /// Creates a new send handler.
    pub fn new(
        storage: Arc<dyn PipelineStorage>,
        ledger: Arc<dyn CreditLedger>,
        provider: Arc<dyn SmsProvider>,
        finalizer: Arc<CampaignFinalizer>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
        settings: SendSettings,
    ) -> Self {
        Self { storage, ledger, provider, finalizer, limiter, clock, settings }
    }

    async fn send(&self, claimed: &ClaimedJob, job: SmsSendJob) -> Result<JobOutcome> {
        let Some(row) = self.storage.find_recipient(job.recipient_message_id).await? else {
            warn!(
                recipient_message_id = %job.recipient_message_id,
                job_id = %claimed.id,
                "send job for unknown recipient row"
            );
            return Ok(JobOutcome::Completed);
        };
        if row.status != RecipientStatus::Queued {
            debug!(
                recipient_message_id = %row.id,
                status = %row.status,
                "recipient already resolved, skipping send"
            );
            return Ok(JobOutcome::Completed);
        }

        let Some(reservation_id) = self.active_reservation(&job).await? else {
            warn!(
                campaign_id = %job.campaign_id,
                recipient_message_id = %job.recipient_message_id,
                reservation_id = %job.reservation_id,
                "no active reservation backs the send"
            );
            self.fail(&job, RESERVATION_INACTIVE.to_string()).await?;
            return Ok(JobOutcome::Completed);
        };
        let job = SmsSendJob { reservation_id, ..job };

        self.limiter.acquire().await;

        let request = SendRequest {
            phone: job.phone.clone(),
            body: job.body.clone(),
            reference: row.id.to_string(),
        };
        let result = match tokio::time::timeout(self.settings.provider_timeout, self.provider.send(request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::timeout(self.settings.provider_timeout.as_secs())),
        };

        match result {
            Ok(receipt) => self.accept(&job, receipt).await,
            Err(err) if err.is_retryable() => self.retry_or_give_up(claimed, &job, err).await,
            Err(err) => {
                warn!(
                    campaign_id = %job.campaign_id,
                    recipient_message_id = %job.recipient_message_id,
                    error = %err,
                    "permanent send failure"
                );
                self.fail(&job, err.code()).await?;
                Ok(JobOutcome::Completed)
            },
        }
    }

    /// The job's reservation if it is still active, otherwise the campaign's
    /// current one when that is active. Jobs published before a pause carry
    /// the reservation the campaign had then.
    async fn active_reservation(&self, job: &SmsSendJob) -> Result<Option<ReservationId>> {
        if self.is_active(job.reservation_id).await? {
            return Ok(Some(job.reservation_id));
        }
        let current = self.storage.find_campaign(job.campaign_id).await?.and_then(|c| c.reservation_id);
        match current {
            Some(id) if id != job.reservation_id && self.is_active(id).await? => {
                debug!(
                    campaign_id = %job.campaign_id,
                    stale = %job.reservation_id,
                    current = %id,
                    "charging the campaign's current reservation"
                );
                Ok(Some(id))
            },
            _ => Ok(None),
        }
    }

    async fn is_active(&self, reservation_id: ReservationId) -> Result<bool> {
        let reservation = self.ledger.find_reservation(reservation_id).await?;
        Ok(reservation.is_some_and(|r| r.status == ReservationStatus::Active))
    }

    async fn accept(&self, job: &SmsSendJob, receipt: SendReceipt) -> Result<JobOutcome> {
        let cost = self.settings.per_message_cost;
        let settled = self.ledger.commit(job.reservation_id, job.recipient_message_id, cost).await?;

        let credits_charged = match settled {
            SettleOutcome::Applied | SettleOutcome::AlreadySettled => {
                i32::try_from(cost).unwrap_or(i32::MAX)
            },
            SettleOutcome::Exceeded | SettleOutcome::Inactive => {
                error!(
                    campaign_id = %job.campaign_id,
                    reservation_id = %job.reservation_id,
                    recipient_message_id = %job.recipient_message_id,
                    outcome = ?settled,
                    "reservation refused commit for an accepted message"
                );
                0
            },
        };

        let marked = self
            .storage
            .mark_accepted(job.recipient_message_id, receipt.provider_message_id.clone(), credits_charged)
            .await?;
        if marked {
            info!(
                campaign_id = %job.campaign_id,
                recipient_message_id = %job.recipient_message_id,
                provider_message_id = %receipt.provider_message_id,
                credits_charged,
                "message accepted"
            );
        } else {
            warn!(
                recipient_message_id = %job.recipient_message_id,
                "recipient left queued while the send was in flight"
            );
        }

        self.finalizer.try_finalize(job.campaign_id).await?;
        Ok(JobOutcome::Completed)
    }

    async fn retry_or_give_up(
        &self,
        claimed: &ClaimedJob,
        job: &SmsSendJob,
        err: PipelineError,
    ) -> Result<JobOutcome> {
        let context = RetryContext::new(
            claimed.attempts,
            err.clone(),
            self.clock.now_utc(),
            self.settings.retry_policy.clone(),
        );

        match context.decide_retry() {
            RetryDecision::Retry { next_attempt_at } => {
                self.storage.record_send_error(job.recipient_message_id, err.code()).await?;
                warn!(
                    campaign_id = %job.campaign_id,
                    recipient_message_id = %job.recipient_message_id,
                    attempt = claimed.attempts,
                    next_attempt_at = %next_attempt_at,
                    error = %err,
                    "send failed, retrying"
                );
                Ok(JobOutcome::Retry { run_at: next_attempt_at, reason: err.to_string() })
            },
            RetryDecision::GiveUp { reason } => {
                warn!(
                    campaign_id = %job.campaign_id,
                    recipient_message_id = %job.recipient_message_id,
                    attempt = claimed.attempts,
                    reason = %reason,
                    "giving up on send"
                );
                self.fail(job, err.code()).await?;
                Ok(JobOutcome::Completed)
            },
        }
    }

    async fn fail(&self, job: &SmsSendJob, code: String) -> Result<()> {
        if self.storage.mark_failed_send(job.recipient_message_id, code).await? {
            let released = self
                .ledger
                .release(job.reservation_id, job.recipient_message_id, self.settings.per_message_cost)
                .await?;
            if !matches!(released, SettleOutcome::Applied | SettleOutcome::AlreadySettled) {
                warn!(
                    reservation_id = %job.reservation_id,
                    recipient_message_id = %job.recipient_message_id,
                    outcome = ?released,
                    "slice release not applied"
                );
            }
        }

        self.finalizer.try_finalize(job.campaign_id).await?;
        Ok(())
    }
}

impl JobHandler for SendHandler {
    fn handle<'a>(&'a self, claimed: &'a ClaimedJob, job: Job) -> BoxFuture<'a, Result<JobOutcome>> {
        Box::pin(async move {
            match job {
                Job::SmsSend(job) => self.send(claimed, job).await,
                other => Ok(JobOutcome::Failed {
                    reason: format!("unexpected {} payload on sms-send", other.queue()),
                }),
            }
        })
    }
}
