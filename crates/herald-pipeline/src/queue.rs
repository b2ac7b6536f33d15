//! Job payloads, queue names and the handler table.
//!
//! Every job is one variant of the tagged [`Job`] enum and is serialized with
//! a `kind` discriminator, so a payload can always be routed without
//! inspecting its fields. Handlers are registered explicitly per queue in a
//! [`HandlerTable`]; a queue without a handler fails its jobs with
//! `NO_HANDLER` instead of silently dropping them.

use std::{collections::HashMap, fmt, future::Future, pin::Pin, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use herald_core::{
    CampaignId, ContactId, JobId, JobRecord, RecipientMessageId, ReservationId,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PipelineError, Result};

/// Boxed future returned by queue and storage traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Fan out a campaign's audience into per-recipient send jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignSendJob {
    /// Campaign to fan out.
    pub campaign_id: CampaignId,
    /// Reservation the sends settle against.
    pub reservation_id: ReservationId,
    /// Last contact already fanned out; `None` starts from the beginning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<ContactId>,
}

/// Send one message to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsSendJob {
    /// Parent campaign.
    pub campaign_id: CampaignId,
    /// Row to send.
    pub recipient_message_id: RecipientMessageId,
    /// Reservation to commit against on acceptance.
    pub reservation_id: ReservationId,
    /// Destination phone number.
    pub phone: String,
    /// Message body.
    pub body: String,
}

/// Poll the provider for delivery receipts.
///
/// With a campaign id this polls one campaign; without one it sweeps every
/// accepted row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStatusJob {
    /// Campaign to poll, or `None` for the global sweep.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<CampaignId>,
}

/// Periodic maintenance: stuck campaigns and reservation expiry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationJob {}

/// Automation event for a contact. Consumed outside this pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationTriggerJob {
    /// Automation to run.
    pub automation_id: Uuid,
    /// Contact the automation applies to.
    pub contact_id: ContactId,
    /// Triggering event name.
    pub event: String,
}

/// Tagged job payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Job {
    /// `campaign-send`
    CampaignSend(CampaignSendJob),
    /// `sms-send`
    SmsSend(SmsSendJob),
    /// `delivery-status-update`
    DeliveryStatusUpdate(DeliveryStatusJob),
    /// `reconciliation`
    Reconciliation(ReconciliationJob),
    /// `automation-trigger`
    AutomationTrigger(AutomationTriggerJob),
}

impl Job {
    /// Queue the job is published to.
    pub const fn queue(&self) -> QueueName {
        match self {
            Self::CampaignSend(_) => QueueName::CampaignSend,
            Self::SmsSend(_) => QueueName::SmsSend,
            Self::DeliveryStatusUpdate(_) => QueueName::DeliveryStatusUpdate,
            Self::Reconciliation(_) => QueueName::Reconciliation,
            Self::AutomationTrigger(_) => QueueName::AutomationTrigger,
        }
    }

    /// Serializes the payload for storage.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parses a stored payload.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not a known job.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        Ok(Self::deserialize(payload)?)
    }
}

/// Named queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueName {
    /// Audience fan-out.
    CampaignSend,
    /// Per-recipient provider sends.
    SmsSend,
    /// Delivery receipt polling.
    DeliveryStatusUpdate,
    /// Maintenance sweeps.
    Reconciliation,
    /// Automation triggers.
    AutomationTrigger,
}

impl QueueName {
    /// Every queue.
    pub const ALL: [Self; 5] = [
        Self::CampaignSend,
        Self::SmsSend,
        Self::DeliveryStatusUpdate,
        Self::Reconciliation,
        Self::AutomationTrigger,
    ];

    /// Persisted name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CampaignSend => "campaign-send",
            Self::SmsSend => "sms-send",
            Self::DeliveryStatusUpdate => "delivery-status-update",
            Self::Reconciliation => "reconciliation",
            Self::AutomationTrigger => "automation-trigger",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|queue| queue.as_str() == s)
            .ok_or_else(|| PipelineError::internal(format!("unknown queue: {s}")))
    }
}

/// A job claimed from a queue, payload not yet decoded.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    /// Job id.
    pub id: JobId,
    /// Queue the job was claimed from.
    pub queue: QueueName,
    /// Number of times the job has been claimed, including this one.
    pub attempts: u32,
    /// Raw payload.
    pub payload: serde_json::Value,
}

impl ClaimedJob {
    /// Decodes the payload.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is malformed.
    pub fn decode(&self) -> Result<Job> {
        Job::from_payload(&self.payload)
    }
}

impl TryFrom<JobRecord> for ClaimedJob {
    type Error = PipelineError;

    fn try_from(record: JobRecord) -> Result<Self> {
        Ok(Self {
            id: record.id,
            queue: record.queue.parse()?,
            attempts: u32::try_from(record.attempts).unwrap_or(0),
            payload: record.payload,
        })
    }
}

/// What a handler decided about a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Done; remove from the queue.
    Completed,
    /// Run again at `run_at`.
    Retry {
        /// When to run again
        run_at: DateTime<Utc>,
        /// Why the job is being retried
        reason: String,
    },
    /// Give up and keep the job for inspection.
    Failed {
        /// Why the job failed
        reason: String,
    },
}

/// Consumer for one queue.
pub trait JobHandler: Send + Sync + 'static {
    /// Processes one decoded job.
    ///
    /// Errors are treated as transient by the worker and the job is retried
    /// with backoff; permanent failures are expressed as
    /// [`JobOutcome::Failed`].
    fn handle<'a>(&'a self, claimed: &'a ClaimedJob, job: Job) -> BoxFuture<'a, Result<JobOutcome>>;
}

/// Explicit mapping from queue to consumer.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<QueueName, Arc<dyn JobHandler>>,
}

impl HandlerTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `queue`, replacing any previous one.
    pub fn register(&mut self, queue: QueueName, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(queue, handler);
        self
    }

    /// Looks up the handler for `queue`.
    pub fn get(&self, queue: QueueName) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&queue).cloned()
    }

    /// Queues that have a handler.
    pub fn queues(&self) -> Vec<QueueName> {
        let mut queues: Vec<_> = self.handlers.keys().copied().collect();
        queues.sort();
        queues
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable").field("queues", &self.queues()).finish()
    }
}

/// Durable queue operations.
pub trait JobQueue: Send + Sync + 'static {
    /// Publishes `job` to run no earlier than `run_at`.
    fn publish(&self, job: Job, run_at: DateTime<Utc>) -> BoxFuture<'_, herald_core::Result<JobId>>;

    /// Claims up to `batch_size` due jobs, hiding them for `visibility`.
    fn claim(
        &self,
        queue: QueueName,
        batch_size: usize,
        visibility: chrono::Duration,
    ) -> BoxFuture<'_, herald_core::Result<Vec<JobRecord>>>;

    /// Marks a job completed.
    fn complete(&self, id: JobId) -> BoxFuture<'_, herald_core::Result<()>>;

    /// Returns a job to the queue to run at `run_at`.
    fn retry(
        &self,
        id: JobId,
        run_at: DateTime<Utc>,
        reason: Option<String>,
    ) -> BoxFuture<'_, herald_core::Result<()>>;

    /// Marks a job failed.
    fn fail(&self, id: JobId, reason: String) -> BoxFuture<'_, herald_core::Result<()>>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn payloads_use_kind_tag_and_camel_case() {
        let campaign_id = CampaignId::new();
        let reservation_id = ReservationId::new();
        let job = Job::CampaignSend(CampaignSendJob { campaign_id, reservation_id, cursor: None });

        let payload = job.to_payload().unwrap();
        assert_eq!(
            payload,
            json!({
                "kind": "campaign-send",
                "campaignId": campaign_id.to_string(),
                "reservationId": reservation_id.to_string(),
            })
        );
        assert_eq!(Job::from_payload(&payload).unwrap(), job);
    }

    #[test]
    fn sweep_and_maintenance_payloads_are_empty_objects() {
        let sweep = Job::from_payload(&json!({ "kind": "delivery-status-update" })).unwrap();
        assert_eq!(sweep, Job::DeliveryStatusUpdate(DeliveryStatusJob { campaign_id: None }));

        let maintenance = Job::from_payload(&json!({ "kind": "reconciliation" })).unwrap();
        assert_eq!(maintenance.queue(), QueueName::Reconciliation);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(Job::from_payload(&json!({ "kind": "email-send" })).is_err());
        assert!(Job::from_payload(&json!({ "campaignId": "x" })).is_err());
    }

    #[test]
    fn queue_names_round_trip() {
        for queue in QueueName::ALL {
            assert_eq!(queue.as_str().parse::<QueueName>().unwrap(), queue);
        }
        assert!("nope".parse::<QueueName>().is_err());
    }
}
