//! Domain models and strongly-typed identifiers.
//!
//! Defines campaigns, recipient messages, credit reservations, idempotency
//! records, contacts and queue rows, plus the status enums that drive every
//! state transition in the pipeline. Identifiers are UUID newtypes so a
//! reservation id can never be passed where a campaign id is expected.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a campaign.
    CampaignId
);
uuid_id!(
    /// Identifier of the tenant that owns campaigns, contacts and credits.
    OwnerId
);
uuid_id!(
    /// Identifier of a contact in the owner's audience.
    ContactId
);
uuid_id!(
    /// Identifier of one per-recipient message row.
    RecipientMessageId
);
uuid_id!(
    /// Identifier of a credit reservation.
    ReservationId
);
uuid_id!(
    /// Identifier of a queued job.
    JobId
);

macro_rules! text_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Returns the persisted text form.
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!("invalid ", $label, ": {}"), other)),
                }
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <&str as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
                s.parse::<Self>().map_err(Into::into)
            }
        }
    };
}

/// Lifecycle of a campaign.
///
/// Transitions form a DAG: draft/scheduled/paused move to sending on
/// enqueue, sending may pause and resume, and sending ends in completed or
/// failed. Nothing returns to draft once sending has started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    /// Being authored.
    Draft,
    /// Waiting for its scheduled time.
    Scheduled,
    /// Fan-out or sends in progress.
    Sending,
    /// Every recipient resolved with at least one accepted send.
    Completed,
    /// Every recipient failed to send.
    Failed,
    /// Fan-out halted by an operator.
    Paused,
}

text_enum!(CampaignStatus, "campaign status", {
    Draft => "draft",
    Scheduled => "scheduled",
    Sending => "sending",
    Completed => "completed",
    Failed => "failed",
    Paused => "paused",
});

impl CampaignStatus {
    /// Statuses from which a campaign may be enqueued.
    pub const ENQUEUEABLE: [Self; 3] = [Self::Draft, Self::Scheduled, Self::Paused];

    /// Returns true if enqueue is allowed from this status.
    pub fn can_enqueue(self) -> bool {
        Self::ENQUEUEABLE.contains(&self)
    }

    /// Returns true for completed and failed.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// State of a single recipient message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecipientStatus {
    /// Row created by fan-out; send job published.
    Queued,
    /// Provider accepted the message; credits committed.
    Accepted,
    /// Provider confirmed delivery.
    Delivered,
    /// Provider reported the message undeliverable.
    FailedDelivery,
    /// Send was rejected or retries were exhausted; credits released.
    FailedSend,
}

text_enum!(RecipientStatus, "recipient status", {
    Queued => "queued",
    Accepted => "accepted",
    Delivered => "delivered",
    FailedDelivery => "failed_delivery",
    FailedSend => "failed_send",
});

impl RecipientStatus {
    /// Delivered, failed delivery, and failed send never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::FailedDelivery | Self::FailedSend)
    }

    /// True once the send worker is done with the row.
    pub const fn is_send_resolved(self) -> bool {
        !matches!(self, Self::Queued)
    }
}

/// State of a credit reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    /// Holding credits; slices may still be committed or released.
    Active,
    /// Fully settled with at least one committed slice.
    Committed,
    /// Fully settled with nothing committed.
    Released,
    /// Swept after its TTL; unsettled remainder returned.
    Expired,
}

text_enum!(ReservationStatus, "reservation status", {
    Active => "active",
    Committed => "committed",
    Released => "released",
    Expired => "expired",
});

/// State of a queued job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for `run_at`.
    Pending,
    /// Claimed by a worker until `locked_until`.
    Running,
    /// Handler finished.
    Completed,
    /// Handler gave up; kept for inspection.
    Failed,
}

text_enum!(JobStatus, "job status", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

/// A bulk SMS campaign.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Campaign {
    /// Unique identifier.
    pub id: CampaignId,
    /// Tenant that owns the campaign and pays for it.
    pub owner_id: OwnerId,
    /// Display name.
    pub name: String,
    /// Current lifecycle status.
    pub status: CampaignStatus,
    /// Contact tags selecting the audience; empty selects every contact.
    pub audience: Vec<String>,
    /// Message body sent to every recipient.
    pub body: String,
    /// When a scheduled campaign should start.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Estimated at enqueue, replaced by the fan-out count when it finishes.
    pub total_recipients: i32,
    /// Reservation backing the current send attempt.
    pub reservation_id: Option<ReservationId>,
    /// Set once fan-out has walked the entire audience.
    pub fanout_completed_at: Option<DateTime<Utc>>,
    /// Last time a manual reconcile was queued.
    pub last_reconcile_requested_at: Option<DateTime<Utc>>,
    /// When sending started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the campaign reached completed or failed.
    pub finished_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Creates a draft campaign.
    pub fn draft(
        owner_id: OwnerId,
        name: impl Into<String>,
        body: impl Into<String>,
        audience: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CampaignId::new(),
            owner_id,
            name: name.into(),
            status: CampaignStatus::Draft,
            audience,
            body: body.into(),
            scheduled_at: None,
            total_recipients: 0,
            reservation_id: None,
            fanout_completed_at: None,
            last_reconcile_requested_at: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A contact eligible for campaigns.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Contact {
    /// Unique identifier; fan-out pages by this id.
    pub id: ContactId,
    /// Owning tenant.
    pub owner_id: OwnerId,
    /// E.164 phone number.
    pub phone: String,
    /// Segmentation tags.
    pub tags: Vec<String>,
    /// Opted-out contacts are never part of an audience.
    pub opted_out: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Contact {
    /// Returns true if the contact belongs to an audience with `tags`.
    pub fn matches_audience(&self, owner_id: OwnerId, tags: &[String]) -> bool {
        self.owner_id == owner_id
            && !self.opted_out
            && (tags.is_empty() || self.tags.iter().any(|tag| tags.contains(tag)))
    }
}

/// One message to one recipient within a campaign.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RecipientMessage {
    /// Unique identifier.
    pub id: RecipientMessageId,
    /// Parent campaign.
    pub campaign_id: CampaignId,
    /// Contact the message is addressed to.
    pub contact_id: ContactId,
    /// Destination phone number captured at fan-out time.
    pub phone: String,
    /// Current state.
    pub status: RecipientStatus,
    /// Provider reference, present once accepted.
    pub provider_message_id: Option<String>,
    /// Credits charged for this message.
    pub credits_charged: i32,
    /// Send attempts that failed with a retryable error.
    pub send_attempts: i32,
    /// Last provider error, if any.
    pub last_error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// When the provider accepted the message.
    pub accepted_at: Option<DateTime<Utc>>,
}

/// Recipient status tallies for one campaign.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientCounts {
    /// Rows waiting for a send.
    pub queued: i64,
    /// Rows accepted and awaiting a delivery receipt.
    pub accepted: i64,
    /// Rows confirmed delivered.
    pub delivered: i64,
    /// Rows the provider could not deliver.
    pub failed_delivery: i64,
    /// Rows that never left the provider boundary.
    pub failed_send: i64,
}

impl RecipientCounts {
    /// Total number of rows.
    pub const fn total(&self) -> i64 {
        self.queued + self.accepted + self.delivered + self.failed_delivery + self.failed_send
    }

    /// Rows the provider took responsibility for.
    pub const fn sent(&self) -> i64 {
        self.accepted + self.delivered + self.failed_delivery
    }

    /// Adds one row in `status`.
    pub fn record(&mut self, status: RecipientStatus) {
        match status {
            RecipientStatus::Queued => self.queued += 1,
            RecipientStatus::Accepted => self.accepted += 1,
            RecipientStatus::Delivered => self.delivered += 1,
            RecipientStatus::FailedDelivery => self.failed_delivery += 1,
            RecipientStatus::FailedSend => self.failed_send += 1,
        }
    }
}

/// Provisional hold on an owner's credit balance.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CreditReservation {
    /// Unique identifier.
    pub id: ReservationId,
    /// Owner whose balance is held.
    pub owner_id: OwnerId,
    /// Deduplication key (`campaign:{id}`).
    pub reservation_key: String,
    /// Credits held at reservation time.
    pub amount: i64,
    /// Credits converted into debits.
    pub committed: i64,
    /// Credits returned to the available balance.
    pub released: i64,
    /// Current status.
    pub status: ReservationStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// After this instant the expiry sweep reclaims the remainder.
    pub expires_at: DateTime<Utc>,
}

impl CreditReservation {
    /// Credits neither committed nor released.
    pub const fn unsettled(&self) -> i64 {
        self.amount - self.committed - self.released
    }

    /// Status once every credit has been settled.
    pub const fn settled_status(&self) -> ReservationStatus {
        if self.committed > 0 {
            ReservationStatus::Committed
        } else {
            ReservationStatus::Released
        }
    }

    /// Key used to deduplicate reservations for a campaign.
    pub fn key_for_campaign(campaign_id: CampaignId) -> String {
        format!("campaign:{campaign_id}")
    }
}

/// Balance of one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CreditBalance {
    /// Owner of the balance.
    pub owner_id: OwnerId,
    /// Total credits purchased minus committed debits.
    pub balance: i64,
    /// Credits held by active reservations.
    pub reserved: i64,
}

impl CreditBalance {
    /// Credits that can still be reserved.
    pub const fn available(&self) -> i64 {
        self.balance - self.reserved
    }
}

/// Result of a reserve call.
#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    /// A new hold was taken.
    Reserved(CreditReservation),
    /// An active reservation with the same key already existed.
    Existing(CreditReservation),
    /// The available balance could not cover the amount.
    Insufficient {
        /// Credits requested
        required: i64,
        /// Credits available at the time of the call
        available: i64,
    },
}

/// Result of committing or releasing one slice of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// The slice was settled now.
    Applied,
    /// This slice had already been settled.
    AlreadySettled,
    /// Settling would push committed + released above the reserved amount.
    Exceeded,
    /// The reservation is no longer active.
    Inactive,
}

/// Direction of a per-message settlement slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementKind {
    /// Converts held credits into a debit.
    Commit,
    /// Returns held credits to the available balance.
    Release,
}

text_enum!(SettlementKind, "settlement kind", {
    Commit => "commit",
    Release => "release",
});

/// Memoized result of the first enqueue for a key.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdempotencyRecord {
    /// Campaign the key applies to.
    pub campaign_id: CampaignId,
    /// Client-supplied key.
    pub idempotency_key: String,
    /// Recipients counted by the first successful enqueue.
    pub queued: i32,
    /// Reservation taken by the first successful enqueue.
    pub reservation_id: ReservationId,
    /// When the record was stored.
    pub created_at: DateTime<Utc>,
}

/// Raw queue row; the payload is decoded by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    /// Unique identifier.
    pub id: JobId,
    /// Queue name such as `sms-send`.
    pub queue: String,
    /// Tagged JSON payload.
    pub payload: serde_json::Value,
    /// Current status.
    pub status: JobStatus,
    /// Number of times the job has been claimed.
    pub attempts: i32,
    /// Earliest time the job may run.
    pub run_at: DateTime<Utc>,
    /// Visibility deadline for a running job.
    pub locked_until: Option<DateTime<Utc>>,
    /// Last failure reason.
    pub last_error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// Current holder of a worker lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LeaseInfo {
    /// Namespaced lock key.
    pub key: String,
    /// Random token of the holder.
    pub token: String,
    /// When the lease lapses unless refreshed.
    pub expires_at: DateTime<Utc>,
}
