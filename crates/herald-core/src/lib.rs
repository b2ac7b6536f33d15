//! Core domain models and storage for the Herald campaign pipeline.
//!
//! Provides strongly-typed identifiers, campaign/recipient/credit models,
//! the error taxonomy shared by every crate, the `Clock` abstraction, and
//! the PostgreSQL repositories behind `storage::Storage`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, HeraldError, Result};
pub use models::{
    Campaign, CampaignId, CampaignStatus, Contact, ContactId, CreditBalance, CreditReservation,
    IdempotencyRecord, JobId, JobRecord, JobStatus, LeaseInfo, OwnerId, RecipientCounts,
    RecipientMessage, RecipientMessageId, RecipientStatus, ReservationId, ReservationStatus,
    ReserveOutcome, SettleOutcome, SettlementKind,
};
pub use time::{Clock, RealClock, TestClock};
