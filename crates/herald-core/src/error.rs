//! Error types shared across the campaign pipeline.
//!
//! `CoreError` covers storage failures raised by the repositories.
//! `HeraldError` is the caller-facing taxonomy with stable string codes and
//! HTTP status mapping for the enqueue gateway and campaign controls.

use thiserror::Error;

use crate::models::{CampaignId, CampaignStatus};

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Storage-level error for repository operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Stored payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Returns true when the error came from a unique index.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation(message) if message.starts_with("unique"))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Caller-facing errors with codes returned in API error bodies.
#[derive(Debug, Error)]
pub enum HeraldError {
    /// Campaign is not in a state that allows the operation.
    #[error("campaign {id} has status {status}, which does not allow this operation")]
    InvalidStatus {
        /// Campaign that was rejected
        id: CampaignId,
        /// Status the campaign was found in
        status: CampaignStatus,
    },

    /// Audience resolved to zero eligible contacts.
    #[error("campaign {id} has no eligible recipients")]
    NoRecipients {
        /// Campaign with an empty audience
        id: CampaignId,
    },

    /// Campaign is already being sent.
    #[error("campaign {id} is already sending")]
    AlreadySending {
        /// Campaign that is already in flight
        id: CampaignId,
    },

    /// Available credit balance cannot cover the estimated cost.
    #[error("insufficient credits: {required} required, {available} available")]
    InsufficientCredits {
        /// Credits needed for the estimated audience
        required: i64,
        /// Credits currently available to the owner
        available: i64,
    },

    /// Campaign does not exist.
    #[error("campaign {id} not found")]
    CampaignNotFound {
        /// Requested campaign id
        id: CampaignId,
    },

    /// Enqueue request arrived without an `Idempotency-Key` header.
    #[error("Idempotency-Key header is required")]
    MissingIdempotencyKey,

    /// Storage layer failure.
    #[error(transparent)]
    Storage(#[from] CoreError),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HeraldError {
    /// Returns the stable error code exposed to API callers.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidStatus { .. } => "INVALID_STATUS",
            Self::NoRecipients { .. } => "NO_RECIPIENTS",
            Self::AlreadySending { .. } => "ALREADY_SENDING",
            Self::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            Self::CampaignNotFound { .. } => "CAMPAIGN_NOT_FOUND",
            Self::MissingIdempotencyKey => "MISSING_IDEMPOTENCY_KEY",
            Self::Storage(_) => "DATABASE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns the HTTP status code that best describes the error.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InvalidStatus { .. } | Self::AlreadySending { .. } => 409,
            Self::NoRecipients { .. } => 422,
            Self::InsufficientCredits { .. } => 402,
            Self::CampaignNotFound { .. } => 404,
            Self::MissingIdempotencyKey => 400,
            Self::Storage(_) | Self::Internal(_) => 500,
        }
    }

    /// Returns true for request-validation errors that performed no side
    /// effects.
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidStatus { .. }
                | Self::NoRecipients { .. }
                | Self::AlreadySending { .. }
                | Self::InsufficientCredits { .. }
                | Self::MissingIdempotencyKey
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        let id = CampaignId::new();
        assert_eq!(
            HeraldError::InvalidStatus { id, status: CampaignStatus::Completed }.code(),
            "INVALID_STATUS"
        );
        assert_eq!(HeraldError::NoRecipients { id }.code(), "NO_RECIPIENTS");
        assert_eq!(HeraldError::AlreadySending { id }.code(), "ALREADY_SENDING");
        assert_eq!(
            HeraldError::InsufficientCredits { required: 3, available: 1 }.code(),
            "INSUFFICIENT_CREDITS"
        );
    }

    #[test]
    fn validation_errors_map_to_client_statuses() {
        let id = CampaignId::new();
        assert_eq!(HeraldError::AlreadySending { id }.status_code(), 409);
        assert_eq!(HeraldError::InsufficientCredits { required: 1, available: 0 }.status_code(), 402);
        assert_eq!(HeraldError::MissingIdempotencyKey.status_code(), 400);
        assert!(HeraldError::NoRecipients { id }.is_validation());
        assert!(!HeraldError::Internal("boom".into()).is_validation());
    }

    #[test]
    fn unique_violation_detected_from_message() {
        let err = CoreError::ConstraintViolation("unique constraint violation: dup".into());
        assert!(err.is_unique_violation());
        assert!(!CoreError::ConstraintViolation("check constraint violation".into())
            .is_unique_violation());
    }
}
