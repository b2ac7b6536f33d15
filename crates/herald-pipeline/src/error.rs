//! Error types for pipeline operations.
//!
//! Provider-level variants drive retry decisions for SMS sends; the remaining
//! variants cover storage, ledger, lock and worker lifecycle failures.

use std::fmt;

use herald_core::CoreError;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised by the campaign pipeline.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Network-level connectivity failure talking to the provider.
    #[error("network connection failed: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// Provider call exceeded its timeout.
    #[error("provider timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Provider rejected the message.
    #[error("provider rejected message: {code}")]
    ProviderRejected {
        /// Provider or HTTP error code
        code: String,
        /// Whether the provider indicated the send may succeed later
        retryable: bool,
    },

    /// Provider asked us to slow down.
    #[error("rate limited: retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds to wait before retrying
        retry_after_seconds: u64,
    },

    /// Provider failed with a 5xx status.
    #[error("provider server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Database operation failed.
    #[error("database error: {message}")]
    Database {
        /// Database error message
        message: String,
    },

    /// Credit ledger refused or failed an operation.
    #[error("ledger error: {message}")]
    Ledger {
        /// Ledger error message
        message: String,
    },

    /// Worker lock store failed.
    #[error("lock error: {message}")]
    Lock {
        /// Lock error message
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// A job was claimed from a queue with no registered handler.
    #[error("no handler registered for queue {queue}")]
    NoHandler {
        /// Queue name
        queue: String,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked")]
    WorkerPanic {
        /// Identifier of the worker
        worker_id: usize,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("shutdown timed out after {timeout_seconds}s")]
    ShutdownTimeout {
        /// Seconds waited before giving up
        timeout_seconds: u64,
    },

    /// Worker shutdown requested.
    #[error("worker shutdown requested")]
    ShutdownRequested,

    /// Unexpected internal error.
    #[error("internal pipeline error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl PipelineError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a provider rejection.
    pub fn rejected(code: impl Into<String>, retryable: bool) -> Self {
        Self::ProviderRejected { code: code.into(), retryable }
    }

    /// Creates a rate limit error.
    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates a server error.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into() }
    }

    /// Creates a ledger error.
    pub fn ledger(message: impl Into<String>) -> Self {
        Self::Ledger { message: message.into() }
    }

    /// Creates a lock error.
    pub fn lock(message: impl Into<String>) -> Self {
        Self::Lock { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Returns true for failures that may succeed if the send is retried.
    ///
    /// Network errors, timeouts, 5xx, 429 and provider rejections flagged
    /// retryable qualify. 4xx rejections and lifecycle errors do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. }
            | Self::Database { .. } => true,

            Self::ProviderRejected { retryable, .. } => *retryable,

            Self::Ledger { .. }
            | Self::Lock { .. }
            | Self::Configuration { .. }
            | Self::NoHandler { .. }
            | Self::WorkerPanic { .. }
            | Self::ShutdownTimeout { .. }
            | Self::ShutdownRequested
            | Self::Internal { .. } => false,
        }
    }

    /// Returns the provider's retry-after hint, if any.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => Some(*retry_after_seconds),
            _ => None,
        }
    }

    /// Short machine-readable code stored in `last_error` columns.
    pub fn code(&self) -> String {
        match self {
            Self::ProviderRejected { code, .. } => code.clone(),
            Self::ServerError { status_code, .. } => format!("HTTP_{status_code}"),
            Self::NoHandler { .. } => "NO_HANDLER".to_string(),
            other => ErrorCategory::from(other).to_string().to_uppercase(),
        }
    }
}

impl From<CoreError> for PipelineError {
    fn from(err: CoreError) -> Self {
        Self::database(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("payload serialization failed: {err}"))
    }
}

/// Category of pipeline error for logs and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues and timeouts.
    Network,
    /// Provider rejected the message.
    Provider,
    /// Provider server errors (5xx).
    Server,
    /// Rate limiting.
    RateLimit,
    /// Database operations.
    Database,
    /// Credit ledger.
    Ledger,
    /// Worker lock.
    Lock,
    /// Configuration problems.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl From<&PipelineError> for ErrorCategory {
    fn from(error: &PipelineError) -> Self {
        match error {
            PipelineError::Network { .. } | PipelineError::Timeout { .. } => Self::Network,
            PipelineError::ProviderRejected { .. } => Self::Provider,
            PipelineError::ServerError { .. } => Self::Server,
            PipelineError::RateLimited { .. } => Self::RateLimit,
            PipelineError::Database { .. } => Self::Database,
            PipelineError::Ledger { .. } => Self::Ledger,
            PipelineError::Lock { .. } => Self::Lock,
            PipelineError::Configuration { .. } => Self::Configuration,
            PipelineError::NoHandler { .. }
            | PipelineError::WorkerPanic { .. }
            | PipelineError::ShutdownTimeout { .. }
            | PipelineError::ShutdownRequested
            | PipelineError::Internal { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Provider => write!(f, "provider"),
            Self::Server => write!(f, "server"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Database => write!(f, "database"),
            Self::Ledger => write!(f, "ledger"),
            Self::Lock => write!(f, "lock"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(PipelineError::network("connection refused").is_retryable());
        assert!(PipelineError::timeout(10).is_retryable());
        assert!(PipelineError::server_error(503, "unavailable").is_retryable());
        assert!(PipelineError::rate_limited(60).is_retryable());
        assert!(PipelineError::rejected("THROTTLED", true).is_retryable());

        assert!(!PipelineError::rejected("INVALID_NUMBER", false).is_retryable());
        assert!(!PipelineError::ledger("exceeded").is_retryable());
        assert!(!PipelineError::ShutdownRequested.is_retryable());
        assert!(!PipelineError::NoHandler { queue: "automation-trigger".into() }.is_retryable());
    }

    #[test]
    fn rate_limit_retry_after_extracted() {
        assert_eq!(PipelineError::rate_limited(120).retry_after_seconds(), Some(120));
        assert_eq!(PipelineError::timeout(30).retry_after_seconds(), None);
    }

    #[test]
    fn codes_for_last_error_columns() {
        assert_eq!(PipelineError::rejected("OPTED_OUT", false).code(), "OPTED_OUT");
        assert_eq!(PipelineError::server_error(502, "").code(), "HTTP_502");
        assert_eq!(PipelineError::timeout(10).code(), "NETWORK");
        assert_eq!(PipelineError::NoHandler { queue: "x".into() }.code(), "NO_HANDLER");
    }

    #[test]
    fn error_display_format() {
        assert_eq!(PipelineError::timeout(30).to_string(), "provider timeout after 30s");
        assert_eq!(
            PipelineError::rejected("INVALID_NUMBER", false).to_string(),
            "provider rejected message: INVALID_NUMBER"
        );
    }
}
