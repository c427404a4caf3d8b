//! Shared error taxonomy for the sync layer.
//!
//! Cancellation is a first-class variant, distinct from failure: services
//! log it at debug level and never surface it to observers. Everything else
//! is returned as a typed result so the caller decides presentation.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the sync services and their backend clients.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The operation was superseded or its owning context closed. Never
    /// shown to the user.
    #[error("operation cancelled")]
    Cancelled,

    /// Transport-level failure (connect, timeout, TLS). Retryable; surfaced
    /// as an inline retry affordance on the failed item.
    #[error("network error: {0}")]
    Network(String),

    /// The backend returned a non-success status.
    #[error("backend error: {status} - {message}")]
    Api { status: u16, message: String },

    /// The caller lacks permission for the operation. Surfaced immediately,
    /// never retried.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The backend or a local limiter rejected the operation for rate.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// The operation does not apply to current local state (conversation not
    /// open, no such failed send).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An internal channel closed; the owning component shut down.
    #[error("channel closed")]
    ChannelClosed,
}

impl SyncError {
    /// Whether retrying the same operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_) => true,
            SyncError::Api { status, .. } => *status >= 500,
            SyncError::RateLimited { .. } => true,
            _ => false,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

/// Convenience Result alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_display() {
        let err = SyncError::Api {
            status: 403,
            message: "row-level security violation".to_string(),
        };
        assert_eq!(
            format!("{err}"),
            "backend error: 403 - row-level security violation"
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(SyncError::Network("connection refused".to_string()).is_retryable());
        assert!(SyncError::Api {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!SyncError::Api {
            status: 404,
            message: String::new()
        }
        .is_retryable());
        assert!(!SyncError::PermissionDenied("not a member".to_string()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn cancellation_is_not_failure() {
        assert!(SyncError::Cancelled.is_cancellation());
        assert!(!SyncError::ChannelClosed.is_cancellation());
    }

    #[test]
    fn json_error_converts() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{{{").unwrap_err();
        let err: SyncError = serde_err.into();
        assert!(format!("{err}").starts_with("JSON error:"));
    }
}
