//! Common error types for the offline sync subsystem.

use thiserror::Error;

/// Top-level error type for offline store, sync and interception operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local persistence unavailable or the operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Transport-level failure (connection refused, timeout, DNS).
    #[error("Network error: {0}")]
    Network(String),

    /// The remote answered, but not with an acceptable response.
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// The remote accepted the submission but its answer was unusable.
    ///
    /// Resending could deliver the same submission twice.
    #[error("Unconfirmed delivery: {0}")]
    Unconfirmed(String),

    /// Operation requires connectivity and the client is offline.
    #[error("Offline: {0}")]
    Offline(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// State transition not allowed for the record's current state.
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl Error {
    /// Whether the failure came from talking to the remote service.
    ///
    /// Delivery and refresh code records these per item instead of
    /// aborting the surrounding operation.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Delivery(_) | Error::Unconfirmed(_)
        )
    }

    /// Whether the same request may safely be sent again later.
    ///
    /// An unconfirmed delivery reached the server, so it is not retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Delivery(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_classification() {
        assert!(Error::Network("refused".to_string()).is_remote());
        assert!(Error::Delivery("Server returned 500".to_string()).is_remote());
        assert!(!Error::Storage("closed".to_string()).is_remote());
        assert!(!Error::Offline("no link".to_string()).is_remote());
    }

    #[test]
    fn test_unconfirmed_is_not_retryable() {
        let err = Error::Unconfirmed("Response has no 'id' field".to_string());
        assert!(err.is_remote());
        assert!(!err.is_retryable());
        assert!(Error::Network("refused".to_string()).is_retryable());
        assert!(Error::Delivery("Server returned 503".to_string()).is_retryable());
    }

    #[test]
    fn test_display_prefixes() {
        let err = Error::Offline("Cannot sync - you are offline".to_string());
        assert_eq!(err.to_string(), "Offline: Cannot sync - you are offline");
    }
}
