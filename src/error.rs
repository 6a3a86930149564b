//! Error types for the sync core.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the transports, the cache and the session layer.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Token missing, expired or rejected by the server.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The request never reached the server.
    #[error("network error: {0}")]
    Network(String),

    /// The server rejected the payload (4xx other than 401).
    #[error("request rejected ({status}): {message}")]
    Validation { status: u16, message: String },

    /// The server failed while handling the request (5xx).
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// A mutation failed after its optimistic patch was applied. The patch has
    /// already been rolled back when this is returned.
    #[error("optimistic update for {target} rolled back: {source}")]
    ConflictDuringOptimisticUpdate {
        target: String,
        #[source]
        source: Box<SyncError>,
    },

    /// Response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Local key-value storage failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Socket transport error.
    #[error("socket error: {0}")]
    Socket(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether this error should force the user out of the session.
    pub fn is_auth(&self) -> bool {
        match self {
            SyncError::Auth(_) => true,
            SyncError::ConflictDuringOptimisticUpdate { source, .. } => source.is_auth(),
            _ => false,
        }
    }

    /// Whether the failure is transient and worth showing as a retryable notice.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Network(_) | SyncError::Socket(_) => true,
            SyncError::ConflictDuringOptimisticUpdate { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Decode(err.to_string())
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Socket(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_inherits_classification_from_cause() {
        let err = SyncError::ConflictDuringOptimisticUpdate {
            target: "conversation A".into(),
            source: Box::new(SyncError::Network("connection refused".into())),
        };
        assert!(err.is_transient());
        assert!(!err.is_auth());

        let err = SyncError::ConflictDuringOptimisticUpdate {
            target: "conversation A".into(),
            source: Box::new(SyncError::Auth("401".into())),
        };
        assert!(err.is_auth());
    }

    #[test]
    fn validation_message_is_verbatim() {
        let err = SyncError::Validation {
            status: 422,
            message: "Phone number already exists".into(),
        };
        assert_eq!(
            err.to_string(),
            "request rejected (422): Phone number already exists"
        );
    }
}
