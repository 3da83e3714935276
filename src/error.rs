//! Error taxonomy shared by the client engine and the HTTP server.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid {entity} state transition: {from} -> {to}")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("content hash mismatch: declared {declared}, computed {computed}")]
    HashMismatch { declared: String, computed: String },

    #[error("chunk {chunk} of recording {recording_id} already stored with different content")]
    Conflict { recording_id: String, chunk: String },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("storage access error: {0}")]
    StorageAccess(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("upload error: {0}")]
    Upload(String),

    /// The remote side no longer knows the mapped recording
    #[error("remote recording {0} no longer exists")]
    RemoteRecordingGone(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether a failed transfer may be attempted again.
    ///
    /// Transition, not-found and conflict errors indicate a logic or integrity
    /// problem and must surface immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Upload(_) | SyncError::HashMismatch { .. }
        )
    }

    pub fn invalid_transition(
        entity: &'static str,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        SyncError::InvalidStateTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::StorageAccess(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
