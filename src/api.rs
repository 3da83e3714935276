//! JSON bodies exchanged between the client engine and the server.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::ids::{RemoteRecordingId, RoomId};
use crate::recording::{RecordingMetadata, RecordingState};
use crate::room::RoomState;

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRecordingRequest {
    #[serde(default)]
    pub metadata: RecordingMetadata,
    pub room_id: Option<RoomId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRecordingResponse {
    pub id: RemoteRecordingId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordingStateRequest {
    pub state: RecordingState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoomStateRequest {
    pub state: RoomState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkListResponse {
    pub chunk_ids: Vec<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DirectUploadRequest {
    /// `None` addresses the init segment
    pub chunk_id: Option<u64>,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectUploadGrant {
    pub token: String,
    /// Absolute, or relative to the server base URL
    pub upload_url: String,
    pub expires_at: DateTime<Utc>,
}

/// Public view of a room, safe to hand to guests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomView {
    pub id: RoomId,
    pub state: RoomState,
    pub recording_ids: Vec<RemoteRecordingId>,
    pub scheduled_start_at: Option<DateTime<Utc>>,
}

/// Response to room creation, the only place the access token is revealed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedRoom {
    pub id: RoomId,
    pub access_token: String,
    pub state: RoomState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    /// `[from, to]` of a rejected transition, `[declared, computed]` of a hash mismatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<(String, String)>,
}

impl ErrorBody {
    pub fn from_error(err: &SyncError) -> Self {
        let code = match err {
            SyncError::NotFound(_) | SyncError::RemoteRecordingGone(_) => "not_found",
            SyncError::InvalidStateTransition { .. } => "invalid_state_transition",
            SyncError::InvalidChunk(_) => "invalid_chunk",
            SyncError::HashMismatch { .. } => "hash_mismatch",
            SyncError::Conflict { .. } => "conflict",
            SyncError::AccessDenied(_) => "access_denied",
            _ => "internal",
        };
        let detail = match err {
            SyncError::InvalidStateTransition { from, to, .. } => Some((from.clone(), to.clone())),
            SyncError::HashMismatch { declared, computed } => {
                Some((declared.clone(), computed.clone()))
            }
            _ => None,
        };
        Self {
            error: err.to_string(),
            code: code.to_string(),
            detail,
        }
    }
}

/// Turn a non-success response into the matching error variant
pub(crate) async fn error_from_response(response: reqwest::Response) -> SyncError {
    let status = response.status();
    let body = response.json::<ErrorBody>().await.ok();
    let message = body
        .as_ref()
        .map(|b| b.error.clone())
        .unwrap_or_else(|| format!("server returned {}", status));

    let code = body.as_ref().map(|b| b.code.as_str());
    let detail = body.as_ref().and_then(|b| b.detail.clone());

    match (status, code) {
        (StatusCode::BAD_REQUEST, Some("invalid_state_transition")) => {
            let (from, to) = detail.unwrap_or_default();
            SyncError::InvalidStateTransition {
                entity: "remote",
                from,
                to,
            }
        }
        (StatusCode::BAD_REQUEST, Some("hash_mismatch")) => {
            let (declared, computed) = detail.unwrap_or_default();
            SyncError::HashMismatch { declared, computed }
        }
        (StatusCode::NOT_FOUND, _) => SyncError::NotFound(message),
        (StatusCode::FORBIDDEN, _) => SyncError::AccessDenied(message),
        (StatusCode::CONFLICT, _) => SyncError::InvalidChunk(message),
        (StatusCode::BAD_REQUEST, Some("invalid_chunk")) => SyncError::InvalidChunk(message),
        (s, _) if s.is_server_error() => SyncError::Upload(message),
        _ => SyncError::Upload(format!("unexpected status {}: {}", status, message)),
    }
}
