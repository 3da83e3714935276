//! Durable per-chunk upload status.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::fmt;
use std::str::FromStr;

use crate::chunk_store::ChunkSlot;
use crate::constants::INIT_CHUNK_ID;
use crate::error::{Result, SyncError};
use crate::ids::RecordingId;
use crate::queries::upload_states;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Uploaded => "uploaded",
            UploadStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Uploaded | UploadStatus::Failed)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(UploadStatus::Pending),
            "uploading" => Ok(UploadStatus::Uploading),
            "uploaded" => Ok(UploadStatus::Uploaded),
            "failed" => Ok(UploadStatus::Failed),
            other => Err(SyncError::StorageAccess(format!("unknown upload status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadStateRecord {
    pub slot: ChunkSlot,
    pub status: UploadStatus,
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

fn slot_from_db(chunk_id: i64) -> ChunkSlot {
    if chunk_id == INIT_CHUNK_ID {
        ChunkSlot::Init
    } else {
        ChunkSlot::Chunk(u64::try_from(chunk_id).unwrap_or_default())
    }
}

fn row_to_record(row: &SqliteRow) -> Result<UploadStateRecord> {
    let status: String = row.try_get("status")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let last_attempt: Option<i64> = row.try_get("last_attempt_at_ms")?;
    Ok(UploadStateRecord {
        slot: slot_from_db(row.try_get("chunk_id")?),
        status: status.parse()?,
        retry_count: retry_count.max(0) as u32,
        last_attempt_at: last_attempt.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        last_error: row.try_get("last_error")?,
    })
}

/// Upload status table keyed by `(recording_id, chunk_id)`
///
/// Within one recording the owning upload queue is the only writer.
#[derive(Clone)]
pub struct UploadLedger {
    pool: SqlitePool,
}

impl UploadLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a slot as pending; resets a previous failed or stale entry
    pub async fn mark_pending(&self, recording_id: &RecordingId, slot: ChunkSlot) -> Result<()> {
        let sql = upload_states::upsert_pending(recording_id.as_str(), slot.db_id()?);
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn mark_uploading(
        &self,
        recording_id: &RecordingId,
        slot: ChunkSlot,
        retry_count: u32,
    ) -> Result<()> {
        self.update(recording_id, slot, UploadStatus::Uploading, retry_count, None)
            .await
    }

    /// Only call after the remote store acknowledged the write
    pub async fn mark_uploaded(
        &self,
        recording_id: &RecordingId,
        slot: ChunkSlot,
        retry_count: u32,
    ) -> Result<()> {
        self.update(recording_id, slot, UploadStatus::Uploaded, retry_count, None)
            .await
    }

    /// Attempt failed but will be retried
    pub async fn mark_retrying(
        &self,
        recording_id: &RecordingId,
        slot: ChunkSlot,
        retry_count: u32,
        error: &str,
    ) -> Result<()> {
        self.update(recording_id, slot, UploadStatus::Pending, retry_count, Some(error))
            .await
    }

    pub async fn mark_failed(
        &self,
        recording_id: &RecordingId,
        slot: ChunkSlot,
        retry_count: u32,
        error: &str,
    ) -> Result<()> {
        self.update(recording_id, slot, UploadStatus::Failed, retry_count, Some(error))
            .await
    }

    async fn update(
        &self,
        recording_id: &RecordingId,
        slot: ChunkSlot,
        status: UploadStatus,
        retry_count: u32,
        error: Option<&str>,
    ) -> Result<()> {
        let sql = upload_states::update_status(
            recording_id.as_str(),
            slot.db_id()?,
            status.as_str(),
            retry_count,
            Some(Utc::now().timestamp_millis()),
            error,
        );
        let updated = sqlx::query(&sql).execute(&self.pool).await?.rows_affected();
        if updated == 0 {
            return Err(SyncError::NotFound(format!(
                "upload state {}/{}",
                recording_id, slot
            )));
        }
        Ok(())
    }

    pub async fn get(&self, recording_id: &RecordingId, slot: ChunkSlot) -> Result<Option<UploadStateRecord>> {
        let sql = upload_states::select_one(recording_id.as_str(), slot.db_id()?);
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_record).transpose()
    }

    /// All entries of a recording, init segment first, then ascending chunk id
    pub async fn list(&self, recording_id: &RecordingId) -> Result<Vec<UploadStateRecord>> {
        let sql = upload_states::select_for_recording(recording_id.as_str());
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Drop every entry of a synced or discarded recording
    pub async fn delete_all(&self, recording_id: &RecordingId) -> Result<u64> {
        let sql = upload_states::delete_for_recording(recording_id.as_str());
        Ok(sqlx::query(&sql).execute(&self.pool).await?.rows_affected())
    }
}
