//! Recording model, lifecycle and persistence.
//!
//! ```text
//! standby -> recording -> finalizing -> synced
//!                 \_______________________^
//! recording | finalizing -> interrupted   (start-up only)
//! interrupted -> finalizing | synced      (resume)
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use crate::error::{Result, SyncError};
use crate::ids::{RecordingId, RecordingKey, RoomId};
use crate::queries::recordings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    Standby,
    Recording,
    Finalizing,
    Synced,
    /// Found non-terminal at start-up; only the recovery path leaves it
    Interrupted,
}

impl RecordingState {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordingState::Standby => "standby",
            RecordingState::Recording => "recording",
            RecordingState::Finalizing => "finalizing",
            RecordingState::Synced => "synced",
            RecordingState::Interrupted => "interrupted",
        }
    }

    /// Transitions a caller may request
    ///
    /// `recording -> synced` is always legal so very short sessions can skip
    /// `finalizing`. Entering `interrupted` is not requestable; see
    /// [`Recording::mark_interrupted`].
    pub fn can_transition_to(self, next: RecordingState) -> bool {
        use RecordingState::*;
        matches!(
            (self, next),
            (Standby, Recording)
                | (Recording, Finalizing)
                | (Recording, Synced)
                | (Finalizing, Synced)
                | (Interrupted, Finalizing)
                | (Interrupted, Synced)
        )
    }

    /// States in which new chunks are counted
    pub fn accepts_chunks(self) -> bool {
        matches!(self, RecordingState::Recording | RecordingState::Finalizing)
    }

    pub fn is_terminal(self) -> bool {
        self == RecordingState::Synced
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordingState {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "standby" => Ok(RecordingState::Standby),
            "recording" => Ok(RecordingState::Recording),
            "finalizing" => Ok(RecordingState::Finalizing),
            "synced" => Ok(RecordingState::Synced),
            "interrupted" => Ok(RecordingState::Interrupted),
            other => Err(SyncError::StorageAccess(format!(
                "unknown recording state '{}'",
                other
            ))),
        }
    }
}

/// Descriptive recording metadata, all fields optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingMetadata {
    pub display_name: Option<String>,
    /// e.g. "video/webm; codecs=vp9,opus"
    pub mime_type: Option<String>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Bits per second
    pub video_bitrate: Option<u32>,
    /// Bits per second
    pub audio_bitrate: Option<u32>,
    pub framerate: Option<f32>,
    pub duration_us: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording<K = RecordingId> {
    pub id: K,
    pub room_id: Option<RoomId>,
    pub state: RecordingState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub chunk_count: u64,
    pub total_size: u64,
    pub metadata: RecordingMetadata,
}

impl<K: RecordingKey> Recording<K> {
    pub fn new(id: K, room_id: Option<RoomId>, metadata: RecordingMetadata) -> Self {
        Self {
            id,
            room_id,
            state: RecordingState::Standby,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            chunk_count: 0,
            total_size: 0,
            metadata,
        }
    }

    /// Apply a requested transition, stamping `started_at` / `finished_at` if unset
    pub fn transition(&mut self, next: RecordingState, now: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SyncError::invalid_transition("recording", self.state, next));
        }
        self.state = next;
        match next {
            RecordingState::Recording if self.started_at.is_none() => self.started_at = Some(now),
            RecordingState::Synced if self.finished_at.is_none() => self.finished_at = Some(now),
            _ => {}
        }
        Ok(())
    }

    /// Move a stale non-terminal recording aside at start-up
    pub fn mark_interrupted(&mut self) -> Result<()> {
        match self.state {
            RecordingState::Recording | RecordingState::Finalizing => {
                self.state = RecordingState::Interrupted;
                Ok(())
            }
            other => Err(SyncError::invalid_transition(
                "recording",
                other,
                RecordingState::Interrupted,
            )),
        }
    }

    /// Count one more chunk of `size` bytes
    pub fn record_chunk(&mut self, size: u64) -> Result<()> {
        if !self.state.accepts_chunks() {
            return Err(SyncError::InvalidChunk(format!(
                "recording {} does not accept chunks in state {}",
                self.id, self.state
            )));
        }
        self.chunk_count += 1;
        self.total_size += size;
        Ok(())
    }

    /// Legal chain from the current state to `synced`
    pub fn path_to_synced(&self) -> Vec<RecordingState> {
        match self.state {
            RecordingState::Recording | RecordingState::Interrupted => {
                vec![RecordingState::Finalizing, RecordingState::Synced]
            }
            RecordingState::Finalizing => vec![RecordingState::Synced],
            RecordingState::Standby | RecordingState::Synced => Vec::new(),
        }
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn row_to_recording<K: RecordingKey>(row: &SqliteRow) -> Result<Recording<K>> {
    let state: String = row.try_get("state")?;
    let metadata: String = row.try_get("metadata")?;
    let room_id: Option<String> = row.try_get("room_id")?;
    let started: Option<i64> = row.try_get("started_at_ms")?;
    let finished: Option<i64> = row.try_get("finished_at_ms")?;
    let chunk_count: i64 = row.try_get("chunk_count")?;
    let total_size: i64 = row.try_get("total_size")?;
    Ok(Recording {
        id: K::from_raw(row.try_get("id")?),
        room_id: room_id.map(RoomId::new),
        state: state.parse()?,
        created_at: millis_to_datetime(row.try_get("created_at_ms")?),
        started_at: started.map(millis_to_datetime),
        finished_at: finished.map(millis_to_datetime),
        chunk_count: chunk_count.max(0) as u64,
        total_size: total_size.max(0) as u64,
        metadata: serde_json::from_str(&metadata)?,
    })
}

/// Persistence for recordings keyed by `K`
///
/// The client keeps local recordings (`RecordingId`); the server keeps the
/// recordings it registered (`RemoteRecordingId`).
pub struct RecordingRepository<K = RecordingId> {
    pool: SqlitePool,
    _key: PhantomData<fn() -> K>,
}

impl<K> Clone for RecordingRepository<K> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _key: PhantomData,
        }
    }
}

impl<K: RecordingKey> RecordingRepository<K> {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            _key: PhantomData,
        }
    }

    pub async fn insert(&self, recording: &Recording<K>) -> Result<()> {
        let metadata = serde_json::to_string(&recording.metadata)?;
        let sql = recordings::insert(
            recording.id.as_str(),
            recording.room_id.as_ref().map(|r| r.as_str()),
            recording.state.as_str(),
            recording.created_at.timestamp_millis(),
            recording.started_at.map(|t| t.timestamp_millis()),
            recording.finished_at.map(|t| t.timestamp_millis()),
            recording.chunk_count as i64,
            recording.total_size as i64,
            &metadata,
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn find(&self, id: &K) -> Result<Option<Recording<K>>> {
        let sql = recordings::select_by_id(id.as_str());
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_recording).transpose()
    }

    pub async fn get(&self, id: &K) -> Result<Recording<K>> {
        self.find(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("recording {}", id)))
    }

    pub async fn list(&self) -> Result<Vec<Recording<K>>> {
        let rows = sqlx::query(&recordings::select_all())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_recording).collect()
    }

    /// Recordings that are not synced yet and hold at least one chunk
    pub async fn list_unsynced_with_chunks(&self) -> Result<Vec<Recording<K>>> {
        let rows = sqlx::query(&recordings::select_unsynced_with_chunks())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_recording).collect()
    }

    pub async fn list_in_states(&self, states: &[RecordingState]) -> Result<Vec<Recording<K>>> {
        let names: Vec<&str> = states.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query(&recordings::select_in_states(&names))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_recording).collect()
    }

    /// Load, validate and persist one transition
    pub async fn transition(&self, id: &K, next: RecordingState) -> Result<Recording<K>> {
        let mut recording = self.get(id).await?;
        let from = recording.state;
        recording.transition(next, Utc::now())?;
        self.persist_state(&recording, from).await?;
        Ok(recording)
    }

    /// Walk the legal chain to `synced`, returning the final record
    pub async fn advance_to_synced(&self, id: &K) -> Result<Recording<K>> {
        let mut recording = self.get(id).await?;
        for next in recording.path_to_synced() {
            recording = self.transition(id, next).await?;
        }
        if !recording.state.is_terminal() {
            return Err(SyncError::invalid_transition(
                "recording",
                recording.state,
                RecordingState::Synced,
            ));
        }
        Ok(recording)
    }

    pub async fn mark_interrupted(&self, id: &K) -> Result<Recording<K>> {
        let mut recording = self.get(id).await?;
        let from = recording.state;
        recording.mark_interrupted()?;
        self.persist_state(&recording, from).await?;
        Ok(recording)
    }

    async fn persist_state(&self, recording: &Recording<K>, from: RecordingState) -> Result<()> {
        let sql = recordings::update_state(
            recording.id.as_str(),
            from.as_str(),
            recording.state.as_str(),
            recording.started_at.map(|t| t.timestamp_millis()),
            recording.finished_at.map(|t| t.timestamp_millis()),
        );
        let updated = sqlx::query(&sql).execute(&self.pool).await?.rows_affected();
        if updated == 0 {
            // Someone else moved the recording since it was loaded.
            return Err(SyncError::invalid_transition(
                "recording",
                from,
                recording.state,
            ));
        }
        Ok(())
    }

    /// Count a stored chunk; returns false when the recording no longer accepts chunks
    pub async fn record_chunk(&self, id: &K, size: u64) -> Result<bool> {
        let sql = recordings::increment_chunk(id.as_str(), size as i64);
        let updated = sqlx::query(&sql).execute(&self.pool).await?.rows_affected();
        Ok(updated > 0)
    }

    pub async fn delete(&self, id: &K) -> Result<()> {
        sqlx::query(&recordings::delete(id.as_str()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
