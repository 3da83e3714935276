use chrono::Utc;
use log::debug;
use sqlx::sqlite::SqlitePool;
use std::marker::PhantomData;

use super::{content_hash, ensure_not_empty, ChunkSlot, ChunkStore, PutOutcome};
use crate::error::Result;
use crate::ids::RecordingKey;
use crate::queries::chunks;

/// Chunk store backed by the `chunks` table of a SQLite database
///
/// Generic over the id space so the client store (local ids) and the server
/// store (remote ids) cannot be addressed with each other's ids.
pub struct SqliteChunkStore<K> {
    pool: SqlitePool,
    _key: PhantomData<fn() -> K>,
}

impl<K> Clone for SqliteChunkStore<K> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _key: PhantomData,
        }
    }
}

impl<K: RecordingKey> SqliteChunkStore<K> {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            _key: PhantomData,
        }
    }

    /// Stored hash of a slot, if occupied
    pub async fn stored_hash(&self, recording_id: &K, slot: ChunkSlot) -> Result<Option<String>> {
        let sql = chunks::select_hash(recording_id.as_str(), slot.db_id()?);
        let hash: Option<String> = sqlx::query_scalar(&sql)
            .fetch_optional(&self.pool)
            .await?;
        Ok(hash)
    }

    /// Idempotent put with a caller-supplied hash, already verified against the bytes
    pub(crate) async fn put_verified(
        &self,
        recording_id: &K,
        slot: ChunkSlot,
        bytes: &[u8],
        hash: &str,
    ) -> Result<PutOutcome> {
        ensure_not_empty(slot, bytes)?;
        let sql = chunks::insert_or_ignore(
            recording_id.as_str(),
            slot.db_id()?,
            hash,
            bytes,
            Utc::now().timestamp_millis(),
        );
        let inserted = sqlx::query(&sql).execute(&self.pool).await?.rows_affected();
        if inserted > 0 {
            debug!("[ChunkStore] stored {}/{} ({} bytes)", recording_id, slot, bytes.len());
            return Ok(PutOutcome::Stored);
        }

        match self.stored_hash(recording_id, slot).await? {
            Some(existing) if existing == hash => Ok(PutOutcome::AlreadyPresent),
            Some(_) => Ok(PutOutcome::Conflict),
            // Deleted between the insert and the lookup; the caller may retry.
            None => Err(crate::error::SyncError::StorageAccess(format!(
                "chunk {}/{} vanished during put",
                recording_id, slot
            ))),
        }
    }
}

#[async_trait::async_trait]
impl<K: RecordingKey> ChunkStore for SqliteChunkStore<K> {
    type Id = K;

    async fn put_slot(&self, recording_id: &K, slot: ChunkSlot, bytes: &[u8]) -> Result<PutOutcome> {
        let hash = content_hash(bytes);
        self.put_verified(recording_id, slot, bytes, &hash).await
    }

    async fn get_slot(&self, recording_id: &K, slot: ChunkSlot) -> Result<Option<Vec<u8>>> {
        let sql = chunks::select_data(recording_id.as_str(), slot.db_id()?);
        let data: Option<Vec<u8>> = sqlx::query_scalar(&sql)
            .fetch_optional(&self.pool)
            .await?;
        Ok(data)
    }

    async fn list_chunk_ids(&self, recording_id: &K) -> Result<Vec<u64>> {
        let sql = chunks::select_chunk_ids(recording_id.as_str());
        let ids: Vec<i64> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        Ok(ids.into_iter().filter_map(|id| u64::try_from(id).ok()).collect())
    }

    async fn delete_all(&self, recording_id: &K) -> Result<()> {
        let sql = chunks::delete_for_recording(recording_id.as_str());
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }
}
