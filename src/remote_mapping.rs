//! Link between a local recording and its remote counterpart.
//!
//! Created right after remote registration, flipped once when the init
//! segment is acknowledged, deleted once the recording is synced. No row
//! means the recording is local-only.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use crate::error::Result;
use crate::ids::{RecordingId, RemoteRecordingId};
use crate::queries::remote_mappings;

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMapping {
    pub recording_id: RecordingId,
    pub remote_recording_id: RemoteRecordingId,
    pub init_segment_uploaded: bool,
    pub created_at: DateTime<Utc>,
}

fn row_to_mapping(row: &SqliteRow) -> Result<RemoteMapping> {
    let uploaded: i64 = row.try_get("init_segment_uploaded")?;
    let created: i64 = row.try_get("created_at_ms")?;
    Ok(RemoteMapping {
        recording_id: RecordingId::new(row.try_get::<String, _>("recording_id")?),
        remote_recording_id: RemoteRecordingId::new(
            row.try_get::<String, _>("remote_recording_id")?,
        ),
        init_segment_uploaded: uploaded != 0,
        created_at: Utc.timestamp_millis_opt(created).single().unwrap_or_default(),
    })
}

#[derive(Clone)]
pub struct RemoteMappingStore {
    pool: SqlitePool,
}

impl RemoteMappingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        recording_id: &RecordingId,
        remote_recording_id: &RemoteRecordingId,
    ) -> Result<RemoteMapping> {
        let created_at = Utc::now();
        let sql = remote_mappings::insert(
            recording_id.as_str(),
            remote_recording_id.as_str(),
            created_at.timestamp_millis(),
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(RemoteMapping {
            recording_id: recording_id.clone(),
            remote_recording_id: remote_recording_id.clone(),
            init_segment_uploaded: false,
            created_at,
        })
    }

    pub async fn get(&self, recording_id: &RecordingId) -> Result<Option<RemoteMapping>> {
        let sql = remote_mappings::select_by_recording(recording_id.as_str());
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_mapping).transpose()
    }

    pub async fn list(&self) -> Result<Vec<RemoteMapping>> {
        let rows = sqlx::query(&remote_mappings::select_all())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_mapping).collect()
    }

    pub async fn mark_init_uploaded(&self, recording_id: &RecordingId) -> Result<()> {
        let sql = remote_mappings::mark_init_uploaded(recording_id.as_str());
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn delete(&self, recording_id: &RecordingId) -> Result<()> {
        sqlx::query(&remote_mappings::delete(recording_id.as_str()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_connection_in_temporary_file;

    #[tokio::test]
    async fn test_mapping_lifecycle() {
        let (pool, _guard) = create_test_connection_in_temporary_file().await.unwrap();
        let store = RemoteMappingStore::new(pool);
        let local = RecordingId::new("rec_1");
        let remote = RemoteRecordingId::new("rrec_9");

        assert!(store.get(&local).await.unwrap().is_none());
        store.create(&local, &remote).await.unwrap();

        let mapping = store.get(&local).await.unwrap().unwrap();
        assert_eq!(mapping.remote_recording_id, remote);
        assert!(!mapping.init_segment_uploaded);

        store.mark_init_uploaded(&local).await.unwrap();
        assert!(store.get(&local).await.unwrap().unwrap().init_segment_uploaded);
        assert_eq!(store.list().await.unwrap().len(), 1);

        store.delete(&local).await.unwrap();
        assert!(store.get(&local).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mapping_is_created_once() {
        let (pool, _guard) = create_test_connection_in_temporary_file().await.unwrap();
        let store = RemoteMappingStore::new(pool);
        let local = RecordingId::new("rec_1");
        store.create(&local, &RemoteRecordingId::new("rrec_1")).await.unwrap();
        assert!(store
            .create(&local, &RemoteRecordingId::new("rrec_2"))
            .await
            .is_err());
    }
}
