use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};

use crate::schema::UploadStates;

/// INSERT INTO upload_states (recording_id, chunk_id, status, retry_count, last_attempt_at_ms, last_error)
/// VALUES (?, ?, 'pending', 0, NULL, NULL)
/// ON CONFLICT (recording_id, chunk_id) DO UPDATE SET status, retry_count, last_error
pub fn upsert_pending(recording_id: &str, chunk_id: i64) -> String {
    Query::insert()
        .into_table(UploadStates::Table)
        .columns([
            UploadStates::RecordingId,
            UploadStates::ChunkId,
            UploadStates::Status,
            UploadStates::RetryCount,
            UploadStates::LastAttemptAtMs,
            UploadStates::LastError,
        ])
        .values_panic([
            recording_id.into(),
            chunk_id.into(),
            "pending".into(),
            0i32.into(),
            Option::<i64>::None.into(),
            Option::<String>::None.into(),
        ])
        .on_conflict(
            OnConflict::columns([UploadStates::RecordingId, UploadStates::ChunkId])
                .update_columns([
                    UploadStates::Status,
                    UploadStates::RetryCount,
                    UploadStates::LastError,
                ])
                .to_owned(),
        )
        .to_string(SqliteQueryBuilder)
}

/// UPDATE upload_states SET status = ?, retry_count = ?, last_attempt_at_ms = ?, last_error = ?
/// WHERE recording_id = ? AND chunk_id = ?
pub fn update_status(
    recording_id: &str,
    chunk_id: i64,
    status: &str,
    retry_count: u32,
    last_attempt_at_ms: Option<i64>,
    last_error: Option<&str>,
) -> String {
    Query::update()
        .table(UploadStates::Table)
        .value(UploadStates::Status, status)
        .value(UploadStates::RetryCount, retry_count as i64)
        .value(UploadStates::LastAttemptAtMs, last_attempt_at_ms)
        .value(UploadStates::LastError, last_error.map(str::to_string))
        .and_where(Expr::col(UploadStates::RecordingId).eq(recording_id))
        .and_where(Expr::col(UploadStates::ChunkId).eq(chunk_id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT chunk_id, status, retry_count, last_attempt_at_ms, last_error
/// FROM upload_states WHERE recording_id = ? AND chunk_id = ?
pub fn select_one(recording_id: &str, chunk_id: i64) -> String {
    Query::select()
        .columns([
            UploadStates::ChunkId,
            UploadStates::Status,
            UploadStates::RetryCount,
            UploadStates::LastAttemptAtMs,
            UploadStates::LastError,
        ])
        .from(UploadStates::Table)
        .and_where(Expr::col(UploadStates::RecordingId).eq(recording_id))
        .and_where(Expr::col(UploadStates::ChunkId).eq(chunk_id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT chunk_id, status, retry_count, last_attempt_at_ms, last_error
/// FROM upload_states WHERE recording_id = ? ORDER BY chunk_id
pub fn select_for_recording(recording_id: &str) -> String {
    Query::select()
        .columns([
            UploadStates::ChunkId,
            UploadStates::Status,
            UploadStates::RetryCount,
            UploadStates::LastAttemptAtMs,
            UploadStates::LastError,
        ])
        .from(UploadStates::Table)
        .and_where(Expr::col(UploadStates::RecordingId).eq(recording_id))
        .order_by(UploadStates::ChunkId, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM upload_states WHERE recording_id = ?
pub fn delete_for_recording(recording_id: &str) -> String {
    Query::delete()
        .from_table(UploadStates::Table)
        .and_where(Expr::col(UploadStates::RecordingId).eq(recording_id))
        .to_string(SqliteQueryBuilder)
}
