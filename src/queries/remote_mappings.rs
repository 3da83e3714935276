use sea_query::{Expr, Order, Query, SqliteQueryBuilder};

use crate::schema::RemoteMappings;

/// INSERT INTO remote_mappings (recording_id, remote_recording_id, init_segment_uploaded, created_at_ms)
/// VALUES (?, ?, 0, ?)
pub fn insert(recording_id: &str, remote_recording_id: &str, created_at_ms: i64) -> String {
    Query::insert()
        .into_table(RemoteMappings::Table)
        .columns([
            RemoteMappings::RecordingId,
            RemoteMappings::RemoteRecordingId,
            RemoteMappings::InitSegmentUploaded,
            RemoteMappings::CreatedAtMs,
        ])
        .values_panic([
            recording_id.into(),
            remote_recording_id.into(),
            0i32.into(),
            created_at_ms.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// SELECT recording_id, remote_recording_id, init_segment_uploaded, created_at_ms
/// FROM remote_mappings WHERE recording_id = ?
pub fn select_by_recording(recording_id: &str) -> String {
    Query::select()
        .columns([
            RemoteMappings::RecordingId,
            RemoteMappings::RemoteRecordingId,
            RemoteMappings::InitSegmentUploaded,
            RemoteMappings::CreatedAtMs,
        ])
        .from(RemoteMappings::Table)
        .and_where(Expr::col(RemoteMappings::RecordingId).eq(recording_id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT recording_id, remote_recording_id, init_segment_uploaded, created_at_ms
/// FROM remote_mappings ORDER BY created_at_ms
pub fn select_all() -> String {
    Query::select()
        .columns([
            RemoteMappings::RecordingId,
            RemoteMappings::RemoteRecordingId,
            RemoteMappings::InitSegmentUploaded,
            RemoteMappings::CreatedAtMs,
        ])
        .from(RemoteMappings::Table)
        .order_by(RemoteMappings::CreatedAtMs, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// UPDATE remote_mappings SET init_segment_uploaded = 1 WHERE recording_id = ?
pub fn mark_init_uploaded(recording_id: &str) -> String {
    Query::update()
        .table(RemoteMappings::Table)
        .value(RemoteMappings::InitSegmentUploaded, 1i32)
        .and_where(Expr::col(RemoteMappings::RecordingId).eq(recording_id))
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM remote_mappings WHERE recording_id = ?
pub fn delete(recording_id: &str) -> String {
    Query::delete()
        .from_table(RemoteMappings::Table)
        .and_where(Expr::col(RemoteMappings::RecordingId).eq(recording_id))
        .to_string(SqliteQueryBuilder)
}
