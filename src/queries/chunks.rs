use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};

use crate::constants::INIT_CHUNK_ID;
use crate::schema::Chunks;

/// INSERT INTO chunks (recording_id, chunk_id, content_hash, size, data, created_at_ms)
/// VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING
///
/// Callers inspect rows_affected: 0 means a chunk already occupies the slot.
pub fn insert_or_ignore(
    recording_id: &str,
    chunk_id: i64,
    content_hash: &str,
    data: &[u8],
    created_at_ms: i64,
) -> String {
    Query::insert()
        .into_table(Chunks::Table)
        .columns([
            Chunks::RecordingId,
            Chunks::ChunkId,
            Chunks::ContentHash,
            Chunks::Size,
            Chunks::Data,
            Chunks::CreatedAtMs,
        ])
        .values_panic([
            recording_id.into(),
            chunk_id.into(),
            content_hash.into(),
            (data.len() as i64).into(),
            data.to_vec().into(),
            created_at_ms.into(),
        ])
        .on_conflict(OnConflict::new().do_nothing().to_owned())
        .to_string(SqliteQueryBuilder)
}

/// SELECT content_hash FROM chunks WHERE recording_id = ? AND chunk_id = ?
pub fn select_hash(recording_id: &str, chunk_id: i64) -> String {
    Query::select()
        .column(Chunks::ContentHash)
        .from(Chunks::Table)
        .and_where(Expr::col(Chunks::RecordingId).eq(recording_id))
        .and_where(Expr::col(Chunks::ChunkId).eq(chunk_id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT data FROM chunks WHERE recording_id = ? AND chunk_id = ?
pub fn select_data(recording_id: &str, chunk_id: i64) -> String {
    Query::select()
        .column(Chunks::Data)
        .from(Chunks::Table)
        .and_where(Expr::col(Chunks::RecordingId).eq(recording_id))
        .and_where(Expr::col(Chunks::ChunkId).eq(chunk_id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT chunk_id FROM chunks WHERE recording_id = ? AND chunk_id <> -1 ORDER BY chunk_id
pub fn select_chunk_ids(recording_id: &str) -> String {
    Query::select()
        .column(Chunks::ChunkId)
        .from(Chunks::Table)
        .and_where(Expr::col(Chunks::RecordingId).eq(recording_id))
        .and_where(Expr::col(Chunks::ChunkId).ne(INIT_CHUNK_ID))
        .order_by(Chunks::ChunkId, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM chunks WHERE recording_id = ?
pub fn delete_for_recording(recording_id: &str) -> String {
    Query::delete()
        .from_table(Chunks::Table)
        .and_where(Expr::col(Chunks::RecordingId).eq(recording_id))
        .to_string(SqliteQueryBuilder)
}
