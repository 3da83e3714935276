use sea_query::{Expr, Order, Query, SqliteQueryBuilder};

use crate::schema::Recordings;

const ALL_COLUMNS: [Recordings; 9] = [
    Recordings::Id,
    Recordings::RoomId,
    Recordings::State,
    Recordings::CreatedAtMs,
    Recordings::StartedAtMs,
    Recordings::FinishedAtMs,
    Recordings::ChunkCount,
    Recordings::TotalSize,
    Recordings::Metadata,
];

/// INSERT INTO recordings (id, room_id, state, created_at_ms, started_at_ms, finished_at_ms,
///                         chunk_count, total_size, metadata)
/// VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
#[allow(clippy::too_many_arguments)]
pub fn insert(
    id: &str,
    room_id: Option<&str>,
    state: &str,
    created_at_ms: i64,
    started_at_ms: Option<i64>,
    finished_at_ms: Option<i64>,
    chunk_count: i64,
    total_size: i64,
    metadata_json: &str,
) -> String {
    Query::insert()
        .into_table(Recordings::Table)
        .columns(ALL_COLUMNS)
        .values_panic([
            id.into(),
            room_id.map(str::to_string).into(),
            state.into(),
            created_at_ms.into(),
            started_at_ms.into(),
            finished_at_ms.into(),
            chunk_count.into(),
            total_size.into(),
            metadata_json.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// SELECT * FROM recordings WHERE id = ?
pub fn select_by_id(id: &str) -> String {
    Query::select()
        .columns(ALL_COLUMNS)
        .from(Recordings::Table)
        .and_where(Expr::col(Recordings::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT * FROM recordings ORDER BY created_at_ms
pub fn select_all() -> String {
    Query::select()
        .columns(ALL_COLUMNS)
        .from(Recordings::Table)
        .order_by(Recordings::CreatedAtMs, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT * FROM recordings WHERE state <> 'synced' AND chunk_count > 0 ORDER BY created_at_ms
pub fn select_unsynced_with_chunks() -> String {
    Query::select()
        .columns(ALL_COLUMNS)
        .from(Recordings::Table)
        .and_where(Expr::col(Recordings::State).ne("synced"))
        .and_where(Expr::col(Recordings::ChunkCount).gt(0))
        .order_by(Recordings::CreatedAtMs, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT * FROM recordings WHERE state IN (...) ORDER BY created_at_ms
pub fn select_in_states(states: &[&str]) -> String {
    Query::select()
        .columns(ALL_COLUMNS)
        .from(Recordings::Table)
        .and_where(Expr::col(Recordings::State).is_in(states.iter().copied()))
        .order_by(Recordings::CreatedAtMs, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// UPDATE recordings SET state = ?, started_at_ms = ?, finished_at_ms = ?
/// WHERE id = ? AND state = ?
///
/// The `state = ?` guard makes the write a compare-and-set against the state
/// the transition was validated from.
pub fn update_state(
    id: &str,
    expected_state: &str,
    state: &str,
    started_at_ms: Option<i64>,
    finished_at_ms: Option<i64>,
) -> String {
    Query::update()
        .table(Recordings::Table)
        .value(Recordings::State, state)
        .value(Recordings::StartedAtMs, started_at_ms)
        .value(Recordings::FinishedAtMs, finished_at_ms)
        .and_where(Expr::col(Recordings::Id).eq(id))
        .and_where(Expr::col(Recordings::State).eq(expected_state))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE recordings SET chunk_count = chunk_count + 1, total_size = total_size + ?
/// WHERE id = ? AND state IN ('recording', 'finalizing')
pub fn increment_chunk(id: &str, size: i64) -> String {
    Query::update()
        .table(Recordings::Table)
        .value(
            Recordings::ChunkCount,
            Expr::col(Recordings::ChunkCount).add(1),
        )
        .value(
            Recordings::TotalSize,
            Expr::col(Recordings::TotalSize).add(size),
        )
        .and_where(Expr::col(Recordings::Id).eq(id))
        .and_where(Expr::col(Recordings::State).is_in(["recording", "finalizing"]))
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM recordings WHERE id = ?
pub fn delete(id: &str) -> String {
    Query::delete()
        .from_table(Recordings::Table)
        .and_where(Expr::col(Recordings::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}
