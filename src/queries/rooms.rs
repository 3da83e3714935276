use sea_query::{Expr, Order, Query, SqliteQueryBuilder};

use crate::schema::{RoomRecordings, Rooms};

const ROOM_COLUMNS: [Rooms; 6] = [
    Rooms::Id,
    Rooms::AccessToken,
    Rooms::State,
    Rooms::ScheduledStartAtMs,
    Rooms::CreatedAtMs,
    Rooms::UpdatedAtMs,
];

/// INSERT INTO rooms (id, access_token, state, scheduled_start_at_ms, created_at_ms, updated_at_ms)
/// VALUES (?, ?, ?, NULL, ?, ?)
pub fn insert(id: &str, access_token: &str, state: &str, created_at_ms: i64) -> String {
    Query::insert()
        .into_table(Rooms::Table)
        .columns(ROOM_COLUMNS)
        .values_panic([
            id.into(),
            access_token.into(),
            state.into(),
            Option::<i64>::None.into(),
            created_at_ms.into(),
            created_at_ms.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// SELECT * FROM rooms WHERE id = ?
pub fn select_by_id(id: &str) -> String {
    Query::select()
        .columns(ROOM_COLUMNS)
        .from(Rooms::Table)
        .and_where(Expr::col(Rooms::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT * FROM rooms WHERE access_token = ?
pub fn select_by_token(access_token: &str) -> String {
    Query::select()
        .columns(ROOM_COLUMNS)
        .from(Rooms::Table)
        .and_where(Expr::col(Rooms::AccessToken).eq(access_token))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE rooms SET state = ?, scheduled_start_at_ms = ?, updated_at_ms = ?
/// WHERE id = ? AND state = ?
pub fn update_state(
    id: &str,
    expected_state: &str,
    state: &str,
    scheduled_start_at_ms: Option<i64>,
    updated_at_ms: i64,
) -> String {
    Query::update()
        .table(Rooms::Table)
        .value(Rooms::State, state)
        .value(Rooms::ScheduledStartAtMs, scheduled_start_at_ms)
        .value(Rooms::UpdatedAtMs, updated_at_ms)
        .and_where(Expr::col(Rooms::Id).eq(id))
        .and_where(Expr::col(Rooms::State).eq(expected_state))
        .to_string(SqliteQueryBuilder)
}

/// INSERT INTO room_recordings (room_id, recording_id, position)
/// VALUES (?, ?, (SELECT COALESCE(MAX(position), -1) + 1 FROM room_recordings WHERE room_id = ?))
pub fn insert_member(room_id: &str, recording_id: &str) -> String {
    Query::insert()
        .into_table(RoomRecordings::Table)
        .columns([
            RoomRecordings::RoomId,
            RoomRecordings::RecordingId,
            RoomRecordings::Position,
        ])
        .values_panic([
            room_id.into(),
            recording_id.into(),
            Expr::cust_with_values(
                "(SELECT COALESCE(MAX(position), -1) + 1 FROM room_recordings WHERE room_id = ?)",
                [room_id],
            ),
        ])
        .to_string(SqliteQueryBuilder)
}

/// SELECT recording_id FROM room_recordings WHERE room_id = ? ORDER BY position
pub fn select_members(room_id: &str) -> String {
    Query::select()
        .column(RoomRecordings::RecordingId)
        .from(RoomRecordings::Table)
        .and_where(Expr::col(RoomRecordings::RoomId).eq(room_id))
        .order_by(RoomRecordings::Position, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM room_recordings WHERE room_id = ?
pub fn delete_members(room_id: &str) -> String {
    Query::delete()
        .from_table(RoomRecordings::Table)
        .and_where(Expr::col(RoomRecordings::RoomId).eq(room_id))
        .to_string(SqliteQueryBuilder)
}
