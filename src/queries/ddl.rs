use sea_query::{ColumnDef, ForeignKey, ForeignKeyAction, Index, SqliteQueryBuilder, Table};

use crate::schema::{
    Chunks, Metadata, RemoteMappings, Recordings, RoomRecordings, Rooms, UploadStates,
};

/// CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL)
pub fn create_metadata_table() -> String {
    Table::create()
        .table(Metadata::Table)
        .if_not_exists()
        .col(ColumnDef::new(Metadata::Key).string().primary_key())
        .col(ColumnDef::new(Metadata::Value).string().not_null())
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS recordings (
///     id TEXT PRIMARY KEY,
///     room_id TEXT,
///     state TEXT NOT NULL,
///     created_at_ms INTEGER NOT NULL,
///     started_at_ms INTEGER,
///     finished_at_ms INTEGER,
///     chunk_count INTEGER NOT NULL DEFAULT 0,
///     total_size INTEGER NOT NULL DEFAULT 0,
///     metadata TEXT NOT NULL
/// )
pub fn create_recordings_table() -> String {
    Table::create()
        .table(Recordings::Table)
        .if_not_exists()
        .col(ColumnDef::new(Recordings::Id).string().primary_key())
        .col(ColumnDef::new(Recordings::RoomId).string())
        .col(ColumnDef::new(Recordings::State).string().not_null())
        .col(
            ColumnDef::new(Recordings::CreatedAtMs)
                .big_integer()
                .not_null(),
        )
        .col(ColumnDef::new(Recordings::StartedAtMs).big_integer())
        .col(ColumnDef::new(Recordings::FinishedAtMs).big_integer())
        .col(
            ColumnDef::new(Recordings::ChunkCount)
                .big_integer()
                .not_null()
                .default(0),
        )
        .col(
            ColumnDef::new(Recordings::TotalSize)
                .big_integer()
                .not_null()
                .default(0),
        )
        .col(ColumnDef::new(Recordings::Metadata).string().not_null())
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_recordings_state ON recordings(state)
pub fn create_recordings_state_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_recordings_state")
        .table(Recordings::Table)
        .col(Recordings::State)
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS chunks (
///     recording_id TEXT NOT NULL,
///     chunk_id INTEGER NOT NULL,
///     content_hash TEXT NOT NULL,
///     size INTEGER NOT NULL,
///     data BLOB NOT NULL,
///     created_at_ms INTEGER NOT NULL,
///     PRIMARY KEY (recording_id, chunk_id)
/// )
pub fn create_chunks_table() -> String {
    Table::create()
        .table(Chunks::Table)
        .if_not_exists()
        .col(ColumnDef::new(Chunks::RecordingId).string().not_null())
        .col(ColumnDef::new(Chunks::ChunkId).big_integer().not_null())
        .col(ColumnDef::new(Chunks::ContentHash).string().not_null())
        .col(ColumnDef::new(Chunks::Size).big_integer().not_null())
        .col(ColumnDef::new(Chunks::Data).blob().not_null())
        .col(ColumnDef::new(Chunks::CreatedAtMs).big_integer().not_null())
        .primary_key(
            Index::create()
                .col(Chunks::RecordingId)
                .col(Chunks::ChunkId),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS upload_states (
///     recording_id TEXT NOT NULL,
///     chunk_id INTEGER NOT NULL,
///     status TEXT NOT NULL,
///     retry_count INTEGER NOT NULL DEFAULT 0,
///     last_attempt_at_ms INTEGER,
///     last_error TEXT,
///     PRIMARY KEY (recording_id, chunk_id)
/// )
pub fn create_upload_states_table() -> String {
    Table::create()
        .table(UploadStates::Table)
        .if_not_exists()
        .col(ColumnDef::new(UploadStates::RecordingId).string().not_null())
        .col(ColumnDef::new(UploadStates::ChunkId).big_integer().not_null())
        .col(ColumnDef::new(UploadStates::Status).string().not_null())
        .col(
            ColumnDef::new(UploadStates::RetryCount)
                .integer()
                .not_null()
                .default(0),
        )
        .col(ColumnDef::new(UploadStates::LastAttemptAtMs).big_integer())
        .col(ColumnDef::new(UploadStates::LastError).string())
        .primary_key(
            Index::create()
                .col(UploadStates::RecordingId)
                .col(UploadStates::ChunkId),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_upload_states_recording ON upload_states(recording_id)
pub fn create_upload_states_recording_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_upload_states_recording")
        .table(UploadStates::Table)
        .col(UploadStates::RecordingId)
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS remote_mappings (
///     recording_id TEXT PRIMARY KEY,
///     remote_recording_id TEXT NOT NULL,
///     init_segment_uploaded INTEGER NOT NULL DEFAULT 0,
///     created_at_ms INTEGER NOT NULL
/// )
pub fn create_remote_mappings_table() -> String {
    Table::create()
        .table(RemoteMappings::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(RemoteMappings::RecordingId)
                .string()
                .primary_key(),
        )
        .col(
            ColumnDef::new(RemoteMappings::RemoteRecordingId)
                .string()
                .not_null(),
        )
        .col(
            ColumnDef::new(RemoteMappings::InitSegmentUploaded)
                .integer()
                .not_null()
                .default(0),
        )
        .col(
            ColumnDef::new(RemoteMappings::CreatedAtMs)
                .big_integer()
                .not_null(),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS rooms (
///     id TEXT PRIMARY KEY,
///     access_token TEXT NOT NULL,
///     state TEXT NOT NULL,
///     scheduled_start_at_ms INTEGER,
///     created_at_ms INTEGER NOT NULL,
///     updated_at_ms INTEGER NOT NULL
/// )
pub fn create_rooms_table() -> String {
    Table::create()
        .table(Rooms::Table)
        .if_not_exists()
        .col(ColumnDef::new(Rooms::Id).string().primary_key())
        .col(ColumnDef::new(Rooms::AccessToken).string().not_null())
        .col(ColumnDef::new(Rooms::State).string().not_null())
        .col(ColumnDef::new(Rooms::ScheduledStartAtMs).big_integer())
        .col(ColumnDef::new(Rooms::CreatedAtMs).big_integer().not_null())
        .col(ColumnDef::new(Rooms::UpdatedAtMs).big_integer().not_null())
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS room_recordings (
///     room_id TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
///     recording_id TEXT NOT NULL,
///     position INTEGER NOT NULL,
///     PRIMARY KEY (room_id, recording_id)
/// )
pub fn create_room_recordings_table() -> String {
    Table::create()
        .table(RoomRecordings::Table)
        .if_not_exists()
        .col(ColumnDef::new(RoomRecordings::RoomId).string().not_null())
        .col(
            ColumnDef::new(RoomRecordings::RecordingId)
                .string()
                .not_null(),
        )
        .col(
            ColumnDef::new(RoomRecordings::Position)
                .big_integer()
                .not_null(),
        )
        .primary_key(
            Index::create()
                .col(RoomRecordings::RoomId)
                .col(RoomRecordings::RecordingId),
        )
        .foreign_key(
            ForeignKey::create()
                .from(RoomRecordings::Table, RoomRecordings::RoomId)
                .to(Rooms::Table, Rooms::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// Every statement needed for a fresh database, in dependency order
pub fn all_statements() -> Vec<String> {
    vec![
        create_metadata_table(),
        create_recordings_table(),
        create_recordings_state_index(),
        create_chunks_table(),
        create_upload_states_table(),
        create_upload_states_recording_index(),
        create_remote_mappings_table(),
        create_rooms_table(),
        create_room_recordings_table(),
    ]
}
