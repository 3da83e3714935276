use sea_query::Iden;

/// Metadata table - key-value store for database configuration
#[derive(Iden)]
pub enum Metadata {
    Table,
    Key,
    Value,
}

/// Recordings table - one row per recording, client or server side
#[derive(Iden)]
pub enum Recordings {
    Table,
    Id,
    RoomId,
    State,
    CreatedAtMs,
    StartedAtMs,
    FinishedAtMs,
    ChunkCount,
    TotalSize,
    Metadata,
}

/// Chunks table - content-addressed chunk bytes, init segment at chunk_id = -1
#[derive(Iden)]
pub enum Chunks {
    Table,
    RecordingId,
    ChunkId,
    ContentHash,
    Size,
    Data,
    CreatedAtMs,
}

/// Upload states table - per-(recording, chunk) upload ledger
#[derive(Iden)]
pub enum UploadStates {
    Table,
    RecordingId,
    ChunkId,
    Status,
    RetryCount,
    LastAttemptAtMs,
    LastError,
}

/// Remote mappings table - local recording id to remote recording id
#[derive(Iden)]
pub enum RemoteMappings {
    Table,
    RecordingId,
    RemoteRecordingId,
    InitSegmentUploaded,
    CreatedAtMs,
}

/// Rooms table - shared sessions grouping recordings (server side)
#[derive(Iden)]
pub enum Rooms {
    Table,
    Id,
    AccessToken,
    State,
    ScheduledStartAtMs,
    CreatedAtMs,
    UpdatedAtMs,
}

/// Room membership in join order (server side)
#[derive(Iden)]
pub enum RoomRecordings {
    Table,
    RoomId,
    RecordingId,
    Position,
}
