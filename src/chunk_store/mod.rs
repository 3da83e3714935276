//! Content-addressed chunk storage.
//!
//! One contract with local and remote implementations:
//! - `SqliteChunkStore` - durable storage in a SQLite database
//! - `MemoryChunkStore` - in-process storage
//! - `HttpChunkStore` - the remote server, over HTTP
//!
//! `put` is idempotent by content: storing identical bytes at an occupied slot
//! succeeds without writing, storing different bytes is a conflict and leaves
//! the existing bytes untouched.

pub mod http;
pub mod memory;
pub mod sqlite;

use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{Result, SyncError};
use crate::ids::RecordingKey;

pub use http::{HttpChunkStore, TransferMode};
pub use memory::MemoryChunkStore;
pub use sqlite::SqliteChunkStore;

/// Lowercase hex SHA-256 of a chunk body
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Result of an idempotent put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Slot was empty, bytes are now durable
    Stored,
    /// Identical bytes were already durable, nothing written
    AlreadyPresent,
    /// Slot holds different bytes, nothing written
    Conflict,
}

impl PutOutcome {
    /// Whether the bytes are durable at the target after this put
    pub fn is_durable(self) -> bool {
        matches!(self, PutOutcome::Stored | PutOutcome::AlreadyPresent)
    }
}

/// Addressable unit inside a recording: the init segment or a numbered chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChunkSlot {
    Init,
    Chunk(u64),
}

impl ChunkSlot {
    /// Numbered slot, rejecting ids the row key cannot hold
    pub fn chunk(chunk_id: u64) -> Result<Self> {
        let slot = ChunkSlot::Chunk(chunk_id);
        slot.db_id()?;
        Ok(slot)
    }

    /// Row key in the `chunks` table
    ///
    /// Chunk ids share the signed row key with the init segment, so only
    /// `0..=i64::MAX` is addressable.
    pub fn db_id(self) -> Result<i64> {
        match self {
            ChunkSlot::Init => Ok(crate::constants::INIT_CHUNK_ID),
            ChunkSlot::Chunk(id) => i64::try_from(id).map_err(|_| {
                SyncError::InvalidChunk(format!("chunk id {} is out of range", id))
            }),
        }
    }
}

impl fmt::Display for ChunkSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkSlot::Init => f.write_str("init"),
            ChunkSlot::Chunk(id) => write!(f, "{}", id),
        }
    }
}

/// A chunk as handed over by the capture pipeline
#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_id: u64,
    pub bytes: Vec<u8>,
    pub content_hash: String,
    pub has_keyframe: Option<bool>,
}

impl Chunk {
    pub fn new(chunk_id: u64, bytes: Vec<u8>) -> Self {
        let content_hash = content_hash(&bytes);
        Self {
            chunk_id,
            bytes,
            content_hash,
            has_keyframe: None,
        }
    }

    pub fn with_keyframe(mut self, has_keyframe: bool) -> Self {
        self.has_keyframe = Some(has_keyframe);
        self
    }
}

/// Reject empty payloads before they reach any store
pub(crate) fn ensure_not_empty(slot: ChunkSlot, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(SyncError::InvalidChunk(format!("chunk {} has an empty payload", slot)));
    }
    Ok(())
}

/// Durable storage of one init segment plus N numbered chunks per recording
#[async_trait::async_trait]
pub trait ChunkStore: Send + Sync {
    type Id: RecordingKey;

    async fn put_slot(&self, recording_id: &Self::Id, slot: ChunkSlot, bytes: &[u8])
        -> Result<PutOutcome>;

    async fn get_slot(&self, recording_id: &Self::Id, slot: ChunkSlot) -> Result<Option<Vec<u8>>>;

    /// Numbered chunk ids in ascending order, init segment excluded
    async fn list_chunk_ids(&self, recording_id: &Self::Id) -> Result<Vec<u64>>;

    /// Remove every stored unit of a recording; no-op when nothing exists
    async fn delete_all(&self, recording_id: &Self::Id) -> Result<()>;

    async fn put_init(&self, recording_id: &Self::Id, bytes: &[u8]) -> Result<PutOutcome> {
        self.put_slot(recording_id, ChunkSlot::Init, bytes).await
    }

    async fn get_init(&self, recording_id: &Self::Id) -> Result<Option<Vec<u8>>> {
        self.get_slot(recording_id, ChunkSlot::Init).await
    }

    async fn put(&self, recording_id: &Self::Id, chunk_id: u64, bytes: &[u8]) -> Result<PutOutcome> {
        self.put_slot(recording_id, ChunkSlot::Chunk(chunk_id), bytes)
            .await
    }

    async fn get(&self, recording_id: &Self::Id, chunk_id: u64) -> Result<Option<Vec<u8>>> {
        self.get_slot(recording_id, ChunkSlot::Chunk(chunk_id)).await
    }
}
