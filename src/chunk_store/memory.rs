use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use super::{content_hash, ensure_not_empty, ChunkSlot, ChunkStore, PutOutcome};
use crate::error::Result;
use crate::ids::RecordingKey;

struct StoredChunk {
    hash: String,
    bytes: Arc<Vec<u8>>,
}

/// In-process chunk store with the same idempotency contract as the durable ones
pub struct MemoryChunkStore<K> {
    chunks: DashMap<(String, ChunkSlot), StoredChunk>,
    _key: PhantomData<fn() -> K>,
}

impl<K: RecordingKey> Default for MemoryChunkStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: RecordingKey> MemoryChunkStore<K> {
    pub fn new() -> Self {
        Self {
            chunks: DashMap::new(),
            _key: PhantomData,
        }
    }

    /// Number of stored units across all recordings, init segments included
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[async_trait::async_trait]
impl<K: RecordingKey> ChunkStore for MemoryChunkStore<K> {
    type Id = K;

    async fn put_slot(&self, recording_id: &K, slot: ChunkSlot, bytes: &[u8]) -> Result<PutOutcome> {
        ensure_not_empty(slot, bytes)?;
        // Same id range as the durable stores.
        slot.db_id()?;
        let hash = content_hash(bytes);
        // The entry guard holds the shard lock, so check-and-insert is atomic.
        match self.chunks.entry((recording_id.as_str().to_string(), slot)) {
            Entry::Occupied(existing) if existing.get().hash == hash => Ok(PutOutcome::AlreadyPresent),
            Entry::Occupied(_) => Ok(PutOutcome::Conflict),
            Entry::Vacant(vacant) => {
                vacant.insert(StoredChunk {
                    hash,
                    bytes: Arc::new(bytes.to_vec()),
                });
                Ok(PutOutcome::Stored)
            }
        }
    }

    async fn get_slot(&self, recording_id: &K, slot: ChunkSlot) -> Result<Option<Vec<u8>>> {
        Ok(self
            .chunks
            .get(&(recording_id.as_str().to_string(), slot))
            .map(|c| c.bytes.as_ref().clone()))
    }

    async fn list_chunk_ids(&self, recording_id: &K) -> Result<Vec<u64>> {
        let mut ids: Vec<u64> = self
            .chunks
            .iter()
            .filter_map(|entry| match entry.key() {
                (rid, ChunkSlot::Chunk(id)) if rid == recording_id.as_str() => Some(*id),
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn delete_all(&self, recording_id: &K) -> Result<()> {
        self.chunks.retain(|(rid, _), _| rid != recording_id.as_str());
        Ok(())
    }
}
