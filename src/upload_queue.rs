//! Bounded-concurrency retrying pipeline from the local store to the remote one.
//!
//! One queue per (local id, remote id) pair. `enqueue` records the slot as
//! pending in the ledger and hands it to a background task; the caller never
//! waits on the network. At most `max_concurrency` transfers of the queue are
//! in flight; a transfer waiting out its retry backoff does not hold a slot.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

use crate::chunk_store::{ChunkSlot, ChunkStore, PutOutcome};
use crate::constants::{
    self, DEFAULT_MAX_CONCURRENCY, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF_MS,
    MAX_CONCURRENCY_CEILING,
};
use crate::error::{Result, SyncError};
use crate::ids::{RecordingId, RemoteRecordingId};
use crate::ledger::UploadLedger;
use crate::remote_mapping::RemoteMappingStore;

/// Client-side store addressed by local ids
pub type LocalStore = Arc<dyn ChunkStore<Id = RecordingId>>;

/// Remote store addressed by the ids the remote side assigned
pub type RemoteStore = Arc<dyn ChunkStore<Id = RemoteRecordingId>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    pub max_concurrency: usize,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

impl UploadOptions {
    pub fn clamped(self) -> Self {
        Self {
            max_concurrency: self.max_concurrency.clamp(1, MAX_CONCURRENCY_CEILING),
            ..self
        }
    }
}

/// Snapshot of a queue's progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: u64,
    pub uploaded: u64,
    pub failed: u64,
    pub pending: u64,
}

impl QueueStats {
    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }

    pub fn all_uploaded(&self) -> bool {
        self.uploaded == self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retryable errors until the bound was reached
    Exhausted,
    /// Non-retryable error or a content conflict
    Rejected,
    /// The remote side no longer knows the recording
    RemoteGone,
    /// The queue was closed while the transfer was outstanding
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct UploadFailure {
    pub slot: ChunkSlot,
    pub kind: FailureKind,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Outstanding,
    Uploaded,
    Failed,
}

struct QueueInner {
    recording_id: RecordingId,
    remote_id: RemoteRecordingId,
    local: LocalStore,
    remote: RemoteStore,
    ledger: UploadLedger,
    mappings: RemoteMappingStore,
    options: UploadOptions,
    permits: Arc<Semaphore>,
    slots: DashMap<ChunkSlot, SlotState>,
    /// Bytes of units that never made it into the local store
    staged: DashMap<ChunkSlot, Vec<u8>>,
    failures: DashMap<ChunkSlot, UploadFailure>,
    total: AtomicU64,
    uploaded: AtomicU64,
    failed: AtomicU64,
    outstanding: watch::Sender<usize>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<QueueInner>,
}

impl UploadQueue {
    pub fn new(
        recording_id: RecordingId,
        remote_id: RemoteRecordingId,
        local: LocalStore,
        remote: RemoteStore,
        ledger: UploadLedger,
        mappings: RemoteMappingStore,
        options: UploadOptions,
    ) -> Self {
        let options = options.clamped();
        let (outstanding, _) = watch::channel(0usize);
        Self {
            inner: Arc::new(QueueInner {
                recording_id,
                remote_id,
                local,
                remote,
                ledger,
                mappings,
                permits: Arc::new(Semaphore::new(options.max_concurrency)),
                options,
                slots: DashMap::new(),
                staged: DashMap::new(),
                failures: DashMap::new(),
                total: AtomicU64::new(0),
                uploaded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                outstanding,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn recording_id(&self) -> &RecordingId {
        &self.inner.recording_id
    }

    pub fn remote_id(&self) -> &RemoteRecordingId {
        &self.inner.remote_id
    }

    pub fn options(&self) -> UploadOptions {
        self.inner.options
    }

    /// Accept a chunk that is durable in the local store
    ///
    /// Returns `false` when the slot is already outstanding or uploaded. A
    /// slot that failed earlier is driven again. Fails once the queue is
    /// closed.
    pub async fn enqueue(&self, chunk_id: u64) -> Result<bool> {
        self.enqueue_slot(ChunkSlot::Chunk(chunk_id)).await
    }

    /// Accept the init segment; acknowledging it flips the mapping flag
    pub async fn enqueue_init(&self) -> Result<bool> {
        self.enqueue_slot(ChunkSlot::Init).await
    }

    /// Accept a unit whose local write failed
    ///
    /// The queue holds the bytes in memory until the remote acknowledges them.
    pub async fn enqueue_staged(&self, slot: ChunkSlot, bytes: Vec<u8>) -> Result<bool> {
        self.inner.staged.insert(slot, bytes);
        let accepted = self.enqueue_slot(slot).await;
        if !matches!(accepted, Ok(true)) {
            if let Some(SlotState::Uploaded) | None = self.inner.slots.get(&slot).map(|s| *s) {
                self.inner.staged.remove(&slot);
            }
        }
        accepted
    }

    /// Units held only in memory, not yet acknowledged by the remote
    pub fn staged_slots(&self) -> Vec<ChunkSlot> {
        let mut slots: Vec<ChunkSlot> = self.inner.staged.iter().map(|e| *e.key()).collect();
        slots.sort();
        slots
    }

    pub async fn enqueue_slot(&self, slot: ChunkSlot) -> Result<bool> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Upload(format!(
                "upload queue for {} is closed",
                inner.recording_id
            )));
        }

        // Slot state and counters change together under the entry guard.
        let previous = match inner.slots.entry(slot) {
            Entry::Occupied(mut entry) => {
                let current = *entry.get();
                if current != SlotState::Failed {
                    return Ok(false);
                }
                entry.insert(SlotState::Outstanding);
                inner.failures.remove(&slot);
                inner.failed.fetch_sub(1, Ordering::SeqCst);
                Some(current)
            }
            Entry::Vacant(entry) => {
                entry.insert(SlotState::Outstanding);
                inner.total.fetch_add(1, Ordering::SeqCst);
                None
            }
        };

        // The pending record must exist before the first transfer attempt.
        if let Err(e) = inner.ledger.mark_pending(&inner.recording_id, slot).await {
            match inner.slots.entry(slot) {
                Entry::Occupied(entry) if previous.is_none() => {
                    entry.remove();
                    inner.total.fetch_sub(1, Ordering::SeqCst);
                }
                entry => {
                    entry.insert(SlotState::Failed);
                    inner.failed.fetch_add(1, Ordering::SeqCst);
                }
            }
            return Err(e);
        }

        inner.outstanding.send_modify(|n| *n += 1);
        debug!("[UploadQueue] {} accepted {}", inner.recording_id, slot);
        let task = Arc::clone(inner);
        tokio::spawn(async move {
            let outcome = task.drive(slot).await;
            task.settle(slot, outcome);
        });
        Ok(true)
    }

    /// Resolves once every accepted slot is uploaded or failed
    ///
    /// Safe to call repeatedly and from several tasks.
    pub async fn wait_for_completion(&self) -> QueueStats {
        let mut rx = self.inner.outstanding.subscribe();
        // The sender lives in `inner`, so the channel cannot close under us.
        let _ = rx.wait_for(|n| *n == 0).await;
        self.stats()
    }

    pub fn stats(&self) -> QueueStats {
        let total = self.inner.total.load(Ordering::SeqCst);
        let uploaded = self.inner.uploaded.load(Ordering::SeqCst);
        let failed = self.inner.failed.load(Ordering::SeqCst);
        QueueStats {
            total,
            uploaded,
            failed,
            pending: total.saturating_sub(uploaded.saturating_add(failed)),
        }
    }

    /// Failed slots, init segment first then ascending chunk id
    pub fn failures(&self) -> Vec<UploadFailure> {
        let mut failures: Vec<UploadFailure> =
            self.inner.failures.iter().map(|f| f.value().clone()).collect();
        failures.sort_by_key(|f| f.slot);
        failures
    }

    /// Whether any failure says the remote recording is gone
    pub fn remote_gone(&self) -> bool {
        self.inner
            .failures
            .iter()
            .any(|f| f.kind == FailureKind::RemoteGone)
    }

    /// Stop accepting work; outstanding transfers stop before their next attempt
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl QueueInner {
    async fn drive(&self, slot: ChunkSlot) -> std::result::Result<u32, UploadFailure> {
        let mut retries = 0u32;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(UploadFailure {
                    slot,
                    kind: FailureKind::Cancelled,
                    attempts: retries,
                    error: "queue closed".to_string(),
                });
            }

            let attempt = {
                let _permit = match self.permits.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return Err(UploadFailure {
                            slot,
                            kind: FailureKind::Cancelled,
                            attempts: retries,
                            error: "queue shut down".to_string(),
                        })
                    }
                };
                self.attempt(slot, retries).await
            };

            let err = match attempt {
                Ok(()) => return Ok(retries + 1),
                Err(err) => err,
            };

            if err.is_retryable() && retries < self.options.max_retries {
                retries += 1;
                warn!(
                    "[UploadQueue] {} slot {} attempt {} failed, retrying: {}",
                    self.recording_id, slot, retries, err
                );
                if let Err(e) = self
                    .ledger
                    .mark_retrying(&self.recording_id, slot, retries, &err.to_string())
                    .await
                {
                    warn!("[UploadQueue] ledger write failed for {}/{}: {}", self.recording_id, slot, e);
                }
                let delay = constants::backoff_ms(self.options.retry_backoff_ms, retries);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                continue;
            }

            let kind = match &err {
                SyncError::RemoteRecordingGone(_) => FailureKind::RemoteGone,
                e if e.is_retryable() => FailureKind::Exhausted,
                _ => FailureKind::Rejected,
            };
            error!(
                "[UploadQueue] {} slot {} failed after {} attempt(s): {}",
                self.recording_id,
                slot,
                retries + 1,
                err
            );
            if !self.closed.load(Ordering::SeqCst) {
                if let Err(e) = self
                    .ledger
                    .mark_failed(&self.recording_id, slot, retries, &err.to_string())
                    .await
                {
                    warn!("[UploadQueue] ledger write failed for {}/{}: {}", self.recording_id, slot, e);
                }
            }
            return Err(UploadFailure {
                slot,
                kind,
                attempts: retries + 1,
                error: err.to_string(),
            });
        }
    }

    async fn attempt(&self, slot: ChunkSlot, retries: u32) -> Result<()> {
        let staged = self.staged.get(&slot).map(|bytes| bytes.value().clone());
        let bytes = match staged {
            Some(bytes) => bytes,
            None => self
                .local
                .get_slot(&self.recording_id, slot)
                .await?
                .ok_or_else(|| {
                    SyncError::InvalidChunk(format!(
                        "{}/{} is not in the local store",
                        self.recording_id, slot
                    ))
                })?,
        };

        self.ledger
            .mark_uploading(&self.recording_id, slot, retries)
            .await?;

        match self.remote.put_slot(&self.remote_id, slot, &bytes).await? {
            PutOutcome::Conflict => {
                return Err(SyncError::Conflict {
                    recording_id: self.remote_id.to_string(),
                    chunk: slot.to_string(),
                })
            }
            PutOutcome::Stored | PutOutcome::AlreadyPresent => {}
        }

        // Acknowledged by the remote store; only now may the ledger say so.
        self.ledger
            .mark_uploaded(&self.recording_id, slot, retries)
            .await?;
        if slot == ChunkSlot::Init {
            self.mappings.mark_init_uploaded(&self.recording_id).await?;
        }
        Ok(())
    }

    fn settle(&self, slot: ChunkSlot, outcome: std::result::Result<u32, UploadFailure>) {
        {
            let mut entry = self.slots.entry(slot).or_insert(SlotState::Outstanding);
            match outcome {
                Ok(attempts) => {
                    *entry = SlotState::Uploaded;
                    self.staged.remove(&slot);
                    self.uploaded.fetch_add(1, Ordering::SeqCst);
                    debug!(
                        "[UploadQueue] {} uploaded {} in {} attempt(s)",
                        self.recording_id, slot, attempts
                    );
                }
                Err(failure) => {
                    *entry = SlotState::Failed;
                    self.failures.insert(slot, failure);
                    self.failed.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        if *self.outstanding.borrow() == 0 {
            info!(
                "[UploadQueue] {} drained: {} uploaded, {} failed",
                self.recording_id,
                self.uploaded.load(Ordering::SeqCst),
                self.failed.load(Ordering::SeqCst)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_are_clamped() {
        let opts = UploadOptions {
            max_concurrency: 50,
            ..Default::default()
        }
        .clamped();
        assert_eq!(opts.max_concurrency, MAX_CONCURRENCY_CEILING);
        let opts = UploadOptions {
            max_concurrency: 0,
            ..Default::default()
        }
        .clamped();
        assert_eq!(opts.max_concurrency, 1);
    }

    #[test]
    fn test_stats_helpers() {
        let stats = QueueStats {
            total: 3,
            uploaded: 2,
            failed: 1,
            pending: 0,
        };
        assert!(stats.is_complete());
        assert!(!stats.all_uploaded());
        assert!(QueueStats::default().all_uploaded());
    }
}
