//! Producer side of one recording.
//!
//! Every pushed unit is written to the local store first and then handed to
//! the upload queue. Remote registration runs in the background; units pushed
//! before it completes are buffered and enqueued once the mapping exists.
//! A unit whose local write fails travels to the queue with its bytes; if no
//! uplink can take it either, it is reported as dropped when the session ends.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::chunk_store::{content_hash, ensure_not_empty, Chunk, ChunkSlot, PutOutcome};
use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::ids::{RecordingId, RemoteRecordingId, RoomId};
use crate::recording::{Recording, RecordingMetadata, RecordingState};
use crate::upload_queue::{QueueStats, UploadFailure, UploadQueue};

/// A unit waiting for the uplink; carries its bytes when the local write failed
type Buffered = (ChunkSlot, Option<Vec<u8>>);

enum Uplink {
    Registering { buffered: Vec<Buffered> },
    Ready(UploadQueue),
    /// Registration failed; the recording stays local-only
    Unregistered(String),
}

struct SessionState {
    uplink: Uplink,
    last_chunk_id: Option<u64>,
    init_pushed: bool,
    /// Units lost on every medium
    dropped: Vec<ChunkSlot>,
}

impl SessionState {
    fn drop_unit(&mut self, recording_id: &RecordingId, slot: ChunkSlot) {
        error!(
            "[Capture] {}/{} has no local copy and no uplink, dropped",
            recording_id, slot
        );
        self.dropped.push(slot);
    }
}

#[derive(Debug)]
pub enum FinishOutcome {
    Synced(Recording),
    /// Uploads failed past the retry bound or units were dropped; the
    /// recording stays in `finalizing`
    Incomplete {
        stats: QueueStats,
        failures: Vec<UploadFailure>,
        dropped: Vec<ChunkSlot>,
    },
    /// Never registered remotely, nothing was uploaded
    LocalOnly {
        recording: Recording,
        dropped: Vec<ChunkSlot>,
    },
}

pub struct CaptureSession {
    ctx: SyncContext,
    recording_id: RecordingId,
    state: Arc<Mutex<SessionState>>,
    registration: Option<JoinHandle<()>>,
}

impl CaptureSession {
    /// Create a recording, move it to `recording` and start remote registration
    pub async fn start(
        ctx: SyncContext,
        metadata: RecordingMetadata,
        room_id: Option<RoomId>,
    ) -> Result<Self> {
        let recording = Recording::new(RecordingId::generate(), room_id.clone(), metadata.clone());
        ctx.recordings.insert(&recording).await?;
        ctx.recordings
            .transition(&recording.id, RecordingState::Recording)
            .await?;
        info!("[Capture] started {}", recording.id);

        let state = Arc::new(Mutex::new(SessionState {
            uplink: Uplink::Registering {
                buffered: Vec::new(),
            },
            last_chunk_id: None,
            init_pushed: false,
            dropped: Vec::new(),
        }));

        let registration = tokio::spawn(register(
            ctx.clone(),
            recording.id.clone(),
            metadata,
            room_id,
            Arc::clone(&state),
        ));

        Ok(Self {
            ctx,
            recording_id: recording.id,
            state,
            registration: Some(registration),
        })
    }

    pub fn recording_id(&self) -> &RecordingId {
        &self.recording_id
    }

    /// Remote id, once registration succeeded
    pub async fn remote_id(&self) -> Option<RemoteRecordingId> {
        match &self.state.lock().await.uplink {
            Uplink::Ready(queue) => Some(queue.remote_id().clone()),
            _ => None,
        }
    }

    pub async fn push_init(&self, bytes: Vec<u8>) -> Result<()> {
        ensure_not_empty(ChunkSlot::Init, &bytes)?;
        let mut state = self.state.lock().await;
        if state.init_pushed {
            return Err(SyncError::InvalidChunk(format!(
                "init segment of {} already pushed",
                self.recording_id
            )));
        }
        let stored = self.store_locally(ChunkSlot::Init, &bytes).await?;
        state.init_pushed = true;
        self.hand_over(&mut state, ChunkSlot::Init, (!stored).then_some(bytes))
            .await;
        Ok(())
    }

    /// Store a chunk locally and queue it for upload
    ///
    /// Chunk ids must be strictly increasing. A failing local write is logged
    /// and the chunk goes to the uplink from memory; the session keeps going.
    pub async fn push_chunk(&self, chunk: Chunk) -> Result<()> {
        let slot = ChunkSlot::chunk(chunk.chunk_id)?;
        ensure_not_empty(slot, &chunk.bytes)?;
        let computed = content_hash(&chunk.bytes);
        if computed != chunk.content_hash {
            return Err(SyncError::HashMismatch {
                declared: chunk.content_hash,
                computed,
            });
        }

        let mut state = self.state.lock().await;
        if let Some(last) = state.last_chunk_id {
            if chunk.chunk_id <= last {
                return Err(SyncError::InvalidChunk(format!(
                    "chunk {} of {} does not follow {}",
                    chunk.chunk_id, self.recording_id, last
                )));
            }
        }
        let stored = self.store_locally(slot, &chunk.bytes).await?;
        state.last_chunk_id = Some(chunk.chunk_id);

        match self
            .ctx
            .recordings
            .record_chunk(&self.recording_id, chunk.bytes.len() as u64)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(
                "[Capture] {} no longer counts chunks, chunk {} stored anyway",
                self.recording_id, chunk.chunk_id
            ),
            Err(e) => error!("[Capture] failed to count chunk {} of {}: {}", chunk.chunk_id, self.recording_id, e),
        }

        self.hand_over(&mut state, slot, (!stored).then_some(chunk.bytes))
            .await;
        Ok(())
    }

    /// Returns false when the local write failed
    async fn store_locally(&self, slot: ChunkSlot, bytes: &[u8]) -> Result<bool> {
        match self.ctx.local.put_slot(&self.recording_id, slot, bytes).await {
            Ok(PutOutcome::Stored) | Ok(PutOutcome::AlreadyPresent) => Ok(true),
            Ok(PutOutcome::Conflict) => Err(SyncError::Conflict {
                recording_id: self.recording_id.to_string(),
                chunk: slot.to_string(),
            }),
            Err(e) => {
                error!(
                    "[Capture] local write of {}/{} failed, continuing: {}",
                    self.recording_id, slot, e
                );
                Ok(false)
            }
        }
    }

    /// `staged` carries the bytes of a unit missing from the local store
    async fn hand_over(&self, state: &mut SessionState, slot: ChunkSlot, staged: Option<Vec<u8>>) {
        if let Uplink::Registering { buffered } = &mut state.uplink {
            buffered.push((slot, staged));
            return;
        }
        let queue = match &state.uplink {
            Uplink::Ready(queue) => Some(queue.clone()),
            _ => None,
        };
        match queue {
            Some(queue) => enqueue(&queue, state, &self.recording_id, slot, staged).await,
            None if staged.is_some() => state.drop_unit(&self.recording_id, slot),
            None => {}
        }
    }

    pub async fn stats(&self) -> QueueStats {
        match &self.state.lock().await.uplink {
            Uplink::Ready(queue) => queue.stats(),
            Uplink::Registering { buffered } => QueueStats {
                total: buffered.len() as u64,
                pending: buffered.len() as u64,
                ..Default::default()
            },
            Uplink::Unregistered(_) => QueueStats::default(),
        }
    }

    /// Drain the queue and seal the recording
    ///
    /// With nothing outstanding the recording goes `recording -> synced`
    /// directly, otherwise it waits in `finalizing` for the queue to drain.
    pub async fn finish(mut self) -> Result<FinishOutcome> {
        if let Some(handle) = self.registration.take() {
            if let Err(e) = handle.await {
                warn!("[Capture] registration task of {} aborted: {}", self.recording_id, e);
            }
        }

        let (queue, dropped) = {
            let state = self.state.lock().await;
            match &state.uplink {
                Uplink::Ready(queue) => (queue.clone(), state.dropped.clone()),
                Uplink::Unregistered(reason) => {
                    warn!(
                        "[Capture] {} finished local-only: {}",
                        self.recording_id, reason
                    );
                    let recording = self
                        .ctx
                        .recordings
                        .transition(&self.recording_id, RecordingState::Finalizing)
                        .await?;
                    return Ok(FinishOutcome::LocalOnly {
                        recording,
                        dropped: state.dropped.clone(),
                    });
                }
                Uplink::Registering { .. } => {
                    return Err(SyncError::Upload(format!(
                        "registration of {} did not complete",
                        self.recording_id
                    )))
                }
            }
        };

        let stats = queue.stats();
        if stats.pending == 0 && stats.failed == 0 && dropped.is_empty() {
            let recording = self
                .ctx
                .seal(&self.recording_id, queue.remote_id(), true)
                .await?;
            return Ok(FinishOutcome::Synced(recording));
        }

        self.ctx
            .recordings
            .transition(&self.recording_id, RecordingState::Finalizing)
            .await?;
        if let Err(e) = self
            .ctx
            .registry
            .update_state(queue.remote_id(), RecordingState::Finalizing)
            .await
        {
            debug!("[Capture] remote finalizing of {} not applied: {}", queue.remote_id(), e);
        }

        let stats = queue.wait_for_completion().await;
        if queue.remote_gone() {
            return Err(SyncError::RemoteRecordingGone(queue.remote_id().to_string()));
        }
        if !stats.all_uploaded() || !dropped.is_empty() {
            warn!(
                "[Capture] {} finished with {} failed and {} dropped unit(s)",
                self.recording_id,
                stats.failed,
                dropped.len()
            );
            let staged = queue.staged_slots();
            if !staged.is_empty() {
                error!(
                    "[Capture] {} unit(s) of {} exist only in memory and are lost with this session: {:?}",
                    staged.len(),
                    self.recording_id,
                    staged
                );
            }
            return Ok(FinishOutcome::Incomplete {
                stats,
                failures: queue.failures(),
                dropped,
            });
        }

        let recording = self
            .ctx
            .seal(&self.recording_id, queue.remote_id(), false)
            .await?;
        Ok(FinishOutcome::Synced(recording))
    }

    /// Stop uploading and delete every local trace of the recording
    pub async fn discard(mut self) -> Result<()> {
        if let Some(handle) = self.registration.take() {
            handle.abort();
            let _ = handle.await;
        }
        {
            let mut state = self.state.lock().await;
            if let Uplink::Ready(queue) = &state.uplink {
                queue.close();
            }
            state.uplink = Uplink::Unregistered("discarded".to_string());
        }
        self.ctx.discard(&self.recording_id).await
    }
}

async fn register(
    ctx: SyncContext,
    recording_id: RecordingId,
    metadata: RecordingMetadata,
    room_id: Option<RoomId>,
    state: Arc<Mutex<SessionState>>,
) {
    let started = Utc::now();
    let remote_id = match ctx.registry.register(&metadata, room_id.as_ref()).await {
        Ok(id) => id,
        Err(e) => {
            error!("[Capture] registration of {} failed: {}", recording_id, e);
            go_local_only(&mut *state.lock().await, &recording_id, e.to_string());
            return;
        }
    };
    if let Err(e) = ctx.mappings.create(&recording_id, &remote_id).await {
        error!("[Capture] failed to persist mapping {} -> {}: {}", recording_id, remote_id, e);
        go_local_only(&mut *state.lock().await, &recording_id, e.to_string());
        return;
    }

    let queue = ctx.queue(recording_id.clone(), remote_id.clone());
    let mut state = state.lock().await;
    let buffered = match &mut state.uplink {
        Uplink::Registering { buffered } => std::mem::take(buffered),
        _ => Vec::new(),
    };
    for (slot, staged) in buffered {
        enqueue(&queue, &mut state, &recording_id, slot, staged).await;
    }
    state.uplink = Uplink::Ready(queue);
    info!(
        "[Capture] {} registered as {} in {} ms",
        recording_id,
        remote_id,
        (Utc::now() - started).num_milliseconds()
    );
}

/// Hand one unit to a ready queue
async fn enqueue(
    queue: &UploadQueue,
    state: &mut SessionState,
    recording_id: &RecordingId,
    slot: ChunkSlot,
    staged: Option<Vec<u8>>,
) {
    let in_memory = staged.is_some();
    let accepted = match staged {
        Some(bytes) => queue.enqueue_staged(slot, bytes).await,
        None => queue.enqueue_slot(slot).await,
    };
    if let Err(e) = accepted {
        error!("[Capture] failed to enqueue {}/{}: {}", recording_id, slot, e);
        // A locally stored unit stays pending for the recovery scan.
        if in_memory {
            state.drop_unit(recording_id, slot);
        }
    }
}

fn go_local_only(state: &mut SessionState, recording_id: &RecordingId, reason: String) {
    if let Uplink::Registering { buffered } = &mut state.uplink {
        let lost: Vec<ChunkSlot> = std::mem::take(buffered)
            .into_iter()
            .filter(|(_, staged)| staged.is_some())
            .map(|(slot, _)| slot)
            .collect();
        for slot in lost {
            state.drop_unit(recording_id, slot);
        }
    }
    state.uplink = Uplink::Unregistered(reason);
}
