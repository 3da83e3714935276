#![allow(dead_code)]

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use save_media_chunks::chunk_store::{ChunkSlot, ChunkStore, PutOutcome};
use save_media_chunks::context::SyncContext;
use save_media_chunks::db::create_test_connection_in_temporary_file;
use save_media_chunks::ids::{RecordingId, RemoteRecordingId, RoomId};
use save_media_chunks::recording::{Recording, RecordingMetadata, RecordingState};
use save_media_chunks::remote_api::RecordingRegistry;
use save_media_chunks::serve::{router, AppState};
use save_media_chunks::upload_queue::{LocalStore, RemoteStore, UploadOptions};
use save_media_chunks::{Result, SyncError};

/// Remote store wrapper injecting failures and recording attempt concurrency
pub struct TestRemote<S> {
    inner: S,
    remaining_failures: DashMap<ChunkSlot, u32>,
    attempts: DashMap<ChunkSlot, u32>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    gone: AtomicBool,
    delay: Duration,
}

impl<S> TestRemote<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            remaining_failures: DashMap::new(),
            attempts: DashMap::new(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            gone: AtomicBool::new(false),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The next `times` puts of `slot` fail with a network error
    pub fn fail(&self, slot: ChunkSlot, times: u32) {
        self.remaining_failures.insert(slot, times);
    }

    pub fn set_gone(&self) {
        self.gone.store(true, Ordering::SeqCst);
    }

    pub fn attempts(&self, slot: ChunkSlot) -> u32 {
        self.attempts.get(&slot).map(|a| *a).unwrap_or(0)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait::async_trait]
impl<S> ChunkStore for TestRemote<S>
where
    S: ChunkStore<Id = RemoteRecordingId>,
{
    type Id = RemoteRecordingId;

    async fn put_slot(
        &self,
        recording_id: &RemoteRecordingId,
        slot: ChunkSlot,
        bytes: &[u8],
    ) -> Result<PutOutcome> {
        *self.attempts.entry(slot).or_insert(0) += 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = if self.gone.load(Ordering::SeqCst) {
            Err(SyncError::RemoteRecordingGone(recording_id.to_string()))
        } else {
            let inject = match self.remaining_failures.get_mut(&slot) {
                Some(mut left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            };
            if inject {
                Err(SyncError::Network(format!("injected failure for {}", slot)))
            } else {
                self.inner.put_slot(recording_id, slot, bytes).await
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn get_slot(
        &self,
        recording_id: &RemoteRecordingId,
        slot: ChunkSlot,
    ) -> Result<Option<Vec<u8>>> {
        self.inner.get_slot(recording_id, slot).await
    }

    async fn list_chunk_ids(&self, recording_id: &RemoteRecordingId) -> Result<Vec<u64>> {
        self.inner.list_chunk_ids(recording_id).await
    }

    async fn delete_all(&self, recording_id: &RemoteRecordingId) -> Result<()> {
        self.inner.delete_all(recording_id).await
    }
}

/// Local store whose writes of the given slots fail, as on a full disk
pub struct FailingLocal {
    inner: LocalStore,
    failing: Vec<ChunkSlot>,
}

impl FailingLocal {
    pub fn new(inner: LocalStore, failing: impl IntoIterator<Item = ChunkSlot>) -> Self {
        Self {
            inner,
            failing: failing.into_iter().collect(),
        }
    }
}

#[async_trait::async_trait]
impl ChunkStore for FailingLocal {
    type Id = RecordingId;

    async fn put_slot(&self, recording_id: &RecordingId, slot: ChunkSlot, bytes: &[u8]) -> Result<PutOutcome> {
        if self.failing.contains(&slot) {
            return Err(SyncError::StorageAccess(format!("no space left for {}", slot)));
        }
        self.inner.put_slot(recording_id, slot, bytes).await
    }

    async fn get_slot(&self, recording_id: &RecordingId, slot: ChunkSlot) -> Result<Option<Vec<u8>>> {
        self.inner.get_slot(recording_id, slot).await
    }

    async fn list_chunk_ids(&self, recording_id: &RecordingId) -> Result<Vec<u64>> {
        self.inner.list_chunk_ids(recording_id).await
    }

    async fn delete_all(&self, recording_id: &RecordingId) -> Result<()> {
        self.inner.delete_all(recording_id).await
    }
}

/// Registry handing out sequential remote ids without a server
#[derive(Default)]
pub struct StaticRegistry {
    registered: AtomicUsize,
    pub fail: AtomicBool,
    pub states: DashMap<RemoteRecordingId, String>,
}

#[async_trait::async_trait]
impl RecordingRegistry for StaticRegistry {
    async fn register(
        &self,
        _metadata: &RecordingMetadata,
        _room_id: Option<&RoomId>,
    ) -> Result<RemoteRecordingId> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncError::Network("registry unreachable".to_string()));
        }
        let n = self.registered.fetch_add(1, Ordering::SeqCst);
        Ok(RemoteRecordingId::new(format!("rrec_{}", n)))
    }

    async fn update_state(
        &self,
        id: &RemoteRecordingId,
        state: RecordingState,
    ) -> Result<()> {
        self.states.insert(id.clone(), state.to_string());
        Ok(())
    }
}

/// Fast retries for tests
pub fn test_options() -> UploadOptions {
    UploadOptions {
        max_concurrency: 3,
        max_retries: 3,
        retry_backoff_ms: 1,
    }
}

/// Client context over a temporary database
pub async fn client_context(
    remote: RemoteStore,
    registry: Arc<dyn RecordingRegistry>,
    options: UploadOptions,
) -> (SyncContext, tempfile::TempDir) {
    let (pool, guard) = create_test_connection_in_temporary_file().await.unwrap();
    (SyncContext::new(pool, remote, registry, options), guard)
}

/// Store `chunk_ids` (and optionally the init segment) in the local store
pub async fn seed_local(
    ctx: &SyncContext,
    recording_id: &RecordingId,
    init: bool,
    chunk_ids: impl IntoIterator<Item = u64>,
) {
    if init {
        ctx.local.put_init(recording_id, b"init-segment").await.unwrap();
    }
    for id in chunk_ids {
        ctx.local
            .put(recording_id, id, chunk_bytes(id).as_slice())
            .await
            .unwrap();
    }
}

/// A recording in `recording` state holding the init segment and `chunk_ids` locally
pub async fn seed_recording(ctx: &SyncContext, chunk_ids: impl IntoIterator<Item = u64>) -> RecordingId {
    let recording = Recording::new(RecordingId::generate(), None, RecordingMetadata::default());
    ctx.recordings.insert(&recording).await.unwrap();
    ctx.recordings
        .transition(&recording.id, RecordingState::Recording)
        .await
        .unwrap();

    let ids: Vec<u64> = chunk_ids.into_iter().collect();
    seed_local(ctx, &recording.id, true, ids.iter().copied()).await;
    for id in &ids {
        ctx.recordings
            .record_chunk(&recording.id, chunk_bytes(*id).len() as u64)
            .await
            .unwrap();
    }
    recording.id
}

pub fn chunk_bytes(id: u64) -> Vec<u8> {
    format!("chunk-{:04}-payload", id).into_bytes()
}

/// Start the real server on an ephemeral port
pub async fn start_test_server() -> (String, Arc<AppState>, tempfile::TempDir) {
    let (pool, guard) = create_test_connection_in_temporary_file().await.unwrap();
    let state = Arc::new(AppState::new(
        pool,
        chrono::Duration::milliseconds(3000),
        chrono::Duration::seconds(300),
    ));
    let app = router(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("http://{}", addr);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give server time to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    (url, state, guard)
}
