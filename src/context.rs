//! The client component graph, built once at start-up and passed down.

use log::{info, warn};
use std::fs::File;
use std::sync::Arc;

use crate::chunk_store::{HttpChunkStore, SqliteChunkStore};
use crate::config::ClientConfig;
use crate::db::{self, CLIENT_DB_FILE};
use crate::error::{Result, SyncError};
use crate::ids::{RecordingId, RemoteRecordingId};
use crate::ledger::UploadLedger;
use crate::recording::{Recording, RecordingRepository, RecordingState};
use crate::remote_api::{HttpRemoteApi, RecordingRegistry};
use crate::remote_mapping::RemoteMappingStore;
use crate::upload_queue::{LocalStore, RemoteStore, UploadOptions, UploadQueue};
use sqlx::sqlite::SqlitePool;

#[derive(Clone)]
pub struct SyncContext {
    pub recordings: RecordingRepository<RecordingId>,
    pub local: LocalStore,
    pub remote: RemoteStore,
    pub ledger: UploadLedger,
    pub mappings: RemoteMappingStore,
    pub registry: Arc<dyn RecordingRegistry>,
    pub options: UploadOptions,
}

impl SyncContext {
    /// Wire the client-side stores of `pool` to the given remote collaborators
    pub fn new(
        pool: SqlitePool,
        remote: RemoteStore,
        registry: Arc<dyn RecordingRegistry>,
        options: UploadOptions,
    ) -> Self {
        Self {
            recordings: RecordingRepository::new(pool.clone()),
            local: Arc::new(SqliteChunkStore::<RecordingId>::new(pool.clone())),
            ledger: UploadLedger::new(pool.clone()),
            mappings: RemoteMappingStore::new(pool),
            remote,
            registry,
            options: options.clamped(),
        }
    }

    /// Open the client database and build the HTTP collaborators
    ///
    /// The returned file holds the data directory lock; keep it alive for as
    /// long as the context is used.
    pub async fn connect(config: &ClientConfig) -> Result<(Self, File)> {
        let lock = db::lock_data_dir(&config.data_dir)?;
        let pool = db::open_and_init(&config.data_dir.join(CLIENT_DB_FILE)).await?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;
        let remote = HttpChunkStore::new(client.clone(), &config.remote_url, config.transfer_mode)?;
        let registry = HttpRemoteApi::new(client, &config.remote_url)?;
        info!(
            "[Context] client data in {}, remote {} ({:?})",
            config.data_dir.display(),
            config.remote_url,
            config.transfer_mode
        );
        let ctx = Self::new(
            pool,
            Arc::new(remote),
            Arc::new(registry),
            config.upload.options(),
        );
        Ok((ctx, lock))
    }

    /// Fresh upload queue bound to one (local, remote) pair
    pub fn queue(&self, recording_id: RecordingId, remote_id: RemoteRecordingId) -> UploadQueue {
        UploadQueue::new(
            recording_id,
            remote_id,
            Arc::clone(&self.local),
            Arc::clone(&self.remote),
            self.ledger.clone(),
            self.mappings.clone(),
            self.options,
        )
    }

    /// Move a fully uploaded recording to `synced` and drop its sync bookkeeping
    ///
    /// The remote side is told first, so a failure here leaves the mapping in
    /// place for the next recovery pass. With `direct` a `recording` state goes
    /// straight to `synced`; otherwise the chain passes through `finalizing`.
    pub async fn seal(
        &self,
        recording_id: &RecordingId,
        remote_id: &RemoteRecordingId,
        direct: bool,
    ) -> Result<Recording> {
        match self.registry.update_state(remote_id, RecordingState::Synced).await {
            Ok(()) => {}
            // Sealed remotely by an earlier run that crashed before finishing locally.
            Err(SyncError::InvalidStateTransition { from, .. }) if from == "synced" => {}
            Err(e) => return Err(e),
        }

        let current = self.recordings.get(recording_id).await?;
        let recording = if direct && current.state == RecordingState::Recording {
            self.recordings
                .transition(recording_id, RecordingState::Synced)
                .await?
        } else {
            self.recordings.advance_to_synced(recording_id).await?
        };

        let cleared = self.ledger.delete_all(recording_id).await?;
        self.mappings.delete(recording_id).await?;
        info!(
            "[Context] {} synced as {} ({} chunks, {} ledger entries cleared)",
            recording_id, remote_id, recording.chunk_count, cleared
        );
        Ok(recording)
    }

    /// Drop every local trace of a recording
    ///
    /// Callers must close the recording's upload queue first.
    pub async fn discard(&self, recording_id: &RecordingId) -> Result<()> {
        if let Err(e) = self.local.delete_all(recording_id).await {
            warn!("[Context] failed to delete chunks of {}: {}", recording_id, e);
            return Err(e);
        }
        self.ledger.delete_all(recording_id).await?;
        self.mappings.delete(recording_id).await?;
        self.recordings.delete(recording_id).await?;
        info!("[Context] discarded {}", recording_id);
        Ok(())
    }
}
