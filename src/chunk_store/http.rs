use log::debug;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;

use super::{content_hash, ensure_not_empty, ChunkSlot, ChunkStore, PutOutcome};
use crate::api::{error_from_response, ChunkListResponse, DirectUploadGrant, DirectUploadRequest};
use crate::constants::CONTENT_HASH_HEADER;
use crate::error::{Result, SyncError};
use crate::ids::RemoteRecordingId;

/// How chunk bytes travel to the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Bytes are posted to the server, which stores them
    #[default]
    Proxy,
    /// The server issues a short-lived write grant, bytes go to the grant URL,
    /// then an explicit confirmation commits them
    Direct,
}

/// Remote chunk store speaking the server's HTTP API
#[derive(Clone)]
pub struct HttpChunkStore {
    client: Client,
    base_url: Url,
    mode: TransferMode,
}

impl HttpChunkStore {
    pub fn new(client: Client, base_url: &str, mode: TransferMode) -> Result<Self> {
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url)?,
            mode,
        })
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| SyncError::Config(format!("invalid endpoint '{}': {}", path, e)))
    }

    fn slot_path(recording_id: &RemoteRecordingId, slot: ChunkSlot) -> String {
        let rid = urlencoding::encode(recording_id.as_str());
        match slot {
            ChunkSlot::Init => format!("recordings/{}/init-segment", rid),
            ChunkSlot::Chunk(id) => format!("recordings/{}/chunks?chunk_id={}", rid, id),
        }
    }

    async fn put_proxy(
        &self,
        recording_id: &RemoteRecordingId,
        slot: ChunkSlot,
        bytes: &[u8],
        hash: &str,
    ) -> Result<PutOutcome> {
        let url = self.endpoint(&Self::slot_path(recording_id, slot))?;
        let response = self
            .client
            .post(url)
            .header(CONTENT_HASH_HEADER, hash)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await?;
        outcome_from_response(response, recording_id).await
    }

    async fn put_direct(
        &self,
        recording_id: &RemoteRecordingId,
        slot: ChunkSlot,
        bytes: &[u8],
        hash: &str,
    ) -> Result<PutOutcome> {
        let grant_url = self.endpoint(&format!(
            "recordings/{}/direct-uploads",
            urlencoding::encode(recording_id.as_str())
        ))?;
        let request = DirectUploadRequest {
            chunk_id: match slot {
                ChunkSlot::Init => None,
                ChunkSlot::Chunk(id) => Some(id),
            },
            content_hash: hash.to_string(),
        };
        let response = self.client.post(grant_url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(remote_error(response, recording_id).await);
        }
        let grant: DirectUploadGrant = response.json().await?;

        let upload_url = self.endpoint(&grant.upload_url)?;
        let response = self
            .client
            .put(upload_url)
            .header(CONTENT_HASH_HEADER, hash)
            .body(bytes.to_vec())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(remote_error(response, recording_id).await);
        }

        let confirm_url = self.endpoint(&format!(
            "direct-uploads/{}/confirm",
            urlencoding::encode(&grant.token)
        ))?;
        let response = self.client.post(confirm_url).send().await?;
        outcome_from_response(response, recording_id).await
    }
}

/// Base URLs must end with `/` for relative joins to keep their path prefix
fn normalize_base_url(base_url: &str) -> Result<Url> {
    let mut raw = base_url.trim().to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    Url::parse(&raw).map_err(|e| SyncError::Config(format!("invalid remote url '{}': {}", base_url, e)))
}

/// A 404 on a mapped recording means the remote counterpart is gone
async fn remote_error(response: reqwest::Response, recording_id: &RemoteRecordingId) -> SyncError {
    match error_from_response(response).await {
        SyncError::NotFound(_) => SyncError::RemoteRecordingGone(recording_id.to_string()),
        other => other,
    }
}

async fn outcome_from_response(
    response: reqwest::Response,
    recording_id: &RemoteRecordingId,
) -> Result<PutOutcome> {
    match response.status() {
        StatusCode::CREATED => Ok(PutOutcome::Stored),
        StatusCode::OK => Ok(PutOutcome::AlreadyPresent),
        StatusCode::CONFLICT => Ok(PutOutcome::Conflict),
        _ => Err(remote_error(response, recording_id).await),
    }
}

#[async_trait::async_trait]
impl ChunkStore for HttpChunkStore {
    type Id = RemoteRecordingId;

    async fn put_slot(
        &self,
        recording_id: &RemoteRecordingId,
        slot: ChunkSlot,
        bytes: &[u8],
    ) -> Result<PutOutcome> {
        ensure_not_empty(slot, bytes)?;
        slot.db_id()?;
        let hash = content_hash(bytes);
        debug!(
            "[HttpChunkStore] {:?} put {}/{} ({} bytes)",
            self.mode,
            recording_id,
            slot,
            bytes.len()
        );
        match self.mode {
            TransferMode::Proxy => self.put_proxy(recording_id, slot, bytes, &hash).await,
            TransferMode::Direct => self.put_direct(recording_id, slot, bytes, &hash).await,
        }
    }

    async fn get_slot(
        &self,
        recording_id: &RemoteRecordingId,
        slot: ChunkSlot,
    ) -> Result<Option<Vec<u8>>> {
        let rid = urlencoding::encode(recording_id.as_str());
        let path = match slot {
            ChunkSlot::Init => format!("recordings/{}/init-segment", rid),
            ChunkSlot::Chunk(id) => format!("recordings/{}/chunks/{}", rid, id),
        };
        let response = self.client.get(self.endpoint(&path)?).send().await?;
        match response.status() {
            StatusCode::OK => Ok(Some(response.bytes().await?.to_vec())),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(error_from_response(response).await),
        }
    }

    async fn list_chunk_ids(&self, recording_id: &RemoteRecordingId) -> Result<Vec<u64>> {
        let path = format!("recordings/{}/chunks", urlencoding::encode(recording_id.as_str()));
        let response = self.client.get(self.endpoint(&path)?).send().await?;
        if !response.status().is_success() {
            return Err(remote_error(response, recording_id).await);
        }
        let list: ChunkListResponse = response.json().await?;
        Ok(list.chunk_ids)
    }

    async fn delete_all(&self, recording_id: &RemoteRecordingId) -> Result<()> {
        let path = format!("recordings/{}/chunks", urlencoding::encode(recording_id.as_str()));
        let response = self.client.delete(self.endpoint(&path)?).send().await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(error_from_response(response).await),
        }
    }
}
