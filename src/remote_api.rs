//! Client for the server's registration, state and room endpoints.

use log::debug;
use reqwest::Client;
use url::Url;

use crate::api::{
    error_from_response, CreatedRoom, RecordingStateRequest, RegisterRecordingRequest,
    RegisterRecordingResponse, RoomStateRequest, RoomView,
};
use crate::constants::ACCESS_TOKEN_HEADER;
use crate::error::{Result, SyncError};
use crate::ids::{RemoteRecordingId, RoomId};
use crate::recording::{Recording, RecordingMetadata, RecordingState};
use crate::room::RoomState;

/// Remote bookkeeping of recordings
#[async_trait::async_trait]
pub trait RecordingRegistry: Send + Sync {
    /// Register a new recording, returning the id the remote side assigned
    async fn register(
        &self,
        metadata: &RecordingMetadata,
        room_id: Option<&RoomId>,
    ) -> Result<RemoteRecordingId>;

    async fn update_state(&self, id: &RemoteRecordingId, state: RecordingState) -> Result<()>;
}

#[derive(Clone)]
pub struct HttpRemoteApi {
    client: Client,
    base_url: Url,
}

impl HttpRemoteApi {
    pub fn new(client: Client, base_url: &str) -> Result<Self> {
        let mut raw = base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base_url = Url::parse(&raw)
            .map_err(|e| SyncError::Config(format!("invalid remote url '{}': {}", base_url, e)))?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| SyncError::Config(format!("invalid endpoint '{}': {}", path, e)))
    }

    pub async fn get_recording(&self, id: &RemoteRecordingId) -> Result<Recording<RemoteRecordingId>> {
        let url = self.endpoint(&format!("recordings/{}", urlencoding::encode(id.as_str())))?;
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    pub async fn create_room(&self) -> Result<CreatedRoom> {
        let response = self.client.post(self.endpoint("rooms")?).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    pub async fn get_room(&self, id: &RoomId) -> Result<RoomView> {
        let url = self.endpoint(&format!("rooms/{}", urlencoding::encode(id.as_str())))?;
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    /// Director action, authorized by the room's access token
    pub async fn set_room_state(
        &self,
        id: &RoomId,
        access_token: &str,
        state: RoomState,
    ) -> Result<RoomView> {
        let url = self.endpoint(&format!("rooms/{}/state", urlencoding::encode(id.as_str())))?;
        let response = self
            .client
            .patch(url)
            .header(ACCESS_TOKEN_HEADER, access_token)
            .json(&RoomStateRequest { state })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    pub async fn set_room_state_by_token(&self, access_token: &str, state: RoomState) -> Result<RoomView> {
        let url = self.endpoint(&format!(
            "rooms/by-token/{}/state",
            urlencoding::encode(access_token)
        ))?;
        let response = self
            .client
            .patch(url)
            .json(&RoomStateRequest { state })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json().await?)
    }
}

#[async_trait::async_trait]
impl RecordingRegistry for HttpRemoteApi {
    async fn register(
        &self,
        metadata: &RecordingMetadata,
        room_id: Option<&RoomId>,
    ) -> Result<RemoteRecordingId> {
        let request = RegisterRecordingRequest {
            metadata: metadata.clone(),
            room_id: room_id.cloned(),
        };
        let response = self
            .client
            .post(self.endpoint("recordings")?)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let body: RegisterRecordingResponse = response.json().await?;
        debug!("[RemoteApi] registered {}", body.id);
        Ok(body.id)
    }

    async fn update_state(&self, id: &RemoteRecordingId, state: RecordingState) -> Result<()> {
        let url = self.endpoint(&format!("recordings/{}/state", urlencoding::encode(id.as_str())))?;
        let response = self
            .client
            .patch(url)
            .json(&RecordingStateRequest { state })
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            reqwest::StatusCode::NOT_FOUND => Err(SyncError::RemoteRecordingGone(id.to_string())),
            _ => Err(error_from_response(response).await),
        }
    }
}
