use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, patch, post, put},
    Json, Router,
};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde::Deserialize;
use sqlx::sqlite::SqlitePool;
use std::convert::Infallible;
use std::sync::Arc as StdArc;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};

use crate::api::{
    ChunkListResponse, DirectUploadGrant, DirectUploadRequest, ErrorBody, RecordingStateRequest,
    RegisterRecordingRequest, RegisterRecordingResponse, RoomStateRequest,
};
use crate::chunk_store::{content_hash, ChunkSlot, ChunkStore, PutOutcome, SqliteChunkStore};
use crate::config::ServerConfig;
use crate::constants::{ACCESS_TOKEN_HEADER, CONTENT_HASH_HEADER};
use crate::db::{self, SERVER_DB_FILE};
use crate::error::{Result, SyncError};
use crate::events::{BroadcastPublisher, EventPublisher};
use crate::ids::{RemoteRecordingId, RoomId};
use crate::recording::{Recording, RecordingRepository, RecordingState};
use crate::room::{RoomRepository, RoomService};

/// Largest accepted chunk body
const MAX_CHUNK_BYTES: usize = 64 * 1024 * 1024;

struct PendingGrant {
    recording_id: RemoteRecordingId,
    slot: ChunkSlot,
    content_hash: String,
    expires_at: DateTime<Utc>,
    bytes: Option<Bytes>,
}

// State for the registry, chunk and room handlers
pub struct AppState {
    pub recordings: RecordingRepository<RemoteRecordingId>,
    pub chunks: SqliteChunkStore<RemoteRecordingId>,
    pub rooms: RoomService,
    pub events: BroadcastPublisher,
    grants: DashMap<String, PendingGrant>,
    direct_upload_ttl: Duration,
}

impl AppState {
    pub fn new(pool: SqlitePool, lead_time: Duration, direct_upload_ttl: Duration) -> Self {
        let events = BroadcastPublisher::default();
        let recordings = RecordingRepository::new(pool.clone());
        let publisher: StdArc<dyn EventPublisher> = StdArc::new(events.clone());
        Self {
            rooms: RoomService::new(
                RoomRepository::new(pool.clone()),
                recordings.clone(),
                publisher,
                lead_time,
            ),
            chunks: SqliteChunkStore::new(pool),
            recordings,
            events,
            grants: DashMap::new(),
            direct_upload_ttl,
        }
    }
}

/// Error response carrying the taxonomy's status code and a JSON body
pub struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::NotFound(_) | SyncError::RemoteRecordingGone(_) => StatusCode::NOT_FOUND,
            SyncError::InvalidStateTransition { .. }
            | SyncError::InvalidChunk(_)
            | SyncError::HashMismatch { .. } => StatusCode::BAD_REQUEST,
            SyncError::Conflict { .. } => StatusCode::CONFLICT,
            SyncError::AccessDenied(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("[Serve] {}", self.0);
        } else {
            debug!("[Serve] {} {}", status, self.0);
        }
        (status, Json(ErrorBody::from_error(&self.0))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: StdArc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/recordings", post(register_recording_handler))
        .route("/recordings/{id}", get(get_recording_handler))
        .route("/recordings/{id}/state", patch(recording_state_handler))
        .route(
            "/recordings/{id}/init-segment",
            get(get_init_handler).post(upload_init_handler),
        )
        .route(
            "/recordings/{id}/chunks",
            get(list_chunks_handler)
                .post(upload_chunk_handler)
                .delete(delete_chunks_handler),
        )
        .route("/recordings/{id}/chunks/{chunk_id}", get(get_chunk_handler))
        .route("/recordings/{id}/direct-uploads", post(create_grant_handler))
        .route("/direct-uploads/{token}", put(direct_put_handler))
        .route("/direct-uploads/{token}/confirm", post(confirm_grant_handler))
        .route("/rooms", post(create_room_handler))
        .route("/rooms/{id}", get(get_room_handler))
        .route("/rooms/{id}/state", patch(room_state_handler))
        .route("/rooms/{id}/events", get(room_events_handler))
        .route("/rooms/by-token/{token}/state", patch(room_state_by_token_handler))
        .layer(DefaultBodyLimit::max(MAX_CHUNK_BYTES))
        .layer(cors)
        .with_state(state)
}

/// Open the server database and serve until the process is stopped
pub async fn serve(config: &ServerConfig) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;
    let pool = db::open_and_init(&config.data_dir.join(SERVER_DB_FILE)).await?;
    let state = StdArc::new(AppState::new(
        pool,
        Duration::milliseconds(config.lead_time_ms),
        Duration::seconds(config.direct_upload_ttl_secs),
    ));

    let listener = tokio::net::TcpListener::bind(format!("[::]:{}", config.port))
        .await
        .map_err(|e| SyncError::Config(format!("Failed to bind to port {}: {}", config.port, e)))?;
    info!(
        "[Serve] listening on http://[::]:{} (data in {})",
        config.port,
        config.data_dir.display()
    );
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// Health check endpoint - returns 200 OK if server is running
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn register_recording_handler(
    State(state): State<StdArc<AppState>>,
    Json(request): Json<RegisterRecordingRequest>,
) -> ApiResult<impl IntoResponse> {
    if let Some(room_id) = &request.room_id {
        if !state.rooms.exists(room_id).await? {
            return Err(SyncError::NotFound(format!("room {}", room_id)).into());
        }
    }

    // Registration happens once capture is already running.
    let mut recording = Recording::new(
        RemoteRecordingId::generate(),
        request.room_id.clone(),
        request.metadata,
    );
    recording.transition(RecordingState::Recording, Utc::now())?;
    state.recordings.insert(&recording).await?;

    if let Some(room_id) = &request.room_id {
        state.rooms.join(room_id, &recording.id).await?;
    }
    info!("[Serve] registered recording {}", recording.id);
    Ok((
        StatusCode::CREATED,
        Json(RegisterRecordingResponse { id: recording.id }),
    ))
}

async fn get_recording_handler(
    State(state): State<StdArc<AppState>>,
    Path(id): Path<RemoteRecordingId>,
) -> ApiResult<Json<Recording<RemoteRecordingId>>> {
    Ok(Json(state.recordings.get(&id).await?))
}

async fn recording_state_handler(
    State(state): State<StdArc<AppState>>,
    Path(id): Path<RemoteRecordingId>,
    Json(request): Json<RecordingStateRequest>,
) -> ApiResult<Json<Recording<RemoteRecordingId>>> {
    let recording = state.recordings.transition(&id, request.state).await?;
    info!("[Serve] recording {} is now {}", id, recording.state);
    Ok(Json(recording))
}

fn declared_hash(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_HASH_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
}

/// Verify and store one unit with the idempotent put semantics
async fn store_unit(
    state: &AppState,
    id: &RemoteRecordingId,
    slot: ChunkSlot,
    bytes: &[u8],
    declared: Option<&str>,
) -> ApiResult<Response> {
    let recording = state.recordings.get(id).await?;
    if bytes.is_empty() {
        return Err(SyncError::InvalidChunk(format!("chunk {} has an empty payload", slot)).into());
    }
    let declared = declared.ok_or_else(|| {
        SyncError::InvalidChunk(format!("missing {} header for chunk {}", CONTENT_HASH_HEADER, slot))
    })?;
    let computed = content_hash(bytes);
    if declared != computed {
        return Err(SyncError::HashMismatch {
            declared: declared.to_string(),
            computed,
        }
        .into());
    }

    let outcome = state.chunks.put_verified(id, slot, bytes, &computed).await?;
    let status = match outcome {
        PutOutcome::Stored => {
            if let ChunkSlot::Chunk(_) = slot {
                if !state.recordings.record_chunk(id, bytes.len() as u64).await? {
                    warn!(
                        "[Serve] chunk {} stored for {} in state {}",
                        slot, id, recording.state
                    );
                }
            }
            StatusCode::CREATED
        }
        PutOutcome::AlreadyPresent => StatusCode::OK,
        PutOutcome::Conflict => {
            return Err(SyncError::Conflict {
                recording_id: id.to_string(),
                chunk: slot.to_string(),
            }
            .into())
        }
    };
    Ok((status, Json(serde_json::json!({ "content_hash": computed }))).into_response())
}

async fn upload_init_handler(
    State(state): State<StdArc<AppState>>,
    Path(id): Path<RemoteRecordingId>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    store_unit(&state, &id, ChunkSlot::Init, &body, declared_hash(&headers).as_deref()).await
}

#[derive(Deserialize)]
struct ChunkQuery {
    chunk_id: u64,
}

async fn upload_chunk_handler(
    State(state): State<StdArc<AppState>>,
    Path(id): Path<RemoteRecordingId>,
    Query(query): Query<ChunkQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    store_unit(
        &state,
        &id,
        ChunkSlot::chunk(query.chunk_id)?,
        &body,
        declared_hash(&headers).as_deref(),
    )
    .await
}

fn octet_stream(bytes: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response()
}

async fn get_init_handler(
    State(state): State<StdArc<AppState>>,
    Path(id): Path<RemoteRecordingId>,
) -> ApiResult<Response> {
    match state.chunks.get_init(&id).await? {
        Some(bytes) => Ok(octet_stream(bytes)),
        None => Err(SyncError::NotFound(format!("init segment of {}", id)).into()),
    }
}

async fn get_chunk_handler(
    State(state): State<StdArc<AppState>>,
    Path((id, chunk_id)): Path<(RemoteRecordingId, u64)>,
) -> ApiResult<Response> {
    let slot = ChunkSlot::chunk(chunk_id)?;
    match state.chunks.get_slot(&id, slot).await? {
        Some(bytes) => Ok(octet_stream(bytes)),
        None => Err(SyncError::NotFound(format!("chunk {} of {}", chunk_id, id)).into()),
    }
}

async fn list_chunks_handler(
    State(state): State<StdArc<AppState>>,
    Path(id): Path<RemoteRecordingId>,
) -> ApiResult<Json<ChunkListResponse>> {
    state.recordings.get(&id).await?;
    Ok(Json(ChunkListResponse {
        chunk_ids: state.chunks.list_chunk_ids(&id).await?,
    }))
}

async fn delete_chunks_handler(
    State(state): State<StdArc<AppState>>,
    Path(id): Path<RemoteRecordingId>,
) -> ApiResult<StatusCode> {
    state.chunks.delete_all(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_grant_handler(
    State(state): State<StdArc<AppState>>,
    Path(id): Path<RemoteRecordingId>,
    Json(request): Json<DirectUploadRequest>,
) -> ApiResult<impl IntoResponse> {
    state.recordings.get(&id).await?;
    let slot = match request.chunk_id {
        Some(chunk_id) => ChunkSlot::chunk(chunk_id)?,
        None => ChunkSlot::Init,
    };
    let now = Utc::now();
    state.grants.retain(|_, grant| grant.expires_at > now);

    let token = uuid::Uuid::new_v4().simple().to_string();
    let expires_at = now + state.direct_upload_ttl;
    state.grants.insert(
        token.clone(),
        PendingGrant {
            recording_id: id,
            slot,
            content_hash: request.content_hash.to_ascii_lowercase(),
            expires_at,
            bytes: None,
        },
    );
    Ok((
        StatusCode::CREATED,
        Json(DirectUploadGrant {
            upload_url: format!("direct-uploads/{}", token),
            token,
            expires_at,
        }),
    ))
}

async fn direct_put_handler(
    State(state): State<StdArc<AppState>>,
    Path(token): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let mut grant = state
        .grants
        .get_mut(&token)
        .filter(|grant| grant.expires_at > Utc::now())
        .ok_or_else(|| SyncError::AccessDenied("unknown or expired upload grant".to_string()))?;
    if body.is_empty() {
        return Err(SyncError::InvalidChunk("empty direct upload".to_string()).into());
    }
    let computed = content_hash(&body);
    if computed != grant.content_hash {
        return Err(SyncError::HashMismatch {
            declared: grant.content_hash.clone(),
            computed,
        }
        .into());
    }
    grant.bytes = Some(body);
    Ok(StatusCode::NO_CONTENT)
}

async fn confirm_grant_handler(
    State(state): State<StdArc<AppState>>,
    Path(token): Path<String>,
) -> ApiResult<Response> {
    let (_, grant) = state
        .grants
        .remove(&token)
        .filter(|(_, grant)| grant.expires_at > Utc::now())
        .ok_or_else(|| SyncError::AccessDenied("unknown or expired upload grant".to_string()))?;
    let Some(bytes) = grant.bytes else {
        return Err(SyncError::InvalidChunk(format!(
            "nothing uploaded for {} of {}",
            grant.slot, grant.recording_id
        ))
        .into());
    };
    store_unit(
        &state,
        &grant.recording_id,
        grant.slot,
        &bytes,
        Some(&grant.content_hash),
    )
    .await
}

async fn create_room_handler(State(state): State<StdArc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok((StatusCode::CREATED, Json(state.rooms.create().await?)))
}

async fn get_room_handler(
    State(state): State<StdArc<AppState>>,
    Path(id): Path<RoomId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.rooms.view(&id).await?))
}

async fn room_state_handler(
    State(state): State<StdArc<AppState>>,
    Path(id): Path<RoomId>,
    headers: HeaderMap,
    Json(request): Json<RoomStateRequest>,
) -> ApiResult<impl IntoResponse> {
    let token = headers
        .get(ACCESS_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| SyncError::AccessDenied(format!("missing {} header", ACCESS_TOKEN_HEADER)))?;
    Ok(Json(state.rooms.transition(&id, token, request.state).await?))
}

async fn room_state_by_token_handler(
    State(state): State<StdArc<AppState>>,
    Path(token): Path<String>,
    Json(request): Json<RoomStateRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state.rooms.transition_by_token(&token, request.state).await?,
    ))
}

async fn room_events_handler(
    State(state): State<StdArc<AppState>>,
    Path(id): Path<RoomId>,
) -> ApiResult<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    if !state.rooms.exists(&id).await? {
        return Err(SyncError::NotFound(format!("room {}", id)).into());
    }
    // Lagged receivers skip what they missed; clients reconcile by polling.
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(move |event| {
        let event = event.ok().filter(|e| e.room_id() == &id)?;
        Event::default()
            .event(event.name())
            .json_data(&event)
            .ok()
            .map(Ok)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
