use super::state::AppState;
use crate::audio::{wav, AudioArtifact};
use crate::clock::ReferenceTime;
use crate::error::EngineError;
use crate::session::{
    artifact_name, now_ms, start_after, upload_artifact, SessionConfig, SessionDoc, SessionPatch, SessionRunner,
    SessionStats, TriggerMode, UploadReceipt,
};
use crate::trigger::TriggerSource;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    /// Optional session ID (if not provided, generate UUID)
    pub id: Option<String>,

    pub name: Option<String>,

    /// Absolute start on the reference clock (epoch ms)
    pub scheduled_start_ms: Option<i64>,

    /// Start relative to now, in seconds
    pub start_in_secs: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScheduleRequest {
    pub scheduled_start_ms: Option<i64>,
    pub start_in_secs: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub participant: String,
    pub mode: Option<TriggerMode>,
}

#[derive(Debug, Serialize)]
pub struct JoinResponse {
    pub session_id: String,
    pub participant: String,
    pub status: SessionStats,
}

#[derive(Debug, Deserialize)]
pub struct ClipQuery {
    pub participant: String,
}

#[derive(Debug, Serialize)]
pub struct ClipResponse {
    pub path: String,
    pub url: String,
    pub bytes: usize,
    pub duration_secs: f64,
}

impl ClipResponse {
    fn new(receipt: UploadReceipt, duration_secs: f64) -> Self {
        Self {
            path: receipt.path,
            url: receipt.url,
            bytes: receipt.handle.size,
            duration_secs,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Handler failure mapped onto an HTTP status
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Engine(EngineError),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Engine(e) => {
                let status = match &e {
                    EngineError::SessionExists(_) | EngineError::ScheduleLocked { .. } => {
                        StatusCode::CONFLICT
                    }
                    EngineError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                    EngineError::DecodeFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    EngineError::UploadFailure(_) => StatusCode::BAD_GATEWAY,
                    EngineError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!("Request failed: {}", e);
                }
                (status, e.to_string())
            }
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn resolve_start(
    scheduled_start_ms: Option<i64>,
    start_in_secs: Option<f64>,
) -> ApiResult<Option<i64>> {
    match (scheduled_start_ms, start_in_secs) {
        (Some(start), _) => Ok(Some(start)),
        (None, Some(secs)) => start_after(now_ms(), secs).map(Some).ok_or_else(|| {
            ApiError::BadRequest(format!("start_in_secs {} is out of range", secs))
        }),
        (None, None) => Ok(None),
    }
}

fn content_extension(headers: &HeaderMap) -> Option<&'static str> {
    let content_type = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let essence = content_type.split(';').next()?.trim();
    match essence {
        "audio/webm" | "video/webm" => Some("webm"),
        "audio/ogg" => Some("ogg"),
        "audio/wav" | "audio/x-wav" | "audio/wave" => Some("wav"),
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("mp4"),
        "audio/mpeg" => Some("mp3"),
        "audio/flac" => Some("flac"),
        _ => None,
    }
}

async fn load_session(state: &AppState, id: &str) -> ApiResult<SessionDoc> {
    state
        .services
        .sessions
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Session {} not found", id)))
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /time
/// Reference clock for participant devices
pub async fn reference_time() -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "no-store")],
        Json(ReferenceTime { now: now_ms() }),
    )
}

/// POST /sessions
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = req
        .id
        .unwrap_or_else(|| format!("session-{}", uuid::Uuid::new_v4()));

    let mut doc = SessionDoc::new(&id, req.name);
    if let Some(start) = resolve_start(req.scheduled_start_ms, req.start_in_secs)? {
        doc = doc.scheduled(start);
    }

    state.services.sessions.create(&id, doc.clone()).await?;
    info!("Created session {}", id);

    Ok((StatusCode::CREATED, Json(doc)))
}

/// GET /sessions/:id
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionDoc>> {
    Ok(Json(load_session(&state, &id).await?))
}

/// POST /sessions/:id/schedule
pub async fn schedule_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ScheduleRequest>,
) -> ApiResult<Json<SessionDoc>> {
    let start = resolve_start(req.scheduled_start_ms, req.start_in_secs)?.ok_or_else(|| {
        ApiError::BadRequest("scheduled_start_ms or start_in_secs is required".to_string())
    })?;

    let doc = state
        .services
        .sessions
        .update(&id, SessionPatch::schedule(start))
        .await?;
    info!("Session {} scheduled for {}", id, start);

    Ok(Json(doc))
}

/// POST /sessions/:id/rearm
/// Start a new generation so the session can be scheduled again
pub async fn rearm_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionDoc>> {
    let doc = state
        .services
        .sessions
        .update(&id, SessionPatch::rearm())
        .await?;
    info!("Session {} re-armed as generation {}", id, doc.generation);

    Ok(Json(doc))
}

/// POST /sessions/:id/join
/// Start a local runner for this session
pub async fn join_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<JoinRequest>,
) -> ApiResult<impl IntoResponse> {
    let mut runners = state.runners.write().await;
    if let Some(existing) = runners.get(&id) {
        if existing.is_active() {
            return Err(ApiError::Conflict(format!(
                "Session {} already has a local participant",
                id
            )));
        }
    }

    let config = SessionConfig {
        session_id: id.clone(),
        participant: req.participant.clone(),
        mode: req.mode.unwrap_or(state.session_defaults.mode),
        ..state.session_defaults.clone()
    };

    let runner = SessionRunner::new(config, state.services.clone());
    let handle = runner.handle();
    runners.insert(id.clone(), handle.clone());
    drop(runners);

    tokio::spawn(async move {
        let outcome = runner.run().await;
        if let Some(failure) = outcome.failure {
            warn!("Session {} finished with failure: {}", outcome.session_id, failure);
        }
    });

    info!("Participant {} joined session {}", req.participant, id);

    Ok((
        StatusCode::ACCEPTED,
        Json(JoinResponse {
            session_id: id,
            participant: req.participant,
            status: handle.status(),
        }),
    ))
}

/// POST /sessions/:id/trigger
pub async fn trigger_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let handle = state
        .runner(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("No local participant in session {}", id)))?;

    handle.trigger(TriggerSource::Manual)?;
    info!("Manual trigger for session {}", id);

    Ok((StatusCode::ACCEPTED, Json(handle.status())))
}

/// POST /sessions/:id/leave
pub async fn leave_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionStats>> {
    let handle = state
        .runner(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("No local participant in session {}", id)))?;

    handle.leave();
    info!("Leaving session {}", id);

    Ok(Json(handle.status()))
}

/// GET /sessions/:id/status
pub async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionStats>> {
    state
        .runner(&id)
        .await
        .map(|handle| Json(handle.status()))
        .ok_or_else(|| ApiError::NotFound(format!("No local participant in session {}", id)))
}

/// POST /sessions/:id/clips?participant=..
/// Accept a clip recorded elsewhere, normalize it to WAV and upload it
pub async fn upload_clip(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ClipQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("empty clip".to_string()));
    }

    let doc = load_session(&state, &id).await?;

    let artifact = AudioArtifact::from_container(
        body.to_vec(),
        content_extension(&headers).map(str::to_string),
    );
    let blob = tokio::task::spawn_blocking(move || wav::encode(&artifact))
        .await
        .map_err(|e| EngineError::Audio(format!("encoder task failed: {}", e)))??;

    let path = artifact_name(&doc.slug(), &query.participant, Local::now().naive_local());
    let receipt = upload_artifact(
        state.services.sessions.as_ref(),
        state.services.blobs.as_ref(),
        &id,
        &query.participant,
        &path,
        &blob,
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(ClipResponse::new(receipt, blob.duration_seconds())),
    ))
}
