use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::StreamMode;
use crate::error::{AppError, Result};
use crate::relay::{SessionInfo, StreamId, StreamStatus};
use crate::state::AppState;
use crate::webrtc::{
    AckResponse, AnswerResponse, GenerateStreamIdResponse, IceCandidateRequest, OfferRequest,
};

/// Unwrap a JSON body, turning extractor rejections into `MalformedRequest`
fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AppError::MalformedRequest(rejection.body_text()))
}

// ============================================================================
// Health & Status
// ============================================================================

/// Health check response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub live_streams: usize,
    pub sessions: usize,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.uptime_secs(),
        live_streams: state.coordinator.live_stream_count(),
        sessions: state.coordinator.session_count(),
    })
}

/// Registry snapshot
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamsResponse {
    pub mode: StreamMode,
    pub streams: Vec<StreamStatus>,
    pub session_count: usize,
    pub sessions: Vec<SessionInfo>,
}

pub async fn list_streams(State(state): State<Arc<AppState>>) -> Json<StreamsResponse> {
    let sessions = state.coordinator.list_sessions();
    Json(StreamsResponse {
        mode: state.config.get().relay.mode,
        streams: state.coordinator.stream_status(),
        session_count: sessions.len(),
        sessions,
    })
}

// ============================================================================
// Signaling
// ============================================================================

/// Broadcaster offer
pub async fn broadcast(
    State(state): State<Arc<AppState>>,
    stream: Option<Path<String>>,
    payload: std::result::Result<Json<OfferRequest>, JsonRejection>,
) -> Result<Json<AnswerResponse>> {
    let stream_id = state.resolve_stream(stream.as_deref().map(String::as_str))?;
    let req = json_body(payload)?;
    req.validate().map_err(AppError::MalformedRequest)?;

    info!(stream = %stream_id, "Broadcaster offer received");
    let answer = state
        .coordinator
        .negotiate_broadcaster(stream_id, req.sdp)
        .await?;
    Ok(Json(answer))
}

/// Consumer offer
pub async fn consumer(
    State(state): State<Arc<AppState>>,
    stream: Option<Path<String>>,
    payload: std::result::Result<Json<OfferRequest>, JsonRejection>,
) -> Result<Json<AnswerResponse>> {
    let stream_id = state.resolve_stream(stream.as_deref().map(String::as_str))?;
    let req = json_body(payload)?;
    req.validate().map_err(AppError::MalformedRequest)?;

    info!(stream = %stream_id, "Consumer offer received");
    let answer = state
        .coordinator
        .negotiate_consumer(stream_id, req.sdp)
        .await?;
    Ok(Json(answer))
}

/// Fresh stream id; no registry state is touched
pub async fn generate_stream_id() -> Json<GenerateStreamIdResponse> {
    Json(GenerateStreamIdResponse {
        stream_id: StreamId::generate(),
    })
}

/// Trickle ICE over HTTP
///
/// With a known `sessionId` the candidate goes to that relay session;
/// otherwise it is buffered on the stream and fanned out. Candidates for an
/// ended stream are dropped but still acknowledged.
pub async fn ice_candidate(
    State(state): State<Arc<AppState>>,
    stream: Option<Path<String>>,
    payload: std::result::Result<Json<IceCandidateRequest>, JsonRejection>,
) -> Result<Json<AckResponse>> {
    let req = json_body(payload)?;
    let raw_stream = stream
        .as_deref()
        .map(String::as_str)
        .or(req.stream_id.as_deref());

    if let Some(session_id) = &req.session_id {
        if state.coordinator.session(session_id).is_some() {
            state
                .coordinator
                .submit_candidate(session_id, req.candidate)
                .await?;
            return Ok(Json(AckResponse::ok()));
        }
        if raw_stream.is_none() && state.config.get().relay.mode == StreamMode::Multi {
            return Err(AppError::NoSuchSession(session_id.clone()));
        }
    }

    let stream_id = state.resolve_stream(raw_stream)?;
    if !state
        .coordinator
        .relay_candidate(&stream_id, req.role, req.candidate)
    {
        debug!(stream = %stream_id, role = %req.role, "Candidate for ended stream dropped");
    }
    Ok(Json(AckResponse::ok()))
}

/// Application-initiated session close
pub async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<AckResponse>> {
    state.coordinator.close_session(&session_id).await?;
    Ok(Json(AckResponse::ok()))
}
