//! Operator HTTP API. Every endpoint funnels into the same coordinator
//! operations the clients' websocket requests use.

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tandem_proto::{requested_position, StatusReport};

use crate::coordinator::{CommandOutcome, MediaInfo, SyncCoordinator};
use crate::error::CoordinatorError;
use crate::registry::SessionSummary;

#[derive(Debug, Deserialize)]
pub struct LoadRequest {
    pub path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
pub struct PositionRequest {
    /// Omitted or negative means "where the clock is now"
    #[serde(default)]
    pub position: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SeekRequest {
    pub target: i64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub playback: StatusReport,
    pub media: Option<MediaInfo>,
    pub clients: Vec<SessionSummary>,
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoordinatorError::AlreadyActive => StatusCode::CONFLICT,
            CoordinatorError::NoMedia => StatusCode::NOT_FOUND,
            CoordinatorError::Probe(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

fn outcome(result: Result<CommandOutcome, CoordinatorError>) -> Response {
    match result {
        Ok(CommandOutcome::Dropped) => (StatusCode::CONFLICT, Json(CommandOutcome::Dropped)).into_response(),
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn load(
    State(coordinator): State<SyncCoordinator>,
    Json(request): Json<LoadRequest>,
) -> Response {
    if !request.path.is_file() {
        let body = serde_json::json!({ "error": format!("{} is not a file", request.path.display()) });
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    }
    match coordinator.load(request.path).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn play(
    State(coordinator): State<SyncCoordinator>,
    request: Option<Json<PositionRequest>>,
) -> Response {
    let position = request.and_then(|Json(r)| r.position).and_then(requested_position);
    outcome(coordinator.play(position))
}

pub async fn pause(
    State(coordinator): State<SyncCoordinator>,
    request: Option<Json<PositionRequest>>,
) -> Response {
    let position = request.and_then(|Json(r)| r.position).and_then(requested_position);
    outcome(coordinator.pause(position))
}

pub async fn seek(
    State(coordinator): State<SyncCoordinator>,
    Json(request): Json<SeekRequest>,
) -> Response {
    outcome(coordinator.seek(requested_position(request.target)))
}

pub async fn stop(State(coordinator): State<SyncCoordinator>) -> Response {
    outcome(coordinator.stop())
}

pub async fn resync(State(coordinator): State<SyncCoordinator>) -> Response {
    outcome(coordinator.resync().await)
}

pub async fn status(State(coordinator): State<SyncCoordinator>) -> Json<StatusResponse> {
    Json(StatusResponse {
        playback: coordinator.status(),
        media: coordinator.media(),
        clients: coordinator.registry().summaries(),
    })
}

pub async fn health_check() -> &'static str {
    "ok"
}
