use axum::{
    routing::{get, post},
    Router,
};

use crate::coordinator::SyncCoordinator;
use crate::{connection, control, media};

pub fn router(coordinator: SyncCoordinator) -> Router {
    Router::new()
        .route("/healthz", get(control::health_check))
        .route("/ws", get(connection::ws_endpoint))
        .route("/media", get(media::serve_media))
        .route("/status", get(control::status))
        .route("/control/load", post(control::load))
        .route("/control/play", post(control::play))
        .route("/control/pause", post(control::pause))
        .route("/control/seek", post(control::seek))
        .route("/control/stop", post(control::stop))
        .route("/control/resync", post(control::resync))
        .with_state(coordinator)
}
