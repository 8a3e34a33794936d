pub mod clock;
pub mod config;
pub mod connection;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod handshake;
pub mod media;
pub mod registry;
pub mod resync;
pub mod routes;

use anyhow::{ensure, Result};
use tandem_proto::{format_time, PlayingState, StatusReport};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use config::{ServerConfig, SyncConfig};
pub use coordinator::{CommandOutcome, MediaInfo, SyncCoordinator};
pub use error::CoordinatorError;

use media::{FfprobeProbe, FixedDuration, MediaProbe};
use registry::LOG_TAG;

/// Log a position line whenever the play state changes or it moved this far
const PROGRESS_STEP_MS: i64 = 10_000;

pub async fn run(config: ServerConfig) -> Result<()> {
    let probe: Box<dyn MediaProbe> = match config.fixed_duration {
        Some(duration) => Box::new(FixedDuration(duration)),
        None => Box::new(FfprobeProbe::new(config.ffprobe.clone())),
    };
    let coordinator = SyncCoordinator::new(config.sync.clone(), probe);

    let progress = CancellationToken::new();
    coordinator.spawn(log_progress(coordinator.subscribe(), progress.clone()));

    let listener = TcpListener::bind(config.addr).await?;
    tracing::info!("{LOG_TAG} Listening on {}", config.addr);

    if let Some(path) = &config.media {
        ensure!(path.is_file(), "{} is not a file", path.display());
        let info = coordinator.load(path.clone()).await?;
        tracing::info!("{LOG_TAG} Serving {} ({})", info.name, format_time(info.duration));
    }

    let app = routes::router(coordinator.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            progress.cancel();
            coordinator.shutdown().await;
        })
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn log_progress(
    mut positions: watch::Receiver<Option<StatusReport>>,
    stop: CancellationToken,
) {
    let mut last: Option<(PlayingState, i64)> = None;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            changed = positions.changed() => if changed.is_err() { break },
        }
        let Some(report) = *positions.borrow_and_update() else {
            last = None;
            continue;
        };
        let due = match last {
            Some((state, at)) => {
                state != report.state || (report.position - at).abs() >= PROGRESS_STEP_MS
            }
            None => true,
        };
        if due {
            tracing::debug!("{:?} at {}", report.state, format_time(report.position));
            last = Some((report.state, report.position));
        }
    }
}
