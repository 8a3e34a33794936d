//! Client half of the sync protocol: applies the server's commands to the
//! local player and issues the user's transport requests.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_proto::{
    format_time, Dispatch, Message, PlayingState, RpcError, RpcPeer, StatusReport,
    CURRENT_POSITION,
};
use tokio_util::sync::CancellationToken;

use crate::player::Player;

/// Deviation tolerated until the server says otherwise
pub const DEFAULT_CLOSE_ENOUGH_MS: i64 = 1500;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_TIMEOUT: Duration = Duration::from_secs(1);

pub struct ClientAgent<P: Player> {
    peer: Arc<RpcPeer>,
    player: Arc<P>,
    media_url: String,
    close_enough: AtomicI64,
    ready: AtomicBool,
}

impl<P: Player> ClientAgent<P> {
    pub fn new(peer: Arc<RpcPeer>, player: Arc<P>, media_url: impl Into<String>) -> Self {
        Self {
            peer,
            player,
            media_url: media_url.into(),
            close_enough: AtomicI64::new(DEFAULT_CLOSE_ENOUGH_MS),
            ready: AtomicBool::new(false),
        }
    }

    pub fn player(&self) -> &P {
        &self.player
    }

    pub fn close_enough(&self) -> i64 {
        self.close_enough.load(Ordering::Relaxed)
    }

    /// True between the server's ServerReady and FileClosed
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn local_status(&self) -> StatusReport {
        StatusReport::now(self.player.state(), self.player.position())
    }

    /// Bring the player to the commanded state, seeking only when it is
    /// further than the threshold from `position`.
    fn apply(&self, position: i64, playing: bool) {
        let local = self.player.position();
        let deviation = (local - position).abs();

        if playing {
            self.player.play();
        } else {
            self.player.pause();
        }

        if deviation > self.close_enough() {
            tracing::info!(
                "Seeking {} -> {} ({} ms off)",
                format_time(local),
                format_time(position),
                deviation
            );
            self.player.seek(position);
        }
    }

    async fn call_status(&self, message: Message, timeout: Duration) -> Result<StatusReport, RpcError> {
        match self.peer.call(message, timeout).await? {
            Message::ServerStatus(report) => Ok(report),
            other => Err(RpcError::Violation {
                expected: "ServerStatus",
                got: other.name(),
            }),
        }
    }

    /// Ask the server to play from `position`, or from its current position.
    pub async fn request_play(&self, position: Option<i64>) -> Result<StatusReport, RpcError> {
        let position = position.unwrap_or(CURRENT_POSITION);
        tracing::info!("Requesting play at {}", describe(position));
        self.call_status(Message::ClientRequestsPlay { position }, REQUEST_TIMEOUT)
            .await
    }

    pub async fn request_pause(&self, position: Option<i64>) -> Result<StatusReport, RpcError> {
        let position = position.unwrap_or(CURRENT_POSITION);
        tracing::info!("Requesting pause at {}", describe(position));
        self.call_status(Message::ClientRequestsPause { position }, REQUEST_TIMEOUT)
            .await
    }

    pub async fn request_seek(&self, target: i64) -> Result<StatusReport, RpcError> {
        tracing::info!("Requesting seek to {}", format_time(target));
        self.call_status(Message::ClientRequestSeek { target }, REQUEST_TIMEOUT)
            .await
    }

    pub async fn request_resync(&self) -> Result<StatusReport, RpcError> {
        tracing::info!("Requesting resync");
        self.call_status(Message::ClientRequestsResync, REQUEST_TIMEOUT)
            .await
    }

    /// The server's authoritative position
    pub async fn server_status(&self) -> Result<StatusReport, RpcError> {
        self.call_status(Message::GetStatus, STATUS_TIMEOUT).await
    }

    /// Compare the local player with the server and ask for a resync when
    /// they drifted apart. Returns the drift that triggered a resync.
    pub async fn check_drift(&self) -> Result<Option<i64>, RpcError> {
        if !self.is_ready() || !self.player.is_loaded() {
            return Ok(None);
        }
        let server = self.server_status().await?;
        if server.state == PlayingState::Stopped {
            return Ok(None);
        }

        let drift = (server.position - self.player.position()).abs();
        if drift <= self.close_enough() {
            return Ok(None);
        }
        tracing::debug!("Drifted {} ms from the server", drift);
        self.request_resync().await?;
        Ok(Some(drift))
    }

    /// Run `check_drift` every `period` until cancelled or disconnected.
    pub async fn monitor_drift(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.check_drift().await {
                Ok(_) => {}
                Err(RpcError::Disconnected) => break,
                Err(e) => tracing::warn!("Drift check failed: {}", e),
            }
        }
    }
}

fn describe(position: i64) -> String {
    if position < 0 {
        "current position".to_string()
    } else {
        format_time(position)
    }
}

impl<P: Player> Dispatch for ClientAgent<P> {
    async fn dispatch(&self, message: Message) -> Message {
        match message {
            Message::FileReady { close_enough_value } => {
                tracing::info!("File ready, close enough value: {} ms", close_enough_value);
                self.close_enough.store(close_enough_value, Ordering::Relaxed);
                match self.player.load(&self.media_url) {
                    Ok(()) => Message::FileParsed,
                    Err(e) => {
                        tracing::error!("Failed to open {}: {:#}", self.media_url, e);
                        Message::Empty
                    }
                }
            }
            Message::ServerReady => {
                tracing::info!("Server ready");
                self.ready.store(true, Ordering::Release);
                Message::ClientReady
            }
            Message::ServerRequestsPlay { position } => {
                tracing::info!("Server requests play at {}", format_time(position));
                self.apply(position, true);
                Message::ClientReady
            }
            Message::ServerRequestsPause { position } => {
                tracing::info!("Server requests pause at {}", format_time(position));
                self.apply(position, false);
                Message::ClientReady
            }
            Message::ServerRequestSeek { target } => {
                tracing::info!("Server requests seek to {}", format_time(target));
                self.player.seek(target);
                Message::ClientReady
            }
            Message::FileClosed => {
                tracing::info!("Closing file");
                self.ready.store(false, Ordering::Release);
                self.player.close();
                Message::ClientReady
            }
            Message::ServerRequestsStatus => {
                let report = self.local_status();
                tracing::debug!(
                    "Status request: {:?} at {}",
                    report.state,
                    format_time(report.position)
                );
                Message::ClientStatus(report)
            }
            other => {
                tracing::warn!("Unexpected {} from server", other.name());
                Message::Empty
            }
        }
    }
}
