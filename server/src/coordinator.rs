use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_proto::{format_time, requested_position, Message, PlayingState, RpcPeer, StatusReport};
use tokio::sync::{watch, MutexGuard};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::clock::PlaybackClock;
use crate::config::SyncConfig;
use crate::error::CoordinatorError;
use crate::handshake;
use crate::media::{guess_mime, MediaProbe};
use crate::registry::{ClientSession, ConnectionState, SessionRegistry, LOG_TAG};
use crate::resync::{adjusted_position, resync_target, ResyncGate};

/// The loaded media item as advertised to clients and the control API
#[derive(Debug, Clone, Serialize)]
pub struct MediaInfo {
    pub path: PathBuf,
    pub name: String,
    pub mime: &'static str,
    pub duration: i64,
}

impl MediaInfo {
    fn new(path: PathBuf, duration: i64) -> Self {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mime = guess_mime(&path);
        Self {
            path,
            name,
            mime,
            duration,
        }
    }
}

/// Result of a transport command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// The clock changed and the resolved position was broadcast
    Applied { position: i64 },
    /// Redundant for the current state (play while playing, pause while paused)
    Ignored,
    /// Another command was in flight
    Dropped,
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Play(Option<i64>),
    Pause(Option<i64>),
    Seek(Option<i64>),
    /// Resync correction: pause (or hold) at the given position
    Correct(i64),
}

struct ActiveMedia {
    info: MediaInfo,
    clock: PlaybackClock,
    generation: u64,
    ticker: CancellationToken,
}

type CommandGuard<'a> = MutexGuard<'a, ()>;

struct Inner {
    config: SyncConfig,
    probe: Box<dyn MediaProbe>,
    registry: SessionRegistry,
    /// Serializes every mutation of the clock and of registry membership
    command_lock: tokio::sync::Mutex<()>,
    media: Mutex<Option<ActiveMedia>>,
    generation: AtomicU64,
    resync: ResyncGate,
    positions: watch::Sender<Option<StatusReport>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// The authoritative side of a watch session.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    pub fn new(config: SyncConfig, probe: impl MediaProbe + 'static) -> Self {
        let (positions, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                config,
                probe: Box::new(probe),
                registry: SessionRegistry::new(),
                command_lock: tokio::sync::Mutex::new(()),
                media: Mutex::new(None),
                generation: AtomicU64::new(0),
                resync: ResyncGate::default(),
                positions,
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn media(&self) -> Option<MediaInfo> {
        self.inner.media.lock().as_ref().map(|active| active.info.clone())
    }

    pub fn is_active(&self) -> bool {
        self.inner.media.lock().is_some()
    }

    /// Authoritative position right now
    pub fn status(&self) -> StatusReport {
        self.inner
            .media
            .lock()
            .as_ref()
            .map(|active| active.clock.status())
            .unwrap_or_else(|| StatusReport::now(PlayingState::Stopped, 0))
    }

    /// Position samples published by the ticker; `None` while nothing is loaded.
    pub fn subscribe(&self) -> watch::Receiver<Option<StatusReport>> {
        self.inner.positions.subscribe()
    }

    /// Run a task that shutdown will wait for.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.tasks.spawn(task);
    }

    // --- connection lifecycle ---

    /// Register a new client. If media is active the client is onboarded in
    /// the background and accepted once it is synchronized.
    pub async fn connect(&self, peer: Arc<RpcPeer>) -> Arc<ClientSession> {
        let session = Arc::new(ClientSession::new(Uuid::new_v4(), peer));
        let generation = {
            let _guard = self.inner.command_lock.lock().await;
            self.inner.registry.insert(Arc::clone(&session));
            let generation = self.inner.media.lock().as_ref().map(|active| active.generation);
            if generation.is_some() {
                session.set_state(ConnectionState::AwaitingAck);
            }
            generation
        };

        if let Some(generation) = generation {
            let this = self.clone();
            let joiner = Arc::clone(&session);
            self.spawn(async move { this.onboard_late(joiner, generation).await });
        }
        session
    }

    /// Forget a client whose connection ended.
    pub async fn disconnect(&self, session: &ClientSession) {
        // Fails any call still waiting on this client before we queue for the lock
        session.disconnect();
        let _guard = self.inner.command_lock.lock().await;
        self.inner.registry.remove(session.id);
    }

    fn drop_session(&self, _guard: &CommandGuard<'_>, session: &ClientSession) {
        session.disconnect();
        self.inner.registry.remove(session.id);
    }

    /// Count a protocol violation; disconnects the client once it keeps misbehaving.
    pub fn note_violation(&self, session: &ClientSession) -> bool {
        let count = session.record_violation();
        if count >= self.inner.config.max_violations {
            tracing::warn!(
                "{LOG_TAG} Disconnecting client {} after {} protocol violations",
                session.id,
                count
            );
            session.disconnect();
            true
        } else {
            false
        }
    }

    fn accepts_requests(&self, session: &ClientSession) -> bool {
        !self.is_active() || session.state() == ConnectionState::Ready
    }

    // --- media lifecycle ---

    /// Load `path` and onboard every connected client.
    ///
    /// Clients that do not parse the file in time, or answer with the wrong
    /// message, are disconnected; the rest end up ready with the clock stopped.
    pub async fn load(&self, path: impl Into<PathBuf>) -> Result<MediaInfo, CoordinatorError> {
        let path = path.into();
        if self.is_active() {
            return Err(CoordinatorError::AlreadyActive);
        }

        let duration = self
            .inner
            .probe
            .probe(&path)
            .await
            .map_err(CoordinatorError::Probe)?;

        let guard = self.inner.command_lock.lock().await;
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let ticker = self.inner.shutdown.child_token();
        let info = MediaInfo::new(path, duration);
        {
            let mut media = self.inner.media.lock();
            if media.is_some() {
                return Err(CoordinatorError::AlreadyActive);
            }
            *media = Some(ActiveMedia {
                info: info.clone(),
                clock: PlaybackClock::new(duration),
                generation,
                ticker: ticker.clone(),
            });
        }
        tracing::info!("{LOG_TAG} Loaded {} ({})", info.name, format_time(duration));

        let sessions = self.inner.registry.snapshot();
        for session in &sessions {
            session.set_state(ConnectionState::AwaitingAck);
        }
        let outcome = handshake::onboard(sessions, &self.inner.config).await;
        for (session, _) in &outcome.failed {
            self.drop_session(&guard, session);
        }
        for session in &outcome.ready {
            session.set_state(ConnectionState::Ready);
        }
        tracing::info!(
            "{LOG_TAG} {} client(s) ready, {} dropped",
            outcome.ready.len(),
            outcome.failed.len()
        );

        self.spawn_ticker(ticker, generation);
        drop(guard);
        Ok(info)
    }

    /// Handshake for a client that connected while media was active, followed
    /// by a Play or Pause at the current position so it starts in sync.
    async fn onboard_late(&self, session: Arc<ClientSession>, generation: u64) {
        tracing::info!("{LOG_TAG} Onboarding late joiner {}", session.id);
        let outcome = handshake::onboard(vec![Arc::clone(&session)], &self.inner.config).await;

        let guard = self.inner.command_lock.lock().await;
        if !outcome.failed.is_empty() {
            self.drop_session(&guard, &session);
            return;
        }
        if !self.inner.registry.contains(session.id) {
            return;
        }

        let media = self.inner.media.lock();
        match media.as_ref() {
            Some(active) if active.generation == generation => {
                let position = active.clock.position();
                let catch_up = match active.clock.state() {
                    PlayingState::Playing => Message::ServerRequestsPlay { position },
                    _ => Message::ServerRequestsPause { position },
                };
                match session.peer().send_async(catch_up) {
                    Ok(()) => {
                        session.set_state(ConnectionState::Ready);
                        tracing::info!(
                            "{LOG_TAG} Client {} ready at {}",
                            session.id,
                            format_time(position)
                        );
                    }
                    Err(err) => tracing::debug!("Late joiner {} went away: {}", session.id, err),
                }
            }
            // A newer load already onboarded this client
            Some(_) => {}
            None => {
                let _ = session.peer().send_async(Message::FileClosed);
                session.set_state(ConnectionState::Connected);
            }
        }
    }

    /// Close the media: the clock stops and every ready client gets FileClosed.
    pub fn stop(&self) -> Result<CommandOutcome, CoordinatorError> {
        let Some(guard) = self.try_command("stop") else {
            return Ok(CommandOutcome::Dropped);
        };
        self.close_media(&guard, None, "stopped")
            .ok_or(CoordinatorError::NoMedia)?;
        Ok(CommandOutcome::Applied { position: 0 })
    }

    fn close_media(
        &self,
        _guard: &CommandGuard<'_>,
        generation: Option<u64>,
        reason: &str,
    ) -> Option<MediaInfo> {
        let mut closed = {
            let mut media = self.inner.media.lock();
            let current = media.as_ref().map(|active| active.generation);
            if generation.is_some() && generation != current {
                return None;
            }
            media.take()?
        };
        closed.clock.stop();
        closed.ticker.cancel();
        tracing::info!("{LOG_TAG} Closing {} ({})", closed.info.name, reason);

        self.broadcast(&[Message::FileClosed]);
        for session in self.inner.registry.snapshot() {
            session.set_state(ConnectionState::Connected);
        }
        self.inner.positions.send_replace(None);
        Some(closed.info)
    }

    fn spawn_ticker(&self, token: CancellationToken, generation: u64) {
        let this = self.clone();
        self.spawn(async move {
            loop {
                let delay = this.tick_delay();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if this.tick(generation).await {
                    break;
                }
            }
            tracing::debug!("Position ticker {} stopped", generation);
        });
    }

    fn tick_delay(&self) -> Duration {
        let min = self.inner.config.tick_min.as_millis() as u64;
        let max = self.inner.config.tick_max.as_millis() as u64;
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Publish one position sample; closes the media at end of file.
    /// Returns true once the ticker should stop.
    async fn tick(&self, generation: u64) -> bool {
        let (report, eof) = {
            let mut media = self.inner.media.lock();
            match media.as_mut() {
                Some(active) if active.generation == generation => {
                    let duration = active.clock.duration();
                    if active.clock.check_eof() {
                        (StatusReport::now(PlayingState::Stopped, duration), true)
                    } else {
                        (active.clock.status(), false)
                    }
                }
                _ => return true,
            }
        };
        self.inner.positions.send_replace(Some(report));

        if eof {
            tracing::info!("{LOG_TAG} End of file at {}", format_time(report.position));
            let guard = self.inner.command_lock.lock().await;
            self.close_media(&guard, Some(generation), "end of file");
            return true;
        }
        false
    }

    // --- transport commands ---

    fn try_command(&self, name: &str) -> Option<CommandGuard<'_>> {
        match self.inner.command_lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::debug!("Dropping {}: another command is in flight", name);
                None
            }
        }
    }

    /// Play from `position`, or from the current position when `None`.
    pub fn play(&self, position: Option<i64>) -> Result<CommandOutcome, CoordinatorError> {
        match self.try_command("play") {
            Some(guard) => self.apply(&guard, Command::Play(position)),
            None => Ok(CommandOutcome::Dropped),
        }
    }

    pub fn pause(&self, position: Option<i64>) -> Result<CommandOutcome, CoordinatorError> {
        match self.try_command("pause") {
            Some(guard) => self.apply(&guard, Command::Pause(position)),
            None => Ok(CommandOutcome::Dropped),
        }
    }

    pub fn seek(&self, target: Option<i64>) -> Result<CommandOutcome, CoordinatorError> {
        match self.try_command("seek") {
            Some(guard) => self.apply(&guard, Command::Seek(target)),
            None => Ok(CommandOutcome::Dropped),
        }
    }

    fn apply(
        &self,
        _guard: &CommandGuard<'_>,
        command: Command,
    ) -> Result<CommandOutcome, CoordinatorError> {
        let mut broadcasts = Vec::with_capacity(3);
        let position = {
            let mut media = self.inner.media.lock();
            let active = media.as_mut().ok_or(CoordinatorError::NoMedia)?;
            let clock = &mut active.clock;
            let current = clock.position();
            let resolved = match command {
                Command::Play(requested) | Command::Pause(requested) | Command::Seek(requested) => {
                    requested.map(|p| clock.clamp(p)).unwrap_or(current)
                }
                Command::Correct(target) => clock.clamp(target),
            };

            match command {
                Command::Play(_) => {
                    if !clock.play(resolved) {
                        return Ok(CommandOutcome::Ignored);
                    }
                    broadcasts.push(Message::ServerRequestsPlay { position: resolved });
                }
                Command::Pause(_) => {
                    if !clock.pause(resolved) {
                        return Ok(CommandOutcome::Ignored);
                    }
                    broadcasts.push(Message::ServerRequestsPause { position: resolved });
                }
                Command::Seek(_) if clock.state() == PlayingState::Playing => {
                    // Seeking a running clock directly desyncs clients; go
                    // through pause -> seek -> resume instead
                    clock.pause(current);
                    clock.seek(resolved);
                    clock.play(resolved);
                    broadcasts.push(Message::ServerRequestsPause { position: current });
                    broadcasts.push(Message::ServerRequestSeek { target: resolved });
                    broadcasts.push(Message::ServerRequestsPlay { position: resolved });
                }
                Command::Seek(_) => {
                    clock.seek(resolved);
                    broadcasts.push(Message::ServerRequestSeek { target: resolved });
                }
                Command::Correct(_) => {
                    match clock.state() {
                        PlayingState::Stopped => return Ok(CommandOutcome::Ignored),
                        PlayingState::Playing => {
                            clock.pause(resolved);
                        }
                        PlayingState::Paused => clock.seek(resolved),
                    }
                    broadcasts.push(Message::ServerRequestsPause { position: resolved });
                }
            }
            resolved
        };

        tracing::info!("{LOG_TAG} {:?} -> {}", command, format_time(position));
        self.broadcast(&broadcasts);
        Ok(CommandOutcome::Applied { position })
    }

    /// Queue `messages` for every ready client, the originator included.
    fn broadcast(&self, messages: &[Message]) {
        for session in self.inner.registry.ready() {
            for message in messages {
                if let Err(err) = session.peer().send_async(message.clone()) {
                    tracing::debug!("Skipping {} for client {}: {}", message.name(), session.id, err);
                    break;
                }
            }
        }
    }

    // --- drift correction ---

    /// Pause everyone at the most-behind reported position.
    ///
    /// Status queries fan out without the command lock; clients that fail to
    /// answer are left out of the computation.
    pub async fn resync(&self) -> Result<CommandOutcome, CoordinatorError> {
        let Some(_flight) = self.inner.resync.try_enter() else {
            tracing::debug!("Resync already in progress");
            return Ok(CommandOutcome::Dropped);
        };

        let (server_position, state) = {
            let media = self.inner.media.lock();
            let active = media.as_ref().ok_or(CoordinatorError::NoMedia)?;
            (active.clock.position(), active.clock.state())
        };
        if state == PlayingState::Stopped {
            return Ok(CommandOutcome::Ignored);
        }
        let t0 = Utc::now();

        let timeout = self.inner.config.command_timeout;
        let sessions = self.inner.registry.ready();
        let replies = join_all(sessions.iter().map(|session| async move {
            let reply = session.peer().call(Message::ServerRequestsStatus, timeout).await;
            (session, reply)
        }))
        .await;

        let mut adjusted = Vec::with_capacity(replies.len());
        for (session, reply) in replies {
            match reply {
                Ok(Message::ClientStatus(report)) => {
                    session.record_status(report);
                    let position = adjusted_position(&report, t0);
                    tracing::debug!(
                        "Client {} at {} (adjusted {})",
                        session.id,
                        format_time(report.position),
                        format_time(position)
                    );
                    adjusted.push(position);
                }
                Ok(other) => tracing::warn!(
                    "{LOG_TAG} Client {} answered the status query with {}",
                    session.id,
                    other.name()
                ),
                Err(err) => tracing::warn!("{LOG_TAG} Excluding client {} from resync: {}", session.id, err),
            }
        }

        let target = resync_target(server_position, adjusted.iter().copied());
        tracing::info!(
            "{LOG_TAG} Resync to {} (server at {}, {} report(s))",
            format_time(target),
            format_time(server_position),
            adjusted.len()
        );

        match self.try_command("resync") {
            Some(guard) => self.apply(&guard, Command::Correct(target)),
            None => Ok(CommandOutcome::Dropped),
        }
    }

    // --- protocol dispatch ---

    /// Handle one request from a client and produce its reply.
    pub async fn handle_request(&self, session: &Arc<ClientSession>, message: Message) -> Message {
        tracing::debug!("Client {} -> {}", session.id, message.name());

        let result = match message {
            Message::GetStatus => return Message::ServerStatus(self.status()),
            Message::ClientStatus(report) => {
                session.record_status(report);
                return Message::Empty;
            }
            Message::ClientRequestsPlay { .. }
            | Message::ClientRequestsPause { .. }
            | Message::ClientRequestSeek { .. }
            | Message::ClientRequestsResync
                if !self.accepts_requests(session) =>
            {
                tracing::debug!(
                    "Ignoring {} from client {} until it is onboarded",
                    message.name(),
                    session.id
                );
                return Message::Empty;
            }
            Message::ClientRequestsPlay { position } => self.play(requested_position(position)),
            Message::ClientRequestsPause { position } => self.pause(requested_position(position)),
            Message::ClientRequestSeek { target } => self.seek(requested_position(target)),
            Message::ClientRequestsResync => self.resync().await,
            other => {
                tracing::warn!("{LOG_TAG} Unexpected {} from client {}", other.name(), session.id);
                self.note_violation(session);
                return Message::Empty;
            }
        };

        match result {
            Ok(outcome) => tracing::debug!("Client {} request: {:?}", session.id, outcome),
            Err(err) => tracing::warn!("{LOG_TAG} Client {} request failed: {}", session.id, err),
        }
        Message::ServerStatus(self.status())
    }

    // --- teardown ---

    /// Stop the ticker, close the media, hang up on every client and wait for
    /// all background tasks.
    pub async fn shutdown(&self) {
        tracing::info!("{LOG_TAG} Shutting down");
        self.inner.shutdown.cancel();
        // Disconnecting first fails pending handshakes so the lock frees up promptly
        for session in self.inner.registry.snapshot() {
            session.disconnect();
        }
        {
            let guard = self.inner.command_lock.lock().await;
            self.close_media(&guard, None, "shutdown");
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ClientHandler;
    use crate::media::FixedDuration;
    use tandem_proto::{pump, Dispatch};

    #[derive(Default)]
    struct FakeClient {
        mute_file_ready: bool,
        wrong_file_ready: bool,
        mute_status: bool,
        report: Mutex<Option<StatusReport>>,
        received: Mutex<Vec<Message>>,
    }

    impl FakeClient {
        fn muted() -> Self {
            Self {
                mute_file_ready: true,
                ..Self::default()
            }
        }

        fn reporting(state: PlayingState, position: i64) -> Self {
            Self {
                report: Mutex::new(Some(StatusReport::now(state, position))),
                ..Self::default()
            }
        }

        fn received(&self) -> Vec<Message> {
            self.received.lock().clone()
        }

        fn count(&self, name: &str) -> usize {
            self.received.lock().iter().filter(|m| m.name() == name).count()
        }
    }

    impl Dispatch for FakeClient {
        async fn dispatch(&self, message: Message) -> Message {
            self.received.lock().push(message.clone());
            match message {
                Message::FileReady { .. } if self.mute_file_ready => std::future::pending().await,
                Message::FileReady { .. } if self.wrong_file_ready => Message::ClientReady,
                Message::FileReady { .. } => Message::FileParsed,
                Message::ServerReady => Message::ClientReady,
                Message::ServerRequestsStatus if self.mute_status => std::future::pending().await,
                Message::ServerRequestsStatus => {
                    let report = (*self.report.lock())
                        .unwrap_or_else(|| StatusReport::now(PlayingState::Paused, 0));
                    Message::ClientStatus(report)
                }
                _ => Message::ClientReady,
            }
        }
    }

    struct Joined {
        session: Arc<ClientSession>,
        client: Arc<FakeClient>,
        peer: Arc<RpcPeer>,
    }

    async fn join(coordinator: &SyncCoordinator, client: FakeClient) -> Joined {
        let (server_peer, to_client) = RpcPeer::channel();
        let (client_peer, to_server) = RpcPeer::channel();
        let server_peer = Arc::new(server_peer);
        let client_peer = Arc::new(client_peer);
        let client = Arc::new(client);

        tokio::spawn(pump(Arc::clone(&client_peer), to_client, Arc::clone(&client)));
        let session = coordinator.connect(Arc::clone(&server_peer)).await;
        let handler = ClientHandler::new(coordinator.clone(), Arc::clone(&session));
        tokio::spawn(pump(server_peer, to_server, Arc::new(handler)));

        Joined {
            session,
            client,
            peer: client_peer,
        }
    }

    fn coordinator(duration: i64) -> SyncCoordinator {
        SyncCoordinator::new(SyncConfig::default(), FixedDuration(duration))
    }

    async fn settle<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(120), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_survives_unresponsive_client() {
        let coordinator = coordinator(600_000);
        let a = join(&coordinator, FakeClient::default()).await;
        let b = join(&coordinator, FakeClient::default()).await;
        let mute = join(&coordinator, FakeClient::muted()).await;

        let info = coordinator.load("/media/movie.mkv").await.unwrap();
        assert_eq!(info.name, "movie.mkv");
        assert_eq!(info.duration, 600_000);

        assert_eq!(coordinator.registry().len(), 2);
        assert!(!coordinator.registry().contains(mute.session.id));
        assert!(mute.session.kicked().is_cancelled());
        assert_eq!(a.session.state(), ConnectionState::Ready);
        assert_eq!(b.session.state(), ConnectionState::Ready);
        assert_eq!(coordinator.status().state, PlayingState::Stopped);
        assert_eq!(
            a.client.received()[..2],
            [Message::FileReady { close_enough_value: 1500 }, Message::ServerReady]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_drops_client_with_wrong_reply() {
        let coordinator = coordinator(600_000);
        let a = join(&coordinator, FakeClient::default()).await;
        let b = join(&coordinator, FakeClient::default()).await;
        let wrong = FakeClient {
            wrong_file_ready: true,
            ..FakeClient::default()
        };
        let w = join(&coordinator, wrong).await;

        tokio::time::timeout(Duration::from_secs(5), coordinator.load("/media/movie.mkv"))
            .await
            .expect("a wrong reply must not wait for the handshake timeout")
            .unwrap();

        assert_eq!(coordinator.registry().len(), 2);
        assert!(!coordinator.registry().contains(w.session.id));
        assert!(w.session.kicked().is_cancelled());
        assert_eq!(w.client.count("ServerReady"), 0);
        assert_eq!(a.session.state(), ConnectionState::Ready);
        assert_eq!(b.session.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_drops_client_with_undecodable_reply() {
        let coordinator = coordinator(600_000);
        let a = join(&coordinator, FakeClient::default()).await;
        let (server_peer, mut to_client) = RpcPeer::channel();
        let session = coordinator.connect(Arc::new(server_peer)).await;
        let handler = Arc::new(ClientHandler::new(coordinator.clone(), Arc::clone(&session)));

        let loading = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.load("/media/movie.mkv").await })
        };
        let file_ready = to_client.recv().await.unwrap();
        assert_eq!(file_ready.message.name(), "FileReady");
        handler.receive(&format!(r#"{{"id":900,"reply_to":{},"type":"Bogus"}}"#, file_ready.id));

        tokio::time::timeout(Duration::from_secs(5), loading)
            .await
            .expect("an undecodable reply must not wait for the handshake timeout")
            .unwrap()
            .unwrap();
        assert!(!coordinator.registry().contains(session.id));
        assert!(session.kicked().is_cancelled());
        assert_eq!(a.session.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_second_load_is_rejected() {
        let coordinator = coordinator(60_000);
        coordinator.load("/media/a.mp4").await.unwrap();
        let err = coordinator.load("/media/b.mp4").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::AlreadyActive));
        assert_eq!(coordinator.media().unwrap().name, "a.mp4");
    }

    #[tokio::test]
    async fn test_commands_without_media_fail() {
        let coordinator = coordinator(60_000);
        assert!(matches!(coordinator.play(None), Err(CoordinatorError::NoMedia)));
        assert!(matches!(coordinator.stop(), Err(CoordinatorError::NoMedia)));
    }

    #[tokio::test]
    async fn test_play_broadcasts_once_to_everyone() {
        let coordinator = coordinator(600_000);
        let a = join(&coordinator, FakeClient::default()).await;
        let b = join(&coordinator, FakeClient::default()).await;
        coordinator.load("/media/movie.mkv").await.unwrap();

        let outcome = a
            .peer
            .call(Message::ClientRequestsPlay { position: 120_500 }, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(outcome, Message::ServerStatus(report) if report.state == PlayingState::Playing));
        assert_eq!(coordinator.play(Some(0)).unwrap(), CommandOutcome::Ignored);

        settle(|| a.client.count("ServerRequestsPlay") == 1 && b.client.count("ServerRequestsPlay") == 1).await;
        assert!(a
            .client
            .received()
            .contains(&Message::ServerRequestsPlay { position: 120_500 }));
        assert_eq!(b.client.count("ServerRequestsPlay"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_without_position_uses_clock() {
        let coordinator = coordinator(600_000);
        coordinator.load("/media/movie.mkv").await.unwrap();
        coordinator.play(Some(1_000)).unwrap();
        tokio::time::advance(Duration::from_millis(2_000)).await;

        let outcome = coordinator.pause(None).unwrap();
        assert_eq!(outcome, CommandOutcome::Applied { position: 3_000 });
        assert_eq!(coordinator.pause(None).unwrap(), CommandOutcome::Ignored);
        tokio::time::advance(Duration::from_millis(5_000)).await;
        assert_eq!(coordinator.status().position, 3_000);
    }

    #[tokio::test]
    async fn test_seek_while_playing_restarts_from_target() {
        let coordinator = coordinator(600_000);
        let a = join(&coordinator, FakeClient::default()).await;
        coordinator.load("/media/movie.mkv").await.unwrap();

        coordinator.play(Some(0)).unwrap();
        let outcome = coordinator.seek(Some(10_000)).unwrap();
        assert_eq!(outcome, CommandOutcome::Applied { position: 10_000 });

        let status = coordinator.status();
        assert_eq!(status.state, PlayingState::Playing);
        assert!((10_000..10_200).contains(&status.position));

        settle(|| a.client.count("ServerRequestsPlay") == 2).await;
        let commands: Vec<&'static str> = a.client.received().iter().skip(2).map(|m| m.name()).collect();
        assert_eq!(
            commands,
            ["ServerRequestsPlay", "ServerRequestsPause", "ServerRequestSeek", "ServerRequestsPlay"]
        );
    }

    #[tokio::test]
    async fn test_command_dropped_while_another_is_in_flight() {
        let coordinator = coordinator(600_000);
        coordinator.load("/media/movie.mkv").await.unwrap();

        let busy = coordinator.inner.command_lock.try_lock().unwrap();
        assert_eq!(coordinator.play(None).unwrap(), CommandOutcome::Dropped);
        drop(busy);
        assert!(matches!(coordinator.play(None).unwrap(), CommandOutcome::Applied { .. }));
    }

    #[tokio::test]
    async fn test_resync_pauses_at_most_behind_position() {
        let coordinator = coordinator(600_000);
        let a = join(&coordinator, FakeClient::reporting(PlayingState::Paused, 5_000)).await;
        let b = join(&coordinator, FakeClient::reporting(PlayingState::Paused, 7_000)).await;
        let c = join(&coordinator, FakeClient::reporting(PlayingState::Paused, 4_200)).await;
        coordinator.load("/media/movie.mkv").await.unwrap();
        coordinator.pause(Some(6_000)).unwrap();

        let outcome = coordinator.resync().await.unwrap();
        assert_eq!(outcome, CommandOutcome::Applied { position: 4_200 });
        assert_eq!(coordinator.status().position, 4_200);
        assert_eq!(a.session.last_reported().map(|r| r.position), Some(5_000));

        for joined in [&a, &b, &c] {
            settle(|| {
                joined
                    .client
                    .received()
                    .contains(&Message::ServerRequestsPause { position: 4_200 })
            })
            .await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_excludes_silent_client() {
        let coordinator = coordinator(600_000);
        let _a = join(&coordinator, FakeClient::reporting(PlayingState::Paused, 9_000)).await;
        let silent = FakeClient {
            mute_status: true,
            ..FakeClient::reporting(PlayingState::Paused, 100)
        };
        let s = join(&coordinator, silent).await;
        coordinator.load("/media/movie.mkv").await.unwrap();
        coordinator.pause(Some(9_500)).unwrap();

        let outcome = coordinator.resync().await.unwrap();
        assert_eq!(outcome, CommandOutcome::Applied { position: 9_000 });
        assert!(coordinator.registry().contains(s.session.id));
    }

    #[tokio::test]
    async fn test_resync_is_single_flight() {
        let coordinator = coordinator(600_000);
        coordinator.load("/media/movie.mkv").await.unwrap();
        coordinator.play(None).unwrap();

        let flight = coordinator.inner.resync.try_enter().unwrap();
        assert_eq!(coordinator.resync().await.unwrap(), CommandOutcome::Dropped);
        drop(flight);
        assert!(matches!(coordinator.resync().await.unwrap(), CommandOutcome::Applied { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_joiner_starts_at_current_position() {
        let coordinator = coordinator(600_000);
        coordinator.load("/media/movie.mkv").await.unwrap();
        coordinator.play(Some(30_000)).unwrap();
        tokio::time::advance(Duration::from_millis(4_000)).await;
        coordinator.pause(None).unwrap();

        let late = join(&coordinator, FakeClient::default()).await;
        settle(|| late.session.state() == ConnectionState::Ready).await;
        assert_eq!(
            late.client.received(),
            [
                Message::FileReady { close_enough_value: 1500 },
                Message::ServerReady,
                Message::ServerRequestsPause { position: 34_000 },
            ]
        );
    }

    #[tokio::test]
    async fn test_requests_ignored_until_onboarded() {
        let coordinator = coordinator(600_000);
        coordinator.load("/media/movie.mkv").await.unwrap();
        let late = join(&coordinator, FakeClient::muted()).await;

        let reply = coordinator
            .handle_request(&late.session, Message::ClientRequestsPlay { position: 0 })
            .await;
        assert_eq!(reply, Message::Empty);
        assert_eq!(coordinator.status().state, PlayingState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_file_closes_once() {
        let coordinator = coordinator(1_000);
        let a = join(&coordinator, FakeClient::default()).await;
        let mut positions = coordinator.subscribe();
        coordinator.load("/media/short.mp4").await.unwrap();
        coordinator.play(Some(0)).unwrap();

        settle(|| !coordinator.is_active()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(a.client.count("FileClosed"), 1);
        assert_eq!(a.session.state(), ConnectionState::Connected);
        assert!(positions.has_changed().unwrap());
        assert!(positions.borrow_and_update().is_none());

        // The item is gone, a new one may be loaded
        coordinator.load("/media/next.mp4").await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_media() {
        let coordinator = coordinator(600_000);
        let a = join(&coordinator, FakeClient::default()).await;
        coordinator.load("/media/movie.mkv").await.unwrap();
        coordinator.play(None).unwrap();

        assert_eq!(coordinator.stop().unwrap(), CommandOutcome::Applied { position: 0 });
        assert!(coordinator.media().is_none());
        settle(|| a.client.count("FileClosed") == 1).await;
    }

    #[tokio::test]
    async fn test_repeated_violations_disconnect() {
        let coordinator = coordinator(600_000);
        let a = join(&coordinator, FakeClient::default()).await;

        for _ in 0..2 {
            let reply = coordinator.handle_request(&a.session, Message::FileParsed).await;
            assert_eq!(reply, Message::Empty);
        }
        assert!(!a.session.kicked().is_cancelled());
        coordinator.handle_request(&a.session, Message::ServerReady).await;
        assert!(a.session.kicked().is_cancelled());
    }

    #[tokio::test]
    async fn test_disconnect_unblocks_handshake() {
        let coordinator = coordinator(600_000);
        let mute = join(&coordinator, FakeClient::muted()).await;

        let loading = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.load("/media/movie.mkv").await })
        };
        settle(|| mute.session.peer().pending_calls() == 1).await;

        tokio::time::timeout(Duration::from_secs(5), coordinator.disconnect(&mute.session))
            .await
            .expect("disconnect must not wait for the handshake timeout");
        loading.await.unwrap().unwrap();
        assert!(coordinator.registry().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_drains_tasks() {
        let coordinator = coordinator(600_000);
        let a = join(&coordinator, FakeClient::default()).await;
        coordinator.load("/media/movie.mkv").await.unwrap();
        coordinator.play(None).unwrap();

        tokio::time::timeout(Duration::from_secs(5), coordinator.shutdown())
            .await
            .expect("shutdown must not hang");
        assert!(coordinator.media().is_none());
        assert!(a.session.peer().is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_served_requests() {
        let coordinator = coordinator(600_000);
        let (server_peer, _to_client) = RpcPeer::channel();
        let session = coordinator.connect(Arc::new(server_peer)).await;
        let handler = Arc::new(ClientHandler::new(coordinator.clone(), Arc::clone(&session)));

        handler.receive(r#"{"id":5,"expects_reply":true,"type":"GetStatus"}"#);
        assert_eq!(coordinator.inner.tasks.len(), 1);

        tokio::time::timeout(Duration::from_secs(5), coordinator.shutdown())
            .await
            .expect("shutdown must not hang");
        assert!(coordinator.inner.tasks.is_empty());
    }
}
