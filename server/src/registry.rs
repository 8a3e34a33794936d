use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tandem_proto::{RpcPeer, StatusReport};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const LOG_TAG: &str = "[Tandem Server]";

/// Where a client stands in the onboarding handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Connected, no media to onboard onto
    Connected,
    /// Handshake in progress; requests are not accepted yet
    AwaitingAck,
    /// Handshake done, receives every broadcast
    Ready,
}

/// Server-side handle of one connected client
pub struct ClientSession {
    pub id: Uuid,
    peer: Arc<RpcPeer>,
    state: Mutex<ConnectionState>,
    last_reported: Mutex<Option<StatusReport>>,
    violations: AtomicU32,
    kicked: CancellationToken,
}

/// Serializable view of a session for the control API
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub state: ConnectionState,
    pub last_reported: Option<StatusReport>,
}

impl ClientSession {
    pub fn new(id: Uuid, peer: Arc<RpcPeer>) -> Self {
        Self {
            id,
            peer,
            state: Mutex::new(ConnectionState::Connected),
            last_reported: Mutex::new(None),
            violations: AtomicU32::new(0),
            kicked: CancellationToken::new(),
        }
    }

    pub fn peer(&self) -> &RpcPeer {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub fn last_reported(&self) -> Option<StatusReport> {
        *self.last_reported.lock()
    }

    pub fn record_status(&self, report: StatusReport) {
        *self.last_reported.lock() = Some(report);
    }

    /// Count a protocol violation, returning the running total.
    pub fn record_violation(&self) -> u32 {
        self.violations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Fail outstanding calls and ask the connection task to hang up.
    pub fn disconnect(&self) {
        self.peer.close();
        self.kicked.cancel();
    }

    /// Cancelled once the session has been told to go away.
    pub fn kicked(&self) -> CancellationToken {
        self.kicked.clone()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            state: self.state(),
            last_reported: self.last_reported(),
        }
    }
}

/// All connected clients: client_id -> ClientSession.
///
/// Membership changes are made by the coordinator while it holds the command
/// lock; reads may happen at any time.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<Uuid, Arc<ClientSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<ClientSession>) {
        let id = session.id;
        self.sessions.insert(id, session);
        tracing::info!("{LOG_TAG} Client {} connected ({} total)", id, self.len());
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<ClientSession>> {
        let removed = self.sessions.remove(&id).map(|(_, session)| session);
        if removed.is_some() {
            tracing::info!("{LOG_TAG} Client {} disconnected ({} left)", id, self.len());
        }
        removed
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Sessions that completed the handshake for the current media.
    pub fn ready(&self) -> Vec<Arc<ClientSession>> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().state() == ConnectionState::Ready)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.sessions
            .iter()
            .map(|entry| entry.value().summary())
            .collect()
    }
}
