use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tandem_proto::{Dispatch, Frame, Message, RpcPeer};

use crate::coordinator::SyncCoordinator;
use crate::registry::{ClientSession, LOG_TAG};

const WRITER_GRACE: Duration = Duration::from_secs(5);

/// Routes requests from one client into the coordinator
pub struct ClientHandler {
    coordinator: SyncCoordinator,
    session: Arc<ClientSession>,
}

impl ClientHandler {
    pub fn new(coordinator: SyncCoordinator, session: Arc<ClientSession>) -> Self {
        Self {
            coordinator,
            session,
        }
    }

    /// Handle one text frame read from the socket.
    ///
    /// Requests are served on tasks the coordinator tracks, so shutdown waits
    /// for them. An undecodable frame counts as a violation; if it was a reply,
    /// the call waiting on it fails at once.
    pub fn receive(self: &Arc<Self>, text: &str) {
        let peer = self.session.peer();
        match Frame::decode(text) {
            Ok(frame) => {
                if let Some(inbound) = peer.accept(frame) {
                    let handler = Arc::clone(self);
                    self.coordinator.spawn(async move {
                        handler.session.peer().serve(inbound, handler.as_ref()).await;
                    });
                }
            }
            Err(e) => {
                tracing::warn!("{LOG_TAG} Malformed frame from client {}: {}", self.session.id, e);
                let _ = peer.reject(&e);
                peer.fail_reply(&e);
                self.coordinator.note_violation(&self.session);
            }
        }
    }
}

impl Dispatch for ClientHandler {
    async fn dispatch(&self, message: Message) -> Message {
        self.coordinator.handle_request(&self.session, message).await
    }
}

pub async fn ws_endpoint(
    ws: WebSocketUpgrade,
    State(coordinator): State<SyncCoordinator>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, coordinator))
}

pub async fn handle_connection(socket: WebSocket, coordinator: SyncCoordinator) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (peer, mut outbound) = RpcPeer::channel();
    let peer = Arc::new(peer);

    let session = coordinator.connect(Arc::clone(&peer)).await;
    let client_id = session.id;

    // Spawn task to send frames to the client; once kicked it flushes the
    // queue and closes the socket
    let kicked = session.kicked();
    let mut send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                frame = outbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = kicked.cancelled() => {
                    let _ = ws_sender.send(AxumWsMessage::Close(None)).await;
                    break;
                }
            };

            let json = match frame.encode() {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize {}: {}", frame.message.name(), e);
                    continue;
                }
            };

            if let Err(e) = ws_sender.send(AxumWsMessage::Text(json)).await {
                tracing::error!("Failed to send message: {}", e);
                break;
            }
        }
    });

    let handler = Arc::new(ClientHandler::new(coordinator.clone(), Arc::clone(&session)));
    let kicked = session.kicked();

    // Handle incoming frames
    loop {
        let msg = tokio::select! {
            _ = kicked.cancelled() => break,
            msg = ws_receiver.next() => msg,
        };
        let Some(msg) = msg else { break };

        match msg {
            Ok(AxumWsMessage::Text(text)) => handler.receive(&text),
            Ok(AxumWsMessage::Binary(_)) => {
                tracing::warn!("{LOG_TAG} Binary frame from client {}", client_id);
                coordinator.note_violation(&session);
            }
            Ok(AxumWsMessage::Close(_)) => {
                tracing::info!("{LOG_TAG} Client {} closing connection", client_id);
                break;
            }
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    coordinator.disconnect(&session).await;
    if tokio::time::timeout(WRITER_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }
}
