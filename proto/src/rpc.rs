//! Request/reply on top of a one-way frame channel.
//!
//! Each connection owns one [`RpcPeer`]. Outgoing frames are queued on an
//! unbounded channel drained by the connection's writer task; incoming frames
//! are handed to [`RpcPeer::accept`], which resolves pending calls and returns
//! everything else as an [`Inbound`] request for the connection's dispatcher.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ProtocolError, RpcError};
use crate::message::{Frame, Message};

/// Handles requests arriving on a peer. The returned message is sent back
/// only when the remote side is waiting for it.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, message: Message) -> impl Future<Output = Message> + Send;
}

/// A request or notification from the remote side
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub id: u64,
    pub expects_reply: bool,
    pub message: Message,
}

pub struct RpcPeer {
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Message, RpcError>>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl RpcPeer {
    pub fn new(outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// A peer together with the receiving end of its outbound queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn push(&self, frame: Frame) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Disconnected);
        }
        self.outbound.send(frame).map_err(|_| RpcError::Disconnected)
    }

    /// Fire-and-forget: at most once, no reply.
    pub fn send_async(&self, message: Message) -> Result<(), RpcError> {
        let frame = Frame {
            id: self.allocate_id(),
            reply_to: None,
            expects_reply: false,
            message,
        };
        self.push(frame)
    }

    /// Send a request and wait for the correlated reply.
    ///
    /// Fails with [`RpcError::Timeout`] when nothing arrives in time and with
    /// [`RpcError::Disconnected`] as soon as the peer is closed.
    pub async fn call(&self, message: Message, timeout: Duration) -> Result<Message, RpcError> {
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if self.is_closed() {
                return Err(RpcError::Disconnected);
            }
            pending.insert(id, tx);
        }

        let frame = Frame {
            id,
            reply_to: None,
            expects_reply: true,
            message,
        };
        if let Err(err) = self.push(frame) {
            self.pending.lock().remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RpcError::Disconnected),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    /// [`call`](Self::call), treating any reply other than `expected` as a violation.
    pub async fn call_expecting(
        &self,
        message: Message,
        expected: &'static str,
        timeout: Duration,
    ) -> Result<Message, RpcError> {
        let reply = self.call(message, timeout).await?;
        if reply.name() == expected {
            Ok(reply)
        } else {
            Err(RpcError::Violation {
                expected,
                got: reply.name(),
            })
        }
    }

    pub fn reply(&self, to: u64, message: Message) -> Result<(), RpcError> {
        let frame = Frame {
            id: self.allocate_id(),
            reply_to: Some(to),
            expects_reply: false,
            message,
        };
        self.push(frame)
    }

    /// Answer an inbound request if its sender is waiting.
    pub fn respond(&self, inbound: &Inbound, message: Message) -> Result<(), RpcError> {
        if inbound.expects_reply {
            self.reply(inbound.id, message)
        } else {
            Ok(())
        }
    }

    /// Answer an undecodable request with the default reply.
    pub fn reject(&self, err: &ProtocolError) -> Result<(), RpcError> {
        match err.request_id {
            Some(id) => self.reply(id, Message::Empty),
            None => Ok(()),
        }
    }

    /// Fail the call an undecodable reply was meant for.
    ///
    /// Returns whether a waiting call was found.
    pub fn fail_reply(&self, err: &ProtocolError) -> bool {
        let Some(to) = err.reply_to else {
            return false;
        };
        match self.pending.lock().remove(&to) {
            Some(tx) => {
                let _ = tx.send(Err(RpcError::Violation {
                    expected: "a decodable reply",
                    got: "malformed frame",
                }));
                true
            }
            None => false,
        }
    }

    /// Route a received frame: replies complete their pending call, anything
    /// else is returned for dispatch.
    pub fn accept(&self, frame: Frame) -> Option<Inbound> {
        match frame.reply_to {
            Some(to) => {
                let waiter = self.pending.lock().remove(&to);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(frame.message));
                    }
                    None => {
                        tracing::debug!("Dropping reply {} to unknown or expired call {}", frame.message.name(), to);
                    }
                }
                None
            }
            None => Some(Inbound {
                id: frame.id,
                expects_reply: frame.expects_reply,
                message: frame.message,
            }),
        }
    }

    /// Run the dispatcher for one inbound request and send back its reply.
    pub async fn serve<D: Dispatch>(&self, inbound: Inbound, dispatcher: &D) {
        let reply = dispatcher.dispatch(inbound.message.clone()).await;
        if let Err(err) = self.respond(&inbound, reply) {
            tracing::debug!("Could not answer {}: {}", inbound.message.name(), err);
        }
    }

    /// Mark the peer closed and fail every outstanding call.
    pub fn close(&self) {
        let mut pending = self.pending.lock();
        self.closed.store(true, Ordering::Release);
        pending.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Drive `peer` from an in-process frame channel until it closes.
///
/// Each request is served on its own task so that a slow handler never stops
/// replies to the peer's own calls from being delivered.
pub async fn pump<D: Dispatch>(
    peer: Arc<RpcPeer>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    dispatcher: Arc<D>,
) {
    while let Some(frame) = frames.recv().await {
        if let Some(inbound) = peer.accept(frame) {
            let peer = Arc::clone(&peer);
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { peer.serve(inbound, dispatcher.as_ref()).await });
        }
    }
    peer.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Dispatch for Echo {
        async fn dispatch(&self, message: Message) -> Message {
            match message {
                Message::FileReady { .. } => Message::FileParsed,
                Message::ServerReady => Message::ClientReady,
                _ => Message::Empty,
            }
        }
    }

    struct Silent;

    impl Dispatch for Silent {
        async fn dispatch(&self, _message: Message) -> Message {
            std::future::pending().await
        }
    }

    /// Two peers wired back to back; `server` calls are answered by `client_side`.
    fn linked<D: Dispatch>(client_side: D) -> (Arc<RpcPeer>, Arc<RpcPeer>) {
        let (server, to_client) = RpcPeer::channel();
        let (client, to_server) = RpcPeer::channel();
        let server = Arc::new(server);
        let client = Arc::new(client);
        tokio::spawn(pump(Arc::clone(&client), to_client, Arc::new(client_side)));
        tokio::spawn(pump(Arc::clone(&server), to_server, Arc::new(Echo)));
        (server, client)
    }

    #[tokio::test]
    async fn test_call_receives_correlated_reply() {
        let (server, _client) = linked(Echo);
        let reply = server
            .call(Message::FileReady { close_enough_value: 1500 }, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, Message::FileParsed);
        assert_eq!(server.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_unexpected_reply_is_violation() {
        let (server, _client) = linked(Echo);
        let err = server
            .call_expecting(Message::GetStatus, "ServerStatus", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Violation { expected: "ServerStatus", got: "Empty" }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out_and_forgets_waiter() {
        let (server, _client) = linked(Silent);
        let err = server
            .call(Message::ServerReady, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout(_)));
        assert_eq!(server.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_call() {
        let (server, _client) = linked(Silent);
        let caller = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.call(Message::ServerReady, Duration::from_secs(3600)).await })
        };
        while server.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }
        server.close();
        let result = caller.await.unwrap();
        assert!(matches!(result, Err(RpcError::Disconnected)));
        assert!(matches!(server.send_async(Message::FileClosed), Err(RpcError::Disconnected)));
    }

    #[tokio::test]
    async fn test_send_async_expects_no_reply() {
        let (peer, mut rx) = RpcPeer::channel();
        peer.send_async(Message::FileClosed).unwrap();
        let frame = rx.recv().await.unwrap();
        assert!(!frame.expects_reply);
        assert_eq!(frame.reply_to, None);
        assert_eq!(peer.pending_calls(), 0);
    }

    #[test]
    fn test_reject_answers_only_waiting_senders() {
        let (peer, mut rx) = RpcPeer::channel();
        peer.reject(&ProtocolError { request_id: None, reply_to: None, reason: "x".into() }).unwrap();
        assert!(rx.try_recv().is_err());

        peer.reject(&ProtocolError { request_id: Some(12), reply_to: None, reason: "x".into() }).unwrap();
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.reply_to, Some(12));
        assert_eq!(frame.message, Message::Empty);
    }

    #[test]
    fn test_stray_reply_is_dropped() {
        let (peer, _rx) = RpcPeer::channel();
        let frame = Frame { id: 1, reply_to: Some(99), expects_reply: false, message: Message::ClientReady };
        assert_eq!(peer.accept(frame), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_reply_fails_call_at_once() {
        let (peer, mut rx) = RpcPeer::channel();
        let peer = Arc::new(peer);
        let caller = {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move {
                peer.call_expecting(Message::FileReady { close_enough_value: 1500 }, "FileParsed", Duration::from_secs(60))
                    .await
            })
        };
        let request = rx.recv().await.unwrap();

        let text = format!(r#"{{"id":900,"reply_to":{},"type":"Bogus"}}"#, request.id);
        let err = Frame::decode(&text).unwrap_err();
        assert!(peer.fail_reply(&err));

        let result = caller.await.unwrap();
        assert!(matches!(result, Err(RpcError::Violation { got: "malformed frame", .. })));
        assert_eq!(peer.pending_calls(), 0);

        // a second copy finds nobody waiting
        assert!(!peer.fail_reply(&err));
    }
}
