use std::time::Duration;

use thiserror::Error;

/// Failure of a correlated call to a remote peer
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("peer disconnected")]
    Disconnected,
    #[error("protocol violation: expected {expected}, got {got}")]
    Violation {
        expected: &'static str,
        got: &'static str,
    },
}

/// A frame that could not be decoded.
///
/// `request_id` is set when the envelope was readable and the sender waits for
/// a reply, so the receiver can still answer with a default message.
/// `reply_to` is set when the frame was itself a reply, so the call waiting on
/// it can be failed instead of left to time out.
#[derive(Debug, Error)]
#[error("malformed frame: {reason}")]
pub struct ProtocolError {
    pub request_id: Option<u64>,
    pub reply_to: Option<u64>,
    pub reason: String,
}
