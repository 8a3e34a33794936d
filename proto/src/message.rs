use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Position value meaning "whatever the server clock currently reads".
pub const CURRENT_POSITION: i64 = -1;

fn current_position() -> i64 {
    CURRENT_POSITION
}

/// Playback state shared by the server clock and every client player
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayingState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Position snapshot reported by either side, timestamped when it was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: PlayingState,
    pub position: i64,
    pub timestamp: DateTime<Utc>,
}

impl StatusReport {
    pub fn now(state: PlayingState, position: i64) -> Self {
        Self {
            state,
            position,
            timestamp: Utc::now(),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlayingState::Playing
    }
}

/// Messages sent between client and server.
///
/// The `type` field names the variant; a payload that does not match its tag
/// fails to deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    // Lifecycle (server -> client requests and their replies)
    FileReady {
        close_enough_value: i64,
    },
    FileParsed,
    ServerReady,
    ClientReady,
    FileClosed,

    // Client -> Server
    ClientRequestsPlay {
        #[serde(default = "current_position")]
        position: i64,
    },
    ClientRequestsPause {
        #[serde(default = "current_position")]
        position: i64,
    },
    #[serde(alias = "ClientRequestsSeek")]
    ClientRequestSeek {
        target: i64,
    },
    ClientRequestsResync,
    GetStatus,
    ClientStatus(StatusReport),

    // Server -> Client
    ServerRequestsPlay {
        position: i64,
    },
    ServerRequestsPause {
        position: i64,
    },
    #[serde(alias = "ServerRequestsSeek")]
    ServerRequestSeek {
        target: i64,
    },
    ServerRequestsStatus,
    ServerStatus(StatusReport),

    /// Default reply to anything the receiver has no handler for
    Empty,
}

impl Message {
    /// The wire tag of this message.
    pub fn name(&self) -> &'static str {
        match self {
            Message::FileReady { .. } => "FileReady",
            Message::FileParsed => "FileParsed",
            Message::ServerReady => "ServerReady",
            Message::ClientReady => "ClientReady",
            Message::FileClosed => "FileClosed",
            Message::ClientRequestsPlay { .. } => "ClientRequestsPlay",
            Message::ClientRequestsPause { .. } => "ClientRequestsPause",
            Message::ClientRequestSeek { .. } => "ClientRequestSeek",
            Message::ClientRequestsResync => "ClientRequestsResync",
            Message::GetStatus => "GetStatus",
            Message::ClientStatus(_) => "ClientStatus",
            Message::ServerRequestsPlay { .. } => "ServerRequestsPlay",
            Message::ServerRequestsPause { .. } => "ServerRequestsPause",
            Message::ServerRequestSeek { .. } => "ServerRequestSeek",
            Message::ServerRequestsStatus => "ServerRequestsStatus",
            Message::ServerStatus(_) => "ServerStatus",
            Message::Empty => "Empty",
        }
    }
}

/// Resolves a requested position; negative values defer to the server clock.
pub fn requested_position(position: i64) -> Option<i64> {
    (position >= 0).then_some(position)
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Envelope every message travels in.
///
/// `reply_to` correlates a reply with the request `id` it answers;
/// `expects_reply` is set on requests whose sender is blocked waiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<u64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub expects_reply: bool,
    #[serde(flatten)]
    pub message: Message,
}

/// Just enough of a frame to answer it when the payload is unusable
#[derive(Deserialize)]
struct Envelope {
    id: Option<u64>,
    #[serde(default)]
    reply_to: Option<u64>,
    #[serde(default)]
    expects_reply: bool,
    #[serde(rename = "type")]
    kind: Option<String>,
}

impl Frame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Frame, ProtocolError> {
        match serde_json::from_str::<Frame>(text) {
            Ok(frame) => Ok(frame),
            Err(err) => {
                let envelope = serde_json::from_str::<Envelope>(text).ok();
                let request_id = envelope
                    .as_ref()
                    .filter(|env| env.expects_reply)
                    .and_then(|env| env.id);
                let reply_to = envelope.as_ref().and_then(|env| env.reply_to);
                let kind = envelope
                    .and_then(|env| env.kind)
                    .unwrap_or_else(|| "<untagged>".to_string());
                Err(ProtocolError {
                    request_id,
                    reply_to,
                    reason: format!("{kind}: {err}"),
                })
            }
        }
    }
}
