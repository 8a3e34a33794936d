//! Wire protocol shared by the tandem server and its clients.
//!
//! Messages are JSON objects tagged by `type`, wrapped in a [`Frame`] that
//! carries the correlation data used by [`RpcPeer`].

pub mod error;
pub mod message;
pub mod rpc;
pub mod time;

pub use error::{ProtocolError, RpcError};
pub use message::{requested_position, Frame, Message, PlayingState, StatusReport, CURRENT_POSITION};
pub use rpc::{pump, Dispatch, Inbound, RpcPeer};
pub use time::{format_time, parse_time};
