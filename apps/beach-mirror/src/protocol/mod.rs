pub mod driver;
pub mod handshake;
pub mod heartbeat;
pub mod message;
pub mod patch;
pub mod payload;

use thiserror::Error;
use uuid::Uuid;

pub use driver::{Envelope, Middleware, ProtocolDriver, ProtocolHandler, ReplyReceiver};
pub use message::{decode_message, encode_message, now_millis, Message};
pub use payload::{Payload, PayloadType};

pub type ActorId = Uuid;
pub type AssetId = Uuid;
pub type AnimationId = Uuid;
pub type ClientId = Uuid;
pub type SessionId = Uuid;
pub type UserId = Uuid;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("no rule registered for payload type `{payload_type}`")]
    MissingRule { payload_type: String },
    #[error("message has no payload type")]
    UntypedPayload,
    #[error("failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Connection(#[from] crate::transport::ConnectionError),
}

/// Failure side of a pending request.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ReplyError {
    #[error("request was cancelled before it was sent")]
    Rejected,
    #[error("timed out waiting for reply")]
    TimedOut,
    #[error("connection closed before reply arrived")]
    ConnectionClosed,
}
