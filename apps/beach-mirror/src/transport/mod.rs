use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::Message;

pub mod pipe;
pub mod quality;
pub mod websocket;

pub use pipe::Pipe;
pub use quality::ConnectionQuality;
pub use websocket::WebSocketConnection;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug)]
pub enum ConnectionEvent {
    Recv(Message),
    Close,
}

/// Duplex message channel to one peer.
///
/// Sends are non-blocking so they can be issued while session state is
/// locked. Inbound traffic is delivered through a single event receiver which
/// must be claimed exactly once with [`Connection::take_events`]; a `Close`
/// event is always the last one delivered.
pub trait Connection: Send + Sync {
    fn send(&self, message: Message) -> Result<(), ConnectionError>;
    fn close(&self);
    fn is_closed(&self) -> bool;
    fn quality(&self) -> Arc<ConnectionQuality>;
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>>;
}
