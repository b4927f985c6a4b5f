use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use super::driver::{Envelope, ProtocolDriver};
use super::payload::{HandshakeReply, Payload, PayloadType};
use super::Message;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    TimedOut,
    #[error("connection closed during handshake")]
    Closed,
    #[error("unexpected `{0}` during handshake")]
    UnexpectedPayload(PayloadType),
}

impl HandshakeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            HandshakeError::TimedOut => "timeout",
            HandshakeError::Closed => "closed",
            HandshakeError::UnexpectedPayload(_) => "unexpected_payload",
        }
    }
}

#[derive(Debug, Default)]
pub struct HandshakeOutcome {
    /// A `sync-request` the peer sent before the handshake finished.
    pub sync_request: Option<Message>,
}

/// Server side of the bootstrap exchange: answer `handshake` with the session
/// identity, then wait for `handshake-complete`. `control` carries the
/// connection-level payloads (handshake, handshake-complete, sync-request) in
/// arrival order.
pub async fn accept(
    driver: &ProtocolDriver,
    control: &mut mpsc::UnboundedReceiver<Message>,
    reply: HandshakeReply,
    within: Duration,
) -> Result<HandshakeOutcome, HandshakeError> {
    let exchange = async {
        let mut outcome = HandshakeOutcome::default();
        let mut replied = false;
        loop {
            let message = control.recv().await.ok_or(HandshakeError::Closed)?;
            match message.payload_type() {
                PayloadType::Handshake if !replied => {
                    driver.send_message(Envelope::new(Message::reply(
                        message.id,
                        Payload::HandshakeReply(reply.clone()),
                    )));
                    replied = true;
                }
                PayloadType::HandshakeComplete if replied => return Ok(outcome),
                PayloadType::SyncRequest => {
                    debug!(
                        target = "beach_mirror::protocol",
                        connection = %driver.label(),
                        "captured early sync-request"
                    );
                    outcome.sync_request = Some(message);
                }
                other => return Err(HandshakeError::UnexpectedPayload(other)),
            }
        }
    };
    tokio::time::timeout(within, exchange)
        .await
        .map_err(|_| HandshakeError::TimedOut)?
}
