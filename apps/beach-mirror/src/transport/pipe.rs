use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use super::{Connection, ConnectionError, ConnectionEvent, ConnectionQuality};
use crate::protocol::{decode_message, encode_message, Message};

/// One end of an in-process connection pair.
///
/// Messages are encoded to JSON and decoded again on the way across so both
/// ends observe exactly what a network peer would. Closing either end closes
/// the pair and delivers `Close` to both.
pub struct Pipe {
    peer_events: mpsc::UnboundedSender<ConnectionEvent>,
    own_events: mpsc::UnboundedSender<ConnectionEvent>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    closed: Arc<AtomicBool>,
    quality: Arc<ConnectionQuality>,
}

impl Pipe {
    pub fn pair() -> (Arc<Pipe>, Arc<Pipe>) {
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let left = Arc::new(Pipe {
            peer_events: right_tx.clone(),
            own_events: left_tx.clone(),
            events: Mutex::new(Some(left_rx)),
            closed: Arc::clone(&closed),
            quality: Arc::new(ConnectionQuality::new()),
        });
        let right = Arc::new(Pipe {
            peer_events: left_tx,
            own_events: right_tx,
            events: Mutex::new(Some(right_rx)),
            closed,
            quality: Arc::new(ConnectionQuality::new()),
        });
        (left, right)
    }
}

impl Connection for Pipe {
    fn send(&self, message: Message) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }
        let text = encode_message(&message)?;
        match decode_message(&text) {
            Ok(decoded) => self
                .peer_events
                .send(ConnectionEvent::Recv(decoded))
                .map_err(|_| ConnectionError::Closed),
            Err(err) => {
                warn!(
                    target = "beach_mirror::transport",
                    error = %err,
                    "pipe peer dropped undecodable message"
                );
                Ok(())
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.own_events.send(ConnectionEvent::Close);
        let _ = self.peer_events.send(ConnectionEvent::Close);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn quality(&self) -> Arc<ConnectionQuality> {
        Arc::clone(&self.quality)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events.lock().take()
    }
}
