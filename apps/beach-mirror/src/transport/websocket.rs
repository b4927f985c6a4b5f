use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Connection, ConnectionError, ConnectionEvent, ConnectionQuality};
use crate::protocol::{decode_message, encode_message, Message, ProtocolError};

enum Outbound {
    Frame(String),
    Close,
}

/// Connection over an upgraded axum WebSocket carrying one JSON message per
/// text frame. Consumers may observe more than one `Close`; only the first
/// matters.
pub struct WebSocketConnection {
    outbound: mpsc::UnboundedSender<Outbound>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    closed: Arc<AtomicBool>,
    quality: Arc<ConnectionQuality>,
    label: String,
}

impl WebSocketConnection {
    pub fn spawn(socket: WebSocket, label: impl Into<String>) -> Arc<Self> {
        let label = label.into();
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let writer_label = label.clone();
        let writer = tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                match outbound {
                    Outbound::Frame(text) => {
                        if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
            debug!(target = "beach_mirror::transport", connection = %writer_label, "writer task finished");
        });

        let reader_events = events_tx.clone();
        let reader_closed = Arc::clone(&closed);
        let reader_label = label.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!(target = "beach_mirror::transport", connection = %reader_label, "dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(WsMessage::Close(frame)) => {
                        debug!(
                            target = "beach_mirror::transport",
                            connection = %reader_label,
                            reason = ?frame.map(|f| f.reason.to_string()),
                            "peer closed websocket"
                        );
                        break;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(target = "beach_mirror::transport", connection = %reader_label, error = %err, "websocket receive failed");
                        break;
                    }
                };
                match decode_message(&text) {
                    Ok(message) => {
                        if reader_events.send(ConnectionEvent::Recv(message)).is_err() {
                            break;
                        }
                    }
                    Err(ProtocolError::MissingRule { payload_type }) => {
                        warn!(
                            target = "beach_mirror::transport",
                            connection = %reader_label,
                            payload_type = %payload_type,
                            "dropping message with no rule"
                        );
                    }
                    Err(err) => {
                        warn!(target = "beach_mirror::transport", connection = %reader_label, error = %err, "dropping malformed message");
                    }
                }
            }
            reader_closed.store(true, Ordering::Release);
            writer.abort();
            let _ = reader_events.send(ConnectionEvent::Close);
        });

        Arc::new(Self {
            outbound: outbound_tx,
            events_tx,
            events: Mutex::new(Some(events_rx)),
            closed,
            quality: Arc::new(ConnectionQuality::new()),
            label,
        })
    }
}

impl Connection for WebSocketConnection {
    fn send(&self, message: Message) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }
        let text = encode_message(&message)?;
        self.outbound
            .send(Outbound::Frame(text))
            .map_err(|_| ConnectionError::Closed)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(target = "beach_mirror::transport", connection = %self.label, "closing websocket");
        let _ = self.outbound.send(Outbound::Close);
        // A dead peer never answers the close frame, so report it locally too.
        let _ = self.events_tx.send(ConnectionEvent::Close);
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
