use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::message::{now_millis, Message};
use super::payload::{Payload, PayloadType};
use super::{ReplyError, UserId};
use crate::transport::Connection;

pub type ReplyResult = Result<Message, ReplyError>;
pub type ReplyReceiver = oneshot::Receiver<ReplyResult>;

/// A message on its way out, together with how its reply (if any) is
/// tracked and which user it is restricted to.
#[derive(Debug)]
pub struct Envelope {
    pub message: Message,
    /// Resolved with the reply. Dropping the sender without resolving it is
    /// how a cancelled send rejects its caller.
    pub reply: Option<oneshot::Sender<ReplyResult>>,
    /// Tracks the reply even when nobody waits on it; expiry closes the
    /// connection.
    pub timeout: Option<Duration>,
    pub audience: Option<UserId>,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            reply: None,
            timeout: None,
            audience: None,
        }
    }

    pub fn request(message: Message, timeout: Option<Duration>) -> (Self, ReplyReceiver) {
        let (tx, rx) = oneshot::channel();
        let envelope = Self {
            message,
            reply: Some(tx),
            timeout,
            audience: None,
        };
        (envelope, rx)
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_audience(mut self, audience: Option<UserId>) -> Self {
        self.audience = audience;
        self
    }

    pub fn payload_type(&self) -> PayloadType {
        self.message.payload_type()
    }

    fn is_tracked(&self) -> bool {
        self.reply.is_some() || self.timeout.is_some()
    }
}

/// Interceptor run on every message passing through a driver. Returning
/// `None` swallows the message.
pub trait Middleware: Send + Sync {
    fn before_send(&self, _driver: &ProtocolDriver, envelope: Envelope) -> Option<Envelope> {
        Some(envelope)
    }

    fn before_recv(&self, _driver: &ProtocolDriver, message: Message) -> Option<Message> {
        Some(message)
    }
}

/// Receives what the driver does not consume itself: unsolicited messages,
/// replies to tracked sends that nobody awaits, and unmatched replies.
pub trait ProtocolHandler: Send + Sync {
    fn handle(&self, driver: &ProtocolDriver, message: Message);

    fn missing_promise_for_reply(&self, driver: &ProtocolDriver, message: Message) {
        error!(
            target = "beach_mirror::protocol",
            connection = %driver.label(),
            payload_type = %message.payload_type(),
            reply_to = ?message.reply_to_id,
            "received reply with no pending request"
        );
    }
}

struct Pending {
    sink: Option<oneshot::Sender<ReplyResult>>,
    timer: Option<JoinHandle<()>>,
    payload_type: PayloadType,
}

/// Request/reply state machine over one connection.
#[derive(Clone)]
pub struct ProtocolDriver {
    inner: Arc<DriverInner>,
}

struct DriverInner {
    label: String,
    connection: Arc<dyn Connection>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    pending: Mutex<HashMap<Uuid, Pending>>,
    outstanding: watch::Sender<usize>,
}

impl ProtocolDriver {
    pub fn new(label: impl Into<String>, connection: Arc<dyn Connection>) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            inner: Arc::new(DriverInner {
                label: label.into(),
                connection,
                middleware: RwLock::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
                outstanding,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.inner.connection
    }

    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.inner.middleware.write().push(middleware);
    }

    pub fn send(&self, payload: Payload) {
        self.send_message(Envelope::new(Message::new(payload)));
    }

    /// Runs the outbound middleware chain, then transmits.
    pub fn send_message(&self, envelope: Envelope) {
        let chain = self.inner.middleware.read().clone();
        let mut envelope = envelope;
        for middleware in chain {
            match middleware.before_send(self, envelope) {
                Some(next) => envelope = next,
                None => return,
            }
        }
        self.transmit(envelope);
    }

    /// Sends `message` and waits for its reply.
    pub async fn request(&self, message: Message, timeout: Option<Duration>) -> ReplyResult {
        let (envelope, reply) = Envelope::request(message, timeout);
        self.send_message(envelope);
        reply.await.unwrap_or(Err(ReplyError::Rejected))
    }

    /// Hands a message to the connection without consulting middleware.
    pub fn transmit(&self, envelope: Envelope) {
        let tracked = envelope.is_tracked();
        let payload_type = envelope.payload_type();
        let Envelope {
            mut message,
            reply,
            timeout,
            ..
        } = envelope;

        if message.id.is_nil() {
            message.id = Uuid::new_v4();
        }
        let id = message.id;

        if tracked {
            let timer = timeout.map(|after| self.spawn_timeout(id, after));
            let mut pending = self.inner.pending.lock();
            let replaced = pending.insert(
                id,
                Pending {
                    sink: reply,
                    timer,
                    payload_type,
                },
            );
            if let Some(Pending {
                timer: Some(timer), ..
            }) = replaced
            {
                timer.abort();
            }
            self.inner.outstanding.send_replace(pending.len());
        }

        let quality = self.inner.connection.quality();
        message.server_time_ms = Some(now_millis());
        message.latency_estimate_ms = quality.latency_ms();

        if let Err(err) = self.inner.connection.send(message) {
            debug!(
                target = "beach_mirror::protocol",
                connection = %self.inner.label,
                payload_type = %payload_type,
                error = %err,
                "send failed"
            );
            if let Some(pending) = self.take_pending(id) {
                settle(pending, Err(ReplyError::ConnectionClosed));
            }
        }
    }

    /// Runs the inbound middleware chain, then resolves a pending reply or
    /// dispatches to `handler`.
    pub fn recv_message(&self, message: Message, handler: &dyn ProtocolHandler) {
        let chain = self.inner.middleware.read().clone();
        let mut message = message;
        for middleware in chain {
            match middleware.before_recv(self, message) {
                Some(next) => message = next,
                None => return,
            }
        }

        let Some(reply_to) = message.reply_to_id else {
            handler.handle(self, message);
            return;
        };

        match self.take_pending(reply_to) {
            Some(mut pending) => {
                if let Some(timer) = pending.timer.take() {
                    timer.abort();
                }
                match pending.sink.take() {
                    Some(sink) => {
                        let _ = sink.send(Ok(message));
                    }
                    None => handler.handle(self, message),
                }
            }
            None => handler.missing_promise_for_reply(self, message),
        }
    }

    pub fn outstanding(&self) -> usize {
        *self.inner.outstanding.borrow()
    }

    /// Resolves once no tracked reply is outstanding.
    pub async fn drain(&self) {
        let mut outstanding = self.inner.outstanding.subscribe();
        let _ = outstanding.wait_for(|count| *count == 0).await;
    }

    pub fn reject_all(&self, reason: ReplyError) {
        let drained: Vec<Pending> = {
            let mut pending = self.inner.pending.lock();
            let drained = pending.drain().map(|(_, entry)| entry).collect();
            self.inner.outstanding.send_replace(0);
            drained
        };
        for mut entry in drained {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            settle(entry, Err(reason));
        }
    }

    pub fn close(&self) {
        self.inner.connection.close();
    }

    fn take_pending(&self, id: Uuid) -> Option<Pending> {
        let mut pending = self.inner.pending.lock();
        let entry = pending.remove(&id);
        if entry.is_some() {
            self.inner.outstanding.send_replace(pending.len());
        }
        entry
    }

    fn spawn_timeout(&self, id: Uuid, after: Duration) -> JoinHandle<()> {
        let weak: Weak<DriverInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let driver = ProtocolDriver { inner };
            let Some(mut pending) = driver.take_pending(id) else {
                return;
            };
            // This task is the timer; dropping the handle detaches it.
            pending.timer = None;
            warn!(
                target = "beach_mirror::protocol",
                connection = %driver.label(),
                payload_type = %pending.payload_type,
                timeout_ms = after.as_millis() as u64,
                "reply timed out; closing connection"
            );
            counter!(
                "beach_mirror_reply_timeouts_total",
                1,
                "payload_type" => pending.payload_type.as_str()
            );
            settle(pending, Err(ReplyError::TimedOut));
            driver.close();
        })
    }
}

fn settle(mut pending: Pending, result: ReplyResult) {
    if let Some(sink) = pending.sink.take() {
        let _ = sink.send(result);
    }
}
