use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::protocol::payload::SetAuthoritative;
use crate::protocol::{
    ClientId, Envelope, Message, Middleware, Payload, ProtocolDriver, UserId,
};

#[derive(Default)]
struct DesyncState {
    user_id: Option<UserId>,
    deferred: Vec<Envelope>,
}

/// Per-client outbound filter for user-restricted messages.
///
/// Until the client reports its user with `user-joined`, restricted
/// messages are held. Once the user is known they are delivered if they
/// target that user and discarded otherwise; later restricted messages are
/// filtered on the spot. Discarding drops the envelope, which rejects any
/// caller waiting on its reply. Held messages do not count as outstanding
/// on the driver; a reply deadline starts when the message is released.
pub struct DesyncPreprocessor {
    client_id: ClientId,
    state: Mutex<DesyncState>,
    authoritative: Arc<AtomicBool>,
}

impl DesyncPreprocessor {
    pub fn new(client_id: ClientId, authoritative: Arc<AtomicBool>) -> Self {
        Self {
            client_id,
            state: Mutex::new(DesyncState::default()),
            authoritative,
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.state.lock().user_id
    }

    pub fn deferred(&self) -> usize {
        self.state.lock().deferred.len()
    }
}

impl Middleware for DesyncPreprocessor {
    fn before_send(&self, _driver: &ProtocolDriver, envelope: Envelope) -> Option<Envelope> {
        let Some(audience) = envelope.audience else {
            return Some(envelope);
        };
        let mut state = self.state.lock();
        match state.user_id {
            None => {
                trace!(
                    target = "beach_mirror::client",
                    client_id = %self.client_id,
                    payload_type = %envelope.payload_type(),
                    "deferring restricted message until user is known"
                );
                state.deferred.push(envelope);
                None
            }
            Some(user_id) if user_id == audience => Some(envelope),
            Some(_) => None,
        }
    }

    fn before_recv(&self, driver: &ProtocolDriver, message: Message) -> Option<Message> {
        let Payload::UserJoined(joined) = &message.payload else {
            return Some(message);
        };
        let mut state = self.state.lock();
        state.user_id = Some(joined.user.id);
        if self.authoritative.load(Ordering::SeqCst) {
            driver.transmit(Envelope::new(Message::new(Payload::SetAuthoritative(
                SetAuthoritative {
                    authoritative: true,
                },
            ))));
        }
        let deferred = std::mem::take(&mut state.deferred);
        let (deliver, discard): (Vec<_>, Vec<_>) = deferred
            .into_iter()
            .partition(|envelope| envelope.audience == Some(joined.user.id));
        debug!(
            target = "beach_mirror::client",
            client_id = %self.client_id,
            user_id = %joined.user.id,
            delivered = deliver.len(),
            discarded = discard.len(),
            "user joined; releasing deferred messages"
        );
        for envelope in deliver {
            driver.transmit(envelope);
        }
        drop(state);
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::payload::{Passthrough, UserInfo, UserJoined};
    use crate::protocol::{PayloadType, ReplyError};
    use crate::transport::{Connection, ConnectionEvent, Pipe};
    use serde_json::Map;
    use std::time::Duration;
    use uuid::Uuid;

    fn restricted(user: UserId) -> Envelope {
        Envelope::new(Message::new(Payload::Trace(Passthrough::default()))).with_audience(Some(user))
    }

    fn joined(user: UserId) -> Message {
        Message::new(Payload::UserJoined(UserJoined {
            user: UserInfo {
                id: user,
                fields: Map::new(),
            },
        }))
    }

    #[test_timeout::tokio_timeout_test]
    async fn deferred_messages_resolve_once_user_joins() {
        let (local, remote) = Pipe::pair();
        let mut remote_events = remote.take_events().unwrap();
        let driver = ProtocolDriver::new("desync", local);
        let authoritative = Arc::new(AtomicBool::new(true));
        let desync = Arc::new(DesyncPreprocessor::new(Uuid::new_v4(), authoritative));
        driver.use_middleware(desync.clone());

        let me = Uuid::new_v4();
        let someone_else = Uuid::new_v4();
        driver.send_message(restricted(me));
        let (mut theirs, rejected) = Envelope::request(
            Message::new(Payload::Trace(Passthrough::default())),
            None,
        );
        theirs.audience = Some(someone_else);
        driver.send_message(theirs);
        driver.send(Payload::SyncComplete(Passthrough::default()));
        assert_eq!(desync.deferred(), 2);

        let passed = desync.before_recv(&driver, joined(me));
        assert!(passed.is_some());
        assert_eq!(desync.user_id(), Some(me));
        assert_eq!(rejected.await.unwrap_or(Err(ReplyError::Rejected)), Err(ReplyError::Rejected));

        let mut received = Vec::new();
        for _ in 0..3 {
            match remote_events.recv().await {
                Some(ConnectionEvent::Recv(message)) => received.push(message.payload_type()),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(
            received,
            vec![
                PayloadType::SyncComplete,
                PayloadType::SetAuthoritative,
                PayloadType::Trace
            ]
        );

        driver.send_message(restricted(someone_else));
        driver.send_message(restricted(me));
        match remote_events.recv().await {
            Some(ConnectionEvent::Recv(message)) => {
                assert_eq!(message.payload_type(), PayloadType::Trace)
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(desync.deferred(), 0);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn held_message_reply_deadline_starts_on_release() {
        let (local, remote) = Pipe::pair();
        let _remote_events = remote.take_events().unwrap();
        let driver = ProtocolDriver::new("desync", local.clone());
        let desync = Arc::new(DesyncPreprocessor::new(
            Uuid::new_v4(),
            Arc::new(AtomicBool::new(false)),
        ));
        driver.use_middleware(desync.clone());

        let me = Uuid::new_v4();
        driver.send_message(restricted(me).with_timeout(Some(Duration::from_secs(3))));
        assert_eq!(desync.deferred(), 1);
        assert_eq!(driver.outstanding(), 0);
        driver.drain().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!local.is_closed());

        desync.before_recv(&driver, joined(me));
        assert_eq!(driver.outstanding(), 1);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(local.is_closed());
        assert_eq!(driver.outstanding(), 0);
    }
}
