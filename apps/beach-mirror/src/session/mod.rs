//! One mirrored application session: the app connection, every connected
//! client, and the caches that let late joiners catch up.

pub mod authority;
pub mod client;
pub mod client_sync;
pub mod desync;
pub mod queue;
pub mod state;

use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

pub use authority::AuthorityLedger;
pub use client::{Client, Phase};
pub use client_sync::ClientSync;
pub use desync::DesyncPreprocessor;
pub use queue::MessageQueue;
pub use state::{ClientContext, SessionState};

use crate::config::SessionConfig;
use crate::protocol::{
    now_millis, ActorId, ClientId, Envelope, Message, ProtocolDriver, ProtocolHandler, SessionId,
};
use crate::rules::{Rules, SynchronizationStage};
use crate::transport::{Connection, ConnectionEvent};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("client {0} is not part of this session")]
    UnknownClient(ClientId),
    #[error("client connection closed")]
    ConnectionClosed,
    #[error("server-authoritative sessions do not elect clients")]
    ServerAuthoritative,
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: SessionId,
    config: SessionConfig,
    rules: Arc<Rules>,
    state: Mutex<SessionState>,
    app: ProtocolDriver,
    closed: watch::Sender<bool>,
}

impl Session {
    /// Creates a session fed by `app` and starts pumping its messages. Must be
    /// called inside a tokio runtime.
    pub fn new(
        id: SessionId,
        app: Arc<dyn Connection>,
        rules: Arc<Rules>,
        config: SessionConfig,
    ) -> Self {
        let events = app.take_events();
        let (closed, _) = watch::channel(false);
        let session = Self {
            inner: Arc::new(SessionInner {
                id,
                state: Mutex::new(SessionState::new(id, config.operating_model)),
                config,
                rules,
                app: ProtocolDriver::new(format!("app:{id}"), app),
                closed,
            }),
        };
        match events {
            Some(events) => {
                tokio::spawn(pump_app(session.clone(), events));
            }
            None => {
                error!(
                    target = "beach_mirror::session",
                    session_id = %id,
                    "app connection events already claimed"
                );
                session.shutdown();
            }
        }
        info!(
            target = "beach_mirror::session",
            session_id = %id,
            operating_model = ?session.inner.config.operating_model,
            "session started"
        );
        session
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn rules(&self) -> &Arc<Rules> {
        &self.inner.rules
    }

    /// Attaches a client connection and starts its join. The client becomes
    /// visible in [`Session::clients`] once its handshake completes.
    pub fn connect_client(&self, connection: Arc<dyn Connection>) -> Client {
        let client = Client::new(Uuid::new_v4(), connection, self.inner.rules.clone());
        if self.is_closed() || !client::spawn(self.clone(), client.clone()) {
            client.close();
        }
        client
    }

    pub fn clients(&self) -> Vec<Client> {
        self.inner.state.lock().clients.values().cloned().collect()
    }

    pub fn client(&self, client_id: ClientId) -> Option<Client> {
        self.inner.state.lock().clients.get(&client_id).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.inner.state.lock().client_count()
    }

    pub fn authoritative_client(&self) -> Option<Client> {
        let state = self.inner.state.lock();
        let id = state.authority.authoritative()?;
        state.clients.get(&id).cloned()
    }

    pub fn rigid_body_owner(&self, actor_id: ActorId) -> Option<ClientId> {
        self.inner.state.lock().authority.owner(actor_id)
    }

    pub fn is_orphan(&self, actor_id: ActorId) -> bool {
        self.inner.state.lock().authority.is_orphan(actor_id)
    }

    /// Read access to the caches, for inspection.
    pub fn with_state<R>(&self, inspect: impl FnOnce(&SessionState) -> R) -> R {
        inspect(&self.inner.state.lock())
    }

    /// Hands authority to `client_id`. The previous authority is told it lost
    /// it and orphaned rigid bodies move to the new one.
    pub fn set_authoritative_client(&self, client_id: ClientId) -> Result<(), SessionError> {
        if !self.inner.config.is_peer_authoritative() {
            return Err(SessionError::ServerAuthoritative);
        }
        let mut state = self.inner.state.lock();
        let client = state
            .clients
            .get(&client_id)
            .cloned()
            .ok_or(SessionError::UnknownClient(client_id))?;
        if !state.authority.is_authoritative(client_id) {
            elect(&mut state, &client);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once the app connection is gone and every client was told.
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub fn shutdown(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        self.inner.app.close();
        for client in self.clients() {
            client.close();
        }
        gauge!(
            "beach_mirror_session_clients",
            0.0,
            "session_id" => self.inner.id.to_string()
        );
        info!(
            target = "beach_mirror::session",
            session_id = %self.inner.id,
            "session closed"
        );
    }

    pub(crate) fn add_client(&self, client: &Client) {
        let mut state = self.inner.state.lock();
        state.clients.insert(client.id(), client.clone());
        let count = state.client_count();
        info!(
            target = "beach_mirror::session",
            session_id = %self.inner.id,
            client_id = %client.id(),
            clients = count,
            "client joined"
        );
        self.record_client_count(count);
        if state.is_peer_authoritative() && state.authority.authoritative().is_none() {
            elect(&mut state, client);
        }
    }

    pub(crate) fn remove_client(&self, client_id: ClientId) {
        let mut state = self.inner.state.lock();
        if state.clients.shift_remove(&client_id).is_none() {
            return;
        }
        let was_authority = state.authority.is_authoritative(client_id);
        state.authority.client_departed(client_id);
        state.release_grabs(client_id);
        state.users.retain(|_, owner| *owner != client_id);
        let count = state.client_count();
        info!(
            target = "beach_mirror::session",
            session_id = %self.inner.id,
            client_id = %client_id,
            was_authority,
            orphans = state.authority.orphans().count(),
            clients = count,
            "client left"
        );
        counter!("beach_mirror_clients_left_total", 1);
        self.record_client_count(count);
        if state.is_peer_authoritative() && state.authority.authoritative().is_none() {
            if let Some(successor) = state.clients.values().next().cloned() {
                elect(&mut state, &successor);
            }
        }
    }

    /// Starts `stage` for `client` with a replay snapshot taken under the
    /// session lock. Returns how many messages were replayed.
    pub(crate) fn begin_client_stage(
        &self,
        client: &Client,
        stage: SynchronizationStage,
    ) -> Result<usize, SessionError> {
        let state = self.inner.state.lock();
        if !state.clients.contains_key(&client.id()) {
            return Err(SessionError::UnknownClient(client.id()));
        }
        let replay = state.replay(stage, &self.inner.rules, now_millis());
        Ok(client.begin_stage(stage, replay))
    }

    /// App → clients: update caches, then offer the message to every client.
    pub(crate) fn recv_from_app(&self, mut message: Message) {
        if message.id.is_nil() {
            message.id = Uuid::new_v4();
        }
        let payload_type = message.payload_type();
        let rule = match self.inner.rules.get(payload_type) {
            Ok(rule) => *rule,
            Err(err) => {
                error!(
                    target = "beach_mirror::session",
                    session_id = %self.inner.id,
                    error = %err,
                    "dropping app message"
                );
                return;
            }
        };
        let mut state = self.inner.state.lock();
        let Some(message) = (rule.session.before_receive_from_app)(&mut state, message, now_millis())
        else {
            trace!(
                target = "beach_mirror::session",
                session_id = %self.inner.id,
                payload_type = %payload_type,
                "app message consumed by rule"
            );
            return;
        };
        if rule.expects_reply() {
            state.expect_app_reply(message.id);
        }
        let audience = (rule.client.should_send_to_user)(&message, &state);
        for client in state.clients.values() {
            client.send(
                Envelope::new(message.clone())
                    .with_timeout(rule.reply_timeout())
                    .with_audience(audience),
            );
        }
        counter!(
            "beach_mirror_messages_fanned_out_total",
            state.client_count() as u64,
            "payload_type" => payload_type.as_str()
        );
    }

    /// Client → app: replies are forwarded once, everything else is
    /// validated by its rule, optionally relayed to peers, then sent on.
    pub(crate) fn recv_from_client(&self, client: &Client, message: Message) {
        let payload_type = message.payload_type();
        let rule = match self.inner.rules.get(payload_type) {
            Ok(rule) => *rule,
            Err(err) => {
                error!(
                    target = "beach_mirror::session",
                    session_id = %self.inner.id,
                    client_id = %client.id(),
                    error = %err,
                    "dropping client message"
                );
                return;
            }
        };
        let context = client.context();
        let mut state = self.inner.state.lock();
        if !state.clients.contains_key(&context.id) {
            warn!(
                target = "beach_mirror::session",
                session_id = %self.inner.id,
                client_id = %context.id,
                payload_type = %payload_type,
                "message from client outside the session"
            );
            return;
        }

        if let Some(reply_to) = message.reply_to_id {
            if !state.claim_app_reply(reply_to) {
                trace!(
                    target = "beach_mirror::session",
                    client_id = %context.id,
                    payload_type = %payload_type,
                    reply_to = %reply_to,
                    "dropping reply already answered or not owed to the app"
                );
                return;
            }
            if let Some(reply) = (rule.session.before_receive_from_client)(&mut state, &context, message)
            {
                self.inner.app.send_message(Envelope::new(reply));
            }
            return;
        }

        let Some(message) = (rule.session.before_receive_from_client)(&mut state, &context, message)
        else {
            debug!(
                target = "beach_mirror::session",
                client_id = %context.id,
                payload_type = %payload_type,
                "client message rejected by rule"
            );
            counter!("beach_mirror_client_messages_rejected_total", 1, "payload_type" => payload_type.as_str());
            return;
        };
        if rule.session.relay_to_peers {
            for (peer_id, peer) in state.clients.iter() {
                if *peer_id != context.id {
                    peer.send(state.envelope_for(message.clone(), &self.inner.rules));
                }
            }
        }
        self.inner.app.send_message(Envelope::new(message));
    }

    fn record_client_count(&self, count: usize) {
        gauge!(
            "beach_mirror_session_clients",
            count as f64,
            "session_id" => self.inner.id.to_string()
        );
    }
}

/// Makes `client` the authority, telling the previous one it lost it.
fn elect(state: &mut SessionState, client: &Client) {
    let previous = state.authority.elect(client.id());
    if let Some(previous) = previous
        .filter(|previous| *previous != client.id())
        .and_then(|previous| state.clients.get(&previous))
    {
        previous.set_authoritative(false);
    }
    client.set_authoritative(true);
    counter!("beach_mirror_authority_elections_total", 1);
    info!(
        target = "beach_mirror::session",
        session_id = %state.session_id,
        client_id = %client.id(),
        "client elected authoritative"
    );
}

struct AppHandler {
    session: Session,
}

impl ProtocolHandler for AppHandler {
    fn handle(&self, _driver: &ProtocolDriver, message: Message) {
        self.session.recv_from_app(message);
    }

    /// The app fans requests out to many clients and only the first reply
    /// matters; stray replies from the app side are expected.
    fn missing_promise_for_reply(&self, _driver: &ProtocolDriver, message: Message) {
        trace!(
            target = "beach_mirror::session",
            session_id = %self.session.id(),
            payload_type = %message.payload_type(),
            "ignoring unmatched reply from app"
        );
    }
}

async fn pump_app(
    session: Session,
    mut events: tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    let handler = AppHandler {
        session: session.clone(),
    };
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Recv(message) => session.inner.app.recv_message(message, &handler),
            ConnectionEvent::Close => break,
        }
    }
    session.inner.app.reject_all(crate::protocol::ReplyError::ConnectionClosed);
    session.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatingModel;
    use crate::transport::Pipe;

    fn session(operating_model: OperatingModel) -> (Session, Arc<Pipe>) {
        let (server_end, app_end) = Pipe::pair();
        let session = Session::new(
            Uuid::new_v4(),
            server_end,
            Arc::new(Rules::standard()),
            SessionConfig::default().with_operating_model(operating_model),
        );
        (session, app_end)
    }

    #[test_timeout::tokio_timeout_test]
    async fn elections_need_peer_mode_and_a_known_client() {
        let (server_mode, _app) = session(OperatingModel::ServerAuthoritative);
        assert_eq!(
            server_mode.set_authoritative_client(Uuid::new_v4()),
            Err(SessionError::ServerAuthoritative)
        );

        let (peer_mode, _app) = session(OperatingModel::PeerAuthoritative);
        let unknown = Uuid::new_v4();
        assert_eq!(
            peer_mode.set_authoritative_client(unknown),
            Err(SessionError::UnknownClient(unknown))
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn app_disconnect_closes_session() {
        let (session, app) = session(OperatingModel::PeerAuthoritative);
        assert!(!session.is_closed());
        app.close();
        session.closed().await;
        assert!(session.is_closed());
        assert_eq!(session.client_count(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn app_messages_update_caches_without_clients() {
        let (session, app) = session(OperatingModel::PeerAuthoritative);
        let actor = Uuid::new_v4();
        app.send(Message::new(crate::protocol::Payload::CreateActor(
            crate::protocol::payload::ActorCreation::new(
                crate::protocol::patch::ActorPatch::new(actor)
                    .with_field("rigidBody", serde_json::json!({})),
            ),
        )))
        .unwrap();
        while !session.with_state(|state| state.actors.contains(actor)) {
            tokio::task::yield_now().await;
        }
        assert!(session.is_orphan(actor));
    }
}
