#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use beach_mirror::protocol::payload::{
    AssetsLoaded, HeartbeatReply, ObjectSpawned, OperationOutcome, Passthrough, SyncAnimations,
    UserInfo, UserJoined,
};
use beach_mirror::protocol::{Message, Payload, PayloadType, UserId};
use beach_mirror::transport::Pipe;
use beach_mirror::{Client, Connection, ConnectionEvent, OperatingModel, Rules, Session, SessionConfig};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn config(operating_model: OperatingModel) -> SessionConfig {
    SessionConfig {
        operating_model,
        handshake_timeout: Duration::from_secs(5),
        heartbeat_min: Duration::from_secs(60),
        heartbeat_max: Duration::from_secs(60),
    }
}

/// The app side of a session, driven by hand.
pub struct AppPeer {
    connection: Arc<Pipe>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl AppPeer {
    pub fn start(operating_model: OperatingModel) -> (Session, AppPeer) {
        let (server_end, app_end) = Pipe::pair();
        let events = app_end.take_events().expect("fresh pipe");
        let session = Session::new(
            Uuid::new_v4(),
            server_end,
            Arc::new(Rules::standard()),
            config(operating_model),
        );
        (
            session,
            AppPeer {
                connection: app_end,
                events,
            },
        )
    }

    /// Sends `payload` with a fresh id and returns it.
    pub fn send(&self, payload: Payload) -> Uuid {
        let message = Message {
            id: Uuid::new_v4(),
            ..Message::new(payload)
        };
        let id = message.id;
        self.connection.send(message).expect("app pipe open");
        id
    }

    pub async fn next_of(&mut self, payload_type: PayloadType) -> Message {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Some(ConnectionEvent::Recv(message)) if message.payload_type() == payload_type => {
                        return message
                    }
                    Some(ConnectionEvent::Recv(_)) => continue,
                    other => panic!("app connection ended waiting for {payload_type}: {other:?}"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("app never received {payload_type}"))
    }

    /// Receives until `count` messages of `payload_type` arrived and returns
    /// everything seen on the way, those included.
    pub async fn collect_until(&mut self, payload_type: PayloadType, count: usize) -> Vec<Message> {
        tokio::time::timeout(WAIT, async {
            let mut seen = Vec::new();
            let mut matched = 0;
            while matched < count {
                match self.events.recv().await {
                    Some(ConnectionEvent::Recv(message)) => {
                        if message.payload_type() == payload_type {
                            matched += 1;
                        }
                        seen.push(message);
                    }
                    other => panic!("app connection ended waiting for {payload_type}: {other:?}"),
                }
            }
            seen
        })
        .await
        .unwrap_or_else(|_| panic!("app never received {count} x {payload_type}"))
    }

    /// Everything the app received so far, without waiting.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut received = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let ConnectionEvent::Recv(message) = event {
                received.push(message);
            }
        }
        received
    }

    pub fn close(&self) {
        self.connection.close();
    }
}

#[derive(Clone, Default)]
pub struct PeerBehavior {
    /// Announced with `user-joined` once the join completes.
    pub user: Option<UserId>,
    /// Answer to `sync-animations` queries.
    pub animation_states: Option<Vec<Value>>,
}

/// A scripted client: completes the handshake, answers creation and query
/// requests the way an engine would, and records everything it receives.
pub struct TestPeer {
    pub client: Client,
    connection: Arc<Pipe>,
    inbox: mpsc::UnboundedReceiver<Message>,
    log: Arc<Mutex<Vec<Message>>>,
}

impl TestPeer {
    pub fn connect(session: &Session, behavior: PeerBehavior) -> TestPeer {
        let (server_end, peer_end) = Pipe::pair();
        let mut events = peer_end.take_events().expect("fresh pipe");
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let log = Arc::new(Mutex::new(Vec::new()));

        let responder = Arc::clone(&peer_end);
        let responder_log = Arc::clone(&log);
        tokio::spawn(async move {
            while let Some(ConnectionEvent::Recv(message)) = events.recv().await {
                responder_log.lock().push(message.clone());
                for answer in respond(&message, &behavior) {
                    if responder.send(answer).is_err() {
                        return;
                    }
                }
                let _ = inbox_tx.send(message);
            }
        });

        peer_end
            .send(Message::new(Payload::Handshake(Passthrough::default())))
            .expect("peer pipe open");
        let client = session.connect_client(server_end);
        TestPeer {
            client,
            connection: peer_end,
            inbox,
            log,
        }
    }

    pub fn id(&self) -> Uuid {
        self.client.id()
    }

    pub fn send(&self, message: Message) {
        self.connection.send(message).expect("peer pipe open");
    }

    pub fn send_payload(&self, payload: Payload) {
        self.send(Message::new(payload));
    }

    pub async fn next_of(&mut self, payload_type: PayloadType) -> Message {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.inbox.recv().await {
                    Some(message) if message.payload_type() == payload_type => return message,
                    Some(_) => continue,
                    None => panic!("peer connection ended waiting for {payload_type}"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("peer never received {payload_type}"))
    }

    pub async fn wait_for_sync(&mut self) {
        self.next_of(PayloadType::SyncComplete).await;
    }

    /// Payload types received so far, in arrival order.
    pub fn received(&self) -> Vec<PayloadType> {
        self.log.lock().iter().map(Message::payload_type).collect()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.log.lock().clone()
    }

    pub fn received_of(&self, payload_type: PayloadType) -> Vec<Message> {
        self.log
            .lock()
            .iter()
            .filter(|message| message.payload_type() == payload_type)
            .cloned()
            .collect()
    }

    pub fn close(&self) {
        self.connection.close();
    }
}

fn respond(message: &Message, behavior: &PeerBehavior) -> Vec<Message> {
    let reply = |payload| vec![Message::reply(message.id, payload)];
    match &message.payload {
        Payload::HandshakeReply(_) => vec![
            Message::new(Payload::HandshakeComplete(Passthrough::default())),
            Message::new(Payload::SyncRequest(Passthrough::default())),
        ],
        Payload::SyncComplete(_) => match behavior.user {
            Some(user) => vec![Message::new(Payload::UserJoined(UserJoined {
                user: UserInfo {
                    id: user,
                    fields: Map::new(),
                },
            }))],
            None => Vec::new(),
        },
        Payload::Heartbeat(_) => reply(Payload::HeartbeatReply(HeartbeatReply::default())),
        Payload::CreateActor(body) | Payload::CreateFromLibrary(body) | Payload::CreateFromPrefab(body) => {
            reply(Payload::ObjectSpawned(ObjectSpawned {
                actors: vec![body.actor.clone()],
                ..ObjectSpawned::default()
            }))
        }
        Payload::LoadAssets(_) => reply(Payload::AssetsLoaded(AssetsLoaded::default())),
        Payload::CreateAsset(body) => reply(Payload::AssetsLoaded(AssetsLoaded {
            assets: vec![body.definition.clone()],
            ..AssetsLoaded::default()
        })),
        Payload::CreateAnimation(_) | Payload::CreateAnimation2(_) => {
            reply(Payload::OperationResult(OperationOutcome::default()))
        }
        Payload::SyncAnimations(_) if !message.is_reply() => {
            reply(Payload::SyncAnimations(SyncAnimations {
                animation_states: behavior.animation_states.clone(),
            }))
        }
        _ => Vec::new(),
    }
}

/// Polls `condition` until it holds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}
