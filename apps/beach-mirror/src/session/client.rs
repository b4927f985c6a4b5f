use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::client_sync::ClientSync;
use super::desync::DesyncPreprocessor;
use super::queue::MessageQueue;
use super::state::ClientContext;
use super::Session;
use crate::protocol::handshake::{self, HandshakeError};
use crate::protocol::heartbeat::Heartbeat;
use crate::protocol::payload::{HandshakeReply, SetAuthoritative};
use crate::protocol::{
    ClientId, Envelope, Message, Payload, PayloadType, ProtocolDriver, ProtocolHandler, ReplyError,
    UserId,
};
use crate::rules::{MessageHandling, Rules, StageProgress, SynchronizationStage};
use crate::transport::{Connection, ConnectionEvent};

const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a client is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    /// Handshake done, waiting for `sync-request`. Everything is queued.
    Startup,
    /// Replaying session state; outbound traffic is gated per stage.
    Sync,
    Execution,
    Closed,
}

struct Outbox {
    phase: Phase,
    stages: StageProgress,
    queue: MessageQueue,
}

/// One connected participant.
///
/// All outbound traffic goes through [`Client::send`], which consults the
/// payload's rule against the client's join progress to send, hold, or drop
/// each message. Sends never block, so the session calls them while holding
/// its own lock.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    id: ClientId,
    driver: ProtocolDriver,
    rules: Arc<Rules>,
    outbox: Mutex<Outbox>,
    desync: Arc<DesyncPreprocessor>,
    authoritative: Arc<AtomicBool>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn new(id: ClientId, connection: Arc<dyn Connection>, rules: Arc<Rules>) -> Self {
        let driver = ProtocolDriver::new(format!("client:{id}"), connection);
        let authoritative = Arc::new(AtomicBool::new(false));
        let desync = Arc::new(DesyncPreprocessor::new(id, authoritative.clone()));
        driver.use_middleware(desync.clone());
        Self {
            inner: Arc::new(ClientInner {
                id,
                driver,
                rules,
                outbox: Mutex::new(Outbox {
                    phase: Phase::Handshake,
                    stages: StageProgress::default(),
                    queue: MessageQueue::new(),
                }),
                desync,
                authoritative,
                heartbeat: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    pub fn driver(&self) -> &ProtocolDriver {
        &self.inner.driver
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.inner.desync.user_id()
    }

    pub fn context(&self) -> ClientContext {
        ClientContext {
            id: self.inner.id,
            user_id: self.user_id(),
        }
    }

    pub fn is_authoritative(&self) -> bool {
        self.inner.authoritative.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> Phase {
        self.inner.outbox.lock().phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == Phase::Closed || self.inner.driver.connection().is_closed()
    }

    pub fn queued(&self) -> usize {
        self.inner.outbox.lock().queue.len()
    }

    pub fn stage_progress(&self) -> StageProgress {
        self.inner.outbox.lock().stages.clone()
    }

    /// Marks the client (non-)authoritative and tells it so.
    pub fn set_authoritative(&self, authoritative: bool) {
        self.inner
            .authoritative
            .store(authoritative, Ordering::SeqCst);
        self.send(Envelope::new(Message::new(Payload::SetAuthoritative(
            SetAuthoritative { authoritative },
        ))));
    }

    pub fn send_payload(&self, payload: Payload) {
        self.send(Envelope::new(Message::new(payload)));
    }

    pub fn send(&self, envelope: Envelope) {
        let mut outbox = self.inner.outbox.lock();
        match outbox.phase {
            Phase::Closed => {
                trace!(
                    target = "beach_mirror::client",
                    client_id = %self.inner.id,
                    payload_type = %envelope.payload_type(),
                    "dropping message for closed client"
                );
            }
            Phase::Handshake | Phase::Startup => self.enqueue(&mut outbox, envelope),
            Phase::Sync | Phase::Execution => {
                let handling = match self.inner.rules.get(envelope.payload_type()) {
                    Ok(rule) => rule.handling(&outbox.stages),
                    Err(err) => {
                        error!(
                            target = "beach_mirror::client",
                            client_id = %self.inner.id,
                            error = %err,
                            "dropping message without a rule"
                        );
                        return;
                    }
                };
                self.dispatch(&mut outbox, envelope, handling);
            }
        }
    }

    /// Enters the sync phase: `always` begins and the startup queue is
    /// pruned against it.
    pub fn begin_sync(&self) {
        let mut outbox = self.inner.outbox.lock();
        if outbox.phase == Phase::Closed {
            return;
        }
        outbox.phase = Phase::Sync;
        outbox.stages.begin(SynchronizationStage::Always);
        self.flush(&mut outbox);
    }

    /// Marks `stage` in progress and sends its replay while the caller holds
    /// the session lock, so no live message can slip between the snapshot
    /// and the stage change.
    pub(crate) fn begin_stage(&self, stage: SynchronizationStage, replay: Vec<Envelope>) -> usize {
        let mut outbox = self.inner.outbox.lock();
        if outbox.phase == Phase::Closed {
            return 0;
        }
        outbox.stages.begin(stage);
        let count = replay.len();
        for envelope in replay {
            self.inner.driver.send_message(envelope);
        }
        count
    }

    /// Marks `stage` complete and sends whatever became eligible.
    pub fn complete_stage(&self, stage: SynchronizationStage) -> usize {
        let mut outbox = self.inner.outbox.lock();
        outbox.stages.complete(stage);
        self.flush(&mut outbox)
    }

    /// Re-evaluates the queue and sends everything now allowed. Returns the
    /// number of messages sent.
    pub fn flush_eligible(&self) -> usize {
        let mut outbox = self.inner.outbox.lock();
        self.flush(&mut outbox)
    }

    /// Join finished: every stage counts as complete from now on.
    pub fn enter_execution(&self) -> usize {
        let mut outbox = self.inner.outbox.lock();
        if outbox.phase == Phase::Closed {
            return 0;
        }
        outbox.phase = Phase::Execution;
        outbox.stages = StageProgress::finished();
        self.flush(&mut outbox)
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        let mut outbox = self.inner.outbox.lock();
        if outbox.phase != Phase::Closed {
            outbox.phase = phase;
        }
    }

    pub(crate) fn start_heartbeat(&self, min: Duration, max: Duration) {
        let timeout = self
            .inner
            .rules
            .reply_timeout(PayloadType::Heartbeat)
            .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT);
        let handle = Heartbeat::new(self.inner.driver.clone(), min, max, timeout).spawn();
        if let Some(previous) = self.inner.heartbeat.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Tears down local state after the connection is gone.
    pub(crate) fn shutdown(&self) {
        {
            let mut outbox = self.inner.outbox.lock();
            outbox.phase = Phase::Closed;
            outbox.queue = MessageQueue::new();
        }
        if let Some(heartbeat) = self.inner.heartbeat.lock().take() {
            heartbeat.abort();
        }
        self.inner.driver.reject_all(ReplyError::ConnectionClosed);
    }

    pub fn close(&self) {
        self.inner.driver.close();
    }

    fn enqueue(&self, outbox: &mut Outbox, envelope: Envelope) {
        let payload_type = envelope.payload_type();
        let hook = match self.inner.rules.get(payload_type) {
            Ok(rule) => rule.client.before_queue_message_for_client,
            Err(err) => {
                error!(
                    target = "beach_mirror::client",
                    client_id = %self.inner.id,
                    error = %err,
                    "dropping message without a rule"
                );
                return;
            }
        };
        match hook(&mut outbox.queue, envelope) {
            Some(envelope) => {
                outbox.queue.push(envelope);
                counter!("beach_mirror_messages_queued_total", 1, "payload_type" => payload_type.as_str());
            }
            None => {
                counter!("beach_mirror_messages_coalesced_total", 1, "payload_type" => payload_type.as_str());
            }
        }
    }

    fn dispatch(&self, outbox: &mut Outbox, envelope: Envelope, handling: MessageHandling) {
        match handling {
            MessageHandling::Allow => self.inner.driver.send_message(envelope),
            MessageHandling::Queue => self.enqueue(outbox, envelope),
            MessageHandling::Ignore => {
                trace!(
                    target = "beach_mirror::client",
                    client_id = %self.inner.id,
                    payload_type = %envelope.payload_type(),
                    "ignoring message covered by stage replay"
                );
                counter!("beach_mirror_messages_ignored_total", 1, "payload_type" => envelope.payload_type().as_str());
            }
            MessageHandling::Error => {
                error!(
                    target = "beach_mirror::client",
                    client_id = %self.inner.id,
                    payload_type = %envelope.payload_type(),
                    in_progress = ?outbox.stages.in_progress(),
                    complete = ?outbox.stages.completed(),
                    "message is not allowed in this synchronization state"
                );
                counter!("beach_mirror_stage_errors_total", 1, "payload_type" => envelope.payload_type().as_str());
            }
        }
    }

    fn flush(&self, outbox: &mut Outbox) -> usize {
        let rules = &self.inner.rules;
        let stages = outbox.stages.clone();
        let released = outbox.queue.extract(|envelope| {
            rules
                .get(envelope.payload_type())
                .map_or(true, |rule| rule.handling(&stages) != MessageHandling::Queue)
        });
        let mut sent = 0;
        for envelope in released {
            let handling = rules
                .get(envelope.payload_type())
                .map_or(MessageHandling::Error, |rule| rule.handling(&stages));
            if handling == MessageHandling::Allow {
                sent += 1;
            }
            self.dispatch(outbox, envelope, handling);
        }
        sent
    }
}

/// Routes inbound traffic: connection-control payloads to the lifecycle
/// task, everything else to the session.
struct ClientHandler {
    session: Session,
    client: Client,
    control: mpsc::UnboundedSender<Message>,
}

impl ProtocolHandler for ClientHandler {
    fn handle(&self, _driver: &ProtocolDriver, message: Message) {
        match message.payload_type() {
            PayloadType::Handshake | PayloadType::HandshakeComplete | PayloadType::SyncRequest => {
                if self.control.send(message).is_err() {
                    debug!(
                        target = "beach_mirror::client",
                        client_id = %self.client.id(),
                        "control message after lifecycle ended"
                    );
                }
            }
            payload_type => {
                if self.client.phase() == Phase::Handshake {
                    warn!(
                        target = "beach_mirror::client",
                        client_id = %self.client.id(),
                        payload_type = %payload_type,
                        "dropping message received before handshake"
                    );
                    return;
                }
                self.session.recv_from_client(&self.client, message);
            }
        }
    }

    /// Replies to untracked fan-outs (user prompts) still belong to the app.
    fn missing_promise_for_reply(&self, _driver: &ProtocolDriver, message: Message) {
        self.session.recv_from_client(&self.client, message);
    }
}

/// Starts the tasks that drive a freshly connected client: an event pump and
/// the handshake → sync → execution lifecycle.
pub(crate) fn spawn(session: Session, client: Client) -> bool {
    let Some(mut events) = client.driver().connection().take_events() else {
        error!(
            target = "beach_mirror::client",
            client_id = %client.id(),
            "connection events already claimed"
        );
        return false;
    };
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let handler = ClientHandler {
        session: session.clone(),
        client: client.clone(),
        control: control_tx,
    };

    let pump_session = session.clone();
    let pump_client = client.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Recv(message) => {
                    pump_client.driver().recv_message(message, &handler)
                }
                ConnectionEvent::Close => break,
            }
        }
        drop(handler);
        pump_client.shutdown();
        pump_session.remove_client(pump_client.id());
        info!(
            target = "beach_mirror::client",
            session_id = %pump_session.id(),
            client_id = %pump_client.id(),
            "client disconnected"
        );
    });

    tokio::spawn(run_lifecycle(session, client, control_rx));
    true
}

async fn run_lifecycle(
    session: Session,
    client: Client,
    mut control: mpsc::UnboundedReceiver<Message>,
) {
    let config = session.config().clone();
    let reply = HandshakeReply {
        session_id: session.id(),
        operating_model: config.operating_model,
    };
    let outcome = match handshake::accept(client.driver(), &mut control, reply, config.handshake_timeout).await {
        Ok(outcome) => outcome,
        Err(err) => {
            record_handshake_failure(&session, &client, &err);
            client.close();
            return;
        }
    };
    client.set_phase(Phase::Startup);
    session.add_client(&client);

    let requested = match outcome.sync_request {
        Some(request) => Some(request),
        None => wait_for_sync_request(&client, &mut control).await,
    };
    if requested.is_none() {
        return;
    }

    if let Err(err) = ClientSync::new(session.clone(), client.clone()).run().await {
        debug!(
            target = "beach_mirror::client",
            session_id = %session.id(),
            client_id = %client.id(),
            error = %err,
            "join abandoned"
        );
        return;
    }
    client.start_heartbeat(config.heartbeat_min, config.heartbeat_max);

    while let Some(message) = control.recv().await {
        warn!(
            target = "beach_mirror::client",
            client_id = %client.id(),
            payload_type = %message.payload_type(),
            "ignoring connection control message after join"
        );
    }
}

async fn wait_for_sync_request(
    client: &Client,
    control: &mut mpsc::UnboundedReceiver<Message>,
) -> Option<Message> {
    while let Some(message) = control.recv().await {
        if message.payload_type() == PayloadType::SyncRequest {
            return Some(message);
        }
        warn!(
            target = "beach_mirror::client",
            client_id = %client.id(),
            payload_type = %message.payload_type(),
            "ignoring control message while waiting for sync-request"
        );
    }
    None
}

fn record_handshake_failure(session: &Session, client: &Client, err: &HandshakeError) {
    warn!(
        target = "beach_mirror::client",
        session_id = %session.id(),
        client_id = %client.id(),
        error = %err,
        "handshake failed"
    );
    counter!(
        "beach_mirror_handshake_failures_total",
        1,
        "reason" => err.metric_label()
    );
}
