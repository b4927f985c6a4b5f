//! Per-payload-type synchronization policy.
//!
//! Every payload type has exactly one [`Rule`]. A rule says in which join
//! stage the payload's effect is replayed, what a syncing client does with a
//! live copy of it before, during and after that stage, how long a reply may
//! take, how queued copies coalesce, which user may see it, and how the
//! session updates its caches when the payload arrives from the app or from a
//! client. Client and Session code stay generic over payload types and look
//! everything up here.

mod hooks;
mod table;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use crate::protocol::{Envelope, Message, PayloadType, ProtocolError, UserId};
use crate::session::queue::MessageQueue;
use crate::session::state::{ClientContext, SessionState};

pub use hooks::{
    accept_from_app, accept_from_client, enqueue, may_drive_actor, unrestricted,
};

/// Join stages, in replay order. `Always` is in progress for the whole join;
/// `Never` is never entered, so payloads gated on it only reach the `before`
/// handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SynchronizationStage {
    Always,
    LoadAssets,
    CreateActors,
    ActiveMediaInstances,
    SetBehaviors,
    CreateAnimations,
    SyncAnimations,
    Never,
}

impl SynchronizationStage {
    pub const SEQUENCE: [SynchronizationStage; 6] = [
        SynchronizationStage::LoadAssets,
        SynchronizationStage::CreateActors,
        SynchronizationStage::ActiveMediaInstances,
        SynchronizationStage::SetBehaviors,
        SynchronizationStage::CreateAnimations,
        SynchronizationStage::SyncAnimations,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SynchronizationStage::Always => "always",
            SynchronizationStage::LoadAssets => "load-assets",
            SynchronizationStage::CreateActors => "create-actors",
            SynchronizationStage::ActiveMediaInstances => "active-media-instances",
            SynchronizationStage::SetBehaviors => "set-behaviors",
            SynchronizationStage::CreateAnimations => "create-animations",
            SynchronizationStage::SyncAnimations => "sync-animations",
            SynchronizationStage::Never => "never",
        }
    }
}

impl fmt::Display for SynchronizationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageHandling {
    /// Send now.
    Allow,
    /// Hold in the client queue until handling changes.
    Queue,
    /// Drop; the stage replay will cover it.
    Ignore,
    /// Drop and log: the payload should never reach a client in this state.
    Error,
}

/// Which stages a client has entered and finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageProgress {
    in_progress: BTreeSet<SynchronizationStage>,
    complete: BTreeSet<SynchronizationStage>,
}

impl StageProgress {
    /// Progress of a client that finished joining.
    pub fn finished() -> Self {
        let mut complete: BTreeSet<_> = SynchronizationStage::SEQUENCE.into_iter().collect();
        complete.insert(SynchronizationStage::Always);
        Self {
            in_progress: BTreeSet::new(),
            complete,
        }
    }

    pub fn begin(&mut self, stage: SynchronizationStage) {
        self.in_progress.insert(stage);
    }

    pub fn complete(&mut self, stage: SynchronizationStage) {
        self.in_progress.remove(&stage);
        self.complete.insert(stage);
    }

    pub fn is_in_progress(&self, stage: SynchronizationStage) -> bool {
        self.in_progress.contains(&stage)
    }

    pub fn is_complete(&self, stage: SynchronizationStage) -> bool {
        self.complete.contains(&stage)
    }

    pub fn in_progress(&self) -> Vec<&'static str> {
        self.in_progress.iter().map(|stage| stage.as_str()).collect()
    }

    pub fn completed(&self) -> Vec<&'static str> {
        self.complete.iter().map(|stage| stage.as_str()).collect()
    }
}

/// Merges a newly queued envelope into the queue. Returns the envelope when
/// it should be appended, `None` when it was folded into a queued one.
pub type QueueHook = fn(&mut MessageQueue, Envelope) -> Option<Envelope>;
/// The only user allowed to observe a message, if it is restricted.
pub type AudienceHook = fn(&Message, &SessionState) -> Option<UserId>;
/// Updates session caches from an app message; `None` drops it. The last
/// argument is the current wall clock in milliseconds.
pub type AppHook = fn(&mut SessionState, Message, u64) -> Option<Message>;
/// Validates and applies a client message; `None` drops it silently.
pub type ClientHook = fn(&mut SessionState, &ClientContext, Message) -> Option<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynchronizationRule {
    pub stage: SynchronizationStage,
    pub before: MessageHandling,
    pub during: MessageHandling,
    pub after: MessageHandling,
}

#[derive(Clone, Copy)]
pub struct ClientRule {
    /// Non-zero when the payload expects a reply within this many seconds.
    pub timeout_seconds: u64,
    /// The app waits for the first client reply. Implied by a timeout;
    /// user-facing prompts expect a reply with no deadline.
    pub expects_reply: bool,
    pub before_queue_message_for_client: QueueHook,
    pub should_send_to_user: AudienceHook,
}

#[derive(Clone, Copy)]
pub struct SessionRule {
    pub before_receive_from_app: AppHook,
    pub before_receive_from_client: ClientHook,
    /// Client-origin copies are forwarded to the other clients as well as
    /// the app.
    pub relay_to_peers: bool,
}

#[derive(Clone, Copy)]
pub struct Rule {
    pub synchronization: SynchronizationRule,
    pub client: ClientRule,
    pub session: SessionRule,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("synchronization", &self.synchronization)
            .field("timeout_seconds", &self.client.timeout_seconds)
            .field("relay_to_peers", &self.session.relay_to_peers)
            .finish_non_exhaustive()
    }
}

impl Rule {
    pub const fn new(synchronization: SynchronizationRule) -> Self {
        Self {
            synchronization,
            client: ClientRule {
                timeout_seconds: 0,
                expects_reply: false,
                before_queue_message_for_client: enqueue,
                should_send_to_user: unrestricted,
            },
            session: SessionRule {
                before_receive_from_app: accept_from_app,
                before_receive_from_client: accept_from_client,
                relay_to_peers: false,
            },
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.client.timeout_seconds = seconds;
        self.client.expects_reply = seconds > 0;
        self
    }

    pub fn awaiting_reply(mut self) -> Self {
        self.client.expects_reply = true;
        self
    }

    pub fn with_queue_hook(mut self, hook: QueueHook) -> Self {
        self.client.before_queue_message_for_client = hook;
        self
    }

    pub fn with_audience(mut self, hook: AudienceHook) -> Self {
        self.client.should_send_to_user = hook;
        self
    }

    pub fn with_app_hook(mut self, hook: AppHook) -> Self {
        self.session.before_receive_from_app = hook;
        self
    }

    pub fn with_client_hook(mut self, hook: ClientHook) -> Self {
        self.session.before_receive_from_client = hook;
        self
    }

    pub fn relayed_to_peers(mut self) -> Self {
        self.session.relay_to_peers = true;
        self
    }

    pub fn handling(&self, progress: &StageProgress) -> MessageHandling {
        let sync = &self.synchronization;
        if progress.is_complete(sync.stage) {
            sync.after
        } else if progress.is_in_progress(sync.stage) {
            sync.during
        } else {
            sync.before
        }
    }

    pub fn expects_reply(&self) -> bool {
        self.client.expects_reply
    }

    pub fn reply_timeout(&self) -> Option<Duration> {
        (self.client.timeout_seconds > 0).then(|| Duration::from_secs(self.client.timeout_seconds))
    }

    /// `None` when the message is unrestricted, otherwise whether `user_id`
    /// may observe it.
    pub fn should_send_to_user(
        &self,
        message: &Message,
        state: &SessionState,
        user_id: UserId,
    ) -> Option<bool> {
        (self.client.should_send_to_user)(message, state).map(|audience| audience == user_id)
    }
}

/// The full policy table, passed explicitly to sessions.
#[derive(Clone)]
pub struct Rules {
    table: HashMap<PayloadType, Rule>,
}

impl Rules {
    pub fn standard() -> Self {
        Self::from_rules(
            PayloadType::ALL
                .iter()
                .map(|payload_type| (*payload_type, table::standard_rule(*payload_type))),
        )
    }

    /// Builds a table from explicit entries. Payload types without an entry
    /// fail lookups with [`ProtocolError::MissingRule`].
    pub fn from_rules(rules: impl IntoIterator<Item = (PayloadType, Rule)>) -> Self {
        Self {
            table: rules.into_iter().collect(),
        }
    }

    pub fn with_rule(mut self, payload_type: PayloadType, rule: Rule) -> Self {
        self.table.insert(payload_type, rule);
        self
    }

    pub fn get(&self, payload_type: PayloadType) -> Result<&Rule, ProtocolError> {
        self.table
            .get(&payload_type)
            .ok_or_else(|| ProtocolError::MissingRule {
                payload_type: payload_type.as_str().to_string(),
            })
    }

    pub fn reply_timeout(&self, payload_type: PayloadType) -> Option<Duration> {
        self.table
            .get(&payload_type)
            .and_then(Rule::reply_timeout)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for Rules {
    fn default() -> Self {
        Self::standard()
    }
}
