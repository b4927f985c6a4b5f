use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};
use uuid::Uuid;

use super::authority::AuthorityLedger;
use super::client::Client;
use crate::config::OperatingModel;
use crate::protocol::{ActorId, ClientId, Envelope, Message, SessionId, UserId};
use crate::rules::{Rules, SynchronizationStage};
use crate::sync::{ActorArena, AnimationCache, AssetCache};

/// App requests whose first client reply is still owed to the app.
const MAX_AWAITED_APP_REPLIES: usize = 4096;

/// The client a message came from, as seen by rule hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientContext {
    pub id: ClientId,
    pub user_id: Option<UserId>,
}

/// Everything a session owns, guarded by the session lock.
pub struct SessionState {
    pub session_id: SessionId,
    pub operating_model: OperatingModel,
    pub(crate) clients: IndexMap<ClientId, Client>,
    pub actors: ActorArena,
    pub assets: AssetCache,
    pub animations: AnimationCache,
    pub authority: AuthorityLedger,
    /// Which client each known user is connected through.
    pub users: HashMap<UserId, ClientId>,
    awaited_app_replies: IndexSet<Uuid>,
}

impl SessionState {
    pub fn new(session_id: SessionId, operating_model: OperatingModel) -> Self {
        Self {
            session_id,
            operating_model,
            clients: IndexMap::new(),
            actors: ActorArena::new(),
            assets: AssetCache::new(),
            animations: AnimationCache::new(),
            authority: AuthorityLedger::new(),
            users: HashMap::new(),
            awaited_app_replies: IndexSet::new(),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_peer_authoritative(&self) -> bool {
        self.operating_model == OperatingModel::PeerAuthoritative
    }

    /// Starts tracking a rigid body. Server-authoritative sessions never hand
    /// bodies to a default owner, so they wait in the orphan set until
    /// grabbed.
    pub fn register_rigid_body(&mut self, actor_id: ActorId) {
        self.authority.register(actor_id);
    }

    /// Clears every grab held by `client_id`, handing the bodies back.
    pub fn release_grabs(&mut self, client_id: ClientId) -> usize {
        let mut released = Vec::new();
        for actor in self.actors.iter_mut() {
            if actor.grabbed_by == Some(client_id) {
                actor.grabbed_by = None;
                released.push(actor.actor_id);
            }
        }
        for actor_id in &released {
            self.authority.release(*actor_id);
        }
        released.len()
    }

    pub fn expect_app_reply(&mut self, message_id: Uuid) {
        if self.awaited_app_replies.len() >= MAX_AWAITED_APP_REPLIES {
            self.awaited_app_replies.shift_remove_index(0);
        }
        self.awaited_app_replies.insert(message_id);
    }

    /// True exactly once per awaited app request: the first client reply
    /// claims it and later replies are dropped.
    pub fn claim_app_reply(&mut self, reply_to: Uuid) -> bool {
        self.awaited_app_replies.shift_remove(&reply_to)
    }

    /// Wraps a message bound for a client with its rule's reply timeout and
    /// audience restriction.
    pub fn envelope_for(&self, message: Message, rules: &Rules) -> Envelope {
        match rules.get(message.payload_type()) {
            Ok(rule) => {
                let audience = (rule.client.should_send_to_user)(&message, self);
                Envelope::new(message)
                    .with_timeout(rule.reply_timeout())
                    .with_audience(audience)
            }
            Err(_) => Envelope::new(message),
        }
    }

    /// Messages that rebuild the cached state of `stage` on a joining client,
    /// in dependency order, each with a fresh id.
    pub fn replay(&self, stage: SynchronizationStage, rules: &Rules, now_ms: u64) -> Vec<Envelope> {
        let order = self.actors.creation_order();
        let actors = order.iter().filter_map(|id| self.actors.get(*id));
        let messages: Vec<Message> = match stage {
            SynchronizationStage::LoadAssets => self.assets.replay(),
            SynchronizationStage::CreateActors => actors
                .map(|actor| actor.initialization.replayed())
                .collect(),
            SynchronizationStage::ActiveMediaInstances => actors
                .flat_map(|actor| actor.active_media.iter())
                .filter(|instance| !instance.is_expired(now_ms))
                .map(|instance| {
                    let duration = instance
                        .state()
                        .and_then(|state| state.media_asset_id)
                        .and_then(|asset_id| self.assets.duration(asset_id));
                    instance.replay(duration, now_ms)
                })
                .collect(),
            SynchronizationStage::SetBehaviors => actors
                .filter_map(|actor| actor.behavior.as_ref())
                .map(Message::replayed)
                .collect(),
            SynchronizationStage::CreateAnimations => actors
                .flat_map(|actor| actor.created_animations.iter())
                .map(Message::replayed)
                .chain(self.animations.replay())
                .collect(),
            SynchronizationStage::SyncAnimations
            | SynchronizationStage::Always
            | SynchronizationStage::Never => Vec::new(),
        };
        messages
            .into_iter()
            .map(|message| self.envelope_for(message, rules))
            .collect()
    }
}
