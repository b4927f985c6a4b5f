use std::collections::{HashMap, HashSet};

use indexmap::{IndexMap, IndexSet};
use serde_json::{Map, Value};
use thiserror::Error;

use super::media::ActiveMediaInstance;
use crate::protocol::patch::{merge_fields, ActorPatch};
use crate::protocol::payload::ActorUpdate;
use crate::protocol::{ActorId, ClientId, Message, Payload, UserId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArenaError {
    #[error("actor {0} is not cached")]
    UnknownActor(ActorId),
    #[error("parenting {child} under {parent} would create a cycle")]
    Cycle { child: ActorId, parent: ActorId },
}

/// Everything needed to recreate one live actor on a client that just joined.
#[derive(Debug, Clone)]
pub struct SyncActor {
    pub actor_id: ActorId,
    pub parent_id: Option<ActorId>,
    /// The create-* message with every later patch folded in. Actors spawned
    /// implicitly (library children) hold an `actor-update` instead.
    pub initialization: Message,
    /// Legacy per-actor animations, replayed and destroyed with the actor.
    pub created_animations: Vec<Message>,
    pub active_media: Vec<ActiveMediaInstance>,
    pub behavior: Option<Message>,
    pub grabbed_by: Option<ClientId>,
    pub exclusive_to_user: Option<UserId>,
}

impl SyncActor {
    /// Builds a cache entry from a creation (or implicit-spawn) message.
    /// Returns `None` for payloads that carry no actor patch.
    pub fn from_message(initialization: Message) -> Option<Self> {
        let patch = initialization.payload.actor_patch()?;
        let actor_id = patch.id;
        let parent_id = patch.parent_change().flatten();
        let exclusive_to_user = patch.exclusive_to_user();
        Some(Self {
            actor_id,
            parent_id,
            initialization,
            created_animations: Vec::new(),
            active_media: Vec::new(),
            behavior: None,
            grabbed_by: None,
            exclusive_to_user,
        })
    }

    pub fn implicit(patch: ActorPatch) -> Self {
        let message = Message::new(Payload::ActorUpdate(ActorUpdate { actor: patch }));
        // An actor-update always carries a patch.
        let actor_id = message.payload.actor_patch().map(|p| p.id).unwrap_or_default();
        let mut actor = Self {
            actor_id,
            parent_id: None,
            initialization: message,
            created_animations: Vec::new(),
            active_media: Vec::new(),
            behavior: None,
            grabbed_by: None,
            exclusive_to_user: None,
        };
        if let Some(patch) = actor.initialization.payload.actor_patch() {
            actor.parent_id = patch.parent_change().flatten();
            actor.exclusive_to_user = patch.exclusive_to_user();
        }
        actor
    }

    pub fn patch(&self) -> Option<&ActorPatch> {
        self.initialization.payload.actor_patch()
    }

    pub fn merge_patch(&mut self, patch: &ActorPatch) {
        if let Some(cached) = self.initialization.payload.actor_patch_mut() {
            cached.merge(patch);
        }
    }

    pub fn merge_fields(&mut self, fields: &Map<String, Value>) {
        if let Some(cached) = self.initialization.payload.actor_patch_mut() {
            merge_fields(&mut cached.fields, fields);
        }
    }

    pub fn has_rigid_body(&self) -> bool {
        self.patch().is_some_and(ActorPatch::has_rigid_body)
    }
}

/// Live actors indexed by id, with a children index kept in step with every
/// parent change. Iteration follows creation order.
#[derive(Debug, Default)]
pub struct ActorArena {
    actors: IndexMap<ActorId, SyncActor>,
    children: HashMap<ActorId, IndexSet<ActorId>>,
}

impl ActorArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    pub fn contains(&self, id: ActorId) -> bool {
        self.actors.contains_key(&id)
    }

    pub fn get(&self, id: ActorId) -> Option<&SyncActor> {
        self.actors.get(&id)
    }

    pub fn get_mut(&mut self, id: ActorId) -> Option<&mut SyncActor> {
        self.actors.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncActor> {
        self.actors.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SyncActor> {
        self.actors.values_mut()
    }

    /// Caches `actor`, replacing any previous entry with the same id. A parent
    /// that would close a cycle is dropped.
    pub fn insert(&mut self, mut actor: SyncActor) -> Result<(), ArenaError> {
        let id = actor.actor_id;
        if let Some(previous) = self.actors.get(&id).and_then(|existing| existing.parent_id) {
            self.unlink(id, previous);
        }
        let requested = actor.parent_id.take();
        self.actors.insert(id, actor);
        match requested {
            Some(parent) => self.set_parent(id, Some(parent)),
            None => Ok(()),
        }
    }

    pub fn set_parent(&mut self, id: ActorId, parent: Option<ActorId>) -> Result<(), ArenaError> {
        let current = self
            .actors
            .get(&id)
            .ok_or(ArenaError::UnknownActor(id))?
            .parent_id;
        if current == parent {
            return Ok(());
        }
        if let Some(parent) = parent {
            if self.is_self_or_ancestor(id, parent) {
                return Err(ArenaError::Cycle { child: id, parent });
            }
        }
        if let Some(previous) = current {
            self.unlink(id, previous);
        }
        if let Some(parent) = parent {
            self.children.entry(parent).or_default().insert(id);
        }
        if let Some(actor) = self.actors.get_mut(&id) {
            actor.parent_id = parent;
        }
        Ok(())
    }

    /// Removes `id` and all of its descendants, returning them parent first.
    pub fn remove_tree(&mut self, id: ActorId) -> Vec<SyncActor> {
        let Some(parent) = self.actors.get(&id).map(|actor| actor.parent_id) else {
            return Vec::new();
        };
        if let Some(parent) = parent {
            self.unlink(id, parent);
        }
        let order = self.subtree_order(id);
        let mut removed = Vec::with_capacity(order.len());
        for actor_id in order {
            self.children.remove(&actor_id);
            if let Some(actor) = self.actors.shift_remove(&actor_id) {
                removed.push(actor);
            }
        }
        removed
    }

    /// Actors whose parent is absent or not cached, in creation order.
    pub fn roots(&self) -> Vec<ActorId> {
        self.actors
            .values()
            .filter(|actor| {
                actor
                    .parent_id
                    .map_or(true, |parent| !self.actors.contains_key(&parent))
            })
            .map(|actor| actor.actor_id)
            .collect()
    }

    /// Every cached actor, each parent before its children.
    pub fn creation_order(&self) -> Vec<ActorId> {
        let mut order = Vec::with_capacity(self.actors.len());
        for root in self.roots() {
            order.extend(self.subtree_order(root));
        }
        order
    }

    /// The user an actor is exclusive to, inherited from the nearest ancestor
    /// that sets one.
    pub fn exclusive_user(&self, id: ActorId) -> Option<UserId> {
        let mut current = Some(id);
        let mut steps = 0;
        while let Some(actor_id) = current {
            let actor = self.actors.get(&actor_id)?;
            if actor.exclusive_to_user.is_some() {
                return actor.exclusive_to_user;
            }
            current = actor.parent_id;
            steps += 1;
            if steps > self.actors.len() {
                break;
            }
        }
        None
    }

    fn subtree_order(&self, root: ActorId) -> Vec<ActorId> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![root];
        while let Some(actor_id) = stack.pop() {
            if !visited.insert(actor_id) || !self.actors.contains_key(&actor_id) {
                continue;
            }
            order.push(actor_id);
            if let Some(children) = self.children.get(&actor_id) {
                stack.extend(children.iter().rev().copied());
            }
        }
        order
    }

    fn is_self_or_ancestor(&self, candidate: ActorId, of: ActorId) -> bool {
        let mut current = Some(of);
        let mut steps = 0;
        while let Some(actor_id) = current {
            if actor_id == candidate {
                return true;
            }
            current = self.actors.get(&actor_id).and_then(|actor| actor.parent_id);
            steps += 1;
            if steps > self.actors.len() {
                return true;
            }
        }
        false
    }

    fn unlink(&mut self, id: ActorId, parent: ActorId) {
        if let Some(siblings) = self.children.get_mut(&parent) {
            siblings.shift_remove(&id);
            if siblings.is_empty() {
                self.children.remove(&parent);
            }
        }
    }
}
