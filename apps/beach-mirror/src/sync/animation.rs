use indexmap::IndexMap;
use uuid::Uuid;

use crate::protocol::patch::AnimationPatch;
use crate::protocol::{AnimationId, Message, Payload};

#[derive(Debug, Clone)]
pub struct SyncAnimation {
    pub id: AnimationId,
    pub creator_message_id: Uuid,
    pub creation: Message,
    /// Fold of every `animation-update` since creation.
    pub update: Option<AnimationPatch>,
    pub duration: Option<f64>,
}

impl SyncAnimation {
    /// The creation message with the current state folded in, so a joining
    /// client creates the animation already where it is now.
    pub fn converged(&self) -> Message {
        let mut message = self.creation.replayed();
        if let (Payload::CreateAnimation2(body), Some(update)) = (&mut message.payload, &self.update) {
            body.animation.merge(update);
        }
        message
    }
}

#[derive(Debug, Default)]
pub struct AnimationCache {
    animations: IndexMap<AnimationId, SyncAnimation>,
}

impl AnimationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_creation(&mut self, message: &Message) -> bool {
        let Payload::CreateAnimation2(body) = &message.payload else {
            return false;
        };
        let id = body.animation.id;
        self.animations.insert(
            id,
            SyncAnimation {
                id,
                creator_message_id: message.id,
                creation: message.clone(),
                update: None,
                duration: body.animation.duration(),
            },
        );
        true
    }

    pub fn apply_update(&mut self, patch: &AnimationPatch) -> bool {
        let Some(animation) = self.animations.get_mut(&patch.id) else {
            return false;
        };
        if let Some(duration) = patch.duration() {
            animation.duration = Some(duration);
        }
        match &mut animation.update {
            Some(update) => update.merge(patch),
            None => animation.update = Some(patch.clone()),
        }
        true
    }

    pub fn get(&self, id: AnimationId) -> Option<&SyncAnimation> {
        self.animations.get(&id)
    }

    pub fn len(&self) -> usize {
        self.animations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.animations.is_empty()
    }

    pub fn replay(&self) -> Vec<Message> {
        self.animations.values().map(SyncAnimation::converged).collect()
    }
}
