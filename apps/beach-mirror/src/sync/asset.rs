use indexmap::IndexMap;
use serde_json::Value;
use uuid::Uuid;

use crate::protocol::patch::AssetPatch;
use crate::protocol::payload::{AssetUpdate, AssetsLoaded};
use crate::protocol::{AssetId, Message, Payload};

/// A `load-assets` or `create-asset` message, kept verbatim for replay.
#[derive(Debug, Clone)]
pub struct AssetCreator {
    pub container_id: Uuid,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncAsset {
    pub id: AssetId,
    pub container_id: Uuid,
    pub creator_message_id: Uuid,
    /// Fold of every `asset-update` since the asset loaded.
    pub update: Option<AssetPatch>,
    /// Playback length in seconds, for sounds and video streams.
    pub duration: Option<f64>,
}

/// Media length declared by an asset definition, if it has one.
pub fn asset_duration(patch: &AssetPatch) -> Option<f64> {
    ["sound", "videoStream"]
        .iter()
        .find_map(|kind| patch.get(kind).and_then(|media| media.get("duration")))
        .and_then(Value::as_f64)
        .or_else(|| patch.duration())
}

#[derive(Debug, Default)]
pub struct AssetCache {
    creators: IndexMap<Uuid, AssetCreator>,
    assets: IndexMap<AssetId, SyncAsset>,
}

impl AssetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remembers an asset-creating message. Returns false for anything else.
    pub fn record_creator(&mut self, message: &Message) -> bool {
        let container_id = match &message.payload {
            Payload::LoadAssets(body) => body.container_id,
            Payload::CreateAsset(body) => body.container_id,
            _ => return false,
        };
        self.creators.insert(
            message.id,
            AssetCreator {
                container_id,
                message: message.clone(),
            },
        );
        if let Payload::CreateAsset(body) = &message.payload {
            self.upsert(message.id, container_id, &body.definition);
        }
        true
    }

    pub fn is_creator(&self, message_id: Uuid) -> bool {
        self.creators.contains_key(&message_id)
    }

    /// Records the asset definitions a client reported for a creator. Returns
    /// how many were recorded.
    pub fn record_loaded(&mut self, creator_message_id: Uuid, loaded: &AssetsLoaded) -> usize {
        let Some(container_id) = self
            .creators
            .get(&creator_message_id)
            .map(|creator| creator.container_id)
        else {
            return 0;
        };
        for definition in &loaded.assets {
            self.upsert(creator_message_id, container_id, definition);
        }
        loaded.assets.len()
    }

    pub fn apply_update(&mut self, patch: &AssetPatch) -> bool {
        let Some(asset) = self.assets.get_mut(&patch.id) else {
            return false;
        };
        if let Some(duration) = asset_duration(patch) {
            asset.duration = Some(duration);
        }
        match &mut asset.update {
            Some(update) => update.merge(patch),
            None => asset.update = Some(patch.clone()),
        }
        true
    }

    /// Drops every creator and asset in `container_id`.
    pub fn unload(&mut self, container_id: Uuid) -> usize {
        self.creators
            .retain(|_, creator| creator.container_id != container_id);
        let before = self.assets.len();
        self.assets.retain(|_, asset| asset.container_id != container_id);
        before - self.assets.len()
    }

    pub fn get(&self, id: AssetId) -> Option<&SyncAsset> {
        self.assets.get(&id)
    }

    pub fn duration(&self, id: AssetId) -> Option<f64> {
        self.assets.get(&id).and_then(|asset| asset.duration)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Creators in arrival order, then one merged update per changed asset.
    pub fn replay(&self) -> Vec<Message> {
        let creators = self.creators.values().map(|creator| creator.message.replayed());
        let updates = self.assets.values().filter_map(|asset| {
            asset.update.as_ref().map(|update| {
                Message::new(Payload::AssetUpdate(AssetUpdate {
                    asset: update.clone(),
                }))
            })
        });
        creators.chain(updates).collect()
    }

    fn upsert(&mut self, creator_message_id: Uuid, container_id: Uuid, definition: &AssetPatch) {
        let duration = asset_duration(definition);
        let asset = self.assets.entry(definition.id).or_insert_with(|| SyncAsset {
            id: definition.id,
            container_id,
            creator_message_id,
            update: None,
            duration: None,
        });
        asset.container_id = container_id;
        asset.creator_message_id = creator_message_id;
        if duration.is_some() {
            asset.duration = duration;
        }
    }
}
