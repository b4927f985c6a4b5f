use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::patch::{ActorPatch, AnimationPatch, AssetPatch};
use super::{ActorId, UserId};
use crate::config::OperatingModel;

/// Declares the closed payload set once and derives from it the tagged wire
/// enum, the fieldless [`PayloadType`] discriminant, and the tag table.
macro_rules! payloads {
    ($( $tag:literal => $variant:ident($body:ty), )+) => {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "type")]
        pub enum Payload {
            $(
                #[serde(rename = $tag)]
                $variant($body),
            )+
        }

        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum PayloadType {
            $( $variant, )+
        }

        impl PayloadType {
            pub const ALL: &'static [PayloadType] = &[ $( PayloadType::$variant, )+ ];

            pub fn as_str(self) -> &'static str {
                match self {
                    $( PayloadType::$variant => $tag, )+
                }
            }

            pub fn from_tag(tag: &str) -> Option<Self> {
                match tag {
                    $( $tag => Some(PayloadType::$variant), )+
                    _ => None,
                }
            }
        }

        impl Payload {
            pub fn payload_type(&self) -> PayloadType {
                match self {
                    $( Payload::$variant(_) => PayloadType::$variant, )+
                }
            }
        }
    };
}

payloads! {
    "actor-correction" => ActorCorrection(ActorCommand),
    "actor-update" => ActorUpdate(ActorUpdate),
    "animation-update" => AnimationUpdate(AnimationUpdate),
    "app2engine-rpc" => App2EngineRpc(UserTargeted),
    "asset-update" => AssetUpdate(AssetUpdate),
    "assets-loaded" => AssetsLoaded(AssetsLoaded),
    "collision-event-raised" => CollisionEventRaised(ActorCommand),
    "create-actor" => CreateActor(ActorCreation),
    "create-animation" => CreateAnimation(ActorCommand),
    "create-animation-2" => CreateAnimation2(CreateAnimation2),
    "create-asset" => CreateAsset(CreateAsset),
    "create-from-library" => CreateFromLibrary(ActorCreation),
    "create-from-prefab" => CreateFromPrefab(ActorCreation),
    "destroy-actors" => DestroyActors(DestroyActors),
    "dialog-response" => DialogResponse(Passthrough),
    "engine2app-rpc" => Engine2AppRpc(Passthrough),
    "handshake" => Handshake(Passthrough),
    "handshake-complete" => HandshakeComplete(Passthrough),
    "handshake-reply" => HandshakeReply(HandshakeReply),
    "heartbeat" => Heartbeat(Passthrough),
    "heartbeat-reply" => HeartbeatReply(HeartbeatReply),
    "interpolate-actor" => InterpolateActor(ActorCommand),
    "load-assets" => LoadAssets(LoadAssets),
    "multi-operation-result" => MultiOperationResult(OperationOutcome),
    "object-spawned" => ObjectSpawned(ObjectSpawned),
    "operation-result" => OperationResult(OperationOutcome),
    "perform-action" => PerformAction(PerformAction),
    "physicsbridge-transforms-update" => PhysicsBridgeTransformsUpdate(Passthrough),
    "rigidbody-add-force" => RigidBodyAddForce(ActorCommand),
    "rigidbody-add-force-at-position" => RigidBodyAddForceAtPosition(ActorCommand),
    "rigidbody-add-relative-torque" => RigidBodyAddRelativeTorque(ActorCommand),
    "rigidbody-add-torque" => RigidBodyAddTorque(ActorCommand),
    "rigidbody-commands" => RigidBodyCommands(ActorCommand),
    "rigidbody-move-position" => RigidBodyMovePosition(ActorCommand),
    "rigidbody-move-rotation" => RigidBodyMoveRotation(ActorCommand),
    "set-animation-state" => SetAnimationState(Passthrough),
    "set-authoritative" => SetAuthoritative(SetAuthoritative),
    "set-behavior" => SetBehavior(ActorCommand),
    "set-media-state" => SetMediaState(SetMediaState),
    "show-dialog" => ShowDialog(UserTargeted),
    "sync-animations" => SyncAnimations(SyncAnimations),
    "sync-complete" => SyncComplete(Passthrough),
    "sync-request" => SyncRequest(Passthrough),
    "trace" => Trace(Passthrough),
    "traces" => Traces(Passthrough),
    "trigger-event-raised" => TriggerEventRaised(ActorCommand),
    "unload-assets" => UnloadAssets(UnloadAssets),
    "user-joined" => UserJoined(UserJoined),
    "user-left" => UserLeft(UserLeft),
    "user-update" => UserUpdate(Passthrough),
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Payload {
    /// The actor a payload is scoped to, if any.
    pub fn actor_id(&self) -> Option<ActorId> {
        match self {
            Payload::CreateActor(body)
            | Payload::CreateFromLibrary(body)
            | Payload::CreateFromPrefab(body) => Some(body.actor.id),
            Payload::ActorUpdate(body) => Some(body.actor.id),
            Payload::ActorCorrection(body)
            | Payload::CollisionEventRaised(body)
            | Payload::CreateAnimation(body)
            | Payload::InterpolateActor(body)
            | Payload::RigidBodyAddForce(body)
            | Payload::RigidBodyAddForceAtPosition(body)
            | Payload::RigidBodyAddRelativeTorque(body)
            | Payload::RigidBodyAddTorque(body)
            | Payload::RigidBodyCommands(body)
            | Payload::RigidBodyMovePosition(body)
            | Payload::RigidBodyMoveRotation(body)
            | Payload::SetBehavior(body)
            | Payload::TriggerEventRaised(body) => Some(body.actor_id),
            Payload::SetMediaState(body) => Some(body.actor_id),
            Payload::PerformAction(body) => Some(body.target_id),
            _ => None,
        }
    }

    pub fn actor_patch(&self) -> Option<&ActorPatch> {
        match self {
            Payload::CreateActor(body)
            | Payload::CreateFromLibrary(body)
            | Payload::CreateFromPrefab(body) => Some(&body.actor),
            Payload::ActorUpdate(body) => Some(&body.actor),
            _ => None,
        }
    }

    pub fn actor_patch_mut(&mut self) -> Option<&mut ActorPatch> {
        match self {
            Payload::CreateActor(body)
            | Payload::CreateFromLibrary(body)
            | Payload::CreateFromPrefab(body) => Some(&mut body.actor),
            Payload::ActorUpdate(body) => Some(&mut body.actor),
            _ => None,
        }
    }

    /// The user a payload is explicitly addressed to.
    pub fn target_user(&self) -> Option<UserId> {
        match self {
            Payload::ShowDialog(body) | Payload::App2EngineRpc(body) => body.user_id,
            _ => None,
        }
    }
}

/// Body kept verbatim; the core routes it without inspecting it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Passthrough {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Any payload addressed to a single actor (corrections, rigid-body commands,
/// behaviors, legacy animations, physics events).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorCommand {
    pub actor_id: ActorId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ActorCommand {
    pub fn new(actor_id: ActorId) -> Self {
        Self {
            actor_id,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorCreation {
    pub actor: ActorPatch,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ActorCreation {
    pub fn new(actor: ActorPatch) -> Self {
        Self {
            actor,
            fields: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorUpdate {
    pub actor: ActorPatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyActors {
    pub actor_ids: Vec<ActorId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadAssets {
    pub container_id: Uuid,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAsset {
    pub container_id: Uuid,
    pub definition: AssetPatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetUpdate {
    pub asset: AssetPatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnloadAssets {
    pub container_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetsLoaded {
    #[serde(default)]
    pub assets: Vec<AssetPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAnimation2 {
    pub animation: AnimationPatch,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimationUpdate {
    pub animation: AnimationPatch,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAnimations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation_states: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaCommand {
    Start,
    Update,
    Stop,
}

/// Playback options of a media instance. `time` is in seconds, `pitch` in
/// semitones relative to normal speed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub looping: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MediaOptions {
    pub fn merge(&mut self, other: &MediaOptions) {
        if other.time.is_some() {
            self.time = other.time;
        }
        if other.pitch.is_some() {
            self.pitch = other.pitch;
        }
        if other.looping.is_some() {
            self.looping = other.looping;
        }
        if other.paused.is_some() {
            self.paused = other.paused;
        }
        super::patch::merge_fields(&mut self.extra, &other.extra);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetMediaState {
    pub id: Uuid,
    pub actor_id: ActorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_asset_id: Option<Uuid>,
    pub media_command: MediaCommand,
    #[serde(default)]
    pub options: MediaOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionState {
    Started,
    Performing,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformAction {
    pub user_id: UserId,
    pub target_id: ActorId,
    pub behavior_type: String,
    pub action_name: String,
    pub action_state: ActionState,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl PerformAction {
    pub fn is_grab(&self) -> bool {
        self.action_name.eq_ignore_ascii_case("grab")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTargeted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeReply {
    pub session_id: Uuid,
    pub operating_model: OperatingModel,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReply {
    /// The peer's wall clock when it answered, used for offset estimation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetAuthoritative {
    pub authoritative: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: UserId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoined {
    pub user: UserInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeft {
    pub user_id: UserId,
}

/// Result body of operation-result and multi-operation-result. Failures are
/// data, carried in `failure_message`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSpawned {
    #[serde(default)]
    pub actors: Vec<ActorPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::Message;
    use serde_json::json;
    use std::collections::HashSet;

    #[test_timeout::timeout]
    fn tags_are_unique_and_resolve_back() {
        let mut seen = HashSet::new();
        for payload_type in PayloadType::ALL {
            assert!(seen.insert(payload_type.as_str()), "duplicate tag {payload_type}");
            assert_eq!(PayloadType::from_tag(payload_type.as_str()), Some(*payload_type));
        }
        assert_eq!(PayloadType::ALL.len(), 50);
    }

    #[test_timeout::timeout]
    fn perform_action_decodes_from_wire_shape() {
        let user = Uuid::new_v4();
        let target = Uuid::new_v4();
        let message: Message = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "payload": {
                "type": "perform-action",
                "userId": user,
                "targetId": target,
                "behaviorType": "grab",
                "actionName": "grab",
                "actionState": "started",
                "actionData": {"point": [0, 1, 0]}
            }
        }))
        .unwrap();
        match &message.payload {
            Payload::PerformAction(action) => {
                assert!(action.is_grab());
                assert_eq!(action.action_state, ActionState::Started);
                assert!(action.fields.contains_key("actionData"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(message.payload.actor_id(), Some(target));
    }

    #[test_timeout::timeout]
    fn failure_message_survives_relay() {
        let message: Message = serde_json::from_value(json!({
            "replyToId": Uuid::new_v4(),
            "payload": {"type": "object-spawned", "failureMessage": "prefab missing", "result": {"resultCode": "error"}}
        }))
        .unwrap();
        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(encoded["payload"]["failureMessage"], json!("prefab missing"));
        assert_eq!(encoded["payload"]["result"]["resultCode"], json!("error"));
    }
}
