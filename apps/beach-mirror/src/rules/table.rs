use super::hooks;
use super::MessageHandling::{Allow, Error, Ignore, Queue};
use super::SynchronizationStage::{
    ActiveMediaInstances, Always, CreateActors, CreateAnimations, LoadAssets, Never, SetBehaviors,
    SyncAnimations,
};
use super::{Rule, SynchronizationRule, SynchronizationStage};
use crate::protocol::PayloadType;

const CREATION_TIMEOUT_SECS: u64 = 30;
const HEARTBEAT_TIMEOUT_SECS: u64 = 30;
const PEER_QUERY_TIMEOUT_SECS: u64 = 10;

/// Sent to every client at any time.
const fn open() -> Rule {
    Rule::new(SynchronizationRule {
        stage: Always,
        before: Allow,
        during: Allow,
        after: Allow,
    })
}

/// Only ever sent by clients; delivering one to a client is a bug.
const fn client_only() -> Rule {
    Rule::new(SynchronizationRule {
        stage: Never,
        before: Error,
        during: Error,
        after: Error,
    })
}

/// Replayed from cache in `stage`: live copies are dropped until the stage
/// starts, held while it runs, and delivered once it is done.
const fn replayed(stage: SynchronizationStage) -> Rule {
    Rule::new(SynchronizationRule {
        stage,
        before: Ignore,
        during: Queue,
        after: Allow,
    })
}

/// Not cached; held from the moment the client starts joining until `stage`
/// completes.
const fn deferred(stage: SynchronizationStage) -> Rule {
    Rule::new(SynchronizationRule {
        stage,
        before: Queue,
        during: Queue,
        after: Allow,
    })
}

pub(super) fn standard_rule(payload_type: PayloadType) -> Rule {
    match payload_type {
        // Connection control.
        PayloadType::Handshake
        | PayloadType::HandshakeComplete
        | PayloadType::SyncRequest
        | PayloadType::HeartbeatReply => client_only(),
        PayloadType::HandshakeReply | PayloadType::SyncComplete | PayloadType::SetAuthoritative => {
            open()
        }
        PayloadType::Heartbeat => open().with_timeout(HEARTBEAT_TIMEOUT_SECS),
        PayloadType::Trace => open(),

        // Client reports, relayed toward the app.
        PayloadType::UserJoined => client_only().with_client_hook(hooks::client_user_joined),
        PayloadType::UserLeft => client_only().with_client_hook(hooks::client_user_left),
        PayloadType::UserUpdate
        | PayloadType::DialogResponse
        | PayloadType::Engine2AppRpc
        | PayloadType::MultiOperationResult
        | PayloadType::OperationResult
        | PayloadType::Traces => client_only(),
        PayloadType::ObjectSpawned => client_only().with_client_hook(hooks::client_object_spawned),
        PayloadType::AssetsLoaded => client_only().with_client_hook(hooks::client_assets_loaded),
        PayloadType::CollisionEventRaised | PayloadType::TriggerEventRaised => {
            client_only().with_client_hook(hooks::client_physics_event)
        }
        PayloadType::PhysicsBridgeTransformsUpdate => open().relayed_to_peers(),

        // Assets.
        PayloadType::LoadAssets => replayed(LoadAssets)
            .with_timeout(CREATION_TIMEOUT_SECS)
            .with_app_hook(hooks::app_load_assets),
        PayloadType::CreateAsset => replayed(LoadAssets)
            .with_timeout(CREATION_TIMEOUT_SECS)
            .with_app_hook(hooks::app_create_asset),
        PayloadType::AssetUpdate => replayed(LoadAssets).with_app_hook(hooks::app_asset_update),
        PayloadType::UnloadAssets => replayed(LoadAssets).with_app_hook(hooks::app_unload_assets),

        // Actors.
        PayloadType::CreateActor | PayloadType::CreateFromLibrary | PayloadType::CreateFromPrefab => {
            replayed(CreateActors)
                .with_timeout(CREATION_TIMEOUT_SECS)
                .with_audience(hooks::actor_audience)
                .with_app_hook(hooks::app_create_actor)
        }
        PayloadType::ActorUpdate => replayed(CreateActors)
            .with_queue_hook(hooks::coalesce_actor_update)
            .with_audience(hooks::actor_audience)
            .with_app_hook(hooks::app_actor_update)
            .with_client_hook(hooks::client_actor_update)
            .relayed_to_peers(),
        PayloadType::ActorCorrection => replayed(CreateActors)
            .with_queue_hook(hooks::coalesce_actor_correction)
            .with_audience(hooks::actor_audience)
            .with_app_hook(hooks::app_actor_correction)
            .with_client_hook(hooks::client_actor_correction)
            .relayed_to_peers(),
        PayloadType::DestroyActors => replayed(CreateActors).with_app_hook(hooks::app_destroy_actors),
        PayloadType::InterpolateActor
        | PayloadType::RigidBodyAddForce
        | PayloadType::RigidBodyAddForceAtPosition
        | PayloadType::RigidBodyAddRelativeTorque
        | PayloadType::RigidBodyAddTorque
        | PayloadType::RigidBodyCommands
        | PayloadType::RigidBodyMovePosition
        | PayloadType::RigidBodyMoveRotation => {
            replayed(CreateActors).with_audience(hooks::actor_audience)
        }

        // Media and behaviors.
        PayloadType::SetMediaState => replayed(ActiveMediaInstances)
            .with_audience(hooks::actor_audience)
            .with_app_hook(hooks::app_set_media_state),
        PayloadType::SetBehavior => replayed(SetBehaviors)
            .with_audience(hooks::actor_audience)
            .with_app_hook(hooks::app_set_behavior),

        // Animations.
        PayloadType::CreateAnimation => replayed(CreateAnimations)
            .with_timeout(CREATION_TIMEOUT_SECS)
            .with_audience(hooks::actor_audience)
            .with_app_hook(hooks::app_create_legacy_animation),
        PayloadType::CreateAnimation2 => replayed(CreateAnimations)
            .with_timeout(CREATION_TIMEOUT_SECS)
            .with_app_hook(hooks::app_create_animation),
        PayloadType::AnimationUpdate => replayed(CreateAnimations)
            .with_queue_hook(hooks::coalesce_animation_update)
            .with_app_hook(hooks::app_animation_update),
        PayloadType::SetAnimationState => deferred(SyncAnimations),
        PayloadType::SyncAnimations => {
            deferred(SyncAnimations).with_timeout(PEER_QUERY_TIMEOUT_SECS)
        }

        // Interaction.
        PayloadType::PerformAction => open()
            .with_client_hook(hooks::client_perform_action)
            .relayed_to_peers(),
        PayloadType::ShowDialog => open()
            .with_audience(hooks::targeted_user)
            .awaiting_reply(),
        PayloadType::App2EngineRpc => open().with_audience(hooks::targeted_user),
    }
}
