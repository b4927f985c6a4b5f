//! Hook functions referenced by the standard rule table.

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::protocol::patch::{merge_fields, ActorPatch};
use crate::protocol::payload::ActionState;
use crate::protocol::{ActorId, Envelope, Message, Payload, UserId};
use crate::session::queue::MessageQueue;
use crate::session::state::{ClientContext, SessionState};
use crate::sync::{apply_media_command, SyncActor};

pub fn enqueue(_queue: &mut MessageQueue, envelope: Envelope) -> Option<Envelope> {
    Some(envelope)
}

pub fn unrestricted(_message: &Message, _state: &SessionState) -> Option<UserId> {
    None
}

pub fn accept_from_app(_state: &mut SessionState, message: Message, _now_ms: u64) -> Option<Message> {
    Some(message)
}

pub fn accept_from_client(
    _state: &mut SessionState,
    _client: &ClientContext,
    message: Message,
) -> Option<Message> {
    Some(message)
}

// Queue coalescing.

pub(super) fn coalesce_actor_update(queue: &mut MessageQueue, envelope: Envelope) -> Option<Envelope> {
    let Payload::ActorUpdate(incoming) = &envelope.message.payload else {
        return Some(envelope);
    };
    let actor_id = incoming.actor.id;
    let queued = queue.find_latest_mut(|queued| {
        matches!(&queued.message.payload, Payload::ActorUpdate(update) if update.actor.id == actor_id)
    });
    match queued {
        Some(queued) => {
            if let Payload::ActorUpdate(update) = &mut queued.message.payload {
                update.actor.merge(&incoming.actor);
            }
            None
        }
        None => Some(envelope),
    }
}

pub(super) fn coalesce_actor_correction(
    queue: &mut MessageQueue,
    envelope: Envelope,
) -> Option<Envelope> {
    let Payload::ActorCorrection(incoming) = &envelope.message.payload else {
        return Some(envelope);
    };
    let actor_id = incoming.actor_id;
    let queued = queue.find_latest_mut(|queued| {
        matches!(&queued.message.payload, Payload::ActorCorrection(correction) if correction.actor_id == actor_id)
    });
    match queued {
        Some(queued) => {
            if let Payload::ActorCorrection(correction) = &mut queued.message.payload {
                merge_fields(&mut correction.fields, &incoming.fields);
            }
            None
        }
        None => Some(envelope),
    }
}

pub(super) fn coalesce_animation_update(
    queue: &mut MessageQueue,
    envelope: Envelope,
) -> Option<Envelope> {
    let Payload::AnimationUpdate(incoming) = &envelope.message.payload else {
        return Some(envelope);
    };
    let animation_id = incoming.animation.id;
    let queued = queue.find_latest_mut(|queued| {
        matches!(&queued.message.payload, Payload::AnimationUpdate(update) if update.animation.id == animation_id)
    });
    match queued {
        Some(queued) => {
            if let Payload::AnimationUpdate(update) = &mut queued.message.payload {
                update.animation.merge(&incoming.animation);
            }
            None
        }
        None => Some(envelope),
    }
}

// Audience.

pub(super) fn actor_audience(message: &Message, state: &SessionState) -> Option<UserId> {
    let actor_id = message.payload.actor_id()?;
    state.actors.exclusive_user(actor_id).or_else(|| {
        let patch = message.payload.actor_patch()?;
        patch.exclusive_to_user().or_else(|| {
            patch
                .parent_change()
                .flatten()
                .and_then(|parent| state.actors.exclusive_user(parent))
        })
    })
}

pub(super) fn targeted_user(message: &Message, _state: &SessionState) -> Option<UserId> {
    message.payload.target_user()
}

// App-side cache maintenance.

pub(super) fn app_load_assets(state: &mut SessionState, message: Message, _now_ms: u64) -> Option<Message> {
    state.assets.record_creator(&message);
    Some(message)
}

pub(super) fn app_create_asset(state: &mut SessionState, message: Message, _now_ms: u64) -> Option<Message> {
    state.assets.record_creator(&message);
    Some(message)
}

pub(super) fn app_asset_update(state: &mut SessionState, message: Message, _now_ms: u64) -> Option<Message> {
    if let Payload::AssetUpdate(update) = &message.payload {
        state.assets.apply_update(&update.asset);
    }
    Some(message)
}

pub(super) fn app_unload_assets(state: &mut SessionState, message: Message, _now_ms: u64) -> Option<Message> {
    if let Payload::UnloadAssets(unload) = &message.payload {
        let dropped = state.assets.unload(unload.container_id);
        debug!(
            target = "beach_mirror::sync",
            session_id = %state.session_id,
            container_id = %unload.container_id,
            dropped,
            "unloaded asset container"
        );
    }
    Some(message)
}

pub(super) fn app_create_actor(state: &mut SessionState, mut message: Message, _now_ms: u64) -> Option<Message> {
    let Some(actor) = SyncActor::from_message(message.clone()) else {
        return Some(message);
    };
    let actor_id = actor.actor_id;
    let has_rigid_body = actor.has_rigid_body();
    if let Err(err) = state.actors.insert(actor) {
        warn!(
            target = "beach_mirror::sync",
            session_id = %state.session_id,
            actor_id = %actor_id,
            error = %err,
            "ignoring parent of created actor"
        );
        strip_parent(&mut message);
        if let Some(cached) = state.actors.get_mut(actor_id) {
            strip_parent(&mut cached.initialization);
        }
    }
    if has_rigid_body {
        state.register_rigid_body(actor_id);
    }
    Some(message)
}

pub(super) fn app_actor_update(state: &mut SessionState, mut message: Message, _now_ms: u64) -> Option<Message> {
    let Payload::ActorUpdate(update) = &mut message.payload else {
        return Some(message);
    };
    apply_actor_patch(state, &mut update.actor);
    Some(message)
}

pub(super) fn app_actor_correction(
    state: &mut SessionState,
    message: Message,
    _now_ms: u64,
) -> Option<Message> {
    if let Payload::ActorCorrection(correction) = &message.payload {
        apply_correction(state, correction.actor_id, &correction.fields);
    }
    Some(message)
}

pub(super) fn app_destroy_actors(state: &mut SessionState, message: Message, _now_ms: u64) -> Option<Message> {
    if let Payload::DestroyActors(destroy) = &message.payload {
        for actor_id in &destroy.actor_ids {
            for removed in state.actors.remove_tree(*actor_id) {
                state.authority.forget(removed.actor_id);
            }
        }
    }
    Some(message)
}

pub(super) fn app_set_media_state(state: &mut SessionState, message: Message, now_ms: u64) -> Option<Message> {
    let Payload::SetMediaState(command) = &message.payload else {
        return Some(message);
    };
    let assets = &state.assets;
    match state.actors.get_mut(command.actor_id) {
        Some(actor) => apply_media_command(
            &mut actor.active_media,
            &message,
            |asset_id| assets.duration(asset_id),
            now_ms,
        ),
        None => debug!(
            target = "beach_mirror::sync",
            session_id = %state.session_id,
            actor_id = %command.actor_id,
            "media command for unknown actor"
        ),
    }
    Some(message)
}

pub(super) fn app_set_behavior(state: &mut SessionState, message: Message, _now_ms: u64) -> Option<Message> {
    if let Payload::SetBehavior(behavior) = &message.payload {
        if let Some(actor) = state.actors.get_mut(behavior.actor_id) {
            actor.behavior = Some(message.clone());
        }
    }
    Some(message)
}

pub(super) fn app_create_legacy_animation(
    state: &mut SessionState,
    message: Message,
    _now_ms: u64,
) -> Option<Message> {
    if let Payload::CreateAnimation(animation) = &message.payload {
        if let Some(actor) = state.actors.get_mut(animation.actor_id) {
            actor.created_animations.push(message.clone());
        }
    }
    Some(message)
}

pub(super) fn app_create_animation(state: &mut SessionState, message: Message, _now_ms: u64) -> Option<Message> {
    state.animations.record_creation(&message);
    Some(message)
}

pub(super) fn app_animation_update(
    state: &mut SessionState,
    message: Message,
    _now_ms: u64,
) -> Option<Message> {
    if let Payload::AnimationUpdate(update) = &message.payload {
        state.animations.apply_update(&update.animation);
    }
    Some(message)
}

// Client-side validation.

/// Whether `client` may report authoritative state for `actor_id`: the
/// session authority, or the client currently grabbing it.
pub fn may_drive_actor(state: &SessionState, client: &ClientContext, actor_id: ActorId) -> bool {
    state.authority.is_authoritative(client.id)
        || state
            .actors
            .get(actor_id)
            .is_some_and(|actor| actor.grabbed_by == Some(client.id))
}

pub(super) fn client_actor_update(
    state: &mut SessionState,
    client: &ClientContext,
    mut message: Message,
) -> Option<Message> {
    let Payload::ActorUpdate(update) = &mut message.payload else {
        return Some(message);
    };
    if !may_drive_actor(state, client, update.actor.id) {
        debug!(
            target = "beach_mirror::session",
            client_id = %client.id,
            actor_id = %update.actor.id,
            "dropping actor-update from client without ownership"
        );
        return None;
    }
    apply_actor_patch(state, &mut update.actor);
    Some(message)
}

pub(super) fn client_actor_correction(
    state: &mut SessionState,
    client: &ClientContext,
    message: Message,
) -> Option<Message> {
    let Payload::ActorCorrection(correction) = &message.payload else {
        return Some(message);
    };
    if !may_drive_actor(state, client, correction.actor_id) {
        debug!(
            target = "beach_mirror::session",
            client_id = %client.id,
            actor_id = %correction.actor_id,
            "dropping actor-correction from client without ownership"
        );
        return None;
    }
    apply_correction(state, correction.actor_id, &correction.fields);
    Some(message)
}

pub(super) fn client_perform_action(
    state: &mut SessionState,
    client: &ClientContext,
    message: Message,
) -> Option<Message> {
    let Payload::PerformAction(action) = &message.payload else {
        return Some(message);
    };
    if !action.is_grab() {
        return Some(message);
    }
    let actor_id = action.target_id;
    let Some(actor) = state.actors.get_mut(actor_id) else {
        return Some(message);
    };
    match (action.action_state, actor.grabbed_by) {
        (_, Some(holder)) if holder != client.id => {
            debug!(
                target = "beach_mirror::session",
                client_id = %client.id,
                actor_id = %actor_id,
                holder = %holder,
                "dropping grab of actor held by another client"
            );
            None
        }
        (ActionState::Started, _) => {
            actor.grabbed_by = Some(client.id);
            state.authority.transfer(actor_id, client.id);
            Some(message)
        }
        (ActionState::Stopped, Some(_)) => {
            actor.grabbed_by = None;
            state.authority.release(actor_id);
            Some(message)
        }
        (ActionState::Stopped, None) | (ActionState::Performing, _) => Some(message),
    }
}

pub(super) fn client_physics_event(
    state: &mut SessionState,
    client: &ClientContext,
    message: Message,
) -> Option<Message> {
    let actor_id = message.payload.actor_id()?;
    let accepted = state.authority.is_authoritative(client.id)
        || state.authority.owner(actor_id) == Some(client.id)
        || state.actors.get(actor_id).is_some_and(|actor| actor.grabbed_by == Some(client.id));
    accepted.then_some(message)
}

pub(super) fn client_user_joined(
    state: &mut SessionState,
    client: &ClientContext,
    message: Message,
) -> Option<Message> {
    if let Payload::UserJoined(joined) = &message.payload {
        state.users.insert(joined.user.id, client.id);
    }
    Some(message)
}

pub(super) fn client_user_left(
    state: &mut SessionState,
    client: &ClientContext,
    message: Message,
) -> Option<Message> {
    if let Payload::UserLeft(left) = &message.payload {
        if state.users.get(&left.user_id) == Some(&client.id) {
            state.users.remove(&left.user_id);
        }
        let released = state.release_grabs(client.id);
        if released > 0 {
            debug!(
                target = "beach_mirror::session",
                client_id = %client.id,
                released,
                "released grabs of departing user"
            );
        }
    }
    Some(message)
}

/// Caches actors a client spawned implicitly (children instantiated from a
/// library or prefab) so they are replayed too.
pub(super) fn client_object_spawned(
    state: &mut SessionState,
    _client: &ClientContext,
    message: Message,
) -> Option<Message> {
    if let Payload::ObjectSpawned(spawned) = &message.payload {
        for patch in &spawned.actors {
            if state.actors.contains(patch.id) {
                continue;
            }
            let actor = SyncActor::implicit(patch.clone());
            let has_rigid_body = actor.has_rigid_body();
            if let Err(err) = state.actors.insert(actor) {
                warn!(
                    target = "beach_mirror::sync",
                    session_id = %state.session_id,
                    actor_id = %patch.id,
                    error = %err,
                    "ignoring parent of spawned actor"
                );
            }
            if has_rigid_body {
                state.register_rigid_body(patch.id);
            }
        }
    }
    Some(message)
}

pub(super) fn client_assets_loaded(
    state: &mut SessionState,
    _client: &ClientContext,
    message: Message,
) -> Option<Message> {
    if let (Payload::AssetsLoaded(loaded), Some(reply_to)) = (&message.payload, message.reply_to_id) {
        if state.assets.is_creator(reply_to) {
            state.assets.record_loaded(reply_to, loaded);
        }
    }
    Some(message)
}

/// Folds an actor patch into the cache: reparenting (a cycle is refused and
/// removed from the patch), exclusivity, and newly added rigid bodies.
fn apply_actor_patch(state: &mut SessionState, patch: &mut ActorPatch) {
    let actor_id = patch.id;
    if !state.actors.contains(actor_id) {
        return;
    }
    if let Some(parent) = patch.parent_change() {
        if let Err(err) = state.actors.set_parent(actor_id, parent) {
            warn!(
                target = "beach_mirror::sync",
                session_id = %state.session_id,
                actor_id = %actor_id,
                error = %err,
                "refusing reparent"
            );
            patch.fields.remove("parentId");
        }
    }
    let gained_rigid_body = patch.has_rigid_body();
    if let Some(actor) = state.actors.get_mut(actor_id) {
        if patch.fields.contains_key("exclusiveToUser") {
            actor.exclusive_to_user = patch.exclusive_to_user();
        }
        actor.merge_patch(patch);
    }
    if gained_rigid_body {
        state.register_rigid_body(actor_id);
    }
}

/// Corrections carry the app-space transform; fold it into the cached
/// actor's `transform.app`.
fn apply_correction(state: &mut SessionState, actor_id: ActorId, fields: &Map<String, Value>) {
    let Some(app_transform) = fields.get("appTransform") else {
        return;
    };
    if let Some(actor) = state.actors.get_mut(actor_id) {
        let correction = json!({ "transform": { "app": app_transform } });
        if let Value::Object(correction) = correction {
            actor.merge_fields(&correction);
        }
    }
}

fn strip_parent(message: &mut Message) {
    if let Some(patch) = message.payload.actor_patch_mut() {
        patch.fields.remove("parentId");
    }
}
