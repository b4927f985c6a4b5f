mod common;

use beach_mirror::protocol::patch::ActorPatch;
use beach_mirror::protocol::payload::{
    ActionState, ActorCreation, ActorUpdate, Passthrough, PerformAction, UserTargeted,
};
use beach_mirror::protocol::{Message, Payload, PayloadType, UserId};
use beach_mirror::OperatingModel;
use common::{eventually, AppPeer, PeerBehavior, TestPeer};
use serde_json::{json, Map};
use uuid::Uuid;

fn user(id: UserId) -> PeerBehavior {
    PeerBehavior {
        user: Some(id),
        ..PeerBehavior::default()
    }
}

fn grab(user_id: UserId, target_id: Uuid, action_state: ActionState) -> Payload {
    Payload::PerformAction(PerformAction {
        user_id,
        target_id,
        behavior_type: "grab".into(),
        action_name: "grab".into(),
        action_state,
        fields: Map::new(),
    })
}

fn update(actor: Uuid, marker: &str) -> Payload {
    Payload::ActorUpdate(ActorUpdate {
        actor: ActorPatch::new(actor).with_field("name", json!(marker)),
    })
}

#[test_timeout::tokio_timeout_test]
async fn server_authority_follows_grabs() {
    let (session, mut app) = AppPeer::start(OperatingModel::ServerAuthoritative);
    let actor = Uuid::new_v4();
    app.send(Payload::CreateActor(ActorCreation::new(
        ActorPatch::new(actor).with_field("rigidBody", json!({"mass": 2.0})),
    )));
    eventually("rigid body to be tracked", || session.is_orphan(actor)).await;

    let (holder_user, other_user) = (Uuid::new_v4(), Uuid::new_v4());
    let mut holder = TestPeer::connect(&session, user(holder_user));
    let mut other = TestPeer::connect(&session, user(other_user));
    holder.wait_for_sync().await;
    other.wait_for_sync().await;
    eventually("both users to join", || {
        session.with_state(|state| state.users.len() == 2)
    })
    .await;
    assert!(session.authoritative_client().is_none());
    assert!(holder.received_of(PayloadType::SetAuthoritative).is_empty());

    holder.send_payload(update(actor, "denied"));
    holder.send_payload(grab(holder_user, actor, ActionState::Started));
    holder.send_payload(update(actor, "accepted"));

    let relayed = app.next_of(PayloadType::ActorUpdate).await;
    assert_eq!(
        relayed.payload.actor_patch().and_then(|patch| patch.get("name")),
        Some(&json!("accepted"))
    );
    assert_eq!(session.rigid_body_owner(actor), Some(holder.id()));
    other.next_of(PayloadType::PerformAction).await;
    let mirrored = other.next_of(PayloadType::ActorUpdate).await;
    assert_eq!(
        mirrored.payload.actor_patch().and_then(|patch| patch.get("name")),
        Some(&json!("accepted"))
    );

    other.send_payload(grab(other_user, actor, ActionState::Started));
    other.send_payload(Payload::Traces(Passthrough::default()));
    let seen = app.collect_until(PayloadType::Traces, 1).await;
    assert!(seen
        .iter()
        .all(|message| message.payload_type() != PayloadType::PerformAction));
    assert_eq!(session.rigid_body_owner(actor), Some(holder.id()));

    holder.close();
    eventually("grab to be released", || {
        session.client_count() == 1 && session.is_orphan(actor)
    })
    .await;
    assert_eq!(session.rigid_body_owner(actor), None);
}

#[test_timeout::tokio_timeout_test]
async fn exclusive_actors_only_reach_their_user() {
    let (session, app) = AppPeer::start(OperatingModel::PeerAuthoritative);
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let private = Uuid::new_v4();
    let public = Uuid::new_v4();
    app.send(Payload::CreateActor(ActorCreation::new(
        ActorPatch::new(private).with_field("exclusiveToUser", json!(alice)),
    )));
    app.send(Payload::CreateActor(ActorCreation::new(ActorPatch::new(public))));
    eventually("actors to be cached", || {
        session.with_state(|state| state.actors.len() == 2)
    })
    .await;

    let mut alice_peer = TestPeer::connect(&session, user(alice));
    let mut bob_peer = TestPeer::connect(&session, user(bob));
    alice_peer.wait_for_sync().await;
    bob_peer.wait_for_sync().await;

    // Held until the user is known, so it lands after sync-complete.
    let released = alice_peer.next_of(PayloadType::CreateActor).await;
    assert_eq!(released.payload.actor_id(), Some(private));
    let creations: Vec<_> = alice_peer
        .received_of(PayloadType::CreateActor)
        .iter()
        .map(|message| message.payload.actor_id())
        .collect();
    assert_eq!(creations, vec![Some(public), Some(private)]);
    let log = alice_peer.messages();
    let sync_at = log
        .iter()
        .position(|message| message.payload_type() == PayloadType::SyncComplete)
        .unwrap();
    let private_at = log
        .iter()
        .position(|message| message.payload.actor_id() == Some(private))
        .unwrap();
    assert!(private_at > sync_at);

    eventually("bob's user to be known", || {
        session.with_state(|state| state.users.contains_key(&bob))
    })
    .await;
    let bob_creations = bob_peer.received_of(PayloadType::CreateActor);
    assert_eq!(bob_creations.len(), 1);
    assert_eq!(bob_creations[0].payload.actor_id(), Some(public));

    app.send(update(private, "only-alice"));
    app.send(update(public, "everyone"));
    let private_update = alice_peer.next_of(PayloadType::ActorUpdate).await;
    assert_eq!(private_update.payload.actor_id(), Some(private));
    let public_update = bob_peer.next_of(PayloadType::ActorUpdate).await;
    assert_eq!(public_update.payload.actor_id(), Some(public));
    assert_eq!(bob_peer.received_of(PayloadType::ActorUpdate).len(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn dialog_reply_reaches_app_from_targeted_user_only() {
    let (session, mut app) = AppPeer::start(OperatingModel::PeerAuthoritative);
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let mut alice_peer = TestPeer::connect(&session, user(alice));
    let mut bob_peer = TestPeer::connect(&session, user(bob));
    alice_peer.wait_for_sync().await;
    bob_peer.wait_for_sync().await;
    eventually("both users to join", || {
        session.with_state(|state| state.users.len() == 2)
    })
    .await;

    let dialog_id = app.send(Payload::ShowDialog(UserTargeted {
        user_id: Some(alice),
        fields: Map::new(),
    }));
    let dialog = alice_peer.next_of(PayloadType::ShowDialog).await;
    assert_eq!(dialog.id, dialog_id);
    alice_peer.send(Message::reply(
        dialog_id,
        Payload::DialogResponse(Passthrough::default()),
    ));
    let response = app.next_of(PayloadType::DialogResponse).await;
    assert_eq!(response.reply_to_id, Some(dialog_id));

    bob_peer.send_payload(Payload::Traces(Passthrough::default()));
    app.next_of(PayloadType::Traces).await;
    assert!(bob_peer.received_of(PayloadType::ShowDialog).is_empty());
}
