mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use beach_mirror::protocol::payload::Passthrough;
use beach_mirror::protocol::{decode_message, encode_message, Message, Payload, PayloadType};
use beach_mirror::server::{router, AppState};
use beach_mirror::{OperatingModel, Rules};
use common::{config, eventually, WAIT};
use futures_util::{SinkExt, Stream, StreamExt};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use uuid::Uuid;

async fn start_server() -> (SocketAddr, Arc<AppState>) {
    let state = Arc::new(AppState::new(
        config(OperatingModel::PeerAuthoritative),
        Rules::standard(),
        PrometheusBuilder::new().build_recorder().handle(),
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, state)
}

fn frame(message: Message) -> WsMessage {
    WsMessage::Text(encode_message(&message).unwrap())
}

async fn next_message<S>(socket: &mut S) -> Message
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match socket.next().await {
                Some(Ok(WsMessage::Text(text))) => return decode_message(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    })
    .await
    .expect("no message before timeout")
}

fn rejected_status(result: Result<impl Sized, tungstenite::Error>) -> u16 {
    match result {
        Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("connection was accepted"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn client_joins_session_over_websocket() {
    let (addr, state) = start_server().await;
    let session_id = Uuid::new_v4();

    let status = rejected_status(
        tokio_tungstenite::connect_async(format!("ws://{addr}/client?session={session_id}")).await,
    );
    assert_eq!(status, 404);

    let (_app, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/app?session={session_id}"))
        .await
        .unwrap();
    eventually("session to open", || state.registry.contains(session_id)).await;

    let status = rejected_status(
        tokio_tungstenite::connect_async(format!("ws://{addr}/app?session={session_id}")).await,
    );
    assert_eq!(status, 409);

    let (mut client, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/client?session={session_id}"))
            .await
            .unwrap();
    let handshake = Message {
        id: Uuid::new_v4(),
        ..Message::new(Payload::Handshake(Passthrough::default()))
    };
    client.send(frame(handshake.clone())).await.unwrap();
    let reply = next_message(&mut client).await;
    assert_eq!(reply.reply_to_id, Some(handshake.id));
    match reply.payload {
        Payload::HandshakeReply(body) => {
            assert_eq!(body.session_id, session_id);
            assert_eq!(body.operating_model, OperatingModel::PeerAuthoritative);
        }
        other => panic!("unexpected payload {other:?}"),
    }

    client
        .send(frame(Message::new(Payload::HandshakeComplete(Passthrough::default()))))
        .await
        .unwrap();
    client
        .send(frame(Message::new(Payload::SyncRequest(Passthrough::default()))))
        .await
        .unwrap();

    let mut received = Vec::new();
    while received.last() != Some(&PayloadType::SyncComplete) {
        received.push(next_message(&mut client).await.payload_type());
    }
    assert_eq!(
        received,
        vec![PayloadType::SetAuthoritative, PayloadType::SyncComplete]
    );
    let session = state.registry.get(session_id).unwrap();
    eventually("client to be registered", || session.client_count() == 1).await;
}

#[test_timeout::tokio_timeout_test]
async fn closing_the_app_retires_the_session() {
    let (addr, state) = start_server().await;
    let session_id = Uuid::new_v4();
    let (mut app, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/app?session={session_id}"))
        .await
        .unwrap();
    eventually("session to open", || state.registry.contains(session_id)).await;

    app.close(None).await.unwrap();
    eventually("session to close", || !state.registry.contains(session_id)).await;
    assert!(state.registry.is_empty());
}
