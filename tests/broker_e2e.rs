use futures::{SinkExt, StreamExt};
use peerwatch::protocol::{ClientMessage, ConnectionId, Role, ServerMessage};
use peerwatch::server::{self, BrokerState};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Broker {
    url: String,
    state: Arc<BrokerState>,
    cancel: CancellationToken,
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_broker() -> Broker {
    let state = BrokerState::new(16);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let cancel = CancellationToken::new();
    tokio::spawn(server::serve(listener, server::app(state.clone(), "*"), cancel.clone()));
    Broker { url, state, cancel }
}

async fn open(broker: &Broker, join: ClientMessage) -> Ws {
    let (mut ws, _) = tokio_tungstenite::connect_async(broker.url.as_str()).await.unwrap();
    send(&mut ws, &join).await;
    ws
}

async fn send(ws: &mut Ws, message: &ClientMessage) {
    ws.send(Message::Text(serde_json::to_string(message).unwrap()))
        .await
        .unwrap();
}

async fn recv(ws: &mut Ws) -> ServerMessage {
    let deadline = Duration::from_secs(5);
    loop {
        let frame = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("no message within deadline")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn assert_silent(ws: &mut Ws) {
    let next = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(next.is_err(), "unexpected frame: {next:?}");
}

/// Poll until `check` holds; joins are processed asynchronously.
async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn join(role: Role, peer_id: Option<&str>) -> ClientMessage {
    ClientMessage::Join {
        group_key: "team1".into(),
        role,
        peer_id: peer_id.map(str::to_string),
    }
}

#[tokio::test]
async fn offers_reach_the_viewer_and_answers_reach_only_their_target() {
    let broker = start_broker().await;

    let mut viewer = open(&broker, join(Role::Viewer, None)).await;
    let mut e1 = open(&broker, join(Role::Publisher, Some("e1"))).await;
    let mut e2 = open(&broker, join(Role::Publisher, Some("e2"))).await;

    let state = broker.state.clone();
    wait_until(move || {
        state
            .router
            .registry()
            .group("team1")
            .is_some_and(|g| g.has_viewer && g.publisher_count == 2)
    })
    .await;

    let offer = json!({ "type": "offer", "sdp": "v=0 e1" });
    send(
        &mut e1,
        &ClientMessage::Offer {
            group_key: "team1".into(),
            peer_id: "e1".into(),
            payload: offer.clone(),
        },
    )
    .await;

    let e1_conn: ConnectionId = match recv(&mut viewer).await {
        ServerMessage::Offer { group_key, sender, peer_id, payload } => {
            assert_eq!(group_key, "team1");
            assert_eq!(peer_id, "e1");
            assert_eq!(payload, offer);
            sender
        }
        other => panic!("expected offer, got {other:?}"),
    };

    let answer = json!({ "type": "answer", "sdp": "v=0 viewer" });
    send(
        &mut viewer,
        &ClientMessage::Answer {
            group_key: "team1".into(),
            target: e1_conn,
            payload: answer.clone(),
        },
    )
    .await;

    match recv(&mut e1).await {
        ServerMessage::Answer { payload, .. } => assert_eq!(payload, answer),
        other => panic!("expected answer, got {other:?}"),
    }
    assert_silent(&mut e2).await;

    // A publisher candidate without a target goes to the viewer.
    let candidate = json!({
        "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host",
        "sdpMid": "0",
        "sdpMLineIndex": 0
    });
    send(
        &mut e1,
        &ClientMessage::IceCandidate {
            group_key: "team1".into(),
            target: None,
            peer_id: Some("e1".into()),
            payload: candidate.clone(),
        },
    )
    .await;

    match recv(&mut viewer).await {
        ServerMessage::IceCandidate { peer_id, payload, .. } => {
            assert_eq!(peer_id.as_deref(), Some("e1"));
            assert_eq!(payload, candidate);
        }
        other => panic!("expected candidate, got {other:?}"),
    }
}

#[tokio::test]
async fn closing_a_publisher_socket_notifies_the_viewer() {
    let broker = start_broker().await;

    let mut viewer = open(&broker, join(Role::Viewer, None)).await;
    let mut e1 = open(&broker, join(Role::Publisher, Some("e1"))).await;

    let state = broker.state.clone();
    wait_until(move || {
        state
            .router
            .registry()
            .group("team1")
            .is_some_and(|g| g.has_viewer && g.publisher_count == 1)
    })
    .await;

    e1.close(None).await.unwrap();

    match recv(&mut viewer).await {
        ServerMessage::Disconnect { group_key, peer_id } => {
            assert_eq!(group_key, "team1");
            assert_eq!(peer_id, "e1");
        }
        other => panic!("expected disconnect, got {other:?}"),
    }

    let state = broker.state.clone();
    wait_until(move || {
        state.router.registry().group("team1").is_some_and(|g| g.publisher_count == 0)
    })
    .await;
}

#[tokio::test]
async fn offer_without_a_viewer_is_dropped() {
    let broker = start_broker().await;
    let mut e1 = open(&broker, join(Role::Publisher, Some("e1"))).await;

    let state = broker.state.clone();
    wait_until(move || state.router.registry().group("team1").is_some()).await;

    send(
        &mut e1,
        &ClientMessage::Offer {
            group_key: "team1".into(),
            peer_id: "e1".into(),
            payload: json!({ "type": "offer", "sdp": "v=0" }),
        },
    )
    .await;

    let state = broker.state.clone();
    wait_until(move || state.router.dropped() == 1).await;
    assert_silent(&mut e1).await;
    assert_eq!(broker.state.router.delivered(), 0);
    let group = broker.state.router.registry().group("team1").unwrap();
    assert!(!group.has_viewer);
    assert_eq!(group.publisher_count, 1);
}
