//! Real WebSocket relay on an ephemeral port, driven by raw JSON clients.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use peerlink_core::signaling::RelayConfig;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay(offer_timeout_ms: u64) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = RelayConfig { offer_timeout_ms };
    tokio::spawn(peerlink_relay::serve(listener, config, Duration::from_millis(20)));
    format!("ws://{}", addr)
}

async fn connect(url: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, v: Value) {
    ws.send(Message::Text(v.to_string())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> Value {
    let deadline = Duration::from_secs(3);
    loop {
        let frame = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("timed out waiting for relay")
            .expect("relay closed the socket")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn register(url: &str, peer_id: &str) -> Ws {
    let mut ws = connect(url).await;
    send(
        &mut ws,
        json!({"type": "register", "peerId": peer_id, "deviceType": "desktop"}),
    )
    .await;
    assert_eq!(recv(&mut ws).await, json!({"type": "registered", "peerId": peer_id}));
    ws
}

#[tokio::test]
async fn offline_target_is_reported_and_offers_are_routed() {
    let url = start_relay(200).await;
    let mut a = register(&url, "A").await;
    let mut b = register(&url, "B").await;

    send(&mut a, json!({"type": "offer", "to": "C", "offer": {"sdp": "v=0"}})).await;
    assert_eq!(recv(&mut a).await, json!({"type": "peer-offline", "peerId": "C"}));

    // Garbage leaves the connection usable.
    a.send(Message::Text("not json".into())).await.unwrap();
    send(&mut a, json!({"type": "register"})).await;
    send(&mut a, json!({"type": "ping", "timestamp": 7})).await;
    assert_eq!(recv(&mut a).await, json!({"type": "pong", "timestamp": 7}));

    send(
        &mut a,
        json!({"type": "offer", "from": "spoofed", "to": "B", "offer": {"sdp": "v=0"}}),
    )
    .await;
    let forwarded = recv(&mut b).await;
    assert_eq!(forwarded["type"], "offer");
    assert_eq!(forwarded["from"], "A");
    assert_eq!(forwarded["offer"], json!({"sdp": "v=0"}));

    send(
        &mut b,
        json!({"type": "ice-candidates", "to": "A", "candidates": [{"c": 1}, {"c": 2}]}),
    )
    .await;
    let batch = recv(&mut a).await;
    assert_eq!(batch["type"], "ice-candidates");
    assert_eq!(batch["from"], "B");
    assert_eq!(batch["candidates"].as_array().map(Vec::len), Some(2));

    // B never answers.
    assert_eq!(recv(&mut a).await, json!({"type": "peer-offline", "peerId": "B"}));
}

#[tokio::test]
async fn answered_offer_does_not_time_out_and_presence_follows_sockets() {
    let url = start_relay(150).await;
    let mut a = register(&url, "A").await;
    let mut b = register(&url, "B").await;

    send(&mut a, json!({"type": "offer", "to": "B", "offer": {}})).await;
    assert_eq!(recv(&mut b).await["type"], "offer");
    send(&mut b, json!({"type": "answer", "to": "A", "answer": {"sdp": "ok"}})).await;
    let answer = recv(&mut a).await;
    assert_eq!(answer["type"], "answer");
    assert_eq!(answer["from"], "B");

    tokio::time::sleep(Duration::from_millis(400)).await;
    send(&mut a, json!({"type": "get-peers"})).await;
    // Nothing else was queued for A: the next frame is the peer list, not a timeout notice.
    assert_eq!(
        recv(&mut a).await,
        json!({"type": "peers-list", "peers": ["B"], "count": 1})
    );

    b.close(None).await.unwrap();
    let mut gone = false;
    for _ in 0..50 {
        send(&mut a, json!({"type": "get-peers"})).await;
        if recv(&mut a).await["count"] == 0 {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(gone, "B still registered after closing");

    send(&mut a, json!({"type": "message", "to": "B", "payload": "hi"})).await;
    assert_eq!(recv(&mut a).await, json!({"type": "peer-offline", "peerId": "B"}));
}
