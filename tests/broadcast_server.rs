use std::collections::HashSet;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use signal_socket::{
    AuthRejection, BroadcastReport, ClientConfig, ClientIdentity, EventLoopBridge, ServerConfig, Signal,
    SignalAction, SignalReceiver,
};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TIMEOUT: Duration = Duration::from_secs(5);

fn start_server() -> Arc<EventLoopBridge> {
    let bridge = EventLoopBridge::new(ServerConfig::ephemeral());
    bridge.start().expect("server starts");
    Arc::new(bridge)
}

async fn connect(bridge: &EventLoopBridge) -> WsClient {
    let url = format!("ws://{}", bridge.local_addr().expect("server running"));
    let (ws, _) = connect_async(url).await.expect("client connects");
    ws
}

async fn identify(ws: &mut WsClient, client_id: &str) {
    let identity = ClientIdentity::new(client_id, "veighna_trader", "1.0.0");
    ws.send(Message::Text(identity.to_json().unwrap())).await.unwrap();
}

async fn broadcast(bridge: &Arc<EventLoopBridge>, signal: Signal) -> BroadcastReport {
    let bridge = bridge.clone();
    tokio::task::spawn_blocking(move || bridge.broadcast(signal, TIMEOUT))
        .await
        .unwrap()
        .expect("broadcast completes")
}

async fn client_count(bridge: &Arc<EventLoopBridge>) -> usize {
    let bridge = bridge.clone();
    tokio::task::spawn_blocking(move || bridge.client_count(TIMEOUT))
        .await
        .unwrap()
        .expect("count completes")
}

/// Registration happens on the server after the handshake, so poll for it.
async fn wait_for_clients(bridge: &Arc<EventLoopBridge>, expected: usize) {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let count = client_count(bridge).await;
        if count == expected {
            return;
        }
        assert!(Instant::now() < deadline, "expected {} clients, still have {}", expected, count);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn next_message(ws: &mut WsClient) -> Message {
    tokio::time::timeout(TIMEOUT, ws.next())
        .await
        .expect("frame arrives in time")
        .expect("stream still open")
        .expect("valid frame")
}

async fn next_signal(ws: &mut WsClient) -> Signal {
    loop {
        if let Message::Text(text) = next_message(ws).await {
            return Signal::from_json(&text).expect("frame is a signal");
        }
    }
}

fn buy() -> Signal {
    Signal::new(SignalAction::Buy, "000001.SZ").with_price(15.80).with_volume(100)
}

fn sell() -> Signal {
    Signal::new(SignalAction::Sell, "000001.SZ").with_price(15.60).with_volume(50)
}

#[tokio::test]
async fn test_three_clients_then_one_drops() {
    let bridge = start_server();
    let mut a = connect(&bridge).await;
    let mut b = connect(&bridge).await;
    let mut c = connect(&bridge).await;
    wait_for_clients(&bridge, 3).await;

    let report = broadcast(&bridge, buy()).await;
    assert_eq!(report.delivered, 3);
    assert_eq!(report.failed, 0);
    for ws in [&mut a, &mut b, &mut c] {
        let received = next_signal(ws).await;
        assert_eq!(received, buy());
        assert_eq!(
            serde_json::to_value(&received).unwrap(),
            serde_json::json!({"action": "BUY", "symbol": "000001.SZ", "price": 15.8, "volume": 100})
        );
    }

    // No close handshake: just drop the socket.
    drop(c);
    wait_for_clients(&bridge, 2).await;

    let report = broadcast(&bridge, sell()).await;
    assert_eq!(report.delivered, 2);
    assert_eq!(next_signal(&mut a).await, sell());
    assert_eq!(next_signal(&mut b).await, sell());
}

#[tokio::test]
async fn test_concurrent_broadcasts_from_two_threads() {
    let bridge = start_server();
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connect(&bridge).await);
    }
    wait_for_clients(&bridge, 3).await;

    let senders: Vec<_> = [buy(), sell()]
        .into_iter()
        .map(|signal| {
            let bridge = bridge.clone();
            thread::spawn(move || bridge.broadcast(signal, TIMEOUT))
        })
        .collect();
    for sender in senders {
        let report = tokio::task::spawn_blocking(move || sender.join().unwrap())
            .await
            .unwrap()
            .expect("broadcast completes");
        assert_eq!(report.delivered, 3);
    }

    for ws in clients.iter_mut() {
        let first = next_signal(ws).await;
        let second = next_signal(ws).await;
        let actions: HashSet<Option<SignalAction>> = [first, second].into_iter().map(|s| s.action).collect();
        assert_eq!(actions, HashSet::from([Some(SignalAction::Buy), Some(SignalAction::Sell)]));
    }
}

#[tokio::test]
async fn test_registry_size_follows_connections() {
    let bridge = start_server();
    assert_eq!(client_count(&bridge).await, 0);

    let mut first = connect(&bridge).await;
    let second = connect(&bridge).await;
    wait_for_clients(&bridge, 2).await;

    first.close(None).await.unwrap();
    drop(second);
    wait_for_clients(&bridge, 0).await;

    let report = broadcast(&bridge, buy()).await;
    assert!(report.is_noop());
}

#[tokio::test]
async fn test_malformed_client_json_keeps_connection() {
    let bridge = start_server();
    let mut ws = connect(&bridge).await;
    identify(&mut ws, "desk-7").await;
    ws.send(Message::Text("{not json".to_string())).await.unwrap();
    ws.send(Message::Text(r#"{"ack": "BUY"}"#.to_string())).await.unwrap();

    // Give the server time to read both frames before checking.
    tokio::time::sleep(Duration::from_millis(100)).await;
    wait_for_clients(&bridge, 1).await;

    let report = broadcast(&bridge, buy()).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(next_signal(&mut ws).await, buy());
}

#[tokio::test]
async fn test_rejected_client_is_closed_and_removed() {
    let authenticator = |identity: Option<&ClientIdentity>| match identity.and_then(|i| i.client_id.as_deref()) {
        Some("desk-7") => Ok(()),
        _ => Err(AuthRejection::new("unknown desk")),
    };
    let bridge = EventLoopBridge::with_authenticator(ServerConfig::ephemeral(), Arc::new(authenticator));
    bridge.start().unwrap();
    let bridge = Arc::new(bridge);

    let mut allowed = connect(&bridge).await;
    identify(&mut allowed, "desk-7").await;
    let mut rejected = connect(&bridge).await;
    identify(&mut rejected, "desk-9").await;

    match next_message(&mut rejected).await {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Policy);
            assert_eq!(frame.reason, "unknown desk");
        }
        other => panic!("expected close frame, got {:?}", other),
    }
    wait_for_clients(&bridge, 1).await;

    let report = broadcast(&bridge, buy()).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(next_signal(&mut allowed).await, buy());
}

#[tokio::test]
async fn test_stop_closes_clients_with_going_away() {
    let bridge = start_server();
    let mut ws = connect(&bridge).await;
    wait_for_clients(&bridge, 1).await;

    let stopping = bridge.clone();
    tokio::task::spawn_blocking(move || stopping.stop()).await.unwrap();
    assert!(!bridge.is_alive());

    match next_message(&mut ws).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[test]
fn test_receiver_invokes_handler() {
    let bridge = start_server();
    let (seen_tx, seen_rx) = mpsc::channel();

    let config = ClientConfig {
        server_url: format!("ws://{}", bridge.local_addr().unwrap()),
        ..ClientConfig::default()
    };
    let receiver = SignalReceiver::new(config)
        .with_handler(move |signal| {
            let _ = seen_tx.send(signal);
        })
        .spawn()
        .unwrap();

    let deadline = Instant::now() + TIMEOUT;
    while bridge.client_count(TIMEOUT).unwrap() == 0 {
        assert!(Instant::now() < deadline, "receiver never connected");
        thread::sleep(Duration::from_millis(20));
    }

    let signal = buy().with_strategy_id("test_strategy_001").with_extension("note", Value::from("rebalance"));
    let report = bridge.broadcast(signal.clone(), TIMEOUT).unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(seen_rx.recv_timeout(TIMEOUT).unwrap(), signal);

    bridge.stop();
    assert!(receiver.join().unwrap().is_ok());
}
