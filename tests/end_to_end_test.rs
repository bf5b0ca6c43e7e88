//! `EventBus` against `MockBroker` over a loopback WebSocket.

use std::net::SocketAddr;
use std::time::Duration;

use busbridge::{
    BrokerEvent, ConnectionOptions, ConnectionState, ErrorContent, EventBus, ListenOptions,
    Message, MockBroker, RequestError,
};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

async fn start_broker() -> (MockBroker, SocketAddr) {
    let broker = MockBroker::default();
    broker.handle_send("echo", |body, responder| {
        responder.respond(body.clone());
    });
    let addr = broker.listen(&ListenOptions::loopback()).await.unwrap();
    (broker, addr)
}

fn connect(addr: SocketAddr) -> EventBus {
    let options = ConnectionOptions {
        ping_interval: 1000,
        delay_min: 10,
        delay_max: 50,
        ..ConnectionOptions::default()
    };
    EventBus::connect_url(&format!("http://{addr}/bridge"), options).unwrap()
}

/// Wait for a `register` of `address`, returning the connection it came on.
async fn registered(
    events: &mut broadcast::Receiver<BrokerEvent>,
    address: &str,
) -> busbridge::ConnectionId {
    timeout(WAIT, async {
        loop {
            if let BrokerEvent::Frame {
                connection,
                message: Message::Register { address: seen, .. },
            } = events.recv().await.unwrap()
            {
                if seen == address {
                    return connection;
                }
            }
        }
    })
    .await
    .expect("no register frame reached the broker")
}

#[tokio::test]
async fn test_request_reply_round_trip() {
    let (broker, addr) = start_broker().await;
    broker.handle_send("fail", |_, responder| {
        responder.fail(ErrorContent::new(404, "NO_HANDLERS", "nobody home"));
    });
    let bus = connect(addr);

    let pending = bus.send("echo", json!({"greeting": "hi"})).unwrap();
    let reply_address = pending.reply_address().to_string();
    let reply = timeout(WAIT, pending).await.unwrap().unwrap();
    assert_eq!(reply.address, reply_address);
    assert_eq!(reply.body, json!({"greeting": "hi"}));

    let failed = timeout(WAIT, bus.send("fail", json!(null)).unwrap()).await.unwrap();
    assert_eq!(
        failed,
        Err(RequestError::Failed(ErrorContent::new(404, "NO_HANDLERS", "nobody home")))
    );

    bus.close().await;
    broker.close().await;
}

#[tokio::test]
async fn test_broker_push_reaches_registered_handler() {
    let (broker, addr) = start_broker().await;
    let mut events = broker.events();
    let bus = connect(addr);
    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    bus.register_handler("news", move |frame| {
        let _ = seen_tx.send(frame.body().cloned());
    })
    .unwrap();
    registered(&mut events, "news").await;

    assert_eq!(broker.send("news", json!("headline")).unwrap(), 1);
    let body = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(body, Some(json!("headline")));

    bus.close().await;
    broker.close().await;
}

#[tokio::test]
async fn test_publish_reaches_broker_handler() {
    let (broker, addr) = start_broker().await;
    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    broker.handle_publish("audit", move |body| {
        let _ = seen_tx.send(body.clone());
    });
    let bus = connect(addr);

    bus.publish("audit", json!({"user": 42})).unwrap();
    let body = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(body, json!({"user": 42}));

    bus.close().await;
    broker.close().await;
}

#[tokio::test]
async fn test_reconnect_replays_registrations_to_new_connection() {
    let (broker, addr) = start_broker().await;
    let mut events = broker.events();
    let bus = connect(addr);
    bus.register_handler("news", |_| {}).unwrap();
    let first = registered(&mut events, "news").await;

    assert!(broker.disconnect(first));
    let second = registered(&mut events, "news").await;
    assert_ne!(first, second);

    timeout(WAIT, bus.wait_for_state(ConnectionState::Open))
        .await
        .unwrap()
        .unwrap();
    let reply = timeout(WAIT, bus.send("echo", json!("again")).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.body, json!("again"));
    assert_eq!(broker.connections(), vec![second]);

    bus.close().await;
    broker.close().await;
}

#[tokio::test]
async fn test_client_close_disconnects_from_broker() {
    let (broker, addr) = start_broker().await;
    let mut events = broker.events();
    let bus = connect(addr);
    bus.register_handler("news", |_| {}).unwrap();
    let id = registered(&mut events, "news").await;

    bus.close().await;
    assert_eq!(bus.state(), ConnectionState::Closed);
    timeout(WAIT, async {
        loop {
            if events.recv().await.unwrap() == BrokerEvent::Disconnected(id) {
                return;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(broker.connection_count(), 0);
    broker.close().await;
}
