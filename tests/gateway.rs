//! Gateway integration tests over a real WebSocket connection

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use tokio_tungstenite::tungstenite::Message;

use drydock::events::{Event, EventBus, EventType, Severity};
use drydock::gateway::{Claims, GatewayConfig, SessionManager};

const SECRET: &str = "0123456789abcdef0123456789abcdef";

fn token(user: &str) -> String {
    encode(
        &Header::default(),
        &Claims {
            sub: user.to_string(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        },
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

async fn start_gateway(bus: EventBus) -> (Arc<SessionManager>, String) {
    let manager = Arc::new(SessionManager::new(bus, GatewayConfig::default(), SECRET));
    let app = manager.router();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (manager, format!("ws://{}/ws", addr))
}

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(url: &str, user: &str) -> WsClient {
    let (socket, _) = tokio_tungstenite::connect_async(format!("{}?token={}", url, token(user)))
        .await
        .unwrap();
    socket
}

async fn subscribe(socket: &mut WsClient, topic: &str) {
    socket
        .send(Message::Text(
            serde_json::json!({"type": "subscribe", "topic": topic}).to_string(),
        ))
        .await
        .unwrap();

    let reply = next_json(socket).await.unwrap();
    assert_eq!(reply["type"], "subscribed", "unexpected reply: {}", reply);
}

async fn next_json(socket: &mut WsClient) -> Option<serde_json::Value> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(1), socket.next())
            .await
            .ok()??
            .ok()?;
        match message {
            Message::Text(text) => return serde_json::from_str(&text).ok(),
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return None,
        }
    }
}

#[tokio::test]
async fn missing_or_bad_token_is_rejected_before_upgrade() {
    let (_manager, url) = start_gateway(EventBus::new()).await;

    assert!(tokio_tungstenite::connect_async(url.clone()).await.is_err());
    assert!(
        tokio_tungstenite::connect_async(format!("{}?token=garbage", url))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn subscribed_session_receives_matching_events_only() {
    let bus = EventBus::new();
    let (_manager, url) = start_gateway(bus.clone()).await;

    let mut image_session = connect(&url, "u1").await;
    subscribe(&mut image_session, "image.update").await;

    let mut status_session = connect(&url, "u2").await;
    subscribe(&mut status_session, "container.status").await;

    bus.publish(
        Event::new(
            EventType::ImageUpdateAvailable,
            Severity::Info,
            "image_check",
            "Image update available",
            "web has an update",
        )
        .with_resource("container", "web"),
    );

    let frame = next_json(&mut image_session).await.unwrap();
    assert_eq!(frame["type"], "event");
    assert_eq!(frame["topic"], "image.update_available");
    assert_eq!(frame["data"]["resource_id"], "web");
    assert!(frame["timestamp"].is_i64());

    // The container.status session sees nothing for this event.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), status_session.next())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn resubscribing_replaces_the_previous_subscription() {
    let bus = EventBus::new();
    let (_manager, url) = start_gateway(bus.clone()).await;

    let mut socket = connect(&url, "u1").await;
    subscribe(&mut socket, "image.update").await;
    subscribe(&mut socket, "task.progress").await;

    // A session holds one subscription: the bus sees exactly one.
    assert_eq!(bus.subscriber_count(), 1);

    bus.publish(Event::new(
        EventType::ImageUpdateAvailable,
        Severity::Info,
        "image_check",
        "t",
        "m",
    ));
    bus.publish(Event::new(
        EventType::TaskStarted,
        Severity::Info,
        "scheduler",
        "t",
        "m",
    ));

    // Only the event matching the current topic arrives.
    let frame = next_json(&mut socket).await.unwrap();
    assert_eq!(frame["topic"], "task.started");
}

#[tokio::test]
async fn ping_frames_are_answered_and_unknown_types_error() {
    let (_manager, url) = start_gateway(EventBus::new()).await;
    let mut socket = connect(&url, "u1").await;

    socket
        .send(Message::Text(
            serde_json::json!({"type": "ping", "message_id": "m7"}).to_string(),
        ))
        .await
        .unwrap();
    let pong = next_json(&mut socket).await.unwrap();
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["message_id"], "m7");

    socket
        .send(Message::Text(
            serde_json::json!({"type": "launch"}).to_string(),
        ))
        .await
        .unwrap();
    let error = next_json(&mut socket).await.unwrap();
    assert_eq!(error["type"], "error");
}

#[tokio::test]
async fn rate_limit_errors_without_disconnecting() {
    let (_manager, url) = start_gateway(EventBus::new()).await;
    let mut socket = connect(&url, "u1").await;

    // 150 frames in a burst: 100 are processed, the rest draw errors.
    for _ in 0..150 {
        socket
            .send(Message::Text(
                serde_json::json!({"type": "ack"}).to_string(),
            ))
            .await
            .unwrap();
    }

    let mut errors = 0;
    while let Some(frame) = next_json(&mut socket).await {
        if frame["type"] == "error" {
            errors += 1;
        }
    }
    assert_eq!(errors, 50);

    // Still connected: a ping round-trips.
    socket
        .send(Message::Text(
            serde_json::json!({"type": "ping"}).to_string(),
        ))
        .await
        .unwrap();
    // The ping itself is over-limit too, so expect an error rather than a
    // disconnect.
    let reply = next_json(&mut socket).await.unwrap();
    assert!(reply["type"] == "error" || reply["type"] == "pong");
}

#[tokio::test]
async fn stats_and_cleanup_track_sessions() {
    let bus = EventBus::new();
    let (manager, url) = start_gateway(bus).await;

    let socket = connect(&url, "u1").await;
    let _other = connect(&url, "u1").await;

    // Registration is synchronous with the upgrade; poll briefly anyway.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = manager.stats();
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_connections, 2);
    assert_eq!(stats.user_connections.get("u1"), Some(&2));

    drop(socket);
    tokio::time::sleep(Duration::from_millis(200)).await;
    manager.cleanup_inactive();
    assert_eq!(manager.stats().active_connections, 1);
}
