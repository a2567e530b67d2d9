//! WebSocket session lifecycle
//!
//! Each session runs a reader and a writer. The reader enforces the read
//! deadline and the inbound rate limit and dispatches frames; the writer
//! drains the bounded outbound channel and keeps the connection alive with
//! pings. Event forwarding drops frames when the outbound channel is full:
//! delivery is at-most-once by design.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::{Event, EventBus};

use super::topics::filter_for_topic;
use super::{GatewayConfig, SessionManager};

/// Frame sent by clients
#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub topic: Option<String>,
    #[allow(dead_code)]
    pub data: Option<serde_json::Value>,
    pub message_id: Option<String>,
}

/// Frame sent to clients
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub topic: String,
    pub data: serde_json::Value,
    /// Unix seconds
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl OutboundFrame {
    pub fn new(frame_type: &str, topic: &str, data: serde_json::Value) -> Self {
        Self {
            frame_type: frame_type.to_string(),
            topic: topic.to_string(),
            data,
            timestamp: Utc::now().timestamp(),
            message_id: None,
        }
    }

    pub fn event(event: &Event) -> Self {
        Self::new(
            "event",
            event.event_type.as_str(),
            serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
        )
    }

    pub fn error(message: &str, message_id: Option<String>) -> Self {
        Self {
            frame_type: "error".to_string(),
            topic: String::new(),
            data: serde_json::json!({ "message": message }),
            timestamp: Utc::now().timestamp(),
            message_id,
        }
    }

    pub fn pong(message_id: Option<String>) -> Self {
        Self {
            frame_type: "pong".to_string(),
            topic: String::new(),
            data: serde_json::Value::Null,
            timestamp: Utc::now().timestamp(),
            message_id,
        }
    }

    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Token bucket for inbound frames
///
/// Refills continuously at capacity-per-window; an empty bucket rejects
/// the frame but never the connection.
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last: tokio::time::Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, window: std::time::Duration) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec: capacity as f64 / window.as_secs_f64(),
            last: tokio::time::Instant::now(),
        }
    }

    pub fn allow(&mut self) -> bool {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct ActiveSubscription {
    id: String,
    topic: String,
    forwarder: JoinHandle<()>,
}

/// One connected WebSocket client
pub struct Session {
    pub id: String,
    pub user_id: String,
    outbound: mpsc::Sender<OutboundFrame>,
    subscription: tokio::sync::Mutex<Option<ActiveSubscription>>,
    last_ping: parking_lot::Mutex<DateTime<Utc>>,
    closed: AtomicBool,
    limiter: parking_lot::Mutex<TokenBucket>,
    pub connected_at: DateTime<Utc>,
}

impl Session {
    fn new(user_id: String, outbound: mpsc::Sender<OutboundFrame>, config: &GatewayConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            outbound,
            subscription: tokio::sync::Mutex::new(None),
            last_ping: parking_lot::Mutex::new(Utc::now()),
            closed: AtomicBool::new(false),
            limiter: parking_lot::Mutex::new(TokenBucket::new(
                config.rate_capacity,
                config.rate_window,
            )),
            connected_at: Utc::now(),
        }
    }

    /// Queue a frame; a full channel drops it (at-most-once delivery)
    pub fn send_frame(&self, frame: OutboundFrame) {
        if self.outbound.try_send(frame).is_err() {
            debug!("Outbound channel full for session {}, frame dropped", self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn touch(&self) {
        *self.last_ping.lock() = Utc::now();
    }

    pub fn last_ping(&self) -> DateTime<Utc> {
        *self.last_ping.lock()
    }

    pub async fn current_topic(&self) -> Option<String> {
        self.subscription.lock().await.as_ref().map(|s| s.topic.clone())
    }

    /// Replace the single subscription slot, tearing down the previous one
    async fn replace_subscription(
        &self,
        bus: &EventBus,
        topic: &str,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Result<(), String> {
        let filter = filter_for_topic(topic, &self.user_id)?;

        let mut slot = self.subscription.lock().await;
        if let Some(previous) = slot.take() {
            previous.forwarder.abort();
            bus.unsubscribe(&previous.id);
        }

        let mut subscription = bus.subscribe_with_user(filter, self.user_id.clone());
        let subscription_id = subscription.id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                // try_send: a slow client loses events, never stalls the bus.
                let _ = outbound.try_send(OutboundFrame::event(&event));
            }
        });

        *slot = Some(ActiveSubscription {
            id: subscription_id,
            topic: topic.to_string(),
            forwarder,
        });
        Ok(())
    }

    async fn drop_subscription(&self, bus: &EventBus) {
        let mut slot = self.subscription.lock().await;
        if let Some(previous) = slot.take() {
            previous.forwarder.abort();
            bus.unsubscribe(&previous.id);
        }
    }
}

/// Drive one accepted socket until it closes
pub async fn handle_socket(manager: Arc<SessionManager>, socket: WebSocket, user_id: String) {
    let config = manager.config().clone();
    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);

    let session = Arc::new(Session::new(user_id, outbound_tx.clone(), &config));
    manager.register(session.clone());
    debug!(
        "Session {} connected for user {}",
        session.id, session.user_id
    );

    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(run_writer(ws_tx, outbound_rx, config.clone()));

    run_reader(&manager, &session, ws_rx, outbound_tx, &config).await;

    session.mark_closed();
    session.drop_subscription(manager.bus()).await;
    writer.abort();
    manager.unregister(&session.id);
    debug!("Session {} disconnected", session.id);
}

/// Drain the outbound channel to the socket; ping on an interval
async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
    config: GatewayConfig,
) {
    let mut ping = tokio::time::interval(config.ping_interval);
    ping.tick().await;

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                let send = ws_tx.send(Message::Text(frame.to_json()));
                match tokio::time::timeout(config.write_deadline, send).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("Socket write failed: {}", e);
                        break;
                    }
                    Err(_) => {
                        warn!("Socket write deadline exceeded, closing writer");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                let send = ws_tx.send(Message::Ping(Vec::new()));
                if tokio::time::timeout(config.write_deadline, send)
                    .await
                    .map(|r| r.is_err())
                    .unwrap_or(true)
                {
                    break;
                }
            }
        }
    }
}

/// Process inbound frames in arrival order under the read deadline
async fn run_reader(
    manager: &Arc<SessionManager>,
    session: &Arc<Session>,
    mut ws_rx: SplitStream<WebSocket>,
    outbound: mpsc::Sender<OutboundFrame>,
    config: &GatewayConfig,
) {
    loop {
        let message = match tokio::time::timeout(config.read_deadline, ws_rx.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!("Socket read error on {}: {}", session.id, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Session {} missed its read deadline, closing", session.id);
                break;
            }
        };

        match message {
            Message::Text(text) => {
                // Over-limit frames get an error reply, not a disconnect.
                if !session.limiter.lock().allow() {
                    session.send_frame(OutboundFrame::error("rate limit exceeded", None));
                    continue;
                }

                let frame: InboundFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        session.send_frame(OutboundFrame::error(
                            &format!("malformed frame: {}", e),
                            None,
                        ));
                        continue;
                    }
                };

                dispatch(manager, session, &outbound, frame).await;
            }
            Message::Pong(_) => session.touch(),
            Message::Close(_) => break,
            // Ping frames are answered by the protocol layer.
            _ => {}
        }
    }
}

async fn dispatch(
    manager: &Arc<SessionManager>,
    session: &Arc<Session>,
    outbound: &mpsc::Sender<OutboundFrame>,
    frame: InboundFrame,
) {
    match frame.frame_type.as_str() {
        "subscribe" => {
            let Some(topic) = frame.topic else {
                session.send_frame(OutboundFrame::error(
                    "subscribe requires a topic",
                    frame.message_id,
                ));
                return;
            };
            match session
                .replace_subscription(manager.bus(), &topic, outbound.clone())
                .await
            {
                Ok(()) => session.send_frame(OutboundFrame::new(
                    "subscribed",
                    &topic,
                    serde_json::Value::Null,
                )),
                Err(e) => session.send_frame(OutboundFrame::error(&e, frame.message_id)),
            }
        }
        "unsubscribe" => {
            session.drop_subscription(manager.bus()).await;
            session.send_frame(OutboundFrame::new(
                "unsubscribed",
                "",
                serde_json::Value::Null,
            ));
        }
        "ping" => {
            session.touch();
            session.send_frame(OutboundFrame::pong(frame.message_id));
        }
        "ack" => session.touch(),
        other => {
            session.send_frame(OutboundFrame::error(
                &format!("unknown frame type: {}", other),
                frame.message_id,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn bucket_admits_exactly_capacity_in_a_burst() {
        let mut bucket = TokenBucket::new(100, Duration::from_secs(60));
        let admitted = (0..150).filter(|_| bucket.allow()).count();
        assert_eq!(admitted, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(100, Duration::from_secs(60));
        while bucket.allow() {}

        // 600ms refills one token at 100 per minute.
        tokio::time::advance(Duration::from_millis(700)).await;
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[test]
    fn outbound_frame_shape() {
        let frame = OutboundFrame::error("nope", Some("m1".into()));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["message"], "nope");
        assert_eq!(json["message_id"], "m1");

        let frame = OutboundFrame::new("event", "image.update_available", serde_json::json!({}));
        let json = serde_json::to_value(&frame).unwrap();
        assert!(json.get("message_id").is_none());
        assert!(json["timestamp"].is_i64());
    }

    #[test]
    fn inbound_frame_parses() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"type":"subscribe","topic":"all","message_id":"1"}"#).unwrap();
        assert_eq!(frame.frame_type, "subscribe");
        assert_eq!(frame.topic.as_deref(), Some("all"));

        assert!(serde_json::from_str::<InboundFrame>(r#"{"topic":"all"}"#).is_err());
    }
}
