//! WebSocket gateway
//!
//! Session lifecycle, topic subscriptions over the event bus, inbound rate
//! limiting and keepalive. Delivery to clients is at-most-once: slow
//! consumers lose frames instead of backpressuring the bus.

mod handler;
mod session;
mod topics;

pub use handler::{ws_handler, WsQuery};
pub use session::{InboundFrame, OutboundFrame, Session, TokenBucket};
pub use topics::filter_for_topic;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::events::EventBus;

/// Gateway tuning knobs
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub outbound_capacity: usize,
    pub read_deadline: Duration,
    pub ping_interval: Duration,
    pub write_deadline: Duration,
    pub rate_capacity: u32,
    pub rate_window: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            read_deadline: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
            write_deadline: Duration::from_secs(10),
            rate_capacity: 100,
            rate_window: Duration::from_secs(60),
        }
    }
}

/// JWT claims carried by gateway tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Expiry, unix seconds
    pub exp: usize,
}

/// Connection statistics
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub user_connections: HashMap<String, usize>,
}

/// Owns all live sessions and their shared plumbing
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    bus: EventBus,
    config: GatewayConfig,
    jwt_secret: String,
    total_connections: AtomicU64,
}

impl SessionManager {
    pub fn new(bus: EventBus, config: GatewayConfig, jwt_secret: impl Into<String>) -> Self {
        Self {
            sessions: DashMap::new(),
            bus,
            config,
            jwt_secret: jwt_secret.into(),
            total_connections: AtomicU64::new(0),
        }
    }

    /// Router exposing the gateway endpoint
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(handler::ws_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.clone())
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Validate a bearer token into its claims
    pub fn validate_token(&self, token: &str) -> Result<Claims, String> {
        let validation = Validation::new(Algorithm::HS256);
        let key = DecodingKey::from_secret(self.jwt_secret.as_bytes());

        decode::<Claims>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| e.to_string())
    }

    pub(crate) fn register(&self, session: Arc<Session>) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(session.id.clone(), session);
    }

    pub(crate) fn unregister(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Queue a frame to every session of one user
    pub fn broadcast_to_user(
        &self,
        user_id: &str,
        frame_type: &str,
        topic: &str,
        data: serde_json::Value,
    ) -> usize {
        let mut sent = 0;
        for entry in self.sessions.iter() {
            let session = entry.value();
            if session.user_id == user_id && !session.is_closed() {
                session.send_frame(OutboundFrame::new(frame_type, topic, data.clone()));
                sent += 1;
            }
        }
        sent
    }

    /// Queue a frame to every connected session
    pub fn broadcast_to_all(
        &self,
        frame_type: &str,
        topic: &str,
        data: serde_json::Value,
    ) -> usize {
        let mut sent = 0;
        for entry in self.sessions.iter() {
            let session = entry.value();
            if !session.is_closed() {
                session.send_frame(OutboundFrame::new(frame_type, topic, data.clone()));
                sent += 1;
            }
        }
        sent
    }

    pub fn stats(&self) -> GatewayStats {
        let mut user_connections: HashMap<String, usize> = HashMap::new();
        let mut active = 0;
        for entry in self.sessions.iter() {
            let session = entry.value();
            if !session.is_closed() {
                active += 1;
                *user_connections
                    .entry(session.user_id.clone())
                    .or_default() += 1;
            }
        }

        GatewayStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: active,
            user_connections,
        }
    }

    /// Drop sessions flagged closed; returns how many went away
    pub fn cleanup_inactive(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_closed());
        let removed = before - self.sessions.len();
        if removed > 0 {
            debug!("Cleaned up {} inactive sessions", removed);
        }
        removed
    }

    /// Run periodic session cleanup until the task is aborted
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.cleanup_inactive();
            }
        })
    }

    /// Close every session's bookkeeping during shutdown
    pub fn shutdown(&self) {
        let count = self.sessions.len();
        self.sessions.clear();
        if count > 0 {
            info!("Dropped {} gateway sessions", count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn token(sub: &str, expired: bool) -> String {
        let exp = if expired {
            chrono::Utc::now().timestamp() - 600
        } else {
            chrono::Utc::now().timestamp() + 600
        };
        encode(
            &Header::default(),
            &Claims {
                sub: sub.to_string(),
                exp: exp as usize,
            },
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn manager() -> SessionManager {
        SessionManager::new(EventBus::new(), GatewayConfig::default(), SECRET)
    }

    #[test]
    fn valid_token_yields_claims() {
        let m = manager();
        let claims = m.validate_token(&token("u1", false)).unwrap();
        assert_eq!(claims.sub, "u1");
    }

    #[test]
    fn expired_and_garbage_tokens_fail() {
        let m = manager();
        assert!(m.validate_token(&token("u1", true)).is_err());
        assert!(m.validate_token("not-a-jwt").is_err());
    }

    #[test]
    fn stats_start_empty() {
        let m = manager();
        let stats = m.stats();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert!(stats.user_connections.is_empty());
    }
}
