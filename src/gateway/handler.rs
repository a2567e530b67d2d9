//! WebSocket upgrade handler

use std::sync::Arc;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use serde::Deserialize;
use tracing::debug;

use super::{session, SessionManager};

/// WebSocket query parameters
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Bearer token as a query parameter, for clients that cannot set
    /// headers on the upgrade request
    pub token: Option<String>,
}

/// Upgrade handler: token first, upgrade second
///
/// An invalid or missing token is rejected with 401 before the upgrade
/// happens.
pub async fn ws_handler(
    State(manager): State<Arc<SessionManager>>,
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
) -> Response {
    let token = query
        .token
        .or_else(|| auth.map(|TypedHeader(auth)| auth.token().to_string()));

    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };

    let claims = match manager.validate_token(&token) {
        Ok(claims) => claims,
        Err(e) => {
            debug!("WebSocket token rejected: {}", e);
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    };

    ws.on_upgrade(move |socket| session::handle_socket(manager, socket, claims.sub))
}
