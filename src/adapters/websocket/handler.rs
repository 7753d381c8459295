//! HTTP surface of the gateway: the upgrade endpoint and a health probe.
//!
//! Route: `GET /ws` authenticates before upgrading. The bearer credential is
//! read from `Authorization: Bearer <token>` or, for browser clients that
//! cannot set headers, the `token` query parameter.

use std::sync::Arc;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::domain::foundation::AuthError;

use super::gateway::{Gateway, GatewayError};

/// Upgrade requests may carry frames up to this multiple of the configured
/// limit before the transport itself rejects them; the connection closes
/// anything over the configured limit with 1009.
const TRANSPORT_SIZE_FACTOR: usize = 4;

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

/// Builds the gateway router.
///
/// ```ignore
/// let app = gateway_router(gateway.clone());
/// axum::serve(listener, app).await?;
/// ```
pub fn gateway_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

pub async fn ws_handler(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let token = bearer_token(&headers).or(query.token.as_deref());
    let user = match gateway.authenticate(token).await {
        Ok(user) => user,
        Err(e) => return GatewayRejection::from(e).into_response(),
    };

    let Some(ws) = ws else {
        return GatewayRejection::NotUpgradable.into_response();
    };

    let limit = gateway.config().connection.max_message_size;
    tracing::debug!(user_id = %user, "Upgrading authenticated connection");
    ws.max_message_size(limit.saturating_mul(TRANSPORT_SIZE_FACTOR))
        .max_frame_size(limit.saturating_mul(TRANSPORT_SIZE_FACTOR))
        .on_upgrade(move |socket| async move { gateway.accept(socket, user).await })
}

/// Process-local liveness and connection count.
pub async fn health(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "connections": gateway.hub().connection_count().await,
    }))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Handshake failures. No connection is created for any of these.
#[derive(Debug)]
pub enum GatewayRejection {
    Unauthorized(AuthError),
    AuthUnavailable(String),
    ShuttingDown,
    NotUpgradable,
    Internal(String),
}

impl From<GatewayError> for GatewayRejection {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::ShuttingDown => GatewayRejection::ShuttingDown,
            GatewayError::Auth(AuthError::ServiceUnavailable(msg)) => {
                GatewayRejection::AuthUnavailable(msg)
            }
            GatewayError::Auth(auth) => GatewayRejection::Unauthorized(auth),
            GatewayError::Encode(msg) => GatewayRejection::Internal(msg),
        }
    }
}

impl IntoResponse for GatewayRejection {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            GatewayRejection::Unauthorized(err) => {
                (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", err.to_string())
            }
            GatewayRejection::AuthUnavailable(msg) => {
                tracing::warn!(error = %msg, "Token verifier unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "AUTH_UNAVAILABLE",
                    "Authentication service unavailable".to_string(),
                )
            }
            GatewayRejection::ShuttingDown => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SHUTTING_DOWN",
                "Gateway is shutting down".to_string(),
            ),
            GatewayRejection::NotUpgradable => (
                StatusCode::UPGRADE_REQUIRED,
                "UPGRADE_REQUIRED",
                "Expected a WebSocket upgrade request".to_string(),
            ),
            GatewayRejection::Internal(msg) => {
                tracing::error!(error = %msg, "Gateway handshake failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Internal error".to_string(),
                )
            }
        };

        (
            status,
            Json(serde_json::json!({
                "error": message,
                "code": code,
            })),
        )
            .into_response()
    }
}
