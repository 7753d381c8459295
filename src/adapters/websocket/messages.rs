//! WebSocket message protocol.
//!
//! Every frame the server writes has the shape `{"type": ..., "data": ...}`,
//! whether it is a gateway control message or an event routed from the bus.
//! Client frames are flat objects tagged by `type`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::foundation::{ConnectionId, ConversationId, Timestamp, UserId};
use crate::domain::realtime::ClientEvent;

use super::GatewayError;

/// A serialized text frame, shared across every connection it fans out to.
pub type Frame = Arc<str>;

// ============================================
// Server → Client Messages
// ============================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection registered with the hub.
    Connected(ConnectedMessage),

    /// Heartbeat response.
    Pong(PongMessage),

    /// Conversations the connection now receives events for.
    Subscribed(SubscribedMessage),

    Error(ErrorMessage),
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectedMessage {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PongMessage {
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscribedMessage {
    pub conversation_ids: Vec<ConversationId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorMessage {
    pub code: u16,
    pub message: String,
}

impl ServerMessage {
    pub fn connected(connection_id: ConnectionId, user_id: &UserId) -> Self {
        ServerMessage::Connected(ConnectedMessage {
            connection_id,
            user_id: user_id.clone(),
            timestamp: Timestamp::now().to_rfc3339(),
        })
    }

    pub fn pong() -> Self {
        ServerMessage::Pong(PongMessage {
            timestamp: Timestamp::now().to_rfc3339(),
        })
    }

    pub fn subscribed(conversation_ids: Vec<ConversationId>) -> Self {
        ServerMessage::Subscribed(SubscribedMessage { conversation_ids })
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorMessage {
            code,
            message: message.into(),
        })
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::error(400, message)
    }

    pub fn to_frame(&self) -> Result<Frame, GatewayError> {
        serde_json::to_string(self)
            .map(Frame::from)
            .map_err(|e| GatewayError::Encode(e.to_string()))
    }
}

/// Serializes a routed event once so it can be shared by every recipient.
pub fn event_frame(event: &ClientEvent) -> Result<Frame, GatewayError> {
    serde_json::to_string(event)
        .map(Frame::from)
        .map_err(|e| GatewayError::Encode(e.to_string()))
}

// ============================================
// Client → Server Messages
// ============================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Heartbeat request; also refreshes presence.
    Ping,

    /// Ask to receive events for these conversations.
    Subscribe {
        #[serde(default)]
        conversation_ids: Vec<ConversationId>,
    },

    /// The user is typing in a conversation.
    Typing { conversation_id: ConversationId },
}
