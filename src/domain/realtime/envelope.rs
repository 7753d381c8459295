//! Routing envelopes exchanged over the shared pub/sub bus.
//!
//! The target scope travels in the channel name (`ws:user:{id}`,
//! `ws:conv:{id}`, `ws:broadcast`); the payload is the client-facing
//! event `{"type": ..., "data": ...}`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::foundation::{ConversationId, DomainError, ErrorCode, UserId, ValidationError};

/// Pattern the gateway subscribes to.
pub const CHANNEL_PATTERN: &str = "ws:*";

const PREFIX: &str = "ws";
const BROADCAST: &str = "broadcast";

/// Who a routed event is for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    User(UserId),
    Conversation(ConversationId),
    Broadcast,
}

impl Scope {
    pub fn channel(&self) -> String {
        match self {
            Scope::User(id) => format!("{}:user:{}", PREFIX, id),
            Scope::Conversation(id) => format!("{}:conv:{}", PREFIX, id),
            Scope::Broadcast => format!("{}:{}", PREFIX, BROADCAST),
        }
    }

    pub fn parse_channel(channel: &str) -> Result<Scope, ValidationError> {
        let mut parts = channel.splitn(3, ':');
        let prefix = parts.next().unwrap_or_default();
        let kind = parts.next().unwrap_or_default();
        let id = parts.next();

        if prefix != PREFIX {
            return Err(ValidationError::invalid_format(
                "channel",
                format!("'{}' is not a gateway channel", channel),
            ));
        }

        match (kind, id) {
            (BROADCAST, None) => Ok(Scope::Broadcast),
            ("user", Some(id)) => Ok(Scope::User(UserId::new(id)?)),
            ("conv", Some(id)) => id.parse().map(Scope::Conversation).map_err(|_| {
                ValidationError::invalid_format("channel", format!("bad conversation id '{}'", id))
            }),
            _ => Err(ValidationError::invalid_format(
                "channel",
                format!("unknown scope in '{}'", channel),
            )),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel())
    }
}

/// Client-facing event: a kind and its data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ClientEvent {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// A client event addressed to a scope.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingEnvelope {
    pub scope: Scope,
    pub event: ClientEvent,
}

impl RoutingEnvelope {
    pub fn new(scope: Scope, kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            scope,
            event: ClientEvent::new(kind, data),
        }
    }

    pub fn to_user(user: &UserId, kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new(Scope::User(user.clone()), kind, data)
    }

    pub fn to_conversation(
        conv: &ConversationId,
        kind: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self::new(Scope::Conversation(*conv), kind, data)
    }

    pub fn channel(&self) -> String {
        self.scope.channel()
    }

    pub fn encode_payload(&self) -> Result<String, DomainError> {
        serde_json::to_string(&self.event).map_err(|e| {
            DomainError::new(
                ErrorCode::InvalidPayload,
                format!("Failed to encode {} envelope: {}", self.event.kind, e),
            )
        })
    }

    /// Rebuilds an envelope from a bus delivery.
    pub fn decode(channel: &str, payload: &str) -> Result<Self, DomainError> {
        let scope = Scope::parse_channel(channel)?;
        let event: ClientEvent = serde_json::from_str(payload).map_err(|e| {
            DomainError::new(
                ErrorCode::InvalidPayload,
                format!("Malformed payload on {}: {}", channel, e),
            )
        })?;
        Ok(Self { scope, event })
    }
}
