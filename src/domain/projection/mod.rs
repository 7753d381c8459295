//! Denormalized read state kept in the projection store.
//!
//! Keys are namespaced `<entity-type>:<entity-id>[:<facet>]`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::foundation::{ClassId, ConversationId, MessageId, Timestamp, UserId};
use crate::domain::payloads::ChatMessage;

/// Most recent conversations kept per user.
pub const CONVERSATION_LIST_LIMIT: usize = 500;
/// Characters of message content kept as the conversation preview.
pub const MESSAGE_PREVIEW_CHARS: usize = 100;
pub const MESSAGE_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const PRESENCE_TTL: Duration = Duration::from_secs(90);
pub const TYPING_TTL: Duration = Duration::from_secs(10);

/// Truncates to `max_chars` characters, appending "..." when cut.
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

/// Key builders for every projection entry.
pub mod keys {
    use super::*;

    pub fn conversation_list(user: &UserId) -> String {
        format!("conv:{}:list", user)
    }

    pub fn conversation_meta(conv: &ConversationId) -> String {
        format!("conv:{}:meta", conv)
    }

    pub fn unread(conv: &ConversationId, user: &UserId) -> String {
        format!("conv:{}:unread:{}", conv, user)
    }

    pub fn participants(conv: &ConversationId) -> String {
        format!("conv:{}:participants", conv)
    }

    pub fn message(id: &MessageId) -> String {
        format!("msg:{}", id)
    }

    pub fn class_meta(class: &ClassId) -> String {
        format!("class:{}:meta", class)
    }

    pub fn presence(user: &UserId) -> String {
        format!("presence:{}", user)
    }

    pub fn typing(conv: &ConversationId, user: &UserId) -> String {
        format!("typing:{}:{}", conv, user)
    }

    pub fn typing_prefix(conv: &ConversationId) -> String {
        format!("typing:{}:", conv)
    }
}

/// The "last message" facet of a conversation's meta entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub id: MessageId,
    pub text: String,
    pub at_millis: i64,
    pub sender: UserId,
    pub seq: i64,
}

impl LastMessage {
    pub fn from_message(msg: &ChatMessage) -> Self {
        Self {
            id: msg.id,
            text: truncate_preview(&msg.content, MESSAGE_PREVIEW_CHARS),
            at_millis: msg.created_at.as_unix_millis(),
            sender: msg.sender_id.clone(),
            seq: msg.seq,
        }
    }
}

/// Conversation meta entry (`conv:{id}:meta`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub kind: Option<String>,
    pub name: Option<String>,
    pub last_message: Option<LastMessage>,
}

/// Cached copy of a message (`msg:{id}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub seq: i64,
    pub content: String,
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<Timestamp>,
}

impl From<&ChatMessage> for CachedMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            id: msg.id,
            conversation_id: msg.conversation_id,
            sender_id: msg.sender_id.clone(),
            seq: msg.seq,
            content: msg.content.clone(),
            created_at: msg.created_at,
            reply_to_id: msg.reply_to_id,
            edited_at: msg.edited_at,
        }
    }
}

/// Class meta entry (`class:{id}:meta`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassMeta {
    pub name: String,
    pub code: String,
    pub created_by: UserId,
}

/// Outcome of a guarded projection write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The stored state is already as new or newer.
    Stale,
    /// Nothing to update (entry missing or expired).
    Missing,
}

impl WriteOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate_preview("hello", 100), "hello");
        assert_eq!(truncate_preview(&"a".repeat(100), 100), "a".repeat(100));
    }

    #[test]
    fn long_text_is_cut_with_ellipsis() {
        assert_eq!(truncate_preview("abcdef", 3), "abc...");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "héllo wörld";
        assert_eq!(truncate_preview(text, 2), "hé...");
    }

    #[test]
    fn keys_are_namespaced_by_entity_type() {
        let user = UserId::new("u1").unwrap();
        let conv: ConversationId = "0b8f9a3e-1d2c-4f5e-8a7b-9c0d1e2f3a4b".parse().unwrap();
        assert_eq!(keys::conversation_list(&user), "conv:u1:list");
        assert_eq!(
            keys::unread(&conv, &user),
            "conv:0b8f9a3e-1d2c-4f5e-8a7b-9c0d1e2f3a4b:unread:u1"
        );
        assert!(keys::typing(&conv, &user).starts_with(&keys::typing_prefix(&conv)));
    }

    proptest! {
        #[test]
        fn preview_never_exceeds_limit(text in ".{0,300}", max in 1usize..150) {
            let preview = truncate_preview(&text, max);
            let chars = preview.chars().count();
            if text.chars().count() <= max {
                prop_assert_eq!(preview, text);
            } else {
                prop_assert_eq!(chars, max + 3);
                prop_assert!(preview.ends_with("..."));
            }
        }
    }
}
