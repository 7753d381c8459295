//! Shapes of the business payloads recorded in the outbox.
//!
//! Producers serialize these when they call outbox create; handlers decode
//! them from [`EventTask::data`](crate::domain::tasks::EventTask).

use serde::{Deserialize, Serialize};

use crate::domain::foundation::{ClassId, ConversationId, MessageId, Timestamp, UserId};

/// A chat message as stored by the messaging domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    /// Per-conversation sequence number, strictly increasing.
    pub seq: i64,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

/// `message.created` and `message.edited`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message: ChatMessage,
    #[serde(default)]
    pub participants: Vec<UserId>,
}

/// `message.deleted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDeletedPayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub participants: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<ClassId>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_at: Option<Timestamp>,
}

impl Participant {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

/// `conversation.created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationCreatedPayload {
    pub conversation: Conversation,
    #[serde(default)]
    pub participants: Vec<Participant>,
}

/// `conversation.participant.joined` and `conversation.participant.left`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantChangedPayload {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// `conversation.read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationReadPayload {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    #[serde(alias = "last_read_seq")]
    pub seq: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Class {
    pub id: ClassId,
    pub name: String,
    #[serde(default)]
    pub code: String,
    pub created_by: UserId,
    pub created_at: Timestamp,
}

/// `class.created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassCreatedPayload {
    pub class: Class,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMember {
    pub user_id: UserId,
    pub role: String,
}

/// `class.member.added`.
///
/// Older producers send `class_id` + `member`; newer ones embed the class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMemberAddedPayload {
    pub class_id: ClassId,
    #[serde(alias = "class_member")]
    pub member: ClassMember,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<Class>,
}
