//! In-app notifications and the rules for building them from events.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::foundation::{DomainError, NotificationId, Timestamp, UserId};
use crate::domain::projection::truncate_preview;

/// Maximum characters of message content copied into a notification body.
pub const BODY_PREVIEW_CHARS: usize = 100;

/// Namespace for notification ids derived from their source event.
const NOTIFICATION_NAMESPACE: Uuid = Uuid::from_u128(0x6d1f_3a52_8c0e_4b7d_9e21_5f4a_c8b3_0e17);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    ClassInvite,
    Mention,
    NewMessage,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::ClassInvite => "class_invite",
            NotificationType::Mention => "mention",
            NotificationType::NewMessage => "new_message",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "class_invite" => Ok(NotificationType::ClassInvite),
            "mention" => Ok(NotificationType::Mention),
            "new_message" => Ok(NotificationType::NewMessage),
            other => Err(DomainError::validation(
                "type",
                format!("Unknown notification type: {}", other),
            )),
        }
    }
}

/// Reference to the entity a notification is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "entity_type")]
    pub kind: String,
    #[serde(rename = "entity_id")]
    pub id: Uuid,
}

/// A persisted in-app notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub body: String,
    #[serde(flatten)]
    pub entity: Option<EntityRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl Notification {
    pub fn new(
        user_id: UserId,
        kind: NotificationType,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: NotificationId::new(),
            user_id,
            kind,
            title: title.into(),
            body: body.into(),
            entity: None,
            data: None,
            read_at: None,
            created_at: Timestamp::now(),
        }
    }

    pub fn with_entity(mut self, kind: impl Into<String>, id: Uuid) -> Self {
        self.entity = Some(EntityRef {
            kind: kind.into(),
            id,
        });
        self
    }

    /// Replaces the random id with one derived from `source`, the recipient
    /// and the type, so the same event always yields the same notification.
    pub fn derived_from(mut self, source: &str) -> Self {
        let name = format!("{}:{}:{}", source, self.user_id, self.kind);
        let id = Uuid::new_v5(&NOTIFICATION_NAMESPACE, name.as_bytes());
        self.id = NotificationId::from_uuid(id);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }

    /// Sets the read flag. Returns false if it was already set.
    pub fn mark_read(&mut self) -> bool {
        if self.read_at.is_some() {
            return false;
        }
        self.read_at = Some(Timestamp::now());
        true
    }

    /// "New message" notification for one recipient of a chat message.
    pub fn new_message(
        recipient: UserId,
        message_id: Uuid,
        conversation_id: Uuid,
        sender_id: &UserId,
        content: &str,
    ) -> Self {
        Self::new(
            recipient,
            NotificationType::NewMessage,
            "New message",
            truncate_preview(content, BODY_PREVIEW_CHARS),
        )
        .with_entity("message", message_id)
        .with_data(json!({
            "message_id": message_id,
            "conversation_id": conversation_id,
            "sender_id": sender_id,
        }))
    }

    /// Invitation sent to a member just added to a class.
    pub fn class_invite(member: UserId, class_id: Uuid, class_name: &str, role: &str) -> Self {
        Self::new(
            member,
            NotificationType::ClassInvite,
            "Class invitation",
            format!("You have been added to class: {}", class_name),
        )
        .with_entity("class", class_id)
        .with_data(json!({
            "class_id": class_id,
            "class_name": class_name,
            "role": role,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    #[test]
    fn new_message_truncates_body_and_links_message() {
        let content = "x".repeat(150);
        let msg_id = Uuid::new_v4();
        let conv_id = Uuid::new_v4();
        let n = Notification::new_message(user("bob"), msg_id, conv_id, &user("alice"), &content);

        assert_eq!(n.kind, NotificationType::NewMessage);
        assert_eq!(n.title, "New message");
        assert_eq!(n.body, format!("{}...", "x".repeat(100)));
        assert_eq!(n.entity.as_ref().unwrap().kind, "message");
        assert_eq!(n.data.as_ref().unwrap()["sender_id"], "alice");
    }

    #[test]
    fn derived_id_is_stable_per_source_recipient_and_type() {
        let msg = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let build = |to: &str| {
            Notification::new_message(user(to), msg, conv, &user("alice"), "hi")
                .derived_from("outbox:42")
        };

        assert_eq!(build("bob").id, build("bob").id);
        assert_ne!(build("bob").id, build("carol").id);
        assert_ne!(
            build("bob").id,
            Notification::new_message(user("bob"), msg, conv, &user("alice"), "hi")
                .derived_from("outbox:43")
                .id
        );
    }

    #[test]
    fn class_invite_names_the_class() {
        let class_id = Uuid::new_v4();
        let n = Notification::class_invite(user("carol"), class_id, "Algebra I", "student");

        assert_eq!(n.title, "Class invitation");
        assert_eq!(n.body, "You have been added to class: Algebra I");
        assert_eq!(n.data.as_ref().unwrap()["role"], "student");
        assert_eq!(n.entity.unwrap().id, class_id);
    }

    #[test]
    fn mark_read_is_one_shot() {
        let mut n = Notification::new(user("dave"), NotificationType::Mention, "t", "b");
        assert!(!n.is_read());
        assert!(n.mark_read());
        assert!(!n.mark_read());
    }

    #[test]
    fn serializes_with_flat_entity_fields() {
        let n = Notification::new(user("erin"), NotificationType::Mention, "t", "b")
            .with_entity("message", Uuid::nil());
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "mention");
        assert_eq!(json["entity_type"], "message");
        assert!(json.get("read_at").is_none());
    }
}
