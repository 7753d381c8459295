//! NotificationHandler - persists in-app notifications and pushes them live.
//!
//! Registered for `notify:new_message` and `notify:class_invite`.
//!
//! Persistence comes first and is durable; the live push that follows is
//! best-effort. A failed publish is logged and never rolls back or retries
//! the stored notification.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use crate::domain::foundation::DomainError;
use crate::domain::notification::Notification;
use crate::domain::outbox::EventType;
use crate::domain::payloads::{ClassMemberAddedPayload, MessagePayload};
use crate::domain::realtime::RoutingEnvelope;
use crate::domain::tasks::{EventTask, TaskMessage};
use crate::ports::{NotificationRepository, ProjectionStore, PubSubBus, TaskError, TaskHandler};

/// Client event kind for a freshly stored notification.
pub const NOTIFICATION_EVENT: &str = "notification.new";

/// Shown when neither the payload nor the projection knows the class name.
const UNKNOWN_CLASS_NAME: &str = "a class";

pub struct NotificationHandler {
    notifications: Arc<dyn NotificationRepository>,
    projections: Arc<dyn ProjectionStore>,
    bus: Arc<dyn PubSubBus>,
}

impl NotificationHandler {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        projections: Arc<dyn ProjectionStore>,
        bus: Arc<dyn PubSubBus>,
    ) -> Self {
        Self {
            notifications,
            projections,
            bus,
        }
    }

    /// Builds, stores and pushes the notifications for one event.
    ///
    /// Returns how many notifications were persisted.
    pub async fn notify(&self, event: &EventTask) -> Result<usize, TaskError> {
        match EventType::parse(&event.event_type) {
            Some(EventType::MessageCreated) => Ok(self.new_message(event).await?),
            Some(EventType::ClassMemberAdded) => Ok(self.class_invite(event).await?),
            _ => Err(TaskError::Permanent(format!(
                "no notification for event type {}",
                event.event_type
            ))),
        }
    }

    async fn new_message(&self, event: &EventTask) -> Result<usize, DomainError> {
        let payload: MessagePayload = event.decode()?;
        let msg = &payload.message;

        let recipients: Vec<_> = payload
            .participants
            .iter()
            .filter(|u| **u != msg.sender_id)
            .collect();
        if recipients.is_empty() {
            return Ok(0);
        }

        let mut stored = 0;
        let mut last_error = None;
        for recipient in recipients {
            let notification = Notification::new_message(
                recipient.clone(),
                *msg.id.as_uuid(),
                *msg.conversation_id.as_uuid(),
                &msg.sender_id,
                &msg.content,
            )
            .derived_from(&source_key(event));
            match self.store_and_push(&notification).await {
                Ok(()) => stored += 1,
                Err(e) => {
                    tracing::warn!(
                        user_id = %recipient,
                        message_id = %msg.id,
                        error = %e,
                        "Failed to create message notification"
                    );
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if stored == 0 => Err(e),
            _ => Ok(stored),
        }
    }

    async fn class_invite(&self, event: &EventTask) -> Result<usize, DomainError> {
        let payload: ClassMemberAddedPayload = event.decode()?;

        let class_name = match &payload.class {
            Some(class) => class.name.clone(),
            None => self.class_name(&payload).await,
        };

        let notification = Notification::class_invite(
            payload.member.user_id.clone(),
            *payload.class_id.as_uuid(),
            &class_name,
            &payload.member.role,
        )
        .derived_from(&source_key(event));
        self.store_and_push(&notification).await?;
        Ok(1)
    }

    /// Falls back to the class projection, then a generic name.
    async fn class_name(&self, payload: &ClassMemberAddedPayload) -> String {
        match self.projections.class_meta(&payload.class_id).await {
            Ok(Some(meta)) => meta.name,
            Ok(None) => UNKNOWN_CLASS_NAME.to_string(),
            Err(e) => {
                tracing::warn!(class_id = %payload.class_id, error = %e, "Class meta lookup failed");
                UNKNOWN_CLASS_NAME.to_string()
            }
        }
    }

    /// A redelivered event finds its notification already stored; the push
    /// is repeated and clients drop it by id.
    async fn store_and_push(&self, notification: &Notification) -> Result<(), DomainError> {
        if !self.notifications.create(notification).await? {
            tracing::debug!(
                notification_id = %notification.id,
                user_id = %notification.user_id,
                "Notification already stored"
            );
        }

        let envelope = RoutingEnvelope::to_user(
            &notification.user_id,
            NOTIFICATION_EVENT,
            json!({ "notification": notification }),
        );
        if let Err(e) = self.bus.publish_envelope(&envelope).await {
            tracing::warn!(
                notification_id = %notification.id,
                user_id = %notification.user_id,
                error = %e,
                "Failed to push notification"
            );
        }
        Ok(())
    }
}

/// Identifies the source event for deterministic notification ids.
fn source_key(event: &EventTask) -> String {
    format!("outbox:{}", event.event_id)
}

#[async_trait]
impl TaskHandler for NotificationHandler {
    async fn handle(&self, task: &TaskMessage) -> Result<(), TaskError> {
        let event = EventTask::from_bytes(&task.payload)?;
        let stored = self.notify(&event).await?;
        tracing::debug!(
            event_id = %event.event_id,
            task_type = %task.task_type,
            stored,
            "Notifications created"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "NotificationHandler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{
        InMemoryNotificationRepository, InMemoryProjectionStore, InMemoryPubSub,
    };
    use crate::domain::foundation::{
        ClassId, ConversationId, MessageId, OutboxEventId, Timestamp, UserId,
    };
    use crate::domain::notification::NotificationType;
    use crate::domain::outbox::{NewOutboxEvent, OutboxEvent};
    use crate::domain::payloads::{ChatMessage, Class, ClassMember};
    use crate::domain::projection::ClassMeta;
    use serde::Serialize;
    use std::sync::atomic::{AtomicI64, Ordering};
    use uuid::Uuid;

    static NEXT_EVENT_ID: AtomicI64 = AtomicI64::new(1);

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn event<P: Serialize>(kind: EventType, payload: &P) -> EventTask {
        let new = NewOutboxEvent::new("test", Uuid::new_v4(), kind, payload).unwrap();
        EventTask::from_outbox(&OutboxEvent::pending(
            OutboxEventId::new(NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed)),
            new,
            Timestamp::now(),
        ))
    }

    fn message_created(participants: &[&str]) -> EventTask {
        let msg = ChatMessage {
            id: MessageId::new(),
            conversation_id: ConversationId::new(),
            sender_id: user("alice"),
            seq: 1,
            content: "see you at ten".to_string(),
            reply_to_id: None,
            edited_at: None,
            created_at: Timestamp::now(),
        };
        event(
            EventType::MessageCreated,
            &MessagePayload {
                message: msg,
                participants: participants.iter().map(|p| user(p)).collect(),
            },
        )
    }

    fn member_added(class_id: ClassId, class: Option<Class>) -> EventTask {
        event(
            EventType::ClassMemberAdded,
            &ClassMemberAddedPayload {
                class_id,
                member: ClassMember {
                    user_id: user("carol"),
                    role: "student".to_string(),
                },
                class,
            },
        )
    }

    struct Fixture {
        repo: InMemoryNotificationRepository,
        store: InMemoryProjectionStore,
        bus: InMemoryPubSub,
        handler: NotificationHandler,
    }

    fn fixture() -> Fixture {
        let repo = InMemoryNotificationRepository::new();
        let store = InMemoryProjectionStore::new();
        let bus = InMemoryPubSub::new();
        let handler = NotificationHandler::new(
            Arc::new(repo.clone()),
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
        );
        Fixture {
            repo,
            store,
            bus,
            handler,
        }
    }

    #[tokio::test]
    async fn message_notifies_everyone_but_the_sender() {
        let f = fixture();

        let stored = f
            .handler
            .notify(&message_created(&["alice", "bob", "carol"]))
            .await
            .unwrap();

        assert_eq!(stored, 2);
        let mut recipients: Vec<String> =
            f.repo.all().iter().map(|n| n.user_id.to_string()).collect();
        recipients.sort();
        assert_eq!(recipients, vec!["bob", "carol"]);
        assert!(f.repo.all().iter().all(|n| n.kind == NotificationType::NewMessage));

        let pushed = f.bus.published_on("ws:user:bob");
        assert_eq!(pushed.len(), 1);
        let frame: serde_json::Value = serde_json::from_str(&pushed[0].payload).unwrap();
        assert_eq!(frame["type"], NOTIFICATION_EVENT);
        assert_eq!(frame["data"]["notification"]["title"], "New message");
        assert!(f.bus.published_on("ws:user:alice").is_empty());
    }

    #[tokio::test]
    async fn redelivered_event_stores_each_notification_once() {
        let f = fixture();
        let task = message_created(&["alice", "bob"]);

        f.handler.notify(&task).await.unwrap();
        f.handler.notify(&task).await.unwrap();

        let all = f.repo.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].user_id, user("bob"));

        let pushed = f.bus.published_on("ws:user:bob");
        let ids: Vec<serde_json::Value> = pushed
            .iter()
            .map(|m| serde_json::from_str::<serde_json::Value>(&m.payload).unwrap())
            .map(|frame| frame["data"]["notification"]["id"].clone())
            .collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn retry_after_partial_failure_fills_only_the_gap() {
        let f = fixture();
        let task = message_created(&["alice", "bob", "carol"]);
        f.repo.fail_inserts_for(user("bob"));
        assert_eq!(f.handler.notify(&task).await.unwrap(), 1);

        f.repo.clear_failures();
        f.handler.notify(&task).await.unwrap();

        let mut recipients: Vec<String> =
            f.repo.all().iter().map(|n| n.user_id.to_string()).collect();
        recipients.sort();
        assert_eq!(recipients, vec!["bob", "carol"]);
    }

    #[tokio::test]
    async fn one_failed_insert_does_not_fail_the_task() {
        let f = fixture();
        f.repo.fail_inserts_for(user("bob"));

        let stored = f
            .handler
            .notify(&message_created(&["alice", "bob", "carol"]))
            .await
            .unwrap();

        assert_eq!(stored, 1);
        assert_eq!(f.repo.all()[0].user_id, user("carol"));
    }

    #[tokio::test]
    async fn every_insert_failing_is_retryable() {
        let f = fixture();
        f.repo.fail_inserts_for(user("bob"));

        let err = f
            .handler
            .notify(&message_created(&["alice", "bob"]))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn sender_only_conversation_stores_nothing() {
        let f = fixture();
        assert_eq!(f.handler.notify(&message_created(&["alice"])).await.unwrap(), 0);
        assert!(f.repo.all().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_keeps_the_notification() {
        let f = fixture();
        f.bus.set_publish_failing(true);

        f.handler
            .notify(&message_created(&["alice", "bob"]))
            .await
            .unwrap();

        assert_eq!(f.repo.all().len(), 1);
    }

    #[tokio::test]
    async fn class_invite_uses_payload_class_name() {
        let f = fixture();
        let class_id = ClassId::new();
        let class = Class {
            id: class_id,
            name: "Algebra I".to_string(),
            code: "ALG1".to_string(),
            created_by: user("instructor"),
            created_at: Timestamp::now(),
        };

        f.handler
            .notify(&member_added(class_id, Some(class)))
            .await
            .unwrap();

        let all = f.repo.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].kind, NotificationType::ClassInvite);
        assert_eq!(all[0].body, "You have been added to class: Algebra I");
        assert_eq!(f.bus.published_on("ws:user:carol").len(), 1);
    }

    #[tokio::test]
    async fn class_invite_falls_back_to_projected_meta() {
        let f = fixture();
        let class_id = ClassId::new();
        f.store
            .set_class_meta(
                &class_id,
                &ClassMeta {
                    name: "Chemistry".to_string(),
                    code: "CHEM".to_string(),
                    created_by: user("instructor"),
                },
            )
            .await
            .unwrap();

        f.handler.notify(&member_added(class_id, None)).await.unwrap();

        assert_eq!(
            f.repo.all()[0].body,
            "You have been added to class: Chemistry"
        );
    }

    #[tokio::test]
    async fn unrelated_event_is_permanent() {
        let f = fixture();
        let task = event(
            EventType::MessageDeleted,
            &serde_json::json!({"message_id": Uuid::new_v4()}),
        );
        assert!(!f.handler.notify(&task).await.unwrap_err().is_retryable());
    }
}
