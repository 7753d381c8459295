//! ProjectionHandler - keeps the denormalized read state in step with events.
//!
//! Registered for both `project:message` and `project:conversation`; the
//! event type inside the task picks the projection.
//!
//! ## Failure policy
//!
//! Writes other projections depend on (conversation lists, last message,
//! participants) propagate their error so the task is retried. Auxiliary
//! writes (list trimming, message cache, unread counters, live publish) are
//! logged and skipped.
//!
//! ## Idempotency
//!
//! Tasks are delivered at least once and in no particular order.
//! List upserts and set adds converge on replay. The last-message facet
//! only moves forward by `seq`, and unread counters are bumped only when it
//! moved, so a duplicate `message.created` never double counts.
//! Edits apply only when newer than the cached copy.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use crate::domain::foundation::DomainError;
use crate::domain::outbox::EventType;
use crate::domain::payloads::{
    ClassCreatedPayload, ConversationCreatedPayload, ConversationReadPayload,
    MessageDeletedPayload, MessagePayload, ParticipantChangedPayload,
};
use crate::domain::projection::{
    truncate_preview, CachedMessage, ClassMeta, LastMessage, WriteOutcome,
    CONVERSATION_LIST_LIMIT, MESSAGE_CACHE_TTL, MESSAGE_PREVIEW_CHARS,
};
use crate::domain::realtime::RoutingEnvelope;
use crate::domain::tasks::{EventTask, TaskMessage};
use crate::ports::{ProjectionStore, PubSubBus, TaskError, TaskHandler};

pub struct ProjectionHandler {
    projections: Arc<dyn ProjectionStore>,
    bus: Arc<dyn PubSubBus>,
}

impl ProjectionHandler {
    pub fn new(projections: Arc<dyn ProjectionStore>, bus: Arc<dyn PubSubBus>) -> Self {
        Self { projections, bus }
    }

    /// Applies one event to the projections.
    pub async fn project(&self, event: &EventTask) -> Result<(), TaskError> {
        let Some(kind) = EventType::parse(&event.event_type) else {
            return Err(TaskError::Permanent(format!(
                "no projection for event type {}",
                event.event_type
            )));
        };

        match kind {
            EventType::MessageCreated => self.message_created(event).await?,
            EventType::MessageEdited => self.message_edited(event).await?,
            EventType::MessageDeleted => self.message_deleted(event).await?,
            EventType::ConversationCreated => self.conversation_created(event).await?,
            EventType::ParticipantJoined => self.participant_joined(event).await?,
            EventType::ParticipantLeft => self.participant_left(event).await?,
            EventType::ConversationRead => self.conversation_read(event).await?,
            EventType::ClassCreated => self.class_created(event).await?,
            other => {
                return Err(TaskError::Permanent(format!(
                    "no projection for event type {}",
                    other
                )))
            }
        }

        tracing::debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            "Projection applied"
        );
        Ok(())
    }

    // ════════════════════════════════════════════════════════════════════════════════
    // Messages
    // ════════════════════════════════════════════════════════════════════════════════

    async fn message_created(&self, event: &EventTask) -> Result<(), DomainError> {
        let payload: MessagePayload = event.decode()?;
        let msg = &payload.message;
        let conv = msg.conversation_id;
        let score = msg.created_at.as_unix_millis();

        for user in &payload.participants {
            self.projections
                .add_to_conversation_list(user, &conv, score)
                .await?;
            if let Err(e) = self
                .projections
                .trim_conversation_list(user, CONVERSATION_LIST_LIMIT)
                .await
            {
                tracing::warn!(user_id = %user, error = %e, "Failed to trim conversation list");
            }
        }

        let outcome = self
            .projections
            .advance_last_message(&conv, &LastMessage::from_message(msg))
            .await?;

        if outcome.applied() {
            for user in payload.participants.iter().filter(|u| **u != msg.sender_id) {
                if let Err(e) = self.projections.increment_unread(&conv, user).await {
                    tracing::warn!(
                        conversation_id = %conv,
                        user_id = %user,
                        error = %e,
                        "Failed to increment unread"
                    );
                }
            }
        } else {
            tracing::debug!(
                message_id = %msg.id,
                seq = msg.seq,
                "Last message already newer, meta and unread untouched"
            );
        }

        if let Err(e) = self
            .projections
            .cache_message(&CachedMessage::from(msg), MESSAGE_CACHE_TTL)
            .await
        {
            tracing::warn!(message_id = %msg.id, error = %e, "Failed to cache message");
        }

        self.publish(RoutingEnvelope::to_conversation(
            &conv,
            "message.created",
            json!({ "message": msg }),
        ))
        .await;
        Ok(())
    }

    async fn message_edited(&self, event: &EventTask) -> Result<(), DomainError> {
        let payload: MessagePayload = event.decode()?;
        let msg = &payload.message;
        let edited_at = msg.edited_at.unwrap_or(event.occurred_at);

        let outcome = self
            .projections
            .apply_message_edit(&msg.id, &msg.content, edited_at)
            .await?;
        if outcome == WriteOutcome::Stale {
            tracing::debug!(message_id = %msg.id, "Newer edit already projected");
            return Ok(());
        }

        let preview = truncate_preview(&msg.content, MESSAGE_PREVIEW_CHARS);
        if let Err(e) = self
            .projections
            .refresh_last_message_text(&msg.conversation_id, &msg.id, &preview)
            .await
        {
            tracing::warn!(message_id = %msg.id, error = %e, "Failed to refresh preview");
        }

        self.publish(RoutingEnvelope::to_conversation(
            &msg.conversation_id,
            "message.edited",
            json!({
                "message": {
                    "id": msg.id,
                    "conversation_id": msg.conversation_id,
                    "content": msg.content,
                    "edited_at": edited_at,
                }
            }),
        ))
        .await;
        Ok(())
    }

    async fn message_deleted(&self, event: &EventTask) -> Result<(), DomainError> {
        let payload: MessageDeletedPayload = event.decode()?;

        if let Err(e) = self
            .projections
            .delete_cached_message(&payload.message_id)
            .await
        {
            tracing::warn!(message_id = %payload.message_id, error = %e, "Failed to drop cached message");
        }

        self.publish(RoutingEnvelope::to_conversation(
            &payload.conversation_id,
            "message.deleted",
            json!({
                "message_id": payload.message_id,
                "conversation_id": payload.conversation_id,
            }),
        ))
        .await;
        Ok(())
    }

    // ════════════════════════════════════════════════════════════════════════════════
    // Conversations
    // ════════════════════════════════════════════════════════════════════════════════

    async fn conversation_created(&self, event: &EventTask) -> Result<(), DomainError> {
        let payload: ConversationCreatedPayload = event.decode()?;
        let conv = &payload.conversation;
        let score = conv.created_at.as_unix_millis();
        let active: Vec<_> = payload.participants.iter().filter(|p| p.is_active()).collect();

        for participant in &active {
            self.projections
                .add_to_conversation_list(&participant.user_id, &conv.id, score)
                .await?;
        }
        self.projections
            .set_conversation_info(&conv.id, &conv.kind, conv.name.as_deref())
            .await?;
        for participant in &active {
            self.projections
                .add_participant(&conv.id, &participant.user_id)
                .await?;
        }

        for participant in &active {
            self.publish(RoutingEnvelope::to_user(
                &participant.user_id,
                "conversation.created",
                json!({ "conversation": conv }),
            ))
            .await;
        }
        Ok(())
    }

    async fn participant_joined(&self, event: &EventTask) -> Result<(), DomainError> {
        let payload: ParticipantChangedPayload = event.decode()?;
        let joined_at = payload.timestamp.unwrap_or(event.occurred_at);

        self.projections
            .add_to_conversation_list(
                &payload.user_id,
                &payload.conversation_id,
                joined_at.as_unix_millis(),
            )
            .await?;
        self.projections
            .add_participant(&payload.conversation_id, &payload.user_id)
            .await?;

        self.publish(RoutingEnvelope::to_conversation(
            &payload.conversation_id,
            "participant.joined",
            json!({
                "conversation_id": payload.conversation_id,
                "user_id": payload.user_id,
                "joined_at": joined_at,
            }),
        ))
        .await;
        Ok(())
    }

    async fn participant_left(&self, event: &EventTask) -> Result<(), DomainError> {
        let payload: ParticipantChangedPayload = event.decode()?;
        let conv = &payload.conversation_id;

        self.projections
            .remove_from_conversation_list(&payload.user_id, conv)
            .await?;
        self.projections
            .remove_participant(conv, &payload.user_id)
            .await?;
        if let Err(e) = self.projections.reset_unread(conv, &payload.user_id).await {
            tracing::warn!(conversation_id = %conv, error = %e, "Failed to reset unread");
        }

        self.publish(RoutingEnvelope::to_conversation(
            conv,
            "participant.left",
            json!({
                "conversation_id": conv,
                "user_id": payload.user_id,
            }),
        ))
        .await;
        Ok(())
    }

    async fn conversation_read(&self, event: &EventTask) -> Result<(), DomainError> {
        let payload: ConversationReadPayload = event.decode()?;

        self.projections
            .reset_unread(&payload.conversation_id, &payload.user_id)
            .await?;

        self.publish(RoutingEnvelope::to_user(
            &payload.user_id,
            "conversation.read",
            json!({
                "conversation_id": payload.conversation_id,
                "last_read_seq": payload.seq,
            }),
        ))
        .await;
        Ok(())
    }

    async fn class_created(&self, event: &EventTask) -> Result<(), DomainError> {
        let payload: ClassCreatedPayload = event.decode()?;
        let class = &payload.class;

        self.projections
            .set_class_meta(
                &class.id,
                &ClassMeta {
                    name: class.name.clone(),
                    code: class.code.clone(),
                    created_by: class.created_by.clone(),
                },
            )
            .await?;

        self.publish(RoutingEnvelope::to_user(
            &class.created_by,
            "class.created",
            json!({ "class": class }),
        ))
        .await;
        Ok(())
    }

    /// Best-effort live delivery.
    async fn publish(&self, envelope: RoutingEnvelope) {
        if let Err(e) = self.bus.publish_envelope(&envelope).await {
            tracing::warn!(
                channel = %envelope.channel(),
                kind = %envelope.event.kind,
                error = %e,
                "Failed to publish projection event"
            );
        }
    }
}

#[async_trait]
impl TaskHandler for ProjectionHandler {
    async fn handle(&self, task: &TaskMessage) -> Result<(), TaskError> {
        let event = EventTask::from_bytes(&task.payload)?;
        self.project(&event).await
    }

    fn name(&self) -> &'static str {
        "ProjectionHandler"
    }
}
