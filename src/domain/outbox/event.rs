//! Outbox rows and their lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::foundation::{DomainError, ErrorCode, OutboxEventId, Timestamp};

/// Processing status of an outbox row.
///
/// Moves only forward: `pending -> processing -> processed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Processed => "processed",
            OutboxStatus::Failed => "failed",
        }
    }

    /// Whether the row may move from `self` to `next`.
    pub fn can_transition_to(&self, next: OutboxStatus) -> bool {
        matches!(
            (self, next),
            (OutboxStatus::Pending, OutboxStatus::Processing)
                | (OutboxStatus::Processing, OutboxStatus::Processed)
                | (OutboxStatus::Processing, OutboxStatus::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Processed | OutboxStatus::Failed)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "processing" => Ok(OutboxStatus::Processing),
            "processed" => Ok(OutboxStatus::Processed),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(DomainError::validation(
                "status",
                format!("Unknown outbox status: {}", other),
            )),
        }
    }
}

/// Domain event types recorded in the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    MessageCreated,
    MessageEdited,
    MessageDeleted,
    ClassCreated,
    ClassMemberAdded,
    ClassMemberRemoved,
    ConversationCreated,
    ParticipantJoined,
    ParticipantLeft,
    ConversationRead,
}

impl EventType {
    pub const ALL: [EventType; 10] = [
        EventType::MessageCreated,
        EventType::MessageEdited,
        EventType::MessageDeleted,
        EventType::ClassCreated,
        EventType::ClassMemberAdded,
        EventType::ClassMemberRemoved,
        EventType::ConversationCreated,
        EventType::ParticipantJoined,
        EventType::ParticipantLeft,
        EventType::ConversationRead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MessageCreated => "message.created",
            EventType::MessageEdited => "message.edited",
            EventType::MessageDeleted => "message.deleted",
            EventType::ClassCreated => "class.created",
            EventType::ClassMemberAdded => "class.member.added",
            EventType::ClassMemberRemoved => "class.member.removed",
            EventType::ConversationCreated => "conversation.created",
            EventType::ParticipantJoined => "conversation.participant.joined",
            EventType::ParticipantLeft => "conversation.participant.left",
            EventType::ConversationRead => "conversation.read",
        }
    }

    /// Parses a stored event type. Unknown strings yield `None`.
    pub fn parse(s: &str) -> Option<EventType> {
        EventType::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the outbox table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: OutboxEventId,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    /// Raw event type string; see [`EventType::parse`].
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub processed_at: Option<Timestamp>,
}

impl OutboxEvent {
    /// Materializes a freshly inserted row.
    pub fn pending(id: OutboxEventId, new: NewOutboxEvent, created_at: Timestamp) -> Self {
        Self {
            id,
            aggregate_type: new.aggregate_type,
            aggregate_id: new.aggregate_id,
            event_type: new.event_type,
            payload: new.payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at,
            processed_at: None,
        }
    }

    pub fn kind(&self) -> Option<EventType> {
        EventType::parse(&self.event_type)
    }

    /// Claims the row for relaying and counts the attempt.
    pub fn mark_processing(&mut self) -> Result<(), DomainError> {
        self.transition(OutboxStatus::Processing)?;
        self.attempts += 1;
        Ok(())
    }

    pub fn mark_processed(&mut self) -> Result<(), DomainError> {
        self.transition(OutboxStatus::Processed)?;
        self.processed_at = Some(Timestamp::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), DomainError> {
        self.transition(OutboxStatus::Failed)?;
        self.last_error = Some(reason.into());
        Ok(())
    }

    fn transition(&mut self, next: OutboxStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::new(
                ErrorCode::InvalidStateTransition,
                format!(
                    "Outbox event {} cannot move from {} to {}",
                    self.id, self.status, next
                ),
            ));
        }
        self.status = next;
        Ok(())
    }
}

/// Options for recording a new event alongside a business write.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl NewOutboxEvent {
    /// Builds the options, serializing `payload` to JSON.
    pub fn new<P: Serialize>(
        aggregate_type: impl Into<String>,
        aggregate_id: Uuid,
        event_type: EventType,
        payload: &P,
    ) -> Result<Self, DomainError> {
        let payload = serde_json::to_value(payload).map_err(|e| {
            DomainError::new(
                ErrorCode::InvalidPayload,
                format!("Failed to serialize {} payload: {}", event_type, e),
            )
        })?;

        Ok(Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            event_type: event_type.as_str().to_string(),
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> OutboxEvent {
        let new = NewOutboxEvent::new(
            "message",
            Uuid::new_v4(),
            EventType::MessageCreated,
            &json!({"message": {"content": "hi"}}),
        )
        .unwrap();
        OutboxEvent::pending(OutboxEventId::new(1), new, Timestamp::now())
    }

    #[test]
    fn event_types_round_trip_through_strings() {
        for kind in EventType::ALL {
            assert_eq!(EventType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventType::parse("message.exploded"), None);
    }

    #[test]
    fn lifecycle_moves_forward_and_counts_attempts() {
        let mut event = sample_event();
        event.mark_processing().unwrap();
        assert_eq!(event.status, OutboxStatus::Processing);
        assert_eq!(event.attempts, 1);

        event.mark_processed().unwrap();
        assert_eq!(event.status, OutboxStatus::Processed);
        assert!(event.processed_at.is_some());
    }

    #[test]
    fn terminal_status_never_reverts() {
        let mut event = sample_event();
        event.mark_processing().unwrap();
        event.mark_failed("broker down").unwrap();

        let err = event.mark_processing().unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidStateTransition);
        assert_eq!(event.status, OutboxStatus::Failed);
        assert_eq!(event.last_error.as_deref(), Some("broker down"));
    }

    #[test]
    fn pending_cannot_skip_to_processed() {
        let mut event = sample_event();
        assert!(event.mark_processed().is_err());
    }

    #[test]
    fn status_parses_database_strings() {
        assert_eq!("failed".parse::<OutboxStatus>().unwrap(), OutboxStatus::Failed);
        assert!("done".parse::<OutboxStatus>().is_err());
    }
}
