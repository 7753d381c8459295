//! Payload carried by tasks the relay derives from outbox rows.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::foundation::{DomainError, ErrorCode, OutboxEventId, Timestamp};
use crate::domain::outbox::OutboxEvent;

/// The outbox row, re-addressed as task input.
///
/// Handlers need the event type to pick a projection; the business
/// payload alone does not carry it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTask {
    pub event_id: OutboxEventId,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub occurred_at: Timestamp,
    pub data: serde_json::Value,
}

impl EventTask {
    pub fn from_outbox(event: &OutboxEvent) -> Self {
        Self {
            event_id: event.id,
            event_type: event.event_type.clone(),
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id,
            occurred_at: event.created_at,
            data: event.payload.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DomainError> {
        serde_json::to_vec(self).map_err(|e| {
            DomainError::new(
                ErrorCode::InvalidPayload,
                format!("Failed to encode task for event {}: {}", self.event_id, e),
            )
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DomainError> {
        serde_json::from_slice(bytes).map_err(|e| {
            DomainError::new(
                ErrorCode::InvalidPayload,
                format!("Malformed event task payload: {}", e),
            )
        })
    }

    /// Decodes the business payload into a typed shape.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DomainError> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            DomainError::new(
                ErrorCode::InvalidPayload,
                format!("Malformed {} payload: {}", self.event_type, e),
            )
            .with_detail("event_id", self.event_id.to_string())
        })
    }
}
