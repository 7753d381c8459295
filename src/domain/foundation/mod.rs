//! Foundation module - Shared domain primitives.
//!
//! Identifiers, timestamps and error types used by every other module.

mod auth;
mod errors;
mod ids;
mod timestamp;

pub use auth::AuthError;
pub use errors::{DomainError, ErrorCode, ValidationError};
pub use ids::{
    ClassId, ConnectionId, ConversationId, MessageId, NotificationId, OutboxEventId, TaskId,
    UserId,
};
pub use timestamp::Timestamp;
