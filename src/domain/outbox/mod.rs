//! Transactional outbox: rows written with business changes, and the
//! table that decides which tasks each row becomes.

mod event;
mod routing;

pub use event::{EventType, NewOutboxEvent, OutboxEvent, OutboxStatus};
pub use routing::{route_for, routed_task_types, TaskRoute, ROUTES};
