//! PostgreSQL adapters.
//!
//! - `PostgresOutboxStore` - transactional outbox table and relay transactions
//! - `PostgresNotificationRepository` - persisted in-app notifications

mod notification_repository;
mod outbox_store;

pub use notification_repository::PostgresNotificationRepository;
pub use outbox_store::{PostgresOutboxStore, PostgresOutboxTransaction};
