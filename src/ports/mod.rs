//! Ports - Interfaces for external dependencies.
//!
//! Following hexagonal architecture, ports define the contracts between
//! the pipeline and the outside world. Adapters implement these ports.
//!
//! ## Pipeline Ports
//!
//! - `OutboxStore` / `OutboxTransaction` - Relay access to the outbox table
//! - `TaskBroker` - Durable priority queues
//! - `TaskHandler` - Work executed by the task server per task type
//!
//! ## Read Model Ports
//!
//! - `ProjectionStore` - Denormalized state in the key-value store
//! - `NotificationRepository` - Durable in-app notifications
//!
//! ## Real-time Ports
//!
//! - `PubSubBus` - Shared bus between handlers and gateway instances
//! - `TokenVerifier` - Bearer token verification on upgrade

mod notification_repository;
mod outbox_store;
mod projection_store;
mod pubsub;
mod task_broker;
mod task_handler;
mod token_verifier;

pub use notification_repository::NotificationRepository;
pub use outbox_store::{OutboxStore, OutboxTransaction};
pub use projection_store::ProjectionStore;
pub use pubsub::{BusError, BusMessage, BusStream, PubSubBus};
pub use task_broker::{BrokerError, TaskBroker, LEASE_EXPIRED};
pub use task_handler::{TaskError, TaskHandler};
pub use token_verifier::TokenVerifier;
