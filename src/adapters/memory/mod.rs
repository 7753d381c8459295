//! In-memory adapters for tests and local development.

mod broker;
mod notifications;
mod outbox;
mod projection;
mod pubsub;

pub use broker::InMemoryTaskBroker;
pub use notifications::InMemoryNotificationRepository;
pub use outbox::{InMemoryOutboxStore, InMemoryWriteTransaction};
pub use projection::InMemoryProjectionStore;
pub use pubsub::{pattern_matches, InMemoryPubSub};
