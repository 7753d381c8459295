//! Redis adapters: projection store, pub/sub bus and task broker.
//!
//! All three share one `MultiplexedConnection`; only pub/sub subscriptions
//! open their own connection.

mod projection_store;
mod pubsub;
mod task_broker;

pub use projection_store::RedisProjectionStore;
pub use pubsub::RedisPubSub;
pub use task_broker::RedisTaskBroker;
