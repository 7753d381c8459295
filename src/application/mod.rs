//! Application layer - the moving parts of the pipeline.
//!
//! - `relay` drains the outbox onto the task broker
//! - `task_server` runs registered handlers against the priority queues
//! - `handlers` turn events into projections and notifications

pub mod handlers;
pub mod relay;
pub mod task_server;

pub use handlers::{register_handlers, NotificationHandler, ProjectionHandler};
pub use relay::{OutboxRelay, RelayConfig, RelayReport};
pub use task_server::{Execution, TaskServer, TaskServerConfig, TaskServerStats};
