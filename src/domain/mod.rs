//! Domain layer containing the pipeline's types and rules.
//!
//! # Module Organization
//!
//! - `foundation` - Shared primitives (IDs, timestamps, errors)
//! - `outbox` - Outbox rows, their lifecycle and the event routing table
//! - `tasks` - Tasks, priority queues and retry policy
//! - `payloads` - Business event payload shapes
//! - `projection` - Denormalized read state and its keys
//! - `notification` - In-app notifications
//! - `realtime` - Routing envelopes, close codes, connection lifecycle

pub mod foundation;
pub mod notification;
pub mod outbox;
pub mod payloads;
pub mod projection;
pub mod realtime;
pub mod tasks;
