//! Adapters - Implementations of port interfaces.
//!
//! Adapters connect the pipeline to external systems:
//! - `postgres` - Outbox and notification persistence (sqlx)
//! - `redis` - Projection store, pub/sub bus and task broker
//! - `memory` - In-process implementations of every port
//! - `auth` - Bearer token verification
//! - `websocket` - Live delivery gateway

pub mod auth;
pub mod memory;
pub mod postgres;
pub mod redis;
pub mod websocket;
