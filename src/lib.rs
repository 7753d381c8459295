//! Realtime Pipeline - reliable, near-real-time delivery of domain events
//!
//! A business write records its event in the outbox table inside the same
//! transaction. From there:
//!
//! ```text
//! outbox ──▶ relay ──▶ task queues (critical/default/low)
//!                          │
//!                          ▼
//!                    task server ──▶ projection / notification handlers
//!                                          │
//!                                          ▼ publish ws:{scope}
//!                                     pub/sub bus ──▶ gateway subscriber ──▶ hub ──▶ sockets
//! ```
//!
//! - `domain` - events, routing table, tasks, projections, notifications
//! - `ports` - the seams to storage, broker, bus and token verification
//! - `adapters` - PostgreSQL, Redis, in-memory and WebSocket implementations
//! - `application` - relay, task server and handlers
//! - `config` - layered environment configuration

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;
