//! WebSocket gateway: live delivery of routed events to connected clients.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Pub/Sub Bus (shared)                          │
//! │        ws:user:{id}      ws:conv:{id}      ws:broadcast              │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                     │
//!                                     │ psubscribe ws:*
//!                                     ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           Subscriber                                 │
//! │   - Decodes channel scope and payload                                │
//! │   - Resubscribes with backoff when the bus drops                     │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                     │
//!                                     │ send_to_user / conversation / all
//!                                     ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              Hub                                     │
//! │   user: alice             user: bob                                  │
//! │   ├── conn-a ─▶ buffer    └── conn-c ─▶ buffer                       │
//! │   └── conn-b ─▶ buffer                                               │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                     │
//!                                     ▼
//!                    Connection: write pump ─▶ socket ─▶ read pump
//! ```
//!
//! # Components
//!
//! - [`messages`] - Wire protocol for server and client frames
//! - [`hub`] - Registry of local connections and non-blocking fan-out
//! - [`connection`] - Per-connection read and write pumps
//! - [`subscriber`] - Bus to hub bridge
//! - [`gateway`] - Handshake, background loops, staged shutdown
//! - [`handler`] - Axum routes for `/ws` and `/health`

pub mod connection;
pub mod gateway;
pub mod handler;
pub mod hub;
pub mod messages;
pub mod subscriber;

pub use connection::{Connection, ConnectionConfig, ConnectionContext};
pub use gateway::{Gateway, GatewayConfig, GatewayError};
pub use handler::{gateway_router, health, ws_handler, GatewayRejection};
pub use hub::{ConnectionHandle, Delivery, Hub, Registration, ShutdownReport};
pub use messages::{ClientMessage, Frame, ServerMessage};
pub use subscriber::{Backoff, Subscriber};
