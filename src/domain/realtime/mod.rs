//! Real-time delivery vocabulary shared by handlers and the gateway.

mod envelope;
mod lifecycle;

pub use envelope::{ClientEvent, RoutingEnvelope, Scope, CHANNEL_PATTERN};
pub use lifecycle::{AtomicConnectionState, CloseCode, ConnectionState};
