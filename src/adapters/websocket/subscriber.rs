//! Bridge from the shared pub/sub bus into the local hub.
//!
//! ```text
//! handlers ──publish──▶ bus (ws:user:*, ws:conv:*, ws:broadcast)
//!                        │ psubscribe ws:*
//!                        ▼
//!                  Subscriber ──▶ Hub ──▶ connections on this instance
//! ```
//!
//! The receive loop never waits on a connection: hub sends only queue into
//! bounded buffers. When the bus connection drops, the subscriber
//! resubscribes with backoff until shutdown.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;

use crate::domain::realtime::{RoutingEnvelope, Scope, CHANNEL_PATTERN};
use crate::ports::{BusMessage, PubSubBus};

use super::hub::Hub;

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the delay to wait now and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Outcome of one subscription.
enum Session {
    /// The stream ended; resubscribe.
    Lost,
    Shutdown,
}

pub struct Subscriber {
    bus: Arc<dyn PubSubBus>,
    hub: Arc<Hub>,
    backoff: Backoff,
}

impl Subscriber {
    pub fn new(bus: Arc<dyn PubSubBus>, hub: Arc<Hub>) -> Self {
        Self {
            bus,
            hub,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Consumes the bus until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(pattern = CHANNEL_PATTERN, "Subscriber starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.bus.subscribe(CHANNEL_PATTERN).await {
                Ok(stream) => {
                    self.backoff.reset();
                    tracing::debug!(pattern = CHANNEL_PATTERN, "Subscribed to bus");
                    match self.consume(stream, &mut shutdown).await {
                        Session::Shutdown => break,
                        Session::Lost => {
                            tracing::warn!("Bus subscription lost, resubscribing");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Bus subscribe failed");
                }
            }

            let delay = self.backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Subscriber stopped");
    }

    async fn consume(
        &self,
        mut stream: crate::ports::BusStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Session {
        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(message) => {
                        self.dispatch(&message).await;
                    }
                    None => return Session::Lost,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Session::Shutdown;
                    }
                }
            }
        }
    }

    /// Forwards one bus delivery to the hub. Returns the number of local
    /// connections that queued it.
    pub async fn dispatch(&self, message: &BusMessage) -> usize {
        let envelope = match RoutingEnvelope::decode(&message.channel, &message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(channel = %message.channel, error = %e, "Dropping malformed bus message");
                return 0;
            }
        };

        let delivered = match &envelope.scope {
            Scope::User(user) => self.hub.send_to_user(user, &envelope.event).await,
            Scope::Conversation(conv) => {
                self.hub.send_to_conversation(conv, &envelope.event).await
            }
            Scope::Broadcast => self.hub.broadcast(&envelope.event).await,
        };

        tracing::trace!(
            channel = %message.channel,
            kind = %envelope.event.kind,
            delivered,
            "Routed bus message"
        );
        delivered
    }
}
