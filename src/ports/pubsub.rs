//! PubSubBus port - the shared bus connecting handlers to every gateway.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::domain::realtime::RoutingEnvelope;

#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("Pub/sub bus unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to encode bus payload: {0}")]
    Encode(String),
}

/// One delivery from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Inbound deliveries. The stream ends when the connection drops.
pub type BusStream = BoxStream<'static, BusMessage>;

#[async_trait]
pub trait PubSubBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;

    /// Subscribes to a glob pattern such as `ws:*`.
    async fn subscribe(&self, pattern: &str) -> Result<BusStream, BusError>;

    /// Publishes a routing envelope on its scope's channel.
    async fn publish_envelope(&self, envelope: &RoutingEnvelope) -> Result<(), BusError> {
        let payload = envelope
            .encode_payload()
            .map_err(|e| BusError::Encode(e.to_string()))?;
        self.publish(&envelope.channel(), &payload).await
    }
}
