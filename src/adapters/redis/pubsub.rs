//! Redis pub/sub bus shared by every gateway instance.
//!
//! Publishing reuses the multiplexed connection; each subscription opens a
//! dedicated connection because a subscribed connection can do nothing else.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::ports::{BusError, BusMessage, BusStream, PubSubBus};

#[derive(Clone)]
pub struct RedisPubSub {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisPubSub {
    pub fn new(client: redis::Client, conn: MultiplexedConnection) -> Self {
        Self { client, conn }
    }
}

impl std::fmt::Debug for RedisPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPubSub").finish_non_exhaustive()
    }
}

#[async_trait]
impl PubSubBus for RedisPubSub {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e: redis::RedisError| BusError::Unavailable(e.to_string()))
    }

    async fn subscribe(&self, pattern: &str) -> Result<BusStream, BusError> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(BusMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                }),
                Err(e) => {
                    tracing::warn!(
                        channel = %msg.get_channel_name(),
                        error = %e,
                        "Dropping non-UTF-8 bus payload"
                    );
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
