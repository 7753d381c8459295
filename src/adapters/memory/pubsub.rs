//! In-process pub/sub bus on a tokio broadcast channel.
//!
//! Supports the trailing-`*` patterns the gateway subscribes with.
//! Tests can drop every live subscription with [`InMemoryPubSub::disconnect_all`]
//! and make the next subscribe attempts fail.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::ports::{BusError, BusMessage, BusStream, PubSubBus};

const CHANNEL_CAPACITY: usize = 1024;

/// True if `channel` matches a glob `pattern` with an optional trailing `*`.
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryPubSub {
    sender: Arc<Mutex<broadcast::Sender<BusMessage>>>,
    published: Arc<Mutex<Vec<BusMessage>>>,
    failing_subscribes: Arc<AtomicUsize>,
    subscribe_attempts: Arc<AtomicUsize>,
    publish_failing: Arc<AtomicBool>,
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender: Arc::new(Mutex::new(sender)),
            published: Arc::new(Mutex::new(Vec::new())),
            failing_subscribes: Arc::new(AtomicUsize::new(0)),
            subscribe_attempts: Arc::new(AtomicUsize::new(0)),
            publish_failing: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    // === Test Helpers ===

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<BusMessage> {
        self.published
            .lock()
            .expect("InMemoryPubSub: lock poisoned")
            .clone()
    }

    pub fn published_on(&self, channel: &str) -> Vec<BusMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.channel == channel)
            .collect()
    }

    /// Ends every open subscription stream.
    pub fn disconnect_all(&self) {
        let (fresh, _) = broadcast::channel(CHANNEL_CAPACITY);
        *self.sender.lock().expect("InMemoryPubSub: lock poisoned") = fresh;
    }

    /// Makes the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.failing_subscribes.store(count, Ordering::SeqCst);
    }

    pub fn subscribe_attempts(&self) -> usize {
        self.subscribe_attempts.load(Ordering::SeqCst)
    }

    pub fn set_publish_failing(&self, failing: bool) {
        self.publish_failing.store(failing, Ordering::SeqCst);
    }

    /// Number of live subscription streams.
    pub fn subscriber_count(&self) -> usize {
        self.sender
            .lock()
            .expect("InMemoryPubSub: lock poisoned")
            .receiver_count()
    }
}

#[async_trait]
impl PubSubBus for InMemoryPubSub {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        if self.publish_failing.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("publish rejected".into()));
        }
        let message = BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        self.published
            .lock()
            .expect("InMemoryPubSub: lock poisoned")
            .push(message.clone());
        // No receivers is not an error, same as a Redis PUBLISH reaching nobody.
        let _ = self
            .sender
            .lock()
            .expect("InMemoryPubSub: lock poisoned")
            .send(message);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<BusStream, BusError> {
        self.subscribe_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BusError::Unavailable("subscribe rejected".into()));
        }

        let receiver = self
            .sender
            .lock()
            .expect("InMemoryPubSub: lock poisoned")
            .subscribe();
        let pattern = pattern.to_string();
        let stream = futures::stream::unfold(receiver, move |mut rx| {
            let pattern = pattern.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(msg) if pattern_matches(&pattern, &msg.channel) => {
                            return Some((msg, rx));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "in-memory subscriber lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
