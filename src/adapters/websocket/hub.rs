//! Connection registry and fan-out for live WebSocket connections.
//!
//! ```text
//! user: alice              conversation: c-1
//! ├── conn-a (laptop)      ├── conn-a
//! └── conn-b (phone)       └── conn-c
//! user: bob
//! └── conn-c
//! ```
//!
//! Sends never block: each connection owns a bounded outbound buffer and a
//! full buffer force-closes that connection with 1013 instead of waiting.
//! Only connections on this instance are known here.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify, RwLock};

use crate::domain::foundation::{ConnectionId, ConversationId, UserId};
use crate::domain::realtime::{
    AtomicConnectionState, ClientEvent, CloseCode, ConnectionState,
};
use crate::ports::ProjectionStore;

use super::messages::{event_frame, Frame};
use super::GatewayError;

/// Hub-side handle to one live connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user: UserId,
    outbound: mpsc::Sender<Frame>,
    close: watch::Sender<Option<CloseCode>>,
    state: AtomicConnectionState,
}

/// Result of offering a frame to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Buffer full; the connection has been told to close.
    Overflowed,
    /// The connection is already gone.
    Closed,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn transition(&self, next: ConnectionState) -> bool {
        self.state.transition(next)
    }

    /// Queues a frame without waiting.
    pub fn offer(&self, frame: Frame) -> Delivery {
        match self.outbound.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    connection_id = %self.id,
                    user_id = %self.user,
                    "Outbound buffer full, closing slow connection"
                );
                self.close(CloseCode::TryAgainLater);
                Delivery::Overflowed
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Asks the connection's pumps to close. The first code wins.
    pub fn close(&self, code: CloseCode) {
        self.close.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(code);
                true
            } else {
                false
            }
        });
    }

    pub fn close_code(&self) -> Option<CloseCode> {
        *self.close.borrow()
    }
}

/// Everything a connection's pumps need from a successful registration.
#[derive(Debug)]
pub struct Registration {
    pub handle: Arc<ConnectionHandle>,
    pub outbound: mpsc::Receiver<Frame>,
    pub close: watch::Receiver<Option<CloseCode>>,
}

/// Outcome of a hub shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections that deregistered within the grace period.
    pub closed: usize,
    /// Connections dropped when the grace period ran out.
    pub forced: usize,
}

#[derive(Debug, Default)]
struct Registry {
    by_user: HashMap<UserId, HashMap<ConnectionId, Arc<ConnectionHandle>>>,
    by_connection: HashMap<ConnectionId, Arc<ConnectionHandle>>,
    subscribers: HashMap<ConversationId, HashSet<ConnectionId>>,
    subscriptions: HashMap<ConnectionId, HashSet<ConversationId>>,
}

impl Registry {
    fn remove(&mut self, id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let handle = self.by_connection.remove(id)?;
        if let Some(conns) = self.by_user.get_mut(&handle.user) {
            conns.remove(id);
            if conns.is_empty() {
                self.by_user.remove(&handle.user);
            }
        }
        for conv in self.subscriptions.remove(id).unwrap_or_default() {
            if let Some(subs) = self.subscribers.get_mut(&conv) {
                subs.remove(id);
                if subs.is_empty() {
                    self.subscribers.remove(&conv);
                }
            }
        }
        Some(handle)
    }
}

/// In-process registry of live connections.
///
/// # Thread Safety
///
/// One `RwLock` guards every map so the user, connection and conversation
/// indexes never disagree. Sends take the read lock only long enough to
/// snapshot the target handles.
#[derive(Debug)]
pub struct Hub {
    registry: RwLock<Registry>,
    accepting: AtomicBool,
    drained: Notify,
    buffer_size: usize,
}

impl Hub {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            accepting: AtomicBool::new(true),
            drained: Notify::new(),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Adds a connection for `user`. Fails once shutdown has begun.
    pub async fn register(&self, user: UserId) -> Result<Registration, GatewayError> {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.buffer_size);
        let (close_tx, close_rx) = watch::channel(None);
        let handle = Arc::new(ConnectionHandle {
            id: ConnectionId::new(),
            user,
            outbound: outbound_tx,
            close: close_tx,
            state: AtomicConnectionState::new(),
        });

        let mut registry = self.registry.write().await;
        // Checked under the write lock so shutdown's snapshot cannot miss us.
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(GatewayError::ShuttingDown);
        }
        registry
            .by_user
            .entry(handle.user.clone())
            .or_default()
            .insert(handle.id, handle.clone());
        registry.by_connection.insert(handle.id, handle.clone());
        drop(registry);

        tracing::debug!(
            connection_id = %handle.id,
            user_id = %handle.user,
            "Connection registered"
        );

        Ok(Registration {
            handle,
            outbound: outbound_rx,
            close: close_rx,
        })
    }

    /// Removes a connection. Safe to call any number of times.
    ///
    /// Returns true only for the call that actually removed it.
    pub async fn unregister(&self, id: &ConnectionId) -> bool {
        let mut registry = self.registry.write().await;
        let removed = registry.remove(id);
        let now_empty = registry.by_connection.is_empty();
        drop(registry);

        match removed {
            Some(handle) => {
                tracing::debug!(
                    connection_id = %id,
                    user_id = %handle.user,
                    "Connection unregistered"
                );
                if now_empty {
                    self.drained.notify_waiters();
                }
                true
            }
            None => false,
        }
    }

    /// Adds `conversations` to the set a connection receives events for.
    pub async fn subscribe(&self, id: &ConnectionId, conversations: &[ConversationId]) -> bool {
        let mut registry = self.registry.write().await;
        if !registry.by_connection.contains_key(id) {
            return false;
        }
        for conv in conversations {
            registry.subscribers.entry(*conv).or_default().insert(*id);
            registry.subscriptions.entry(*id).or_default().insert(*conv);
        }
        true
    }

    /// Delivers `event` to every connection currently registered for `user`.
    ///
    /// Returns the number of connections the frame was queued on.
    pub async fn send_to_user(&self, user: &UserId, event: &ClientEvent) -> usize {
        let targets: Vec<Arc<ConnectionHandle>> = {
            let registry = self.registry.read().await;
            registry
                .by_user
                .get(user)
                .map(|conns| conns.values().cloned().collect())
                .unwrap_or_default()
        };
        self.fan_out(targets, event)
    }

    /// Delivers `event` to connections subscribed to `conv`.
    pub async fn send_to_conversation(&self, conv: &ConversationId, event: &ClientEvent) -> usize {
        let targets: Vec<Arc<ConnectionHandle>> = {
            let registry = self.registry.read().await;
            registry
                .subscribers
                .get(conv)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| registry.by_connection.get(id).cloned())
                        .collect()
                })
                .unwrap_or_default()
        };
        self.fan_out(targets, event)
    }

    /// Delivers `event` to every connection on this instance.
    pub async fn broadcast(&self, event: &ClientEvent) -> usize {
        let targets: Vec<Arc<ConnectionHandle>> = {
            let registry = self.registry.read().await;
            registry.by_connection.values().cloned().collect()
        };
        self.fan_out(targets, event)
    }

    /// Queues a frame on a single connection, e.g. a direct reply.
    pub async fn send_to_connection(&self, id: &ConnectionId, frame: Frame) -> Delivery {
        let handle = self.registry.read().await.by_connection.get(id).cloned();
        match handle {
            Some(handle) => handle.offer(frame),
            None => Delivery::Closed,
        }
    }

    fn fan_out(&self, targets: Vec<Arc<ConnectionHandle>>, event: &ClientEvent) -> usize {
        if targets.is_empty() {
            return 0;
        }
        let frame = match event_frame(event) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(event_type = %event.kind, error = %e, "Failed to encode event");
                return 0;
            }
        };
        targets
            .iter()
            .filter(|handle| handle.offer(frame.clone()) == Delivery::Queued)
            .count()
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.by_connection.len()
    }

    pub async fn user_connection_count(&self, user: &UserId) -> usize {
        self.registry
            .read()
            .await
            .by_user
            .get(user)
            .map_or(0, |conns| conns.len())
    }

    /// Users with at least one connection on this instance.
    pub async fn online_users(&self) -> Vec<UserId> {
        self.registry.read().await.by_user.keys().cloned().collect()
    }

    /// Connections whose state is still `Open`.
    pub async fn open_connection_count(&self) -> usize {
        self.registry
            .read()
            .await
            .by_connection
            .values()
            .filter(|h| h.state() == ConnectionState::Open)
            .count()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stops registrations, asks every connection to close with 1001 and
    /// waits up to `grace` for them to deregister. Stragglers are dropped.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let handles: Vec<Arc<ConnectionHandle>> = {
            let registry = self.registry.write().await;
            self.accepting.store(false, Ordering::SeqCst);
            registry.by_connection.values().cloned().collect()
        };
        let total = handles.len();
        tracing::info!(connections = total, "Hub shutting down");

        for handle in &handles {
            handle.close(CloseCode::GoingAway);
        }
        drop(handles);

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let drained = self.drained.notified();
            if self.connection_count().await == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                break;
            }
        }

        let stragglers: Vec<Arc<ConnectionHandle>> = {
            let mut registry = self.registry.write().await;
            let ids: Vec<ConnectionId> = registry.by_connection.keys().copied().collect();
            ids.iter().filter_map(|id| registry.remove(id)).collect()
        };
        for handle in &stragglers {
            tracing::warn!(
                connection_id = %handle.id,
                user_id = %handle.user,
                "Dropping connection that did not close within grace period"
            );
            handle.transition(ConnectionState::Closed);
        }

        ShutdownReport {
            closed: total.saturating_sub(stragglers.len()),
            forced: stragglers.len(),
        }
    }

    /// Refreshes presence for users connected here until `shutdown` flips.
    pub async fn run_presence(
        self: Arc<Self>,
        projections: Arc<dyn ProjectionStore>,
        interval: Duration,
        ttl: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for user in self.online_users().await {
                        if let Err(e) = projections.set_presence(&user, "online", ttl).await {
                            tracing::warn!(user_id = %user, error = %e, "Failed to refresh presence");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("Presence loop stopped");
                        return;
                    }
                }
            }
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(256)
    }
}
