//! Gateway lifecycle: handshake, background loops and staged shutdown.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, Stream};
use std::fmt::Display;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::domain::foundation::{AuthError, UserId};
use crate::domain::projection::PRESENCE_TTL;
use crate::ports::{ProjectionStore, PubSubBus, TokenVerifier};

use super::connection::{Connection, ConnectionConfig, ConnectionContext};
use super::hub::{Hub, ShutdownReport};
use super::subscriber::Subscriber;

/// Errors raised at the gateway boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("Gateway is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Failed to encode frame: {0}")]
    Encode(String),
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub connection: ConnectionConfig,
    /// Outbound frames buffered per connection before it is closed.
    pub buffer_size: usize,
    pub shutdown_grace: Duration,
    pub presence_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            buffer_size: 256,
            shutdown_grace: Duration::from_secs(5),
            presence_interval: Duration::from_secs(30),
        }
    }
}

/// Handles to the gateway's background loops.
struct Workers {
    subscriber: Option<JoinHandle<()>>,
    presence: Option<JoinHandle<()>>,
}

/// One gateway instance: the local hub plus its bus subscriber and presence
/// loop.
pub struct Gateway {
    hub: Arc<Hub>,
    ctx: Arc<ConnectionContext>,
    verifier: Arc<dyn TokenVerifier>,
    config: GatewayConfig,
    subscriber_stop: watch::Sender<bool>,
    presence_stop: watch::Sender<bool>,
    workers: Mutex<Workers>,
}

impl Gateway {
    /// Builds the gateway and spawns its subscriber and presence loops.
    pub fn start(
        config: GatewayConfig,
        projections: Arc<dyn ProjectionStore>,
        bus: Arc<dyn PubSubBus>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Arc<Self> {
        let hub = Arc::new(Hub::new(config.buffer_size));
        let ctx = Arc::new(ConnectionContext {
            hub: hub.clone(),
            projections: projections.clone(),
            bus: bus.clone(),
            config: config.connection,
        });

        let (subscriber_stop, subscriber_rx) = watch::channel(false);
        let (presence_stop, presence_rx) = watch::channel(false);

        let subscriber = tokio::spawn(Subscriber::new(bus, hub.clone()).run(subscriber_rx));
        let presence = tokio::spawn(hub.clone().run_presence(
            projections,
            config.presence_interval,
            PRESENCE_TTL,
            presence_rx,
        ));

        tracing::info!(
            buffer_size = config.buffer_size,
            max_message_size = config.connection.max_message_size,
            "Gateway started"
        );

        Arc::new(Self {
            hub,
            ctx,
            verifier,
            config,
            subscriber_stop,
            presence_stop,
            workers: Mutex::new(Workers {
                subscriber: Some(subscriber),
                presence: Some(presence),
            }),
        })
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Verifies a bearer credential. No connection exists until this passes.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<UserId, GatewayError> {
        if !self.hub.is_accepting() {
            return Err(GatewayError::ShuttingDown);
        }
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        Ok(self.verifier.verify(token).await?)
    }

    /// Registers an upgraded socket for `user` and serves it until it closes.
    pub async fn accept<S, E>(&self, socket: S, user: UserId)
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message> + Send + 'static,
        E: Display + Send,
        <S as Sink<Message>>::Error: Display + Send,
    {
        match self.hub.register(user.clone()).await {
            Ok(registration) => Connection::serve(socket, registration, self.ctx.clone()).await,
            Err(e) => {
                // Shutdown began between the handshake and the upgrade.
                tracing::debug!(user_id = %user, error = %e, "Rejecting upgraded socket");
                drop(socket);
            }
        }
    }

    /// Staged shutdown: stop registrations, close connections with 1001
    /// within the grace period, then stop the subscriber and presence loop.
    pub async fn shutdown(&self) -> ShutdownReport {
        let report = self.hub.shutdown(self.config.shutdown_grace).await;
        tracing::info!(
            closed = report.closed,
            forced = report.forced,
            "Gateway connections drained"
        );

        let mut workers = self.workers.lock().await;

        let _ = self.subscriber_stop.send(true);
        if let Some(handle) = workers.subscriber.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Subscriber task failed");
            }
        }

        let _ = self.presence_stop.send(true);
        if let Some(handle) = workers.presence.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Presence task failed");
            }
        }

        tracing::info!("Gateway stopped");
        report
    }
}
