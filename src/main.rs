//! Realtime pipeline server: outbox relay, task workers and the WebSocket
//! gateway in one process.

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use realtime_pipeline::adapters::auth::JwtTokenVerifier;
use realtime_pipeline::adapters::postgres::{PostgresNotificationRepository, PostgresOutboxStore};
use realtime_pipeline::adapters::redis::{RedisProjectionStore, RedisPubSub, RedisTaskBroker};
use realtime_pipeline::adapters::websocket::{gateway_router, Gateway, GatewayConfig};
use realtime_pipeline::application::{
    register_handlers, NotificationHandler, OutboxRelay, ProjectionHandler, RelayConfig,
    TaskServer, TaskServerConfig,
};
use realtime_pipeline::config::AppConfig;
use realtime_pipeline::domain::outbox::routed_task_types;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = AppConfig::load()?;
    init_tracing(&config);
    config.validate()?;

    tracing::info!(
        environment = ?config.server.environment,
        addr = %config.server.socket_addr()?,
        "Starting realtime pipeline"
    );

    // PostgreSQL: outbox and notifications
    tracing::info!(url = %config.database.redacted_url(), "Connecting to PostgreSQL");
    let pool = config
        .database
        .pool_options()
        .connect(&config.database.url)
        .await?;
    if config.database.run_migrations {
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("Database migrations applied");
    }
    let outbox = Arc::new(PostgresOutboxStore::new(pool.clone()));
    let notifications = Arc::new(PostgresNotificationRepository::new(pool.clone()));

    // Redis: projections, bus, task queues
    let client = redis::Client::open(config.redis.url.as_str())?;
    let conn = tokio::time::timeout(
        config.redis.timeout(),
        client.get_multiplexed_tokio_connection(),
    )
    .await
    .map_err(|_| "timed out connecting to Redis")??;
    let projections = Arc::new(RedisProjectionStore::new(conn.clone()));
    let bus = Arc::new(RedisPubSub::new(client.clone(), conn.clone()));
    let broker = Arc::new(RedisTaskBroker::new(conn, config.redis.timeout()));

    // Task server with every routed task type covered
    let mut server = TaskServer::new(broker.clone(), TaskServerConfig::from(&config.worker));
    register_handlers(
        &mut server,
        Arc::new(ProjectionHandler::new(projections.clone(), bus.clone())),
        Arc::new(NotificationHandler::new(
            notifications,
            projections.clone(),
            bus.clone(),
        )),
    );
    server.validate(&routed_task_types())?;
    let server = Arc::new(server);

    let relay = OutboxRelay::with_config(outbox, broker, RelayConfig::from(&config.relay));

    let verifier = Arc::new(JwtTokenVerifier::new(
        &config.auth.jwt_secret,
        config.auth.issuer.as_deref(),
    ));
    let gateway = Gateway::start(
        GatewayConfig::from(&config.gateway),
        projections,
        bus,
        verifier,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay_task = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { relay.run(shutdown).await }
    });
    let worker_task = tokio::spawn(server.clone().run(shutdown_rx.clone()));

    let listener = tokio::net::TcpListener::bind(config.server.socket_addr()?).await?;
    tracing::info!(addr = %listener.local_addr()?, "Gateway listening");

    let app = gateway_router(gateway.clone());
    let serve_gateway = gateway.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            serve_gateway.shutdown().await;
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = relay_task.await {
        tracing::error!(error = %e, "Relay task ended abnormally");
    }
    if let Err(e) = worker_task.await {
        tracing::error!(error = %e, "Worker task ended abnormally");
    }

    let stats = server.stats();
    tracing::info!(
        processed = stats.processed,
        retried = stats.retried,
        dead_lettered = stats.dead_lettered,
        unsettled = stats.unsettled,
        "Shutdown complete"
    );
    pool.close().await;
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level));

    if config.is_production() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
