//! Application configuration module
//!
//! Type-safe configuration loaded from environment variables (and an optional
//! file) using the `config` and `dotenvy` crates. Variables use the
//! `PIPELINE` prefix and `__` between nested keys.
//!
//! # Example
//!
//! ```no_run
//! use realtime_pipeline::config::AppConfig;
//!
//! let config = AppConfig::load().expect("Failed to load configuration");
//! config.validate().expect("Invalid configuration");
//!
//! println!("Server running on {}", config.server.socket_addr().unwrap());
//! ```

mod auth;
mod database;
mod error;
mod pipeline;
mod redis;
mod server;

pub use auth::AuthConfig;
pub use database::DatabaseConfig;
pub use error::{ConfigError, ValidationError};
pub use pipeline::{GatewaySettings, RelaySettings, WorkerSettings};
pub use redis::RedisConfig;
pub use server::{Environment, ServerConfig};

use serde::Deserialize;
use std::path::Path;

const ENV_PREFIX: &str = "PIPELINE";

/// Root application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port, environment, log filter)
    #[serde(default)]
    pub server: ServerConfig,

    /// Outbox and notifications (PostgreSQL)
    pub database: DatabaseConfig,

    /// Projections, pub/sub bus and task queues
    pub redis: RedisConfig,

    /// Handshake token verification
    pub auth: AuthConfig,

    #[serde(default)]
    pub relay: RelaySettings,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub gateway: GatewaySettings,
}

impl AppConfig {
    /// Load configuration from environment variables
    ///
    /// This function:
    /// 1. Loads `.env` file if present (for development)
    /// 2. Reads environment variables with `PIPELINE` prefix
    /// 3. Uses `__` (double underscore) to separate nested values
    ///
    /// # Environment Variable Format
    ///
    /// - `PIPELINE__SERVER__PORT=8080` -> `server.port = 8080`
    /// - `PIPELINE__REDIS__URL=...` -> `redis.url = ...`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or values
    /// cannot be parsed.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Like [`AppConfig::load`], with `file` (TOML, YAML or JSON by
    /// extension) as a base layer that environment variables override.
    pub fn load_from(file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::default()
                    .prefix(ENV_PREFIX)
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Validate all configuration values
    ///
    /// # Errors
    ///
    /// Returns the first `ValidationError`, which names the failing field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.server.validate()?;
        self.database.validate()?;
        self.redis.validate()?;
        self.auth.validate()?;
        self.relay.validate()?;
        self.worker.validate()?;
        self.gateway.validate()?;
        Ok(())
    }

    /// Check if running in production environment
    pub fn is_production(&self) -> bool {
        self.server.is_production()
    }
}
