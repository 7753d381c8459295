//! Relay, worker and gateway tuning.
//!
//! These sections are plain numbers on the wire; each converts into the
//! runtime config of the component it tunes.

use serde::Deserialize;
use std::time::Duration;

use super::error::ValidationError;
use crate::adapters::websocket::{ConnectionConfig, GatewayConfig};
use crate::application::{RelayConfig, TaskServerConfig};
use crate::domain::tasks::{QueueWeights, RetryPolicy};

const MAX_BATCH_SIZE: u32 = 1000;

// ════════════════════════════════════════════════════════════════════════════════
// Relay
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct RelaySettings {
    #[serde(default = "default_relay_poll_ms")]
    pub poll_interval_ms: u64,

    /// Pending events fetched per tick
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Processed events older than this are deleted
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

impl RelaySettings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::MustBePositive("relay.poll_interval_ms"));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ValidationError::OutOfRange {
                field: "relay.batch_size",
                reason: "must be between 1 and 1000",
            });
        }
        if self.cleanup_interval_secs == 0 {
            return Err(ValidationError::MustBePositive("relay.cleanup_interval_secs"));
        }
        if self.retention_days == 0 {
            return Err(ValidationError::MustBePositive("relay.retention_days"));
        }
        Ok(())
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_relay_poll_ms(),
            batch_size: default_batch_size(),
            cleanup_interval_secs: default_cleanup_interval(),
            retention_days: default_retention_days(),
        }
    }
}

impl From<&RelaySettings> for RelayConfig {
    fn from(s: &RelaySettings) -> Self {
        RelayConfig {
            poll_interval: Duration::from_millis(s.poll_interval_ms),
            batch_size: s.batch_size,
            cleanup_interval: Duration::from_secs(s.cleanup_interval_secs),
            retention: Duration::from_secs(s.retention_days * 24 * 60 * 60),
        }
    }
}

fn default_relay_poll_ms() -> u64 {
    1000
}

fn default_batch_size() -> u32 {
    50
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_retention_days() -> u64 {
    7
}

// ════════════════════════════════════════════════════════════════════════════════
// Worker
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_worker_poll_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,

    /// Attempts before a task is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_secs")]
    pub retry_max_delay_secs: u64,

    #[serde(default = "default_weight_critical")]
    pub weight_critical: u32,

    #[serde(default = "default_weight_default")]
    pub weight_default: u32,

    #[serde(default = "default_weight_low")]
    pub weight_low: u32,
}

impl WorkerSettings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.concurrency == 0 {
            return Err(ValidationError::MustBePositive("worker.concurrency"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::MustBePositive("worker.poll_interval_ms"));
        }
        if self.task_timeout_secs == 0 {
            return Err(ValidationError::MustBePositive("worker.task_timeout_secs"));
        }
        if self.max_attempts == 0 {
            return Err(ValidationError::MustBePositive("worker.max_attempts"));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_secs.saturating_mul(1000) {
            return Err(ValidationError::OutOfRange {
                field: "worker.retry_base_delay_ms",
                reason: "must not exceed retry_max_delay_secs",
            });
        }
        if [self.weight_critical, self.weight_default, self.weight_low].contains(&0) {
            return Err(ValidationError::OutOfRange {
                field: "worker.weight_*",
                reason: "every queue needs a non-zero weight",
            });
        }
        Ok(())
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_worker_poll_ms(),
            task_timeout_secs: default_task_timeout(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_ms(),
            retry_max_delay_secs: default_retry_max_secs(),
            weight_critical: default_weight_critical(),
            weight_default: default_weight_default(),
            weight_low: default_weight_low(),
        }
    }
}

impl From<&WorkerSettings> for TaskServerConfig {
    fn from(s: &WorkerSettings) -> Self {
        TaskServerConfig {
            concurrency: s.concurrency,
            poll_interval: Duration::from_millis(s.poll_interval_ms),
            task_timeout: Duration::from_secs(s.task_timeout_secs),
            retry: RetryPolicy::new(
                s.max_attempts,
                Duration::from_millis(s.retry_base_delay_ms),
                Duration::from_secs(s.retry_max_delay_secs),
            ),
            weights: QueueWeights {
                critical: s.weight_critical,
                default: s.weight_default,
                low: s.weight_low,
            },
        }
    }
}

fn default_concurrency() -> usize {
    10
}

fn default_worker_poll_ms() -> u64 {
    200
}

fn default_task_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_base_ms() -> u64 {
    1000
}

fn default_retry_max_secs() -> u64 {
    60
}

fn default_weight_critical() -> u32 {
    6
}

fn default_weight_default() -> u32 {
    3
}

fn default_weight_low() -> u32 {
    1
}

// ════════════════════════════════════════════════════════════════════════════════
// Gateway
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_write_wait")]
    pub write_wait_secs: u64,

    /// Idle timeout; the peer must send something within this window
    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,

    #[serde(default = "default_ping_period")]
    pub ping_period_secs: u64,

    /// Largest inbound frame in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound frames queued per connection
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_presence_interval")]
    pub presence_interval_secs: u64,
}

impl GatewaySettings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.write_wait_secs == 0 {
            return Err(ValidationError::MustBePositive("gateway.write_wait_secs"));
        }
        if self.ping_period_secs == 0 {
            return Err(ValidationError::MustBePositive("gateway.ping_period_secs"));
        }
        if self.ping_period_secs >= self.pong_wait_secs {
            return Err(ValidationError::OutOfRange {
                field: "gateway.ping_period_secs",
                reason: "must be shorter than pong_wait_secs",
            });
        }
        if self.max_message_size == 0 {
            return Err(ValidationError::MustBePositive("gateway.max_message_size"));
        }
        if self.buffer_size == 0 {
            return Err(ValidationError::MustBePositive("gateway.buffer_size"));
        }
        if self.presence_interval_secs == 0 {
            return Err(ValidationError::MustBePositive("gateway.presence_interval_secs"));
        }
        Ok(())
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            write_wait_secs: default_write_wait(),
            pong_wait_secs: default_pong_wait(),
            ping_period_secs: default_ping_period(),
            max_message_size: default_max_message_size(),
            buffer_size: default_buffer_size(),
            shutdown_grace_secs: default_shutdown_grace(),
            presence_interval_secs: default_presence_interval(),
        }
    }
}

impl From<&GatewaySettings> for GatewayConfig {
    fn from(s: &GatewaySettings) -> Self {
        GatewayConfig {
            connection: ConnectionConfig {
                write_wait: Duration::from_secs(s.write_wait_secs),
                pong_wait: Duration::from_secs(s.pong_wait_secs),
                ping_period: Duration::from_secs(s.ping_period_secs),
                max_message_size: s.max_message_size,
            },
            buffer_size: s.buffer_size,
            shutdown_grace: Duration::from_secs(s.shutdown_grace_secs),
            presence_interval: Duration::from_secs(s.presence_interval_secs),
        }
    }
}

fn default_write_wait() -> u64 {
    10
}

fn default_pong_wait() -> u64 {
    60
}

fn default_ping_period() -> u64 {
    30
}

fn default_max_message_size() -> usize {
    8192
}

fn default_buffer_size() -> usize {
    256
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_presence_interval() -> u64 {
    30
}
