//! OutboxRelay - drains the transactional outbox into the task queue.
//!
//! Second half of the outbox pattern:
//! 1. Business code writes rows to `outbox` in its own transaction
//! 2. **The relay polls pending rows and enqueues their tasks** ← This module
//!
//! ## Per-event unit of work
//!
//! ```text
//! begin ─▶ mark_processing ─▶ route ─▶ enqueue task(s) ─▶ mark_processed ─▶ commit
//!                                          │ error
//!                                          └──────────▶ mark_failed ──────▶ commit
//! ```
//!
//! A crash before `commit` leaves the row pending, so the next poll enqueues
//! it again. Handlers are idempotent; delivery is at-least-once.
//! A failed row is never retried here.
//!
//! ## Configuration
//!
//! | Setting | Default | Description |
//! |---------|---------|-------------|
//! | `poll_interval` | 1s | How often to look for pending rows |
//! | `batch_size` | 50 | Max rows per poll |
//! | `cleanup_interval` | 1h | How often processed rows are purged |
//! | `retention` | 7 days | Age at which processed rows are purged |

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

use crate::domain::foundation::{DomainError, Timestamp};
use crate::domain::outbox::{route_for, OutboxEvent, TaskRoute};
use crate::domain::tasks::{EventTask, Task};
use crate::ports::{OutboxStore, OutboxTransaction, TaskBroker};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    pub batch_size: u32,
    pub cleanup_interval: Duration,
    pub retention: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 50,
            cleanup_interval: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl RelayConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }
}

/// What one poll did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub fetched: usize,
    /// Every task enqueued, row marked processed.
    pub processed: usize,
    /// An enqueue failed, row marked failed.
    pub failed: usize,
    /// No route for the event type, row marked processed.
    pub skipped: usize,
    /// Left pending for the next poll (claimed elsewhere or a store error).
    pub deferred: usize,
}

/// Result of relaying one row, before the commit.
enum Outcome {
    Processed,
    Failed,
    Skipped,
    NotClaimed,
}

pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn TaskBroker>,
    config: RelayConfig,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn OutboxStore>, broker: Arc<dyn TaskBroker>) -> Self {
        Self::with_config(store, broker, RelayConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn TaskBroker>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }

    /// Polls until `shutdown` flips to true. The batch in progress finishes;
    /// no new batch starts.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut poll = time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = time::interval(self.config.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Outbox relay started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Outbox relay stopped");
                        return;
                    }
                }
                _ = poll.tick() => {
                    match self.poll_once().await {
                        Ok(report) if report.fetched > 0 => {
                            tracing::debug!(
                                fetched = report.fetched,
                                processed = report.processed,
                                failed = report.failed,
                                skipped = report.skipped,
                                deferred = report.deferred,
                                "Relay batch done"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "Relay poll failed, retrying next tick"),
                    }
                }
                _ = cleanup.tick() => {
                    self.cleanup().await;
                }
            }
        }
    }

    /// Relays one batch of pending rows, oldest first.
    pub async fn poll_once(&self) -> Result<RelayReport, DomainError> {
        let events = self.store.fetch_pending(self.config.batch_size).await?;
        let mut report = RelayReport {
            fetched: events.len(),
            ..RelayReport::default()
        };

        for event in &events {
            match self.relay_event(event).await {
                Ok(Outcome::Processed) => report.processed += 1,
                Ok(Outcome::Failed) => report.failed += 1,
                Ok(Outcome::Skipped) => report.skipped += 1,
                Ok(Outcome::NotClaimed) => report.deferred += 1,
                Err(e) => {
                    tracing::error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        error = %e,
                        "Outbox update failed, event stays pending"
                    );
                    report.deferred += 1;
                }
            }
        }

        Ok(report)
    }

    async fn relay_event(&self, event: &OutboxEvent) -> Result<Outcome, DomainError> {
        let mut tx = self.store.begin().await?;
        if !tx.mark_processing(event.id).await? {
            tracing::debug!(event_id = %event.id, "Event already claimed");
            return Ok(Outcome::NotClaimed);
        }

        let outcome = match route_for(&event.event_type) {
            None => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "No route for event type, skipping"
                );
                tx.mark_processed(event.id).await?;
                Outcome::Skipped
            }
            Some(route) => match self.enqueue_tasks(event, route).await {
                Ok(()) => {
                    tx.mark_processed(event.id).await?;
                    Outcome::Processed
                }
                Err(reason) => {
                    tracing::error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        queue = %route.queue,
                        error = %reason,
                        "Enqueue failed, marking event failed"
                    );
                    tx.mark_failed(event.id, &reason).await?;
                    Outcome::Failed
                }
            },
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Enqueues one task per routed type. Stops at the first failure.
    async fn enqueue_tasks(&self, event: &OutboxEvent, route: &TaskRoute) -> Result<(), String> {
        let payload = EventTask::from_outbox(event)
            .to_bytes()
            .map_err(|e| e.to_string())?;

        for task_type in route.task_types {
            let task_id = self
                .broker
                .enqueue(Task::new(*task_type, payload.clone()), route.queue)
                .await
                .map_err(|e| e.to_string())?;
            tracing::debug!(
                event_id = %event.id,
                task_id = %task_id,
                task_type = %task_type,
                queue = %route.queue,
                "Task enqueued"
            );
        }
        Ok(())
    }

    /// Purges processed rows past the retention window.
    pub async fn cleanup(&self) -> Option<u64> {
        let before = Timestamp::now().minus_secs(self.config.retention.as_secs() as i64);
        match self.store.cleanup_processed(before).await {
            Ok(removed) => {
                if removed > 0 {
                    tracing::info!(removed, "Purged processed outbox rows");
                }
                Some(removed)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Outbox cleanup failed");
                None
            }
        }
    }
}
