//! TaskBroker port - durable priority queues shared by producers and workers.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::domain::foundation::{DomainError, ErrorCode, TaskId};
use crate::domain::tasks::{QueueName, Task, TaskMessage};

/// `last_error` of a task whose worker never settled it.
pub const LEASE_EXPIRED: &str = "lease expired before the task was settled";

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The backing store could not be reached or timed out.
    #[error("Task broker unavailable: {0}")]
    Unavailable(String),

    /// A stored task could not be decoded.
    #[error("Corrupt task {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl BrokerError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

impl From<BrokerError> for DomainError {
    fn from(err: BrokerError) -> Self {
        DomainError::new(ErrorCode::BrokerUnavailable, err.to_string())
    }
}

/// Producer and consumer side of the task queue.
#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// Appends a task to `queue`. Never blocks past the adapter's timeout.
    async fn enqueue(&self, task: Task, queue: QueueName) -> Result<TaskId, BrokerError>;

    /// Pops the oldest task of `queue` and holds it in flight until `lease`
    /// elapses. An expired lease is handed back by [`TaskBroker::recover_expired`].
    async fn dequeue(
        &self,
        queue: QueueName,
        lease: Duration,
    ) -> Result<Option<TaskMessage>, BrokerError>;

    /// Removes a completed task, including any copy requeued after its
    /// lease expired.
    async fn ack(&self, task: &TaskMessage) -> Result<(), BrokerError>;

    /// Parks a failed task until `delay` has passed.
    async fn retry(&self, task: &TaskMessage, delay: Duration) -> Result<(), BrokerError>;

    /// Moves a task to the dead-letter set. It is never run again.
    async fn dead_letter(&self, task: &TaskMessage) -> Result<(), BrokerError>;

    /// Moves retries whose delay has elapsed back to their queue.
    async fn promote_due(&self) -> Result<usize, BrokerError>;

    /// Returns in-flight tasks whose lease expired to their queue, counting
    /// the lost run as a failed attempt.
    async fn recover_expired(&self) -> Result<usize, BrokerError>;

    /// Number of tasks waiting in `queue`.
    async fn queue_depth(&self, queue: QueueName) -> Result<usize, BrokerError>;
}
