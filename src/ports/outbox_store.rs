//! OutboxStore port - relay-side access to the transactional outbox.
//!
//! Rows are *written* by business code on its own transaction through the
//! adapter's `create` function. This port covers what the relay needs:
//! reading pending rows and moving each one through its lifecycle inside a
//! short per-event transaction.
//!
//! ## Crash safety
//!
//! `mark_processing` and the terminal mark are staged on the same
//! [`OutboxTransaction`]. If the relay dies before `commit`, the row is
//! still `pending` and the next poll picks it up again.

use async_trait::async_trait;

use crate::domain::foundation::{DomainError, OutboxEventId, Timestamp};
use crate::domain::outbox::{OutboxEvent, OutboxStatus};

/// Relay-side view of the outbox table.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` rows with status `pending`, oldest first.
    async fn fetch_pending(&self, limit: u32) -> Result<Vec<OutboxEvent>, DomainError>;

    /// Opens a unit of work for lifecycle updates.
    async fn begin(&self) -> Result<Box<dyn OutboxTransaction>, DomainError>;

    /// Deletes processed rows created before `before`. Returns rows removed.
    async fn cleanup_processed(&self, before: Timestamp) -> Result<u64, DomainError>;

    /// Row counts per status, for diagnostics.
    async fn count_by_status(&self) -> Result<Vec<(OutboxStatus, i64)>, DomainError>;
}

/// Staged lifecycle updates. Dropping without `commit` discards them.
#[async_trait]
pub trait OutboxTransaction: Send {
    /// Claims a pending row: status becomes `processing`, attempts += 1.
    ///
    /// Returns false if the row is no longer pending (another relay
    /// instance got there first).
    async fn mark_processing(&mut self, id: OutboxEventId) -> Result<bool, DomainError>;

    async fn mark_processed(&mut self, id: OutboxEventId) -> Result<(), DomainError>;

    async fn mark_failed(&mut self, id: OutboxEventId, reason: &str) -> Result<(), DomainError>;

    async fn commit(self: Box<Self>) -> Result<(), DomainError>;
}
