//! NotificationRepository port - durable notification storage.

use async_trait::async_trait;

use crate::domain::foundation::{DomainError, NotificationId, UserId};
use crate::domain::notification::Notification;

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Stores `notification`. Returns false, without touching the stored
    /// row, when a notification with the same id already exists.
    async fn create(&self, notification: &Notification) -> Result<bool, DomainError>;

    async fn find_by_id(&self, id: &NotificationId) -> Result<Option<Notification>, DomainError>;

    /// Newest first, at most `limit`.
    async fn list_for_user(
        &self,
        user: &UserId,
        limit: u32,
    ) -> Result<Vec<Notification>, DomainError>;

    /// Sets the read flag. Returns false if it was already read.
    ///
    /// Fails with `NotificationNotFound` when the notification does not
    /// exist or belongs to someone else.
    async fn mark_read(&self, id: &NotificationId, user: &UserId) -> Result<bool, DomainError>;
}
