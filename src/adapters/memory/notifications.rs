//! In-memory notification repository.
//!
//! # Testing only
//!
//! Uses `.expect()` on lock operations. Production uses
//! `PostgresNotificationRepository`.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::domain::foundation::{DomainError, ErrorCode, NotificationId, UserId};
use crate::domain::notification::Notification;
use crate::ports::NotificationRepository;

#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationRepository {
    rows: Arc<Mutex<Vec<Notification>>>,
    failing_users: Arc<Mutex<HashSet<UserId>>>,
}

impl InMemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects inserts for `user` until cleared.
    pub fn fail_inserts_for(&self, user: UserId) {
        self.failing_users
            .lock()
            .expect("InMemoryNotificationRepository: lock poisoned")
            .insert(user);
    }

    pub fn clear_failures(&self) {
        self.failing_users
            .lock()
            .expect("InMemoryNotificationRepository: lock poisoned")
            .clear();
    }

    pub fn all(&self) -> Vec<Notification> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Notification>> {
        self.rows
            .lock()
            .expect("InMemoryNotificationRepository: lock poisoned")
    }
}

#[async_trait]
impl NotificationRepository for InMemoryNotificationRepository {
    async fn create(&self, notification: &Notification) -> Result<bool, DomainError> {
        let failing = self
            .failing_users
            .lock()
            .expect("InMemoryNotificationRepository: lock poisoned")
            .contains(&notification.user_id);
        if failing {
            return Err(DomainError::new(
                ErrorCode::DatabaseError,
                format!("insert rejected for {}", notification.user_id),
            ));
        }
        let mut rows = self.lock();
        if rows.iter().any(|n| n.id == notification.id) {
            return Ok(false);
        }
        rows.push(notification.clone());
        Ok(true)
    }

    async fn find_by_id(&self, id: &NotificationId) -> Result<Option<Notification>, DomainError> {
        Ok(self.lock().iter().find(|n| n.id == *id).cloned())
    }

    async fn list_for_user(
        &self,
        user: &UserId,
        limit: u32,
    ) -> Result<Vec<Notification>, DomainError> {
        let mut found: Vec<Notification> = self
            .lock()
            .iter()
            .filter(|n| n.user_id == *user)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found.truncate(limit as usize);
        Ok(found)
    }

    async fn mark_read(&self, id: &NotificationId, user: &UserId) -> Result<bool, DomainError> {
        let mut rows = self.lock();
        let row = rows
            .iter_mut()
            .find(|n| n.id == *id && n.user_id == *user)
            .ok_or_else(|| {
                DomainError::new(
                    ErrorCode::NotificationNotFound,
                    format!("Notification {} not found", id),
                )
            })?;
        Ok(row.mark_read())
    }
}
