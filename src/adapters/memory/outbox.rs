//! In-memory outbox with real transaction semantics.
//!
//! # Testing only
//!
//! Uses `.expect()` on lock operations, which panics if a lock is poisoned.
//! Production deployments use `PostgresOutboxStore`.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::domain::foundation::{DomainError, ErrorCode, OutboxEventId, Timestamp};
use crate::domain::outbox::{NewOutboxEvent, OutboxEvent, OutboxStatus};
use crate::ports::{OutboxStore, OutboxTransaction};

#[derive(Debug, Default)]
struct OutboxTable {
    next_id: i64,
    rows: BTreeMap<OutboxEventId, OutboxEvent>,
}

/// Outbox table held in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutboxStore {
    table: Arc<Mutex<OutboxTable>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a business transaction that can record outbox rows.
    pub fn begin_write(&self) -> InMemoryWriteTransaction {
        InMemoryWriteTransaction {
            table: self.table.clone(),
            staged: Vec::new(),
        }
    }

    /// Records a single event in its own committed transaction.
    pub fn insert(&self, new: NewOutboxEvent) -> OutboxEvent {
        let mut tx = self.begin_write();
        let event = tx.create(new);
        tx.commit();
        event
    }

    // === Test Helpers ===

    /// Makes every store call fail as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn get(&self, id: OutboxEventId) -> Option<OutboxEvent> {
        self.lock().rows.get(&id).cloned()
    }

    pub fn all(&self) -> Vec<OutboxEvent> {
        self.lock().rows.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OutboxTable> {
        self.table.lock().expect("InMemoryOutboxStore: lock poisoned")
    }

    fn check_available(&self) -> Result<(), DomainError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DomainError::new(
                ErrorCode::DatabaseError,
                "outbox store unavailable",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn fetch_pending(&self, limit: u32) -> Result<Vec<OutboxEvent>, DomainError> {
        self.check_available()?;
        let table = self.lock();
        let mut pending: Vec<OutboxEvent> = table
            .rows
            .values()
            .filter(|e| e.status == OutboxStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn begin(&self) -> Result<Box<dyn OutboxTransaction>, DomainError> {
        self.check_available()?;
        Ok(Box::new(InMemoryOutboxTransaction {
            store: self.clone(),
            working: HashMap::new(),
        }))
    }

    async fn cleanup_processed(&self, before: Timestamp) -> Result<u64, DomainError> {
        self.check_available()?;
        let mut table = self.lock();
        let before_len = table.rows.len();
        table.rows.retain(|_, e| {
            !(e.status == OutboxStatus::Processed && e.processed_at.is_some_and(|at| at < before))
        });
        Ok((before_len - table.rows.len()) as u64)
    }

    async fn count_by_status(&self) -> Result<Vec<(OutboxStatus, i64)>, DomainError> {
        self.check_available()?;
        let table = self.lock();
        let mut counts: HashMap<OutboxStatus, i64> = HashMap::new();
        for row in table.rows.values() {
            *counts.entry(row.status).or_default() += 1;
        }
        let mut counts: Vec<_> = counts.into_iter().collect();
        counts.sort_by_key(|(status, _)| status.as_str());
        Ok(counts)
    }
}

/// Business-side transaction: rows become visible only on `commit`.
#[derive(Debug)]
pub struct InMemoryWriteTransaction {
    table: Arc<Mutex<OutboxTable>>,
    staged: Vec<OutboxEvent>,
}

impl InMemoryWriteTransaction {
    /// Stages a pending row. Ids are drawn immediately, like a sequence.
    pub fn create(&mut self, new: NewOutboxEvent) -> OutboxEvent {
        let id = {
            let mut table = self
                .table
                .lock()
                .expect("InMemoryOutboxStore: lock poisoned");
            table.next_id += 1;
            OutboxEventId::new(table.next_id)
        };
        let event = OutboxEvent::pending(id, new, Timestamp::now());
        self.staged.push(event.clone());
        event
    }

    pub fn commit(self) {
        let mut table = self
            .table
            .lock()
            .expect("InMemoryOutboxStore: lock poisoned");
        for event in self.staged {
            table.rows.insert(event.id, event);
        }
    }

    /// Explicit rollback; dropping has the same effect.
    pub fn rollback(self) {}
}

/// Relay-side transaction over working copies of claimed rows.
struct InMemoryOutboxTransaction {
    store: InMemoryOutboxStore,
    working: HashMap<OutboxEventId, OutboxEvent>,
}

impl InMemoryOutboxTransaction {
    fn working_copy(&mut self, id: OutboxEventId) -> Result<&mut OutboxEvent, DomainError> {
        if !self.working.contains_key(&id) {
            let row = self.store.get(id).ok_or_else(|| {
                DomainError::new(
                    ErrorCode::OutboxEventNotFound,
                    format!("Outbox event {} not found", id),
                )
            })?;
            self.working.insert(id, row);
        }
        self.working.get_mut(&id).ok_or_else(|| {
            DomainError::new(ErrorCode::InternalError, "working copy vanished")
        })
    }
}

#[async_trait]
impl OutboxTransaction for InMemoryOutboxTransaction {
    async fn mark_processing(&mut self, id: OutboxEventId) -> Result<bool, DomainError> {
        self.store.check_available()?;
        let row = self.working_copy(id)?;
        if row.status != OutboxStatus::Pending {
            return Ok(false);
        }
        row.mark_processing()?;
        Ok(true)
    }

    async fn mark_processed(&mut self, id: OutboxEventId) -> Result<(), DomainError> {
        self.store.check_available()?;
        self.working_copy(id)?.mark_processed()
    }

    async fn mark_failed(&mut self, id: OutboxEventId, reason: &str) -> Result<(), DomainError> {
        self.store.check_available()?;
        self.working_copy(id)?.mark_failed(reason)
    }

    async fn commit(self: Box<Self>) -> Result<(), DomainError> {
        self.store.check_available()?;
        let mut table = self.store.lock();
        for (id, row) in self.working {
            table.rows.insert(id, row);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::outbox::EventType;
    use serde_json::json;
    use uuid::Uuid;

    fn new_event(kind: EventType) -> NewOutboxEvent {
        NewOutboxEvent::new("message", Uuid::new_v4(), kind, &json!({"k": 1})).unwrap()
    }

    #[tokio::test]
    async fn rolled_back_write_leaves_no_row() {
        let store = InMemoryOutboxStore::new();
        let mut tx = store.begin_write();
        tx.create(new_event(EventType::MessageCreated));
        tx.rollback();

        assert!(store.is_empty());
        assert!(store.fetch_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropped_write_leaves_no_row() {
        let store = InMemoryOutboxStore::new();
        {
            let mut tx = store.begin_write();
            tx.create(new_event(EventType::MessageCreated));
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn fetch_pending_is_oldest_first_and_bounded() {
        let store = InMemoryOutboxStore::new();
        let first = store.insert(new_event(EventType::MessageCreated));
        let second = store.insert(new_event(EventType::MessageEdited));
        store.insert(new_event(EventType::MessageDeleted));

        let pending = store.fetch_pending(2).await.unwrap();
        assert_eq!(
            pending.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![first.id, second.id]
        );
    }

    #[tokio::test]
    async fn uncommitted_claim_keeps_row_pending() {
        let store = InMemoryOutboxStore::new();
        let event = store.insert(new_event(EventType::MessageCreated));

        {
            let mut tx = store.begin().await.unwrap();
            assert!(tx.mark_processing(event.id).await.unwrap());
            // dropped before mark_processed/commit
        }

        let pending = store.fetch_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 0);
    }

    #[tokio::test]
    async fn committed_lifecycle_is_terminal() {
        let store = InMemoryOutboxStore::new();
        let event = store.insert(new_event(EventType::MessageCreated));

        let mut tx = store.begin().await.unwrap();
        assert!(tx.mark_processing(event.id).await.unwrap());
        tx.mark_processed(event.id).await.unwrap();
        tx.commit().await.unwrap();

        let row = store.get(event.id).unwrap();
        assert_eq!(row.status, OutboxStatus::Processed);
        assert_eq!(row.attempts, 1);

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.mark_processing(event.id).await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_processed_rows() {
        let store = InMemoryOutboxStore::new();
        let done = store.insert(new_event(EventType::MessageCreated));
        let waiting = store.insert(new_event(EventType::MessageEdited));

        let mut tx = store.begin().await.unwrap();
        tx.mark_processing(done.id).await.unwrap();
        tx.mark_processed(done.id).await.unwrap();
        tx.commit().await.unwrap();

        let removed = store
            .cleanup_processed(Timestamp::now().plus_millis(1_000))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(done.id).is_none());
        assert!(store.get(waiting.id).is_some());
    }

    #[tokio::test]
    async fn unavailable_store_fails_fetch() {
        let store = InMemoryOutboxStore::new();
        store.set_unavailable(true);
        let err = store.fetch_pending(1).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::DatabaseError);
    }
}
