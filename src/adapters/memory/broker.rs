//! In-memory task broker.
//!
//! # Testing only
//!
//! Uses `.expect()` on lock operations. Production uses `RedisTaskBroker`.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::domain::foundation::TaskId;
use crate::domain::tasks::{QueueName, Task, TaskMessage};
use crate::ports::{BrokerError, TaskBroker, LEASE_EXPIRED};

#[derive(Debug, Default)]
struct BrokerState {
    pending: HashMap<QueueName, VecDeque<TaskMessage>>,
    /// In-flight tasks with their lease deadline.
    active: HashMap<TaskId, (Instant, TaskMessage)>,
    scheduled: Vec<(Instant, TaskMessage)>,
    dead: Vec<TaskMessage>,
    completed: Vec<TaskMessage>,
}

/// Broker holding queues in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskBroker {
    state: Arc<Mutex<BrokerState>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryTaskBroker {
    pub fn new() -> Self {
        Self::default()
    }

    // === Test Helpers ===

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Tasks waiting in `queue`, oldest first.
    pub fn pending(&self, queue: QueueName) -> Vec<TaskMessage> {
        self.lock()
            .pending
            .get(&queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn scheduled_count(&self) -> usize {
        self.lock().scheduled.len()
    }

    pub fn dead_letters(&self) -> Vec<TaskMessage> {
        self.lock().dead.clone()
    }

    pub fn completed(&self) -> Vec<TaskMessage> {
        self.lock().completed.clone()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().expect("InMemoryTaskBroker: lock poisoned")
    }

    /// Drops every trace of `id` outside the active map, so a late
    /// settlement cancels a copy requeued by lease recovery.
    fn forget(state: &mut BrokerState, task: &TaskMessage) {
        state.active.remove(&task.id);
        if let Some(queue) = state.pending.get_mut(&task.queue) {
            queue.retain(|m| m.id != task.id);
        }
        state.scheduled.retain(|(_, m)| m.id != task.id);
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::unavailable("in-memory broker switched off"));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskBroker for InMemoryTaskBroker {
    async fn enqueue(&self, task: Task, queue: QueueName) -> Result<TaskId, BrokerError> {
        self.check_available()?;
        let msg = TaskMessage::new(task, queue);
        let id = msg.id;
        self.lock().pending.entry(queue).or_default().push_back(msg);
        Ok(id)
    }

    async fn dequeue(
        &self,
        queue: QueueName,
        lease: Duration,
    ) -> Result<Option<TaskMessage>, BrokerError> {
        self.check_available()?;
        let mut state = self.lock();
        let next = state.pending.get_mut(&queue).and_then(|q| q.pop_front());
        if let Some(msg) = &next {
            state
                .active
                .insert(msg.id, (Instant::now() + lease, msg.clone()));
        }
        Ok(next)
    }

    async fn ack(&self, task: &TaskMessage) -> Result<(), BrokerError> {
        self.check_available()?;
        let mut state = self.lock();
        Self::forget(&mut state, task);
        state.completed.push(task.clone());
        Ok(())
    }

    async fn retry(&self, task: &TaskMessage, delay: Duration) -> Result<(), BrokerError> {
        self.check_available()?;
        let mut state = self.lock();
        Self::forget(&mut state, task);
        state.scheduled.push((Instant::now() + delay, task.clone()));
        Ok(())
    }

    async fn dead_letter(&self, task: &TaskMessage) -> Result<(), BrokerError> {
        self.check_available()?;
        let mut state = self.lock();
        Self::forget(&mut state, task);
        state.dead.push(task.clone());
        Ok(())
    }

    async fn promote_due(&self) -> Result<usize, BrokerError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.lock();
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.scheduled)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        state.scheduled = waiting;
        let promoted = due.len();
        for (_, msg) in due {
            state.pending.entry(msg.queue).or_default().push_back(msg);
        }
        Ok(promoted)
    }

    async fn recover_expired(&self) -> Result<usize, BrokerError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.lock();
        let expired: Vec<TaskId> = state
            .active
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some((_, mut msg)) = state.active.remove(id) {
                msg.record_failure(LEASE_EXPIRED);
                state.pending.entry(msg.queue).or_default().push_back(msg);
            }
        }
        Ok(expired.len())
    }

    async fn queue_depth(&self, queue: QueueName) -> Result<usize, BrokerError> {
        self.check_available()?;
        Ok(self.lock().pending.get(&queue).map_or(0, |q| q.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tasks::task_types;

    const LEASE: Duration = Duration::from_secs(30);

    fn task() -> Task {
        Task::new(task_types::PROJECT_MESSAGE, b"{}".to_vec())
    }

    #[tokio::test]
    async fn queues_are_fifo_and_independent() {
        let broker = InMemoryTaskBroker::new();
        let a = broker.enqueue(task(), QueueName::Default).await.unwrap();
        let b = broker.enqueue(task(), QueueName::Default).await.unwrap();
        broker.enqueue(task(), QueueName::Low).await.unwrap();

        assert_eq!(broker.dequeue(QueueName::Default, LEASE).await.unwrap().unwrap().id, a);
        assert_eq!(broker.dequeue(QueueName::Default, LEASE).await.unwrap().unwrap().id, b);
        assert!(broker.dequeue(QueueName::Critical, LEASE).await.unwrap().is_none());
        assert_eq!(broker.queue_depth(QueueName::Low).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ack_clears_active_entry() {
        let broker = InMemoryTaskBroker::new();
        broker.enqueue(task(), QueueName::Critical).await.unwrap();
        let msg = broker.dequeue(QueueName::Critical, LEASE).await.unwrap().unwrap();
        assert_eq!(broker.active_count(), 1);

        broker.ack(&msg).await.unwrap();
        assert_eq!(broker.active_count(), 0);
        assert_eq!(broker.completed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retried_task_returns_after_delay() {
        let broker = InMemoryTaskBroker::new();
        broker.enqueue(task(), QueueName::Default).await.unwrap();
        let mut msg = broker.dequeue(QueueName::Default, LEASE).await.unwrap().unwrap();
        msg.record_failure("boom");
        broker.retry(&msg, Duration::from_secs(2)).await.unwrap();

        assert_eq!(broker.promote_due().await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(broker.promote_due().await.unwrap(), 1);

        let again = broker.dequeue(QueueName::Default, LEASE).await.unwrap().unwrap();
        assert_eq!(again.id, msg.id);
        assert_eq!(again.retried, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_returns_task_to_its_queue() {
        let broker = InMemoryTaskBroker::new();
        let id = broker.enqueue(task(), QueueName::Critical).await.unwrap();
        broker.dequeue(QueueName::Critical, LEASE).await.unwrap().unwrap();

        assert_eq!(broker.recover_expired().await.unwrap(), 0);
        tokio::time::advance(LEASE + Duration::from_secs(1)).await;
        assert_eq!(broker.recover_expired().await.unwrap(), 1);
        assert_eq!(broker.active_count(), 0);

        let again = broker.dequeue(QueueName::Critical, LEASE).await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.retried, 1);
        assert_eq!(again.last_error.as_deref(), Some(LEASE_EXPIRED));
    }

    #[tokio::test(start_paused = true)]
    async fn late_ack_cancels_the_recovered_copy() {
        let broker = InMemoryTaskBroker::new();
        broker.enqueue(task(), QueueName::Default).await.unwrap();
        let msg = broker.dequeue(QueueName::Default, LEASE).await.unwrap().unwrap();

        tokio::time::advance(LEASE * 2).await;
        broker.recover_expired().await.unwrap();
        assert_eq!(broker.pending(QueueName::Default).len(), 1);

        broker.ack(&msg).await.unwrap();
        assert!(broker.pending(QueueName::Default).is_empty());
        assert_eq!(broker.completed().len(), 1);
    }

    #[tokio::test]
    async fn unavailable_broker_rejects_enqueue() {
        let broker = InMemoryTaskBroker::new();
        broker.set_unavailable(true);
        let err = broker.enqueue(task(), QueueName::Low).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
    }
}
