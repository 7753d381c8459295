//! TaskServer - worker pool that executes queued tasks.
//!
//! ```text
//!            ┌────────── WeightedSchedule (6:3:1) ──────────┐
//!            ▼                    ▼                          ▼
//!   tasks:critical:pending  tasks:default:pending   tasks:low:pending
//!            └──────────────┬──────────────────────────────┘
//!                           ▼
//!                 worker 1..N ─▶ handler[task_type]
//!                           │
//!            ok ─▶ ack      │ err ─▶ retry with backoff ─▶ dead letter
//! ```
//!
//! ## Leases
//!
//! A dequeued task is leased for `task_timeout` plus [`LEASE_MARGIN`]. If the
//! worker dies or cannot settle the task with the broker, the promoter hands
//! it back to its queue once the lease runs out. A task whose lease keeps
//! expiring uses up its attempts like any other failure.
//!
//! Each poll asks the scheduled queue first and falls back to the others by
//! priority, so a worker never idles while any queue has work and `low`
//! still gets one slot in ten under sustained critical load.
//!
//! ## Startup validation
//!
//! [`TaskServer::validate`] rejects a configuration where some routed task
//! type has no handler. A task of an unknown type that still reaches a
//! worker is dead-lettered without running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

use crate::domain::foundation::{DomainError, ErrorCode};
use crate::domain::tasks::{QueueWeights, RetryPolicy, TaskMessage, WeightedSchedule};
use crate::ports::{BrokerError, TaskBroker, TaskError, TaskHandler};

/// Slack between the handler timeout and lease expiry.
pub const LEASE_MARGIN: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct TaskServerConfig {
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// Sleep between polls when every queue is empty. Also the retry
    /// promotion interval.
    pub poll_interval: Duration,
    pub task_timeout: Duration,
    pub retry: RetryPolicy,
    pub weights: QueueWeights,
}

impl Default for TaskServerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            poll_interval: Duration::from_millis(200),
            task_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            weights: QueueWeights::default(),
        }
    }
}

/// Counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskServerStats {
    pub processed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Outcomes the broker did not record; lease recovery redelivers these.
    pub unsettled: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    unsettled: AtomicU64,
}

/// How one execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    Completed,
    Retrying,
    DeadLettered,
    /// The broker call recording the outcome failed.
    Unsettled,
}

pub struct TaskServer {
    broker: Arc<dyn TaskBroker>,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    config: TaskServerConfig,
    schedule: WeightedSchedule,
    tick: AtomicUsize,
    counters: Counters,
}

impl TaskServer {
    pub fn new(broker: Arc<dyn TaskBroker>, config: TaskServerConfig) -> Self {
        let schedule = WeightedSchedule::new(config.weights);
        Self {
            broker,
            handlers: HashMap::new(),
            config,
            schedule,
            tick: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    /// Registers the handler for one exact task type, replacing any previous one.
    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        tracing::debug!(task_type = %task_type, handler = handler.name(), "Registered task handler");
        self.handlers.insert(task_type, handler);
    }

    pub fn has_handler(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Fails if any of `required` has no registered handler.
    pub fn validate(&self, required: &[&str]) -> Result<(), DomainError> {
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|t| !self.has_handler(t))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(DomainError::new(
            ErrorCode::ValidationFailed,
            format!("No handler registered for task types: {}", missing.join(", ")),
        ))
    }

    pub fn stats(&self) -> TaskServerStats {
        TaskServerStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            unsettled: self.counters.unsettled.load(Ordering::Relaxed),
        }
    }

    fn lease(&self) -> Duration {
        self.config.task_timeout + LEASE_MARGIN
    }

    /// Runs the workers and the retry promoter until `shutdown` flips to
    /// true. In-flight tasks finish before this returns.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        tracing::info!(
            concurrency = self.config.concurrency,
            handlers = self.handlers.len(),
            "Task server started"
        );

        let mut workers = Vec::with_capacity(self.config.concurrency + 1);
        for index in 0..self.config.concurrency.max(1) {
            workers.push(tokio::spawn(self.clone().worker(index, shutdown.clone())));
        }
        workers.push(tokio::spawn(self.clone().promoter(shutdown)));

        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Task server worker ended abnormally");
            }
        }

        let stats = self.stats();
        tracing::info!(
            processed = stats.processed,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered,
            unsettled = stats.unsettled,
            "Task server stopped"
        );
    }

    async fn worker(self: Arc<Self>, index: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.process_next().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    tracing::warn!(worker = index, error = %e, "Dequeue failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!(worker = index, "Worker stopped");
    }

    async fn promoter(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Promotes due retries and recovers expired leases.
    pub async fn sweep(&self) {
        match self.broker.promote_due().await {
            Ok(0) => {}
            Ok(n) => tracing::debug!(promoted = n, "Promoted due retries"),
            Err(e) => tracing::warn!(error = %e, "Retry promotion failed"),
        }
        match self.broker.recover_expired().await {
            Ok(0) => {}
            Ok(n) => tracing::warn!(recovered = n, "Recovered tasks with expired leases"),
            Err(e) => tracing::warn!(error = %e, "Lease recovery failed"),
        }
    }

    /// Pulls the next task by weighted priority.
    pub async fn next_task(&self) -> Result<Option<TaskMessage>, BrokerError> {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        for queue in self.schedule.order_for(tick) {
            if let Some(task) = self.broker.dequeue(queue, self.lease()).await? {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Pulls and executes one task. `None` if every queue was empty.
    pub async fn process_next(&self) -> Result<Option<Execution>, BrokerError> {
        match self.next_task().await? {
            Some(task) => Ok(Some(self.execute(task).await)),
            None => Ok(None),
        }
    }

    /// Runs one task through its handler and settles it with the broker.
    pub async fn execute(&self, mut task: TaskMessage) -> Execution {
        let Some(handler) = self.handlers.get(&task.task_type).cloned() else {
            task.record_failure(format!("no handler registered for {}", task.task_type));
            return self.bury(&task).await;
        };

        if !self.config.retry.should_retry(task.retried) {
            // Only lease recovery hands out a task with no attempts left.
            return self.bury(&task).await;
        }

        tracing::debug!(
            task_id = %task.id,
            task_type = %task.task_type,
            queue = %task.queue,
            attempt = task.attempt(),
            "Executing task"
        );

        match self.invoke(handler, &task).await {
            Ok(()) => match self.broker.ack(&task).await {
                Ok(()) => {
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                    Execution::Completed
                }
                Err(e) => self.unsettled(&task, "ack", &e),
            },
            Err(err) => {
                task.record_failure(err.to_string());
                if err.is_retryable() && self.config.retry.should_retry(task.retried) {
                    let delay = self.config.retry.backoff(task.retried);
                    tracing::warn!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        attempt = task.retried,
                        max_attempts = self.config.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Task failed, scheduling retry"
                    );
                    match self.broker.retry(&task, delay).await {
                        Ok(()) => {
                            self.counters.retried.fetch_add(1, Ordering::Relaxed);
                            Execution::Retrying
                        }
                        Err(e) => self.unsettled(&task, "retry", &e),
                    }
                } else {
                    self.bury(&task).await
                }
            }
        }
    }

    /// Calls the handler on its own task so a panic or a timeout counts as a
    /// failed attempt instead of killing the worker.
    async fn invoke(
        &self,
        handler: Arc<dyn TaskHandler>,
        task: &TaskMessage,
    ) -> Result<(), TaskError> {
        let owned = task.clone();
        let run = tokio::spawn(async move { handler.handle(&owned).await });
        let abort = run.abort_handle();

        match time::timeout(self.config.task_timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(TaskError::Retryable(format!("handler panicked: {}", join))),
            Err(_) => {
                abort.abort();
                Err(TaskError::Retryable(format!(
                    "timed out after {}s",
                    self.config.task_timeout.as_secs()
                )))
            }
        }
    }

    async fn bury(&self, task: &TaskMessage) -> Execution {
        tracing::error!(
            task_id = %task.id,
            task_type = %task.task_type,
            queue = %task.queue,
            attempts = task.retried,
            error = task.last_error.as_deref().unwrap_or_default(),
            "Task dead-lettered"
        );
        match self.broker.dead_letter(task).await {
            Ok(()) => {
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                Execution::DeadLettered
            }
            Err(e) => self.unsettled(task, "dead-letter", &e),
        }
    }

    /// The task stays leased; recovery returns it once the lease expires.
    fn unsettled(&self, task: &TaskMessage, op: &'static str, err: &BrokerError) -> Execution {
        tracing::error!(
            task_id = %task.id,
            task_type = %task.task_type,
            op,
            lease_secs = self.lease().as_secs(),
            error = %err,
            "Failed to settle task, awaiting lease recovery"
        );
        self.counters.unsettled.fetch_add(1, Ordering::Relaxed);
        Execution::Unsettled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryTaskBroker;
    use crate::domain::tasks::{QueueName, Task};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fails the first `failures` calls with the given error, then succeeds.
    struct ScriptedHandler {
        failures: AtomicUsize,
        error: TaskError,
        seen: Mutex<Vec<TaskMessage>>,
    }

    impl ScriptedHandler {
        fn ok() -> Arc<Self> {
            Self::failing(0, TaskError::Retryable(String::new()))
        }

        fn failing(failures: usize, error: TaskError) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicUsize::new(failures),
                error,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TaskHandler for ScriptedHandler {
        async fn handle(&self, task: &TaskMessage) -> Result<(), TaskError> {
            self.seen.lock().unwrap().push(task.clone());
            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }

        fn name(&self) -> &'static str {
            "ScriptedHandler"
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl TaskHandler for SlowHandler {
        async fn handle(&self, _task: &TaskMessage) -> Result<(), TaskError> {
            time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "SlowHandler"
        }
    }

    fn server(broker: &InMemoryTaskBroker) -> TaskServer {
        TaskServer::new(
            Arc::new(broker.clone()),
            TaskServerConfig {
                concurrency: 2,
                poll_interval: Duration::from_millis(5),
                task_timeout: Duration::from_secs(1),
                retry: RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1)),
                weights: QueueWeights::default(),
            },
        )
    }

    async fn enqueue(broker: &InMemoryTaskBroker, task_type: &str, queue: QueueName) {
        broker
            .enqueue(Task::new(task_type, b"{}".to_vec()), queue)
            .await
            .unwrap();
    }

    #[test]
    fn validate_reports_missing_handlers() {
        let broker = InMemoryTaskBroker::new();
        let mut server = server(&broker);
        server.register("a", ScriptedHandler::ok());

        assert!(server.validate(&["a"]).is_ok());
        let err = server.validate(&["a", "b", "c"]).unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
        assert!(err.message.contains("b, c"));
    }

    #[tokio::test]
    async fn success_acks_and_counts() {
        let broker = InMemoryTaskBroker::new();
        let handler = ScriptedHandler::ok();
        let mut server = server(&broker);
        server.register("a", handler.clone());
        enqueue(&broker, "a", QueueName::Default).await;

        assert_eq!(server.process_next().await.unwrap(), Some(Execution::Completed));
        assert_eq!(server.process_next().await.unwrap(), None);
        assert_eq!(handler.calls(), 1);
        assert_eq!(broker.completed().len(), 1);
        assert_eq!(server.stats().processed, 1);
    }

    #[tokio::test]
    async fn critical_work_is_taken_first() {
        let broker = InMemoryTaskBroker::new();
        let handler = ScriptedHandler::ok();
        let mut server = server(&broker);
        server.register("low", handler.clone());
        server.register("critical", handler.clone());
        enqueue(&broker, "low", QueueName::Low).await;
        enqueue(&broker, "critical", QueueName::Critical).await;

        let first = server.next_task().await.unwrap().unwrap();
        assert_eq!(first.queue, QueueName::Critical);
        let second = server.next_task().await.unwrap().unwrap();
        assert_eq!(second.queue, QueueName::Low);
    }

    #[tokio::test]
    async fn low_queue_is_not_starved() {
        let broker = InMemoryTaskBroker::new();
        let server = server(&broker);
        for _ in 0..20 {
            enqueue(&broker, "c", QueueName::Critical).await;
        }
        enqueue(&broker, "l", QueueName::Low).await;

        let mut polls = 0;
        loop {
            polls += 1;
            let task = server.next_task().await.unwrap().unwrap();
            if task.queue == QueueName::Low {
                break;
            }
        }
        assert!(polls <= 10, "low waited {} polls", polls);
    }

    #[tokio::test]
    async fn retryable_failure_is_rescheduled_then_dead_lettered() {
        let broker = InMemoryTaskBroker::new();
        let handler = ScriptedHandler::failing(10, TaskError::Retryable("redis down".into()));
        let mut server = server(&broker);
        server.register("a", handler.clone());
        enqueue(&broker, "a", QueueName::Critical).await;

        let task = server.next_task().await.unwrap().unwrap();
        assert_eq!(server.execute(task).await, Execution::Retrying);
        assert_eq!(broker.scheduled_count(), 1);

        // Third and final attempt.
        let mut last = TaskMessage::new(Task::new("a", vec![]), QueueName::Critical);
        last.retried = 2;
        assert_eq!(server.execute(last).await, Execution::DeadLettered);

        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retried, 3);
        assert_eq!(dead[0].last_error.as_deref(), Some("redis down"));
        assert_eq!(server.stats().retried, 1);
        assert_eq!(server.stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries() {
        let broker = InMemoryTaskBroker::new();
        let mut server = server(&broker);
        server.register(
            "a",
            ScriptedHandler::failing(1, TaskError::Permanent("bad payload".into())),
        );
        enqueue(&broker, "a", QueueName::Low).await;

        assert_eq!(
            server.process_next().await.unwrap(),
            Some(Execution::DeadLettered)
        );
        assert_eq!(broker.scheduled_count(), 0);
        assert_eq!(broker.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn unknown_task_type_is_dead_lettered() {
        let broker = InMemoryTaskBroker::new();
        let server = server(&broker);
        enqueue(&broker, "mystery", QueueName::Default).await;

        assert_eq!(
            server.process_next().await.unwrap(),
            Some(Execution::DeadLettered)
        );
        let dead = broker.dead_letters();
        assert!(dead[0].last_error.as_deref().unwrap().contains("mystery"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out_as_retryable() {
        let broker = InMemoryTaskBroker::new();
        let mut server = server(&broker);
        server.register("slow", Arc::new(SlowHandler));
        enqueue(&broker, "slow", QueueName::Default).await;

        assert_eq!(server.process_next().await.unwrap(), Some(Execution::Retrying));
        assert_eq!(broker.scheduled_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn broker_outage_during_settlement_is_recovered() {
        let broker = InMemoryTaskBroker::new();
        let handler = ScriptedHandler::failing(1, TaskError::Retryable("blip".into()));
        let mut server = server(&broker);
        server.register("a", handler.clone());
        enqueue(&broker, "a", QueueName::Critical).await;

        let task = server.next_task().await.unwrap().unwrap();
        broker.set_unavailable(true);
        assert_eq!(server.execute(task).await, Execution::Unsettled);
        broker.set_unavailable(false);

        let stats = server.stats();
        assert_eq!(stats.retried, 0);
        assert_eq!(stats.unsettled, 1);
        assert_eq!(broker.active_count(), 1);

        // Still leased: nothing to run yet.
        server.sweep().await;
        assert_eq!(server.process_next().await.unwrap(), None);

        time::advance(server.lease() + Duration::from_millis(1)).await;
        server.sweep().await;
        assert_eq!(broker.active_count(), 0);
        assert_eq!(server.process_next().await.unwrap(), Some(Execution::Completed));

        assert_eq!(handler.calls(), 2);
        assert_eq!(server.stats().processed, 1);
        assert_eq!(
            broker.completed()[0].last_error.as_deref(),
            Some(crate::ports::LEASE_EXPIRED)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ack_is_not_counted_as_processed() {
        let broker = InMemoryTaskBroker::new();
        let handler = ScriptedHandler::ok();
        let mut server = server(&broker);
        server.register("a", handler.clone());
        enqueue(&broker, "a", QueueName::Default).await;

        let task = server.next_task().await.unwrap().unwrap();
        broker.set_unavailable(true);
        assert_eq!(server.execute(task).await, Execution::Unsettled);
        broker.set_unavailable(false);
        assert_eq!(server.stats().processed, 0);

        time::advance(server.lease() * 2).await;
        server.sweep().await;
        assert_eq!(server.process_next().await.unwrap(), Some(Execution::Completed));
        assert_eq!(server.stats().processed, 1);
        assert_eq!(handler.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn lease_that_keeps_expiring_is_dead_lettered() {
        let broker = InMemoryTaskBroker::new();
        let handler = ScriptedHandler::ok();
        let mut server = server(&broker);
        server.register("a", handler.clone());
        enqueue(&broker, "a", QueueName::Low).await;

        // The worker dies three times without settling.
        for _ in 0..3 {
            server.next_task().await.unwrap().unwrap();
            time::advance(server.lease() * 2).await;
            server.sweep().await;
        }

        assert_eq!(server.process_next().await.unwrap(), Some(Execution::DeadLettered));
        assert_eq!(handler.calls(), 0);
        assert_eq!(broker.dead_letters()[0].retried, 3);
    }

    #[tokio::test]
    async fn run_drains_queues_with_retries_and_stops() {
        let broker = InMemoryTaskBroker::new();
        let flaky = ScriptedHandler::failing(1, TaskError::Retryable("blip".into()));
        let mut server = server(&broker);
        server.register("a", flaky.clone());
        for _ in 0..4 {
            enqueue(&broker, "a", QueueName::Default).await;
        }

        let server = Arc::new(server);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(server.clone().run(rx));

        for _ in 0..400 {
            if server.stats().processed == 4 {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        let stats = server.stats();
        assert_eq!(stats.processed, 4);
        assert_eq!(stats.retried, 1);
        assert_eq!(flaky.calls(), 5);
    }
}
