//! Redis-backed task broker.
//!
//! Layout under the `tasks:` prefix:
//!
//! ```text
//! tasks:{queue}:pending   LIST  task ids, LPUSH in / RPOP out (FIFO)
//! tasks:active            ZSET  ids held by a worker, scored by lease deadline millis
//! tasks:t:{id}            HASH  type, payload, queue, retried, last_error, enqueued_at
//! tasks:retry             ZSET  ids scored by ready-at millis
//! tasks:dead              ZSET  ids scored by dead-letter millis
//! ```

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisResult, Script};
use std::future::Future;
use std::time::Duration;

use crate::domain::foundation::{TaskId, Timestamp};
use crate::domain::tasks::{QueueName, Task, TaskMessage};
use crate::ports::{BrokerError, TaskBroker, LEASE_EXPIRED};

const TASK_PREFIX: &str = "tasks:t:";
const ACTIVE_KEY: &str = "tasks:active";
const RETRY_KEY: &str = "tasks:retry";
const DEAD_KEY: &str = "tasks:dead";
/// Retries promoted (and expired leases recovered) per promoter pass.
const PROMOTE_BATCH: usize = 100;

fn pending_key(queue: QueueName) -> String {
    format!("tasks:{}:pending", queue.as_str())
}

fn task_key(id: &str) -> String {
    format!("{}{}", TASK_PREFIX, id)
}

/// Moves the oldest pending id to the active set under a lease and returns
/// it followed by the flattened task hash.
static DEQUEUE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local id = redis.call('RPOP', KEYS[1])
        if not id then
            return {}
        end
        redis.call('ZADD', KEYS[2], tonumber(ARGV[2]), id)
        local result = {id}
        local fields = redis.call('HGETALL', ARGV[1] .. id)
        for i = 1, #fields do
            result[#result + 1] = fields[i]
        end
        return result
        "#,
    )
});

/// Moves due retries back onto their queue's pending list.
static PROMOTE_DUE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
        local promoted = 0
        for _, id in ipairs(due) do
            redis.call('ZREM', KEYS[1], id)
            local queue = redis.call('HGET', ARGV[3] .. id, 'queue')
            if queue then
                redis.call('LPUSH', 'tasks:' .. queue .. ':pending', id)
                promoted = promoted + 1
            end
        end
        return promoted
        "#,
    )
});

/// Requeues ids whose lease has passed, recording the lost run as a failure.
/// Ids whose hash is gone were settled meanwhile and are only dropped.
static RECOVER_EXPIRED: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
        local recovered = 0
        for _, id in ipairs(expired) do
            redis.call('ZREM', KEYS[1], id)
            local key = ARGV[3] .. id
            local queue = redis.call('HGET', key, 'queue')
            if queue then
                redis.call('HINCRBY', key, 'retried', 1)
                redis.call('HSET', key, 'last_error', ARGV[4])
                redis.call('LPUSH', 'tasks:' .. queue .. ':pending', id)
                recovered = recovered + 1
            end
        end
        return recovered
        "#,
    )
});

#[derive(Clone)]
pub struct RedisTaskBroker {
    conn: MultiplexedConnection,
    timeout: Duration,
}

impl RedisTaskBroker {
    pub fn new(conn: MultiplexedConnection, timeout: Duration) -> Self {
        Self { conn, timeout }
    }

    /// Bounds a Redis call by the configured timeout.
    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = RedisResult<T>>,
    ) -> Result<T, BrokerError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(BrokerError::unavailable(format!("{}: {}", op, e))),
            Err(_) => Err(BrokerError::unavailable(format!(
                "{}: timed out after {:?}",
                op, self.timeout
            ))),
        }
    }

    /// Records the failure bookkeeping and parks the id in `zset`.
    async fn park(&self, task: &TaskMessage, zset: &str, score: i64) -> Result<(), BrokerError> {
        let id = task.id.to_string();
        let key = task_key(&id);
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrem(ACTIVE_KEY, &id)
            .ignore()
            .lrem(pending_key(task.queue), 0, &id)
            .ignore()
            .hset(&key, "retried", task.retried)
            .ignore();
        match &task.last_error {
            Some(err) => pipe.hset(&key, "last_error", err).ignore(),
            None => pipe.hdel(&key, "last_error").ignore(),
        };
        pipe.zadd(zset, &id, score).ignore();
        self.bounded("park task", pipe.query_async::<_, ()>(&mut conn))
            .await
    }
}

impl std::fmt::Debug for RedisTaskBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTaskBroker")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Rebuilds a task from `[id, field, value, field, value, ...]`.
fn decode_task(raw: Vec<Vec<u8>>) -> Result<TaskMessage, BrokerError> {
    let mut iter = raw.into_iter();
    let id_bytes = iter.next().unwrap_or_default();
    let id_text = String::from_utf8_lossy(&id_bytes).into_owned();
    let corrupt = |reason: &str| BrokerError::Corrupt {
        id: id_text.clone(),
        reason: reason.to_string(),
    };

    let mut task_type = None;
    let mut payload = None;
    let mut queue = None;
    let mut retried = 0;
    let mut last_error = None;
    let mut enqueued_at = None;

    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
        let text = || String::from_utf8(value.clone()).map_err(|_| corrupt("non-utf8 field"));
        match field.as_slice() {
            b"type" => task_type = Some(text()?),
            b"payload" => payload = Some(value.clone()),
            b"queue" => {
                queue = Some(
                    text()?
                        .parse::<QueueName>()
                        .map_err(|_| corrupt("unknown queue"))?,
                )
            }
            b"retried" => retried = text()?.parse().map_err(|_| corrupt("bad retried"))?,
            b"last_error" => last_error = Some(text()?),
            b"enqueued_at" => {
                enqueued_at = Some(Timestamp::from_unix_millis(
                    text()?.parse().map_err(|_| corrupt("bad enqueued_at"))?,
                ))
            }
            _ => {}
        }
    }

    Ok(TaskMessage {
        id: id_text.parse().map_err(|_| corrupt("bad id"))?,
        task_type: task_type.ok_or_else(|| corrupt("missing type"))?,
        payload: payload.ok_or_else(|| corrupt("missing payload"))?,
        queue: queue.ok_or_else(|| corrupt("missing queue"))?,
        retried,
        last_error,
        enqueued_at: enqueued_at.unwrap_or_else(Timestamp::now),
    })
}

#[async_trait]
impl TaskBroker for RedisTaskBroker {
    async fn enqueue(&self, task: Task, queue: QueueName) -> Result<TaskId, BrokerError> {
        let msg = TaskMessage::new(task, queue);
        let id = msg.id.to_string();
        let fields: Vec<(&str, Vec<u8>)> = vec![
            ("type", msg.task_type.clone().into_bytes()),
            ("payload", msg.payload.clone()),
            ("queue", queue.as_str().as_bytes().to_vec()),
            ("retried", b"0".to_vec()),
            (
                "enqueued_at",
                msg.enqueued_at.as_unix_millis().to_string().into_bytes(),
            ),
        ];

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(task_key(&id), &fields)
            .ignore()
            .lpush(pending_key(queue), &id)
            .ignore();
        self.bounded("enqueue", pipe.query_async::<_, ()>(&mut conn))
            .await?;
        Ok(msg.id)
    }

    async fn dequeue(
        &self,
        queue: QueueName,
        lease: Duration,
    ) -> Result<Option<TaskMessage>, BrokerError> {
        let deadline = Timestamp::now().as_unix_millis() + lease.as_millis() as i64;
        let mut conn = self.conn.clone();
        let mut invocation = DEQUEUE.prepare_invoke();
        invocation
            .key(pending_key(queue))
            .key(ACTIVE_KEY)
            .arg(TASK_PREFIX)
            .arg(deadline);
        let raw: Vec<Vec<u8>> = self
            .bounded("dequeue", invocation.invoke_async(&mut conn))
            .await?;
        if raw.is_empty() {
            return Ok(None);
        }

        match decode_task(raw) {
            Ok(msg) => Ok(Some(msg)),
            Err(err) => {
                if let BrokerError::Corrupt { id, .. } = &err {
                    let mut conn = self.conn.clone();
                    let mut pipe = redis::pipe();
                    pipe.zrem(ACTIVE_KEY, id)
                        .ignore()
                        .zadd(DEAD_KEY, id, Timestamp::now().as_unix_millis())
                        .ignore();
                    self.bounded("quarantine corrupt task", pipe.query_async::<_, ()>(&mut conn))
                        .await?;
                }
                Err(err)
            }
        }
    }

    async fn ack(&self, task: &TaskMessage) -> Result<(), BrokerError> {
        let id = task.id.to_string();
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrem(ACTIVE_KEY, &id)
            .ignore()
            .lrem(pending_key(task.queue), 0, &id)
            .ignore()
            .zrem(RETRY_KEY, &id)
            .ignore()
            .del(task_key(&id))
            .ignore();
        self.bounded("ack", pipe.query_async::<_, ()>(&mut conn))
            .await
    }

    async fn retry(&self, task: &TaskMessage, delay: Duration) -> Result<(), BrokerError> {
        let ready_at = Timestamp::now().as_unix_millis() + delay.as_millis() as i64;
        self.park(task, RETRY_KEY, ready_at).await
    }

    async fn dead_letter(&self, task: &TaskMessage) -> Result<(), BrokerError> {
        self.park(task, DEAD_KEY, Timestamp::now().as_unix_millis())
            .await
    }

    async fn promote_due(&self) -> Result<usize, BrokerError> {
        let mut conn = self.conn.clone();
        let mut invocation = PROMOTE_DUE.prepare_invoke();
        invocation
            .key(RETRY_KEY)
            .arg(Timestamp::now().as_unix_millis())
            .arg(PROMOTE_BATCH)
            .arg(TASK_PREFIX);
        self.bounded("promote retries", invocation.invoke_async(&mut conn))
            .await
    }

    async fn recover_expired(&self) -> Result<usize, BrokerError> {
        let mut conn = self.conn.clone();
        let mut invocation = RECOVER_EXPIRED.prepare_invoke();
        invocation
            .key(ACTIVE_KEY)
            .arg(Timestamp::now().as_unix_millis())
            .arg(PROMOTE_BATCH)
            .arg(TASK_PREFIX)
            .arg(LEASE_EXPIRED);
        self.bounded("recover expired leases", invocation.invoke_async(&mut conn))
            .await
    }

    async fn queue_depth(&self, queue: QueueName) -> Result<usize, BrokerError> {
        let mut conn = self.conn.clone();
        self.bounded("queue depth", conn.llen(pending_key(queue)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tasks::task_types;

    fn raw(fields: &[(&str, &str)]) -> Vec<Vec<u8>> {
        let mut out = vec![b"6f1c1b1e-6c57-4a4e-9c1a-2f5b8e0d9a11".to_vec()];
        for (k, v) in fields {
            out.push(k.as_bytes().to_vec());
            out.push(v.as_bytes().to_vec());
        }
        out
    }

    #[test]
    fn decodes_flattened_hash() {
        let msg = decode_task(raw(&[
            ("type", task_types::PROJECT_MESSAGE),
            ("payload", "{}"),
            ("queue", "low"),
            ("retried", "2"),
            ("last_error", "boom"),
            ("enqueued_at", "1700000000000"),
        ]))
        .unwrap();

        assert_eq!(msg.task_type, task_types::PROJECT_MESSAGE);
        assert_eq!(msg.queue, QueueName::Low);
        assert_eq!(msg.retried, 2);
        assert_eq!(msg.last_error.as_deref(), Some("boom"));
        assert_eq!(msg.payload, b"{}".to_vec());
    }

    #[test]
    fn missing_fields_are_corrupt() {
        let err = decode_task(raw(&[("type", "x")])).unwrap_err();
        assert!(matches!(err, BrokerError::Corrupt { .. }));
    }

    #[test]
    fn pending_keys_use_queue_names() {
        assert_eq!(pending_key(QueueName::Critical), "tasks:critical:pending");
        assert_eq!(task_key("abc"), "tasks:t:abc");
    }

    #[tokio::test]
    #[ignore = "requires Redis (REDIS_URL)"]
    async fn enqueue_dequeue_ack_cycle() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let client = redis::Client::open(url).expect("client");
        let conn = client.get_multiplexed_tokio_connection().await.expect("conn");
        let broker = RedisTaskBroker::new(conn, Duration::from_secs(2));

        let id = broker
            .enqueue(
                Task::new(task_types::NOTIFY_CLASS_INVITE, b"{}".to_vec()),
                QueueName::Default,
            )
            .await
            .unwrap();
        let msg = broker
            .dequeue(QueueName::Default, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.id, id);
        broker.ack(&msg).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis (REDIS_URL)"]
    async fn expired_lease_is_requeued() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let client = redis::Client::open(url).expect("client");
        let conn = client.get_multiplexed_tokio_connection().await.expect("conn");
        let broker = RedisTaskBroker::new(conn, Duration::from_secs(2));

        let id = broker
            .enqueue(
                Task::new(task_types::NOTIFY_NEW_MESSAGE, b"{}".to_vec()),
                QueueName::Low,
            )
            .await
            .unwrap();
        broker
            .dequeue(QueueName::Low, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(broker.recover_expired().await.unwrap() >= 1);
        let again = broker
            .dequeue(QueueName::Low, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.retried, 1);
        broker.ack(&again).await.unwrap();
    }
}
