//! Tasks as seen by producers and by the worker pool.

use serde::{Deserialize, Serialize};

use super::QueueName;
use crate::domain::foundation::{TaskId, Timestamp};

/// Task type names. Handlers are looked up by exact match.
pub mod task_types {
    pub const PROJECT_MESSAGE: &str = "project:message";
    pub const PROJECT_CONVERSATION: &str = "project:conversation";
    pub const NOTIFY_NEW_MESSAGE: &str = "notify:new_message";
    pub const NOTIFY_CLASS_INVITE: &str = "notify:class_invite";
}

/// A unit of work to enqueue: a type name plus opaque payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    task_type: String,
    payload: Vec<u8>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
        }
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// A task as stored by the broker, with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: TaskId,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub queue: QueueName,
    /// Number of failed attempts so far.
    pub retried: u32,
    pub last_error: Option<String>,
    pub enqueued_at: Timestamp,
}

impl TaskMessage {
    pub fn new(task: Task, queue: QueueName) -> Self {
        Self {
            id: TaskId::new(),
            task_type: task.task_type,
            payload: task.payload,
            queue,
            retried: 0,
            last_error: None,
            enqueued_at: Timestamp::now(),
        }
    }

    /// 1-based number of the attempt currently being executed.
    pub fn attempt(&self) -> u32 {
        self.retried + 1
    }

    /// Records a failed attempt and its cause.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.retried += 1;
        self.last_error = Some(error.into());
    }
}
