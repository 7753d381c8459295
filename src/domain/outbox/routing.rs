//! Static event → task routing table used by the relay.

use super::EventType;
use crate::domain::tasks::{task_types, QueueName};

/// Where one event type goes: the tasks it fans out to and their queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRoute {
    pub event_type: EventType,
    pub task_types: &'static [&'static str],
    pub queue: QueueName,
}

const PROJECT_AND_NOTIFY: &[&str] = &[task_types::PROJECT_MESSAGE, task_types::NOTIFY_NEW_MESSAGE];
const PROJECT_MESSAGE: &[&str] = &[task_types::PROJECT_MESSAGE];
const PROJECT_CONVERSATION: &[&str] = &[task_types::PROJECT_CONVERSATION];
const NOTIFY_CLASS_INVITE: &[&str] = &[task_types::NOTIFY_CLASS_INVITE];

/// Every routed event type. Types absent here are skipped by the relay.
pub const ROUTES: &[TaskRoute] = &[
    TaskRoute {
        event_type: EventType::MessageCreated,
        task_types: PROJECT_AND_NOTIFY,
        queue: QueueName::Critical,
    },
    TaskRoute {
        event_type: EventType::MessageEdited,
        task_types: PROJECT_MESSAGE,
        queue: QueueName::Low,
    },
    TaskRoute {
        event_type: EventType::MessageDeleted,
        task_types: PROJECT_MESSAGE,
        queue: QueueName::Low,
    },
    TaskRoute {
        event_type: EventType::ConversationCreated,
        task_types: PROJECT_CONVERSATION,
        queue: QueueName::Low,
    },
    TaskRoute {
        event_type: EventType::ParticipantJoined,
        task_types: PROJECT_CONVERSATION,
        queue: QueueName::Low,
    },
    TaskRoute {
        event_type: EventType::ParticipantLeft,
        task_types: PROJECT_CONVERSATION,
        queue: QueueName::Low,
    },
    TaskRoute {
        event_type: EventType::ConversationRead,
        task_types: PROJECT_CONVERSATION,
        queue: QueueName::Low,
    },
    TaskRoute {
        event_type: EventType::ClassCreated,
        task_types: PROJECT_CONVERSATION,
        queue: QueueName::Low,
    },
    TaskRoute {
        event_type: EventType::ClassMemberAdded,
        task_types: NOTIFY_CLASS_INVITE,
        queue: QueueName::Default,
    },
];

/// Looks up the route for a raw event type string.
pub fn route_for(event_type: &str) -> Option<&'static TaskRoute> {
    let kind = EventType::parse(event_type)?;
    ROUTES.iter().find(|r| r.event_type == kind)
}

/// Distinct task types any route can produce.
pub fn routed_task_types() -> Vec<&'static str> {
    let mut types: Vec<&'static str> = ROUTES
        .iter()
        .flat_map(|r| r.task_types.iter().copied())
        .collect();
    types.sort_unstable();
    types.dedup();
    types
}
