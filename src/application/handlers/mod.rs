//! Task handlers.
//!
//! Each handler is registered on the task server under one or more task
//! types and receives the originating event as an `EventTask`.

mod notification_handler;
mod projection_handler;

pub use notification_handler::{NotificationHandler, NOTIFICATION_EVENT};
pub use projection_handler::ProjectionHandler;

use std::sync::Arc;

use super::task_server::TaskServer;
use crate::domain::tasks::task_types;

/// Registers both handlers under every task type the relay routes to.
pub fn register_handlers(
    server: &mut TaskServer,
    projections: Arc<ProjectionHandler>,
    notifications: Arc<NotificationHandler>,
) {
    server.register(task_types::PROJECT_MESSAGE, projections.clone());
    server.register(task_types::PROJECT_CONVERSATION, projections);
    server.register(task_types::NOTIFY_NEW_MESSAGE, notifications.clone());
    server.register(task_types::NOTIFY_CLASS_INVITE, notifications);
}
