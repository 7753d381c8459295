//! TaskHandler port - code the worker pool runs for one task type.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::foundation::{DomainError, ErrorCode};
use crate::domain::tasks::TaskMessage;

/// Failure of a single task execution.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// Worth another attempt after backoff.
    #[error("{0}")]
    Retryable(String),

    /// Will fail the same way every time; dead-letter at once.
    #[error("{0}")]
    Permanent(String),
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Retryable(_))
    }
}

impl From<DomainError> for TaskError {
    fn from(err: DomainError) -> Self {
        match err.code {
            ErrorCode::InvalidPayload | ErrorCode::ValidationFailed => {
                TaskError::Permanent(err.to_string())
            }
            _ => TaskError::Retryable(err.to_string()),
        }
    }
}

/// Handles tasks of one exact type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskMessage) -> Result<(), TaskError>;

    /// Handler name for logging.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_payloads_are_permanent() {
        let err: TaskError = DomainError::new(ErrorCode::InvalidPayload, "bad json").into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn infrastructure_errors_are_retryable() {
        let err: TaskError = DomainError::new(ErrorCode::CacheError, "redis down").into();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "[CACHE_ERROR] redis down");
    }
}
