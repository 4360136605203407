//! Error types for tool execution gating.

use serde::{Deserialize, Serialize};
use tg_auth::UserId;
use thiserror::Error;

use crate::model::ExecutionStatus;

pub type GateResult<T> = Result<T, GateError>;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Approval request not found: {0}")]
    ApprovalNotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid transition for execution {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("Approval workflow unavailable")]
    ApprovalUnavailable,

    #[error("Policy configuration error: {0}")]
    PolicyConfig(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl GateError {
    /// Stable machine-readable code for transport status mapping.
    pub fn code(&self) -> &'static str {
        match self {
            GateError::PermissionDenied(_) => "permission_denied",
            GateError::Admission(e) => e.code(),
            GateError::Validation(_) => "validation_failed",
            GateError::ToolNotFound(_) => "tool_not_found",
            GateError::ExecutionNotFound(_) => "execution_not_found",
            GateError::ApprovalNotFound(_) => "approval_not_found",
            GateError::Conflict(_) => "conflict",
            GateError::InvalidTransition { .. } => "invalid_transition",
            GateError::ApprovalUnavailable => "approval_unavailable",
            GateError::PolicyConfig(_) => "policy_config",
            GateError::Storage(_) => "storage",
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GateError::Admission(_) | GateError::ApprovalUnavailable | GateError::Storage(_)
        )
    }

    /// Conflicts are benign no-ops (double resolve, cancel after finish).
    pub fn is_conflict(&self) -> bool {
        matches!(self, GateError::Conflict(_))
    }

    /// Errors the caller caused, as opposed to internal invariant violations.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            GateError::InvalidTransition { .. }
                | GateError::ApprovalUnavailable
                | GateError::PolicyConfig(_)
                | GateError::Storage(_)
        )
    }
}

/// Rejection by admission control. Requests over a cap are refused, never queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("Global concurrency limit reached ({limit} executing)")]
    GlobalLimit { limit: usize },

    #[error("Concurrency limit reached for user '{user_id}' ({limit} executing)")]
    UserLimit { user_id: UserId, limit: usize },

    #[error("Submission rate limit reached for user '{user_id}' ({limit} per minute)")]
    RateLimited { user_id: UserId, limit: usize },
}

impl AdmissionError {
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::GlobalLimit { .. } | AdmissionError::UserLimit { .. } => {
                "concurrency_limit_exceeded"
            }
            AdmissionError::RateLimited { .. } => "rate_limited",
        }
    }
}

/// Failure reported by a [`ToolRunner`](crate::ToolRunner).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl RunnerError {
    pub fn code(&self) -> &'static str {
        match self {
            RunnerError::InvalidInput(_) => "invalid_input",
            RunnerError::Cancelled => "cancelled",
            RunnerError::Failed(_) => "runner_failed",
        }
    }
}

/// Structured failure recorded on a terminal execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub code: String,
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&RunnerError> for ExecutionFailure {
    fn from(err: &RunnerError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<&AdmissionError> for ExecutionFailure {
    fn from(err: &AdmissionError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_is_retryable() {
        let err = GateError::from(AdmissionError::UserLimit {
            user_id: UserId::new("alice"),
            limit: 3,
        });
        assert!(err.is_retryable());
        assert_eq!(err.code(), "concurrency_limit_exceeded");
        assert!(err.to_string().contains("alice"));
    }

    #[test]
    fn test_terminal_errors_not_retryable() {
        assert!(!GateError::PermissionDenied("no".into()).is_retryable());
        assert!(!GateError::Validation("bad".into()).is_retryable());
        assert!(GateError::Conflict("twice".into()).is_conflict());
    }

    #[test]
    fn test_invalid_transition_is_internal() {
        let err = GateError::InvalidTransition {
            id: "exec-1".into(),
            from: ExecutionStatus::Completed,
            to: ExecutionStatus::Executing,
        };
        assert!(!err.is_client_error());
        assert_eq!(
            err.to_string(),
            "Invalid transition for execution exec-1: completed -> executing"
        );
    }

    #[test]
    fn test_failure_from_runner_error() {
        let failure = ExecutionFailure::from(&RunnerError::Failed("disk full".into()));
        assert_eq!(failure.code, "runner_failed");
        assert_eq!(failure.message, "disk full");
    }
}
