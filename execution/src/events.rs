//! Lifecycle events and the notifier seam.
//!
//! Registries publish typed events; transports subscribe and fan them out.
//! [`EventNotifier::emit`] never blocks and never fails the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tg_auth::UserId;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    approval::{ApprovalId, ApprovalRequest},
    model::{ExecutionId, ToolExecution},
};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "execution.requested")]
    ExecutionRequested,
    #[serde(rename = "execution.approved")]
    ExecutionApproved,
    #[serde(rename = "execution.rejected")]
    ExecutionRejected,
    #[serde(rename = "execution.started")]
    ExecutionStarted,
    #[serde(rename = "execution.progress")]
    ExecutionProgress,
    #[serde(rename = "execution.completed")]
    ExecutionCompleted,
    #[serde(rename = "execution.failed")]
    ExecutionFailed,
    #[serde(rename = "execution.cancelled")]
    ExecutionCancelled,
    #[serde(rename = "approval.required")]
    ApprovalRequired,
    #[serde(rename = "approval.escalated")]
    ApprovalEscalated,
    #[serde(rename = "approval.timeout")]
    ApprovalTimeout,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ExecutionRequested => "execution.requested",
            EventKind::ExecutionApproved => "execution.approved",
            EventKind::ExecutionRejected => "execution.rejected",
            EventKind::ExecutionStarted => "execution.started",
            EventKind::ExecutionProgress => "execution.progress",
            EventKind::ExecutionCompleted => "execution.completed",
            EventKind::ExecutionFailed => "execution.failed",
            EventKind::ExecutionCancelled => "execution.cancelled",
            EventKind::ApprovalRequired => "approval.required",
            EventKind::ApprovalEscalated => "approval.escalated",
            EventKind::ApprovalTimeout => "approval.timeout",
        }
    }

    pub fn is_approval(&self) -> bool {
        matches!(
            self,
            EventKind::ApprovalRequired | EventKind::ApprovalEscalated | EventKind::ApprovalTimeout
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change published by a registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub execution_id: ExecutionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<ApprovalId>,
    /// Owner of the execution; transports route on this.
    pub user_id: UserId,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn for_execution(kind: EventKind, execution: &ToolExecution) -> Self {
        Self {
            kind,
            execution_id: execution.id.clone(),
            approval_id: None,
            user_id: execution.user_id.clone(),
            payload: serde_json::to_value(execution.payload()).unwrap_or(Value::Null),
            timestamp: Utc::now(),
        }
    }

    pub fn for_approval(kind: EventKind, request: &ApprovalRequest) -> Self {
        Self {
            kind,
            execution_id: request.tool_execution_id.clone(),
            approval_id: Some(request.id.clone()),
            user_id: request.requested_by.clone(),
            payload: serde_json::to_value(request.payload()).unwrap_or(Value::Null),
            timestamp: Utc::now(),
        }
    }

    pub fn progress(execution: &ToolExecution, partial: Value) -> Self {
        Self {
            kind: EventKind::ExecutionProgress,
            execution_id: execution.id.clone(),
            approval_id: None,
            user_id: execution.user_id.clone(),
            payload: partial,
            timestamp: Utc::now(),
        }
    }
}

/// Receives lifecycle events. Implementations must not block.
pub trait EventNotifier: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Publishes events on a tokio broadcast channel.
///
/// Slow subscribers lag and lose the oldest events; emitters never wait.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventNotifier for BroadcastNotifier {
    fn emit(&self, event: LifecycleEvent) {
        if self.tx.send(event).is_err() {
            debug!("Lifecycle event dropped: no subscribers");
        }
    }
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl EventNotifier for TracingNotifier {
    fn emit(&self, event: LifecycleEvent) {
        info!(
            event = %event.kind,
            execution_id = %event.execution_id,
            user_id = %event.user_id,
            approval_id = event.approval_id.as_ref().map(|id| id.as_str()),
            "Lifecycle event"
        );
    }
}

/// Forwards each event to several notifiers in order.
#[derive(Default)]
pub struct FanoutNotifier {
    targets: Vec<std::sync::Arc<dyn EventNotifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, target: std::sync::Arc<dyn EventNotifier>) -> Self {
        self.targets.push(target);
        self
    }
}

impl EventNotifier for FanoutNotifier {
    fn emit(&self, event: LifecycleEvent) {
        if let Some((last, rest)) = self.targets.split_last() {
            for target in rest {
                target.emit(event.clone());
            }
            last.emit(event);
        }
    }
}
