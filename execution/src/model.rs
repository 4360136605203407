//! Execution records, requests and their lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tg_auth::{Principal, Role, UserId};
use tg_data_connector::StoredEntity;

use crate::{error::ExecutionFailure, policy::PermissionLevel};

/// Unique identifier for a tool execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The user acting on an execution or approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: impl Into<UserId>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }
}

impl From<&Principal> for Actor {
    fn from(principal: &Principal) -> Self {
        Self {
            user_id: principal.user_id.clone(),
            role: principal.role,
        }
    }
}

/// Lifecycle state of a tool execution.
///
/// ```text
/// pending ──> approved ──> executing ──> completed | error | timeout
///    │  └──> rejected         ▲
///    ├───────────────────────-┘ (auto)
///    └──> timeout (approval expired)
/// pending | approved | executing ──> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Approved,
    Rejected,
    Executing,
    Completed,
    Error,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Approved => "approved",
            ExecutionStatus::Rejected => "rejected",
            ExecutionStatus::Executing => "executing",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Rejected
                | ExecutionStatus::Completed
                | ExecutionStatus::Error
                | ExecutionStatus::Timeout
                | ExecutionStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether `next` is reachable from `self` in one step.
    ///
    /// `approved -> error` covers a dispatch refused by admission control
    /// after the approval came in.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Executing)
                | (Pending, Timeout)
                | (Pending, Cancelled)
                | (Approved, Executing)
                | (Approved, Error)
                | (Approved, Cancelled)
                | (Executing, Completed)
                | (Executing, Error)
                | (Executing, Timeout)
                | (Executing, Cancelled)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to run a tool on behalf of a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub tool_id: String,
    pub user_id: UserId,
    pub role: Role,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
    pub input: Value,
}

impl ExecutionRequest {
    pub fn new(tool_id: impl Into<String>, actor: &Actor, input: Value) -> Self {
        Self {
            tool_id: tool_id.into(),
            user_id: actor.user_id.clone(),
            role: actor.role,
            conversation_id: None,
            message_id: None,
            input,
        }
    }

    #[must_use]
    pub fn with_conversation(
        mut self,
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self.message_id = Some(message_id.into());
        self
    }
}

/// Resource usage summary recorded on an execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub duration_ms: Option<u64>,
    pub progress_updates: u64,
}

/// A single tool execution and its full history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecution {
    pub id: ExecutionId,
    pub tool_id: String,
    pub user_id: UserId,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<ExecutionFailure>,
    pub status: ExecutionStatus,
    pub permission: PermissionLevel,
    pub approved_by: Option<UserId>,
    pub requested_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub resource_usage: ResourceUsage,
}

impl ToolExecution {
    pub(crate) fn new(request: &ExecutionRequest, permission: PermissionLevel) -> Self {
        Self {
            id: ExecutionId::default(),
            tool_id: request.tool_id.clone(),
            user_id: request.user_id.clone(),
            conversation_id: request.conversation_id.clone(),
            message_id: request.message_id.clone(),
            input: request.input.clone(),
            output: None,
            error: None,
            status: ExecutionStatus::Pending,
            permission,
            approved_by: None,
            requested_at: Utc::now(),
            approved_at: None,
            started_at: None,
            completed_at: None,
            resource_usage: ResourceUsage::default(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wire representation.
    pub fn payload(&self) -> ExecutionPayload {
        ExecutionPayload {
            id: self.id.clone(),
            tool_id: self.tool_id.clone(),
            status: self.status,
            input: self.input.clone(),
            output: self.output.clone(),
            error: self.error.clone(),
            approved_by: self.approved_by.clone(),
            requested_at: self.requested_at,
            completed_at: self.completed_at,
        }
    }
}

impl StoredEntity for ToolExecution {
    fn entity_id(&self) -> String {
        self.id.to_string()
    }
}

/// Tool execution payload as exposed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPayload {
    pub id: ExecutionId,
    pub tool_id: String,
    pub status: ExecutionStatus,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<UserId>,
    pub requested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Filter for execution history queries.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub user_id: Option<UserId>,
    pub tool_id: Option<String>,
    pub statuses: Vec<ExecutionStatus>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    #[must_use]
    pub fn for_user(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_tool(mut self, tool_id: impl Into<String>) -> Self {
        self.tool_id = Some(tool_id.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.statuses.push(status);
        self
    }

    #[must_use]
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, execution: &ToolExecution) -> bool {
        self.user_id
            .as_ref()
            .map_or(true, |user| &execution.user_id == user)
            && self
                .tool_id
                .as_ref()
                .map_or(true, |tool| &execution.tool_id == tool)
            && (self.statuses.is_empty() || self.statuses.contains(&execution.status))
            && self.since.map_or(true, |since| execution.requested_at >= since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALL: [ExecutionStatus; 8] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Approved,
        ExecutionStatus::Rejected,
        ExecutionStatus::Executing,
        ExecutionStatus::Completed,
        ExecutionStatus::Error,
        ExecutionStatus::Timeout,
        ExecutionStatus::Cancelled,
    ];

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_transitions_only_move_forward() {
        // No state may be reached again from one of its successors.
        for from in ALL {
            for to in ALL.iter().filter(|to| from.can_transition_to(**to)) {
                assert!(!to.can_transition_to(from), "{from} <-> {to}");
            }
        }
        assert!(!ExecutionStatus::Completed.can_transition_to(ExecutionStatus::Executing));
        assert!(!ExecutionStatus::Executing.can_transition_to(ExecutionStatus::Pending));
    }

    #[test]
    fn test_cancel_reachable_from_active_states() {
        for from in ALL.iter().filter(|s| s.is_active()) {
            assert!(from.can_transition_to(ExecutionStatus::Cancelled));
        }
    }

    #[test]
    fn test_payload_omits_unset_fields() {
        let actor = Actor::new("alice", Role::User);
        let request = ExecutionRequest::new("read_file", &actor, json!({"path": "/tmp"}));
        let execution = ToolExecution::new(&request, PermissionLevel::Auto);

        let value = serde_json::to_value(execution.payload()).unwrap();
        assert_eq!(value["status"], "pending");
        assert_eq!(value["tool_id"], "read_file");
        assert!(value.get("output").is_none());
        assert!(value.get("approved_by").is_none());
    }

    #[test]
    fn test_filter_matches() {
        let actor = Actor::new("alice", Role::User);
        let request = ExecutionRequest::new("git_commit", &actor, json!({}));
        let execution = ToolExecution::new(&request, PermissionLevel::UserApproval);

        assert!(ExecutionFilter::default().matches(&execution));
        assert!(ExecutionFilter::default()
            .for_user("alice")
            .with_tool("git_commit")
            .matches(&execution));
        assert!(!ExecutionFilter::default().for_user("bob").matches(&execution));
        assert!(!ExecutionFilter::default()
            .with_status(ExecutionStatus::Completed)
            .matches(&execution));
    }
}
