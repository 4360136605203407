//! Approval request types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tg_auth::UserId;

use crate::{
    model::{Actor, ExecutionId},
    policy::RiskLevel,
};

/// Unique identifier for an approval request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApprovalId(String);

impl ApprovalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ApprovalId {
    fn default() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ApprovalId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Who may resolve a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverClass {
    /// The requesting user.
    UserSelf,
    /// Any admin.
    Admin,
    /// The requesting user or any admin.
    Both,
}

impl ApproverClass {
    /// The class one escalation step wider.
    pub fn widen(self) -> Self {
        match self {
            ApproverClass::UserSelf | ApproverClass::Admin | ApproverClass::Both => {
                ApproverClass::Both
            }
        }
    }

    pub fn includes_requester(&self) -> bool {
        matches!(self, ApproverClass::UserSelf | ApproverClass::Both)
    }

    pub fn includes_admins(&self) -> bool {
        matches!(self, ApproverClass::Admin | ApproverClass::Both)
    }

    /// Whether `actor` may resolve a request made by `requested_by`.
    pub fn permits(&self, actor: &Actor, requested_by: &UserId) -> bool {
        (self.includes_requester() && &actor.user_id == requested_by)
            || (self.includes_admins() && actor.is_admin())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, ApprovalStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision submitted by an approver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

/// A pending or resolved approval for one tool execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub tool_execution_id: ExecutionId,
    pub tool_id: String,
    pub requested_by: UserId,
    pub risk_level: RiskLevel,
    pub approver_class: ApproverClass,
    pub required_by: DateTime<Utc>,
    pub escalation_level: u32,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<UserId>,
    pub reason: Option<String>,
}

impl ApprovalRequest {
    /// Wire representation.
    pub fn payload(&self) -> ApprovalPayload {
        ApprovalPayload {
            id: self.id.clone(),
            tool_execution_id: self.tool_execution_id.clone(),
            risk_level: self.risk_level,
            approver_class: self.approver_class,
            required_by: self.required_by,
            escalation_level: self.escalation_level,
            status: self.status,
        }
    }
}

/// Approval request payload as exposed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalPayload {
    pub id: ApprovalId,
    pub tool_execution_id: ExecutionId,
    pub risk_level: RiskLevel,
    pub approver_class: ApproverClass,
    pub required_by: DateTime<Utc>,
    pub escalation_level: u32,
    pub status: ApprovalStatus,
}

#[cfg(test)]
mod tests {
    use tg_auth::Role;

    use super::*;

    #[test]
    fn test_widen_reaches_both() {
        assert_eq!(ApproverClass::UserSelf.widen(), ApproverClass::Both);
        assert_eq!(ApproverClass::Admin.widen(), ApproverClass::Both);
        assert_eq!(ApproverClass::Both.widen(), ApproverClass::Both);
    }

    #[test]
    fn test_permits() {
        let alice = UserId::new("alice");
        let self_actor = Actor::new("alice", Role::User);
        let other_user = Actor::new("bob", Role::User);
        let admin = Actor::new("root", Role::Admin);

        assert!(ApproverClass::UserSelf.permits(&self_actor, &alice));
        assert!(!ApproverClass::UserSelf.permits(&other_user, &alice));
        assert!(!ApproverClass::UserSelf.permits(&admin, &alice));

        assert!(!ApproverClass::Admin.permits(&self_actor, &alice));
        assert!(ApproverClass::Admin.permits(&admin, &alice));

        assert!(ApproverClass::Both.permits(&self_actor, &alice));
        assert!(ApproverClass::Both.permits(&admin, &alice));
        assert!(!ApproverClass::Both.permits(&other_user, &alice));
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_value(ApproverClass::UserSelf).unwrap(),
            "user_self"
        );
        assert_eq!(serde_json::to_value(ApprovalStatus::Expired).unwrap(), "expired");
        assert_eq!(serde_json::to_value(RiskLevel::High).unwrap(), "high");
    }
}
