//! Audit logging for permission and approval decisions.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tg_auth::UserId;

use crate::model::ExecutionId;

const DEFAULT_MAX_ENTRIES: usize = 10000;

/// Source of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionSource {
    ExplicitToolPolicy,
    RuleMatch,
    CategoryDefault,
    SandboxDefault,
    RoleRestriction,
    Approver,
    Escalation,
    Timeout,
    Cancellation,
}

/// Result of a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionResult {
    Approved,
    Denied { reason: String },
    Pending,
    Escalated { level: u32 },
    TimedOut,
}

impl DecisionResult {
    pub fn is_approved(&self) -> bool {
        matches!(self, DecisionResult::Approved)
    }

    pub fn is_final(&self) -> bool {
        !matches!(
            self,
            DecisionResult::Pending | DecisionResult::Escalated { .. }
        )
    }
}

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub execution_id: ExecutionId,
    pub tool_id: String,
    /// Requester for policy decisions, resolver for approver decisions.
    pub actor: Option<UserId>,
    pub result: DecisionResult,
    pub source: DecisionSource,
}

impl AuditEntry {
    pub fn new(
        execution_id: ExecutionId,
        tool_id: String,
        actor: Option<UserId>,
        result: DecisionResult,
        source: DecisionSource,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            execution_id,
            tool_id,
            actor,
            result,
            source,
        }
    }
}

/// Bounded in-memory audit log. Oldest entries are dropped first.
#[derive(Debug)]
pub struct AuditLog {
    entries: RwLock<VecDeque<AuditEntry>>,
    max_entries: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(max_entries.min(1024))),
            max_entries: max_entries.max(1),
        }
    }

    pub fn record(&self, entry: AuditEntry) {
        let mut entries = self.entries.write();
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn record_decision(
        &self,
        execution_id: &ExecutionId,
        tool_id: &str,
        actor: Option<&UserId>,
        result: DecisionResult,
        source: DecisionSource,
    ) {
        self.record(AuditEntry::new(
            execution_id.clone(),
            tool_id.to_string(),
            actor.cloned(),
            result,
            source,
        ));
    }

    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        self.entries.read().iter().rev().take(limit).cloned().collect()
    }

    pub fn for_actor(&self, user_id: &UserId, limit: usize) -> Vec<AuditEntry> {
        self.entries
            .read()
            .iter()
            .rev()
            .filter(|e| e.actor.as_ref() == Some(user_id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn for_execution(&self, execution_id: &ExecutionId) -> Vec<AuditEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| &e.execution_id == execution_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_log_record() {
        let log = AuditLog::new();
        let alice = UserId::new("alice");

        log.record_decision(
            &ExecutionId::new("exec-1"),
            "read_file",
            Some(&alice),
            DecisionResult::Approved,
            DecisionSource::SandboxDefault,
        );

        assert_eq!(log.len(), 1);
        let recent = log.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].tool_id, "read_file");
        assert_eq!(log.for_actor(&alice, 10).len(), 1);
    }

    #[test]
    fn test_audit_log_max_entries() {
        let log = AuditLog::with_capacity(5);

        for i in 0..10 {
            log.record_decision(
                &ExecutionId::new(format!("exec-{i}")),
                "tool",
                None,
                DecisionResult::Pending,
                DecisionSource::RuleMatch,
            );
        }

        assert_eq!(log.len(), 5);
        let recent = log.recent(10);
        assert_eq!(recent[0].execution_id.as_str(), "exec-9");
        assert_eq!(recent[4].execution_id.as_str(), "exec-5");
    }

    #[test]
    fn test_for_execution_in_order() {
        let log = AuditLog::new();
        let id = ExecutionId::new("exec-1");

        log.record_decision(
            &id,
            "git_push",
            None,
            DecisionResult::Pending,
            DecisionSource::RuleMatch,
        );
        log.record_decision(
            &id,
            "git_push",
            None,
            DecisionResult::Escalated { level: 1 },
            DecisionSource::Escalation,
        );
        log.record_decision(
            &id,
            "git_push",
            None,
            DecisionResult::TimedOut,
            DecisionSource::Timeout,
        );
        log.record_decision(
            &ExecutionId::new("other"),
            "git_push",
            None,
            DecisionResult::Approved,
            DecisionSource::Approver,
        );

        let entries = log.for_execution(&id);
        assert_eq!(entries.len(), 3);
        assert!(!entries[1].result.is_final());
        assert!(entries[2].result.is_final());
        assert!(!entries[2].result.is_approved());
    }
}
