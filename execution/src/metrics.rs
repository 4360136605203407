//! Counters for execution and approval activity.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use crate::model::ExecutionStatus;

/// Metrics for gated tool execution.
pub struct GateMetrics {
    // Admission
    submitted: AtomicU64,
    permission_denied: AtomicU64,
    admission_rejected: AtomicU64,
    validation_failed: AtomicU64,

    // Execution outcomes
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    active_executions: AtomicU64,

    // Approvals
    approvals_requested: AtomicU64,
    approvals_granted: AtomicU64,
    approvals_denied: AtomicU64,
    approvals_escalated: AtomicU64,
    approvals_expired: AtomicU64,

    tool_latencies: DashMap<String, LatencyStats>,
}

impl GateMetrics {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            permission_denied: AtomicU64::new(0),
            admission_rejected: AtomicU64::new(0),
            validation_failed: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            active_executions: AtomicU64::new(0),
            approvals_requested: AtomicU64::new(0),
            approvals_granted: AtomicU64::new(0),
            approvals_denied: AtomicU64::new(0),
            approvals_escalated: AtomicU64::new(0),
            approvals_expired: AtomicU64::new(0),
            tool_latencies: DashMap::new(),
        }
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_permission_denied(&self) {
        self.permission_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admission_rejected(&self) {
        self.admission_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_failed(&self) {
        self.validation_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// An execution entered `executing`.
    pub fn record_started(&self) {
        self.active_executions.fetch_add(1, Ordering::Relaxed);
    }

    /// An execution reached a terminal state.
    ///
    /// `duration_ms` is set only for executions that actually ran.
    pub fn record_finished(
        &self,
        tool_id: &str,
        status: ExecutionStatus,
        duration_ms: Option<u64>,
    ) {
        let counter = match status {
            ExecutionStatus::Completed => &self.completed,
            ExecutionStatus::Error => &self.failed,
            ExecutionStatus::Timeout => &self.timed_out,
            ExecutionStatus::Cancelled => &self.cancelled,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if let Some(ms) = duration_ms {
            self.active_executions.fetch_sub(1, Ordering::Relaxed);
            self.tool_latencies
                .entry(tool_id.to_string())
                .or_insert_with(LatencyStats::new)
                .record(ms);
        }
    }

    pub fn record_approval_requested(&self) {
        self.approvals_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_approval_granted(&self) {
        self.approvals_granted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_approval_denied(&self) {
        self.approvals_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_approval_escalated(&self) {
        self.approvals_escalated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_approval_expired(&self) {
        self.approvals_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            permission_denied: self.permission_denied.load(Ordering::Relaxed),
            admission_rejected: self.admission_rejected.load(Ordering::Relaxed),
            validation_failed: self.validation_failed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            active_executions: self.active_executions.load(Ordering::Relaxed),
            approvals_requested: self.approvals_requested.load(Ordering::Relaxed),
            approvals_granted: self.approvals_granted.load(Ordering::Relaxed),
            approvals_denied: self.approvals_denied.load(Ordering::Relaxed),
            approvals_escalated: self.approvals_escalated.load(Ordering::Relaxed),
            approvals_expired: self.approvals_expired.load(Ordering::Relaxed),
        }
    }

    pub fn tool_latency(&self, tool_id: &str) -> Option<LatencySnapshot> {
        self.tool_latencies.get(tool_id).map(|stats| stats.snapshot())
    }

    pub fn all_tool_latencies(&self) -> Vec<(String, LatencySnapshot)> {
        self.tool_latencies
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }
}

impl Default for GateMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-tool latency statistics.
pub struct LatencyStats {
    count: AtomicU64,
    total_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyStats {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            max_ms: AtomicU64::new(0),
        }
    }

    fn record(&self, ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_ms.load(Ordering::Relaxed);
        let min = self.min_ms.load(Ordering::Relaxed);

        LatencySnapshot {
            count,
            avg_ms: if count > 0 { total / count } else { 0 },
            min_ms: if min == u64::MAX { 0 } else { min },
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub permission_denied: u64,
    pub admission_rejected: u64,
    pub validation_failed: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub active_executions: u64,
    pub approvals_requested: u64,
    pub approvals_granted: u64,
    pub approvals_denied: u64,
    pub approvals_escalated: u64,
    pub approvals_expired: u64,
}

impl MetricsSnapshot {
    /// Completed share of executions that ran to an outcome, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed + self.timed_out;
        if finished == 0 {
            100.0
        } else {
            (self.completed as f64 / finished as f64) * 100.0
        }
    }

    pub fn approval_rate(&self) -> f64 {
        let total = self.approvals_granted + self.approvals_denied + self.approvals_expired;
        if total == 0 {
            100.0
        } else {
            (self.approvals_granted as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub avg_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_metrics() {
        let metrics = GateMetrics::new();

        metrics.record_submitted();
        metrics.record_started();
        assert_eq!(metrics.snapshot().active_executions, 1);

        metrics.record_finished("read_file", ExecutionStatus::Completed, Some(100));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.submitted, 1);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.active_executions, 0);
    }

    #[test]
    fn test_cancel_before_start_records_no_latency() {
        let metrics = GateMetrics::new();
        metrics.record_finished("git_push", ExecutionStatus::Cancelled, None);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cancelled, 1);
        assert_eq!(snapshot.active_executions, 0);
        assert!(metrics.tool_latency("git_push").is_none());
    }

    #[test]
    fn test_latency_stats() {
        let metrics = GateMetrics::new();
        for ms in [100, 200, 150] {
            metrics.record_started();
            metrics.record_finished("fetch", ExecutionStatus::Completed, Some(ms));
        }

        let latency = metrics.tool_latency("fetch").unwrap();
        assert_eq!(latency.count, 3);
        assert_eq!(latency.avg_ms, 150);
        assert_eq!(latency.min_ms, 100);
        assert_eq!(latency.max_ms, 200);
        assert_eq!(metrics.all_tool_latencies().len(), 1);
    }

    #[test]
    fn test_success_rate() {
        let metrics = GateMetrics::new();
        for _ in 0..3 {
            metrics.record_started();
            metrics.record_finished("t", ExecutionStatus::Completed, Some(1));
        }
        metrics.record_started();
        metrics.record_finished("t", ExecutionStatus::Timeout, Some(1));

        assert!((metrics.snapshot().success_rate() - 75.0).abs() < 0.1);
    }

    #[test]
    fn test_approval_metrics() {
        let metrics = GateMetrics::new();

        metrics.record_approval_requested();
        metrics.record_approval_granted();
        metrics.record_approval_requested();
        metrics.record_approval_escalated();
        metrics.record_approval_expired();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.approvals_requested, 2);
        assert_eq!(snapshot.approvals_escalated, 1);
        assert!((snapshot.approval_rate() - 50.0).abs() < 0.1);
    }
}
