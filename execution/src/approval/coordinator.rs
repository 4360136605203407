//! Approval workflow with deadlines and escalation.
//!
//! Each pending request has one timer task racing its deadline against a
//! cancellation token. When the deadline fires with no decision the request
//! escalates: the approver class widens, the level goes up and a fresh
//! deadline starts. Past the last level the request expires and its
//! execution times out. The periodic sweep in [`process_deadlines`] applies
//! the same step, so a missed timer cannot leave a request pending forever.
//!
//! [`process_deadlines`]: ApprovalCoordinator::process_deadlines

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    audit::{AuditLog, DecisionResult, DecisionSource},
    request::{ApprovalDecision, ApprovalId, ApprovalRequest, ApprovalStatus, ApproverClass},
};
use crate::{
    config::ApprovalSettings,
    error::{GateError, GateResult},
    events::{EventKind, EventNotifier, LifecycleEvent},
    metrics::GateMetrics,
    model::{Actor, ExecutionId, ToolExecution},
    policy::RiskLevel,
    registry::{ApprovalHandoff, ExecutionRegistry},
};

struct PendingEntry {
    request: ApprovalRequest,
    timer: CancellationToken,
}

#[derive(Default)]
struct CoordinatorState {
    requests: HashMap<ApprovalId, PendingEntry>,
    /// Latest request per execution.
    by_execution: HashMap<ExecutionId, ApprovalId>,
}

const WITHDRAWN_REASON: &str = "execution no longer pending";

enum DeadlineOutcome {
    Escalated,
    Expired(ExecutionId),
}

/// `now + after`, saturating at the latest representable instant.
fn deadline_after(now: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(after)
        .ok()
        .and_then(|after| now.checked_add_signed(after))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Creates, escalates and resolves approval requests.
pub struct ApprovalCoordinator {
    self_ref: Weak<ApprovalCoordinator>,
    registry: ExecutionRegistry,
    notifier: Arc<dyn EventNotifier>,
    audit_log: Arc<AuditLog>,
    metrics: Arc<GateMetrics>,
    settings: ApprovalSettings,
    state: Mutex<CoordinatorState>,
    shutdown: CancellationToken,
}

impl ApprovalCoordinator {
    /// Creates the coordinator and attaches it to `registry`.
    pub fn new(
        registry: ExecutionRegistry,
        notifier: Arc<dyn EventNotifier>,
        settings: ApprovalSettings,
    ) -> Arc<Self> {
        let coordinator = Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            audit_log: registry.audit_log().clone(),
            metrics: registry.metrics().clone(),
            registry,
            notifier,
            settings,
            state: Mutex::new(CoordinatorState::default()),
            shutdown: CancellationToken::new(),
        });
        let weak: Weak<Self> = Arc::downgrade(&coordinator);
        let handoff: Weak<dyn ApprovalHandoff> = weak;
        coordinator.registry.set_approval_handoff(handoff);
        coordinator
    }

    pub fn settings(&self) -> &ApprovalSettings {
        &self.settings
    }

    fn emit(&self, kind: EventKind, request: &ApprovalRequest) {
        self.notifier.emit(LifecycleEvent::for_approval(kind, request));
    }

    /// Opens a request for a pending execution and starts its deadline.
    pub fn request_approval(
        &self,
        execution: &ToolExecution,
        risk_level: RiskLevel,
        approver_class: ApproverClass,
        deadline: Option<Duration>,
    ) -> GateResult<ApprovalRequest> {
        let deadline = deadline.unwrap_or_else(|| self.settings.deadline());
        let mut state = self.state.lock();

        let open = state
            .by_execution
            .get(&execution.id)
            .and_then(|id| state.requests.get(id))
            .is_some_and(|entry| entry.request.status.is_pending());
        if open {
            return Err(GateError::Conflict(format!(
                "execution {} already has a pending approval request",
                execution.id
            )));
        }

        let now = Utc::now();
        let request = ApprovalRequest {
            id: ApprovalId::default(),
            tool_execution_id: execution.id.clone(),
            tool_id: execution.tool_id.clone(),
            requested_by: execution.user_id.clone(),
            risk_level,
            approver_class,
            required_by: deadline_after(now, deadline),
            escalation_level: 0,
            status: ApprovalStatus::Pending,
            created_at: now,
            resolved_at: None,
            resolved_by: None,
            reason: None,
        };

        let timer = self.shutdown.child_token();
        self.arm_timer(request.id.clone(), 0, deadline, timer.clone());
        self.emit(EventKind::ApprovalRequired, &request);
        self.metrics.record_approval_requested();
        info!(
            approval_id = %request.id,
            execution_id = %execution.id,
            risk = ?risk_level,
            approver = ?approver_class,
            "Approval requested"
        );

        state
            .by_execution
            .insert(execution.id.clone(), request.id.clone());
        state.requests.insert(
            request.id.clone(),
            PendingEntry {
                request: request.clone(),
                timer,
            },
        );
        Ok(request)
    }

    fn arm_timer(&self, id: ApprovalId, level: u32, after: Duration, token: CancellationToken) {
        let coordinator = self.self_ref.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {
                    if let Some(coordinator) = coordinator.upgrade() {
                        coordinator.handle_deadline(&id, level);
                    }
                }
                _ = token.cancelled() => {}
            }
        });
    }

    /// Timer callback. Stale timers (request resolved or already moved to
    /// another level) do nothing.
    fn handle_deadline(&self, id: &ApprovalId, level: u32) {
        let outcome = {
            let mut state = self.state.lock();
            match state.requests.get_mut(id) {
                Some(entry)
                    if entry.request.status.is_pending()
                        && entry.request.escalation_level == level =>
                {
                    Some(self.escalate_or_expire(entry, Utc::now()))
                }
                _ => None,
            }
        };
        if let Some(outcome) = outcome {
            self.finish_deadline(outcome);
        }
    }

    /// Moves a due request one step. The fresh deadline counts from `now`.
    fn escalate_or_expire(&self, entry: &mut PendingEntry, now: DateTime<Utc>) -> DeadlineOutcome {
        entry.timer.cancel();
        let request = &mut entry.request;

        if request.escalation_level < self.settings.max_escalation_levels {
            request.escalation_level += 1;
            request.approver_class = request.approver_class.widen();
            request.required_by = deadline_after(now, self.settings.deadline());

            let timer = self.shutdown.child_token();
            self.arm_timer(
                request.id.clone(),
                request.escalation_level,
                self.settings.deadline(),
                timer.clone(),
            );
            entry.timer = timer;

            let request = &entry.request;
            self.emit(EventKind::ApprovalEscalated, request);
            self.emit(EventKind::ApprovalRequired, request);
            self.audit_log.record_decision(
                &request.tool_execution_id,
                &request.tool_id,
                None,
                DecisionResult::Escalated {
                    level: request.escalation_level,
                },
                DecisionSource::Escalation,
            );
            self.metrics.record_approval_escalated();
            info!(
                approval_id = %request.id,
                level = request.escalation_level,
                approver = ?request.approver_class,
                "Approval escalated"
            );
            DeadlineOutcome::Escalated
        } else {
            request.status = ApprovalStatus::Expired;
            request.resolved_at = Some(now);
            request.reason = Some("no decision before the final deadline".to_string());

            let request = &entry.request;
            self.emit(EventKind::ApprovalTimeout, request);
            self.audit_log.record_decision(
                &request.tool_execution_id,
                &request.tool_id,
                None,
                DecisionResult::TimedOut,
                DecisionSource::Timeout,
            );
            self.metrics.record_approval_expired();
            warn!(
                approval_id = %request.id,
                execution_id = %request.tool_execution_id,
                "Approval expired"
            );
            DeadlineOutcome::Expired(request.tool_execution_id.clone())
        }
    }

    fn finish_deadline(&self, outcome: DeadlineOutcome) {
        if let DeadlineOutcome::Expired(execution_id) = outcome {
            if let Err(e) = self.registry.mark_timed_out(&execution_id) {
                debug!(
                    execution_id = %execution_id,
                    error = %e,
                    "Execution already left pending when its approval expired"
                );
            }
        }
    }

    /// Escalates or expires every pending request whose deadline is at or
    /// before `now`, one level per call. Returns how many were processed.
    pub fn process_deadlines(&self, now: DateTime<Utc>) -> usize {
        let outcomes: Vec<_> = {
            let mut state = self.state.lock();
            let mut due: Vec<_> = state
                .requests
                .values_mut()
                .filter(|e| e.request.status.is_pending() && e.request.required_by <= now)
                .collect();
            due.sort_by_key(|e| e.request.created_at);
            due.into_iter()
                .map(|entry| self.escalate_or_expire(entry, now))
                .collect()
        };

        let processed = outcomes.len();
        for outcome in outcomes {
            self.finish_deadline(outcome);
        }
        if processed > 0 {
            debug!(processed, "Processed approval deadlines");
        }
        processed
    }

    /// Resolves a pending request on behalf of `actor`.
    ///
    /// A request that is no longer pending yields [`GateError::Conflict`].
    pub fn resolve(
        &self,
        id: &ApprovalId,
        decision: ApprovalDecision,
        actor: &Actor,
        reason: Option<String>,
    ) -> GateResult<ApprovalRequest> {
        let request = {
            let mut state = self.state.lock();
            let entry = state
                .requests
                .get_mut(id)
                .ok_or_else(|| GateError::ApprovalNotFound(id.to_string()))?;

            if !entry.request.status.is_pending() {
                debug!(
                    approval_id = %id,
                    status = %entry.request.status,
                    "Resolve on settled approval ignored"
                );
                return Err(GateError::Conflict(format!(
                    "approval request {} is already {}",
                    id, entry.request.status
                )));
            }
            if !entry
                .request
                .approver_class
                .permits(actor, &entry.request.requested_by)
            {
                return Err(GateError::PermissionDenied(format!(
                    "user '{}' may not resolve approval request {}",
                    actor.user_id, id
                )));
            }

            entry.timer.cancel();
            let request = &mut entry.request;
            request.status = match decision {
                ApprovalDecision::Approve => ApprovalStatus::Approved,
                ApprovalDecision::Reject => ApprovalStatus::Rejected,
            };
            request.resolved_at = Some(Utc::now());
            request.resolved_by = Some(actor.user_id.clone());
            request.reason = reason;

            let result = match decision {
                ApprovalDecision::Approve => {
                    self.metrics.record_approval_granted();
                    DecisionResult::Approved
                }
                ApprovalDecision::Reject => {
                    self.metrics.record_approval_denied();
                    DecisionResult::Denied {
                        reason: request
                            .reason
                            .clone()
                            .unwrap_or_else(|| "rejected by approver".to_string()),
                    }
                }
            };
            self.audit_log.record_decision(
                &request.tool_execution_id,
                &request.tool_id,
                Some(&actor.user_id),
                result,
                DecisionSource::Approver,
            );
            request.clone()
        };

        info!(
            approval_id = %id,
            execution_id = %request.tool_execution_id,
            resolved_by = %actor.user_id,
            decision = ?decision,
            "Approval resolved"
        );

        let execution_id = &request.tool_execution_id;
        match decision {
            ApprovalDecision::Approve => {
                if let Err(e) = self.registry.mark_approved(execution_id, &actor.user_id) {
                    let err = Self::stale_execution(e);
                    if err.is_conflict() {
                        self.withdraw_approval(id);
                    }
                    return Err(err);
                }
                self.registry.dispatch(execution_id)?;
            }
            ApprovalDecision::Reject => {
                let reason = request.reason.as_deref().unwrap_or("rejected by approver");
                self.registry
                    .mark_rejected(execution_id, &actor.user_id, reason)
                    .map_err(Self::stale_execution)?;
            }
        }
        Ok(request)
    }

    /// Turns an approval back into a rejection when its execution settled
    /// between the decision and the hand-off to the registry.
    fn withdraw_approval(&self, id: &ApprovalId) {
        let mut state = self.state.lock();
        let Some(entry) = state.requests.get_mut(id) else {
            return;
        };
        if entry.request.status != ApprovalStatus::Approved {
            return;
        }

        let request = &mut entry.request;
        request.status = ApprovalStatus::Rejected;
        request.resolved_at = Some(Utc::now());
        request.reason = Some(WITHDRAWN_REASON.to_string());
        self.audit_log.record_decision(
            &request.tool_execution_id,
            &request.tool_id,
            None,
            DecisionResult::Denied {
                reason: WITHDRAWN_REASON.to_string(),
            },
            DecisionSource::Cancellation,
        );
        info!(
            approval_id = %id,
            execution_id = %request.tool_execution_id,
            "Approval withdrawn: {}",
            WITHDRAWN_REASON
        );
    }

    fn stale_execution(err: GateError) -> GateError {
        match err {
            GateError::InvalidTransition { id, from, .. } => {
                debug!(
                    execution_id = %id,
                    status = %from,
                    "Approval resolved for settled execution"
                );
                GateError::Conflict(format!("execution {id} is already {from}"))
            }
            other => other,
        }
    }

    pub fn get(&self, id: &ApprovalId) -> Option<ApprovalRequest> {
        self.state
            .lock()
            .requests
            .get(id)
            .map(|entry| entry.request.clone())
    }

    /// Latest request opened for an execution.
    pub fn for_execution(&self, execution_id: &ExecutionId) -> Option<ApprovalRequest> {
        let state = self.state.lock();
        state
            .by_execution
            .get(execution_id)
            .and_then(|id| state.requests.get(id))
            .map(|entry| entry.request.clone())
    }

    /// Pending requests visible to `approver`, oldest first.
    ///
    /// Admins (and `None`) see everything; other users only requests they
    /// may resolve themselves.
    pub fn list_pending(&self, approver: Option<&Actor>) -> Vec<ApprovalRequest> {
        let state = self.state.lock();
        let mut pending: Vec<_> = state
            .requests
            .values()
            .map(|entry| &entry.request)
            .filter(|r| r.status.is_pending())
            .filter(|r| match approver {
                None => true,
                Some(actor) if actor.is_admin() => true,
                Some(actor) => {
                    r.requested_by == actor.user_id && r.approver_class.includes_requester()
                }
            })
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    /// Removes settled requests resolved longer than `retention` ago.
    pub fn cleanup_expired(&self, retention: Duration) -> usize {
        let Some(cutoff) = TimeDelta::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };
        let mut state = self.state.lock();
        let stale: Vec<_> = state
            .requests
            .values()
            .filter(|e| {
                !e.request.status.is_pending()
                    && e.request.resolved_at.is_some_and(|at| at < cutoff)
            })
            .map(|e| (e.request.id.clone(), e.request.tool_execution_id.clone()))
            .collect();

        for (id, execution_id) in &stale {
            state.requests.remove(id);
            if state.by_execution.get(execution_id) == Some(id) {
                state.by_execution.remove(execution_id);
            }
        }
        if !stale.is_empty() {
            debug!(removed = stale.len(), "Cleaned up settled approval requests");
        }
        stale.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .requests
            .values()
            .filter(|e| e.request.status.is_pending())
            .count()
    }

    /// Stops all deadline timers. Pending requests stay pending.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        info!(pending = self.pending_count(), "Approval coordinator stopped");
    }
}

impl ApprovalHandoff for ApprovalCoordinator {
    fn open_approval(
        &self,
        execution: &ToolExecution,
        risk: RiskLevel,
        approver_class: ApproverClass,
    ) -> GateResult<ApprovalRequest> {
        self.request_approval(execution, risk, approver_class, None)
    }

    fn close_for_execution(&self, execution_id: &ExecutionId, reason: &str) {
        let mut state = self.state.lock();
        let Some(id) = state.by_execution.get(execution_id).cloned() else {
            return;
        };
        let Some(entry) = state.requests.get_mut(&id) else {
            return;
        };
        if !entry.request.status.is_pending() {
            return;
        }

        entry.timer.cancel();
        let request = &mut entry.request;
        request.status = ApprovalStatus::Rejected;
        request.resolved_at = Some(Utc::now());
        request.reason = Some(reason.to_string());
        self.audit_log.record_decision(
            execution_id,
            &request.tool_id,
            None,
            DecisionResult::Denied {
                reason: reason.to_string(),
            },
            DecisionSource::Cancellation,
        );
        info!(approval_id = %id, execution_id = %execution_id, "Approval closed: {}", reason);
    }
}
