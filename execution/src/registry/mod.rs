//! Execution registry: admission, the execution state machine and runner
//! dispatch.
//!
//! All mutations happen under one `parking_lot::Mutex`, and the events for a
//! transition are emitted before that lock is released, so observers see a
//! single execution's transitions in order. The approval coordinator is only
//! ever called with this lock held, never the other way round.

mod state;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use chrono::{TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tg_auth::UserId;
use tg_data_connector::{EntityStore, StoreWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::state::ExecutionEntry;
use crate::{
    admission::{AdmissionController, ExecutionPermit},
    approval::{ApprovalRequest, ApproverClass, AuditLog, DecisionResult},
    config::ConcurrencyLimits,
    error::{AdmissionError, ExecutionFailure, GateError, GateResult, RunnerError},
    events::{EventKind, EventNotifier, LifecycleEvent, TracingNotifier},
    metrics::GateMetrics,
    model::{ExecutionFilter, ExecutionId, ExecutionRequest, ExecutionStatus, ToolExecution},
    policy::{PermissionLevel, PermissionPolicy, RiskLevel},
    runner::{ProgressSink, RunContext},
    tool::{RegisteredTool, ToolCatalog},
};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Hands approval-required executions to the approval workflow.
pub trait ApprovalHandoff: Send + Sync {
    /// Opens an approval request for a freshly submitted pending execution.
    fn open_approval(
        &self,
        execution: &ToolExecution,
        risk: RiskLevel,
        approver_class: ApproverClass,
    ) -> GateResult<ApprovalRequest>;

    /// Closes the open request of an execution that was cancelled.
    fn close_for_execution(&self, execution_id: &ExecutionId, reason: &str);
}

enum RunOutcome {
    Finished(Result<Value, RunnerError>),
    TimedOut(Duration),
    Cancelled,
}

struct RegistryInner {
    catalog: Arc<ToolCatalog>,
    policy: Arc<PermissionPolicy>,
    admission: AdmissionController,
    notifier: Arc<dyn EventNotifier>,
    audit_log: Arc<AuditLog>,
    metrics: Arc<GateMetrics>,
    writer: Option<StoreWriter<ToolExecution>>,
    handoff: RwLock<Option<Weak<dyn ApprovalHandoff>>>,
    state: Mutex<HashMap<ExecutionId, ExecutionEntry>>,
    running: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
}

/// Builder for [`ExecutionRegistry`].
pub struct ExecutionRegistryBuilder {
    catalog: Arc<ToolCatalog>,
    policy: Arc<PermissionPolicy>,
    limits: ConcurrencyLimits,
    notifier: Option<Arc<dyn EventNotifier>>,
    audit_log: Option<Arc<AuditLog>>,
    metrics: Option<Arc<GateMetrics>>,
    store: Option<Arc<dyn EntityStore<ToolExecution>>>,
    shutdown_timeout: Duration,
}

impl ExecutionRegistryBuilder {
    #[must_use]
    pub fn limits(mut self, limits: ConcurrencyLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn EventNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn audit_log(mut self, audit_log: Arc<AuditLog>) -> Self {
        self.audit_log = Some(audit_log);
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: Arc<GateMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Persists every state change through an ordered write-behind queue.
    /// Requires a tokio runtime.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn EntityStore<ToolExecution>>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> ExecutionRegistry {
        ExecutionRegistry {
            inner: Arc::new(RegistryInner {
                catalog: self.catalog,
                policy: self.policy,
                admission: AdmissionController::new(self.limits),
                notifier: self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier)),
                audit_log: self.audit_log.unwrap_or_default(),
                metrics: self.metrics.unwrap_or_default(),
                writer: self.store.map(StoreWriter::spawn),
                handoff: RwLock::new(None),
                state: Mutex::new(HashMap::new()),
                running: Arc::new(AtomicUsize::new(0)),
                shutdown: CancellationToken::new(),
                shutdown_timeout: self.shutdown_timeout,
            }),
        }
    }
}

/// Tracks every tool execution from submission to a terminal state.
#[derive(Clone)]
pub struct ExecutionRegistry {
    inner: Arc<RegistryInner>,
}

impl ExecutionRegistry {
    pub fn builder(
        catalog: Arc<ToolCatalog>,
        policy: Arc<PermissionPolicy>,
    ) -> ExecutionRegistryBuilder {
        ExecutionRegistryBuilder {
            catalog,
            policy,
            limits: ConcurrencyLimits::default(),
            notifier: None,
            audit_log: None,
            metrics: None,
            store: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Wires the approval workflow. Held weakly.
    pub fn set_approval_handoff(&self, handoff: Weak<dyn ApprovalHandoff>) {
        *self.inner.handoff.write() = Some(handoff);
    }

    fn handoff(&self) -> Option<Arc<dyn ApprovalHandoff>> {
        self.inner.handoff.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.inner.catalog
    }

    pub fn policy(&self) -> &Arc<PermissionPolicy> {
        &self.inner.policy
    }

    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.inner.audit_log
    }

    pub fn metrics(&self) -> &Arc<GateMetrics> {
        &self.inner.metrics
    }

    pub fn limits(&self) -> &ConcurrencyLimits {
        self.inner.admission.limits()
    }

    fn emit(&self, kind: EventKind, execution: &ToolExecution) {
        self.inner
            .notifier
            .emit(LifecycleEvent::for_execution(kind, execution));
    }

    fn persist(&self, execution: &ToolExecution) {
        if let Some(writer) = &self.inner.writer {
            writer.save(execution.clone());
        }
    }

    /// Submits a request.
    ///
    /// Order: tool lookup, input validation, policy, admission. Denied,
    /// invalid and over-limit requests create no record. `auto` requests
    /// start running immediately; the others stay `pending` and get an
    /// approval request.
    pub fn submit(&self, request: ExecutionRequest) -> GateResult<ToolExecution> {
        let inner = &self.inner;
        let tool = inner
            .catalog
            .get(&request.tool_id)
            .ok_or_else(|| GateError::ToolNotFound(request.tool_id.clone()))?;
        let definition = tool.definition.clone();

        if let Err(e) = definition.validate_input(&request.input) {
            inner.metrics.record_validation_failed();
            return Err(e);
        }

        let classification = inner
            .policy
            .explain(&definition, request.role, definition.category);
        let level = classification.level;
        if level.is_denied() {
            let reason = classification
                .reason
                .unwrap_or_else(|| "denied by policy".to_string());
            inner.audit_log.record_decision(
                &ExecutionId::default(),
                &definition.id,
                Some(&request.user_id),
                DecisionResult::Denied {
                    reason: reason.clone(),
                },
                classification.source,
            );
            inner.metrics.record_permission_denied();
            warn!(
                tool_id = %definition.id,
                user_id = %request.user_id,
                role = %request.role,
                %reason,
                "Tool execution denied"
            );
            return Err(GateError::PermissionDenied(reason));
        }

        let handoff = if level.requires_approval() {
            Some(self.handoff().ok_or(GateError::ApprovalUnavailable)?)
        } else {
            None
        };

        let cancel = inner.shutdown.child_token();
        let snapshot = {
            let mut state = inner.state.lock();

            let permit = self
                .admit(level, &request.user_id)
                .inspect_err(|e| {
                    inner.metrics.record_admission_rejected();
                    info!(
                        tool_id = %definition.id,
                        user_id = %request.user_id,
                        code = e.code(),
                        "Tool execution rejected by admission control"
                    );
                })?;

            let mut entry =
                ExecutionEntry::new(ToolExecution::new(&request, level), cancel.clone());
            self.emit(EventKind::ExecutionRequested, &entry.execution);

            if let Some(permit) = permit {
                entry.start(permit)?;
                inner.metrics.record_started();
                self.emit(EventKind::ExecutionStarted, &entry.execution);
            }

            let snapshot = entry.execution.clone();
            self.persist(&snapshot);
            state.insert(snapshot.id.clone(), entry);

            if let Some(handoff) = &handoff {
                let risk = PermissionPolicy::risk_level(&definition);
                let approver_class = level.approver_class().unwrap_or(ApproverClass::Both);
                if let Err(e) = handoff.open_approval(&snapshot, risk, approver_class) {
                    warn!(
                        execution_id = %snapshot.id,
                        error = %e,
                        "Failed to open approval request; cancelling execution"
                    );
                    if let Some(entry) = state.get_mut(&snapshot.id) {
                        self.cancel_locked(entry);
                    }
                    return Err(e);
                }
            }
            snapshot
        };

        inner.metrics.record_submitted();
        inner.audit_log.record_decision(
            &snapshot.id,
            &snapshot.tool_id,
            Some(&snapshot.user_id),
            if level.requires_approval() {
                DecisionResult::Pending
            } else {
                DecisionResult::Approved
            },
            classification.source,
        );
        info!(
            execution_id = %snapshot.id,
            tool_id = %snapshot.tool_id,
            user_id = %snapshot.user_id,
            permission = %level,
            "Tool execution submitted"
        );

        if handoff.is_none() {
            self.spawn_run(&snapshot, tool, cancel);
        }
        Ok(snapshot)
    }

    /// Checks caps. `auto` requests take a slot; approval-required requests
    /// only need one to be free now and take theirs at dispatch.
    fn admit(
        &self,
        level: PermissionLevel,
        user_id: &UserId,
    ) -> Result<Option<ExecutionPermit>, AdmissionError> {
        let admission = &self.inner.admission;
        let permit = if level == PermissionLevel::Auto {
            Some(admission.try_acquire(user_id)?)
        } else {
            admission.check_capacity(user_id)?;
            None
        };
        admission.record_submission(user_id)?;
        Ok(permit)
    }

    /// `pending -> approved`.
    pub fn mark_approved(&self, id: &ExecutionId, approver: &UserId) -> GateResult<ToolExecution> {
        let mut state = self.inner.state.lock();
        let entry = state
            .get_mut(id)
            .ok_or_else(|| GateError::ExecutionNotFound(id.to_string()))?;
        entry.transition(ExecutionStatus::Approved)?;
        entry.execution.approved_by = Some(approver.clone());

        self.emit(EventKind::ExecutionApproved, &entry.execution);
        self.persist(&entry.execution);
        Ok(entry.execution.clone())
    }

    /// `pending -> rejected`.
    pub fn mark_rejected(
        &self,
        id: &ExecutionId,
        approver: &UserId,
        reason: &str,
    ) -> GateResult<ToolExecution> {
        let mut state = self.inner.state.lock();
        let entry = state
            .get_mut(id)
            .ok_or_else(|| GateError::ExecutionNotFound(id.to_string()))?;
        entry.transition(ExecutionStatus::Rejected)?;
        entry.execution.error = Some(ExecutionFailure::new("approval_rejected", reason));
        entry.cancel.cancel();

        self.emit(EventKind::ExecutionRejected, &entry.execution);
        self.persist(&entry.execution);
        self.inner
            .metrics
            .record_finished(&entry.execution.tool_id, ExecutionStatus::Rejected, None);
        info!(execution_id = %id, approver = %approver, "Tool execution rejected");
        Ok(entry.execution.clone())
    }

    /// `pending -> timeout`, once its approval expired.
    pub fn mark_timed_out(&self, id: &ExecutionId) -> GateResult<ToolExecution> {
        let mut state = self.inner.state.lock();
        let entry = state
            .get_mut(id)
            .ok_or_else(|| GateError::ExecutionNotFound(id.to_string()))?;
        if entry.status() != ExecutionStatus::Pending {
            return Err(GateError::InvalidTransition {
                id: id.to_string(),
                from: entry.status(),
                to: ExecutionStatus::Timeout,
            });
        }
        entry.transition(ExecutionStatus::Timeout)?;
        entry.execution.error = Some(ExecutionFailure::new(
            "approval_expired",
            "approval deadline passed with no decision",
        ));
        entry.cancel.cancel();

        self.emit(EventKind::ExecutionFailed, &entry.execution);
        self.persist(&entry.execution);
        self.inner
            .metrics
            .record_finished(&entry.execution.tool_id, ExecutionStatus::Timeout, None);
        info!(execution_id = %id, "Tool execution timed out waiting for approval");
        Ok(entry.execution.clone())
    }

    /// `approved -> executing`, then runs the tool in the background.
    ///
    /// Caps are checked again here; an approved execution over a cap ends in
    /// `error` with the admission code.
    pub fn dispatch(&self, id: &ExecutionId) -> GateResult<ToolExecution> {
        let (snapshot, tool, cancel) = {
            let mut state = self.inner.state.lock();
            let entry = state
                .get_mut(id)
                .ok_or_else(|| GateError::ExecutionNotFound(id.to_string()))?;
            if entry.status() != ExecutionStatus::Approved {
                return Err(GateError::InvalidTransition {
                    id: id.to_string(),
                    from: entry.status(),
                    to: ExecutionStatus::Executing,
                });
            }

            let Some(tool) = self.inner.catalog.get(&entry.execution.tool_id) else {
                let failure = ExecutionFailure::new(
                    "tool_not_found",
                    format!("tool '{}' was removed", entry.execution.tool_id),
                );
                self.fail_locked(entry, failure);
                return Err(GateError::ToolNotFound(entry.execution.tool_id.clone()));
            };

            let permit = match self.inner.admission.try_acquire(&entry.execution.user_id) {
                Ok(permit) => permit,
                Err(e) => {
                    self.inner.metrics.record_admission_rejected();
                    self.fail_locked(entry, ExecutionFailure::from(&e));
                    return Err(e.into());
                }
            };
            entry.start(permit)?;
            self.inner.metrics.record_started();
            self.emit(EventKind::ExecutionStarted, &entry.execution);
            self.persist(&entry.execution);

            (entry.execution.clone(), tool, entry.cancel.clone())
        };

        self.spawn_run(&snapshot, tool, cancel);
        Ok(snapshot)
    }

    fn fail_locked(&self, entry: &mut ExecutionEntry, failure: ExecutionFailure) {
        if let Err(e) = entry.transition(ExecutionStatus::Error) {
            warn!(error = %e, "Could not fail execution");
            return;
        }
        warn!(
            execution_id = %entry.execution.id,
            code = %failure.code,
            "Tool execution failed before start"
        );
        entry.execution.error = Some(failure);
        self.emit(EventKind::ExecutionFailed, &entry.execution);
        self.persist(&entry.execution);
        self.inner
            .metrics
            .record_finished(&entry.execution.tool_id, ExecutionStatus::Error, None);
    }

    fn spawn_run(
        &self,
        execution: &ToolExecution,
        tool: RegisteredTool,
        cancel: CancellationToken,
    ) {
        let registry = self.clone();
        let id = execution.id.clone();
        let input = execution.input.clone();
        let timeout = tool.definition.timeout;

        let progress: ProgressSink = {
            let weak = Arc::downgrade(&self.inner);
            let id = id.clone();
            Arc::new(move |partial| {
                if let Some(inner) = weak.upgrade() {
                    ExecutionRegistry { inner }.record_progress(&id, partial);
                }
            })
        };
        let ctx = RunContext::new(id.clone(), execution.user_id.clone(), cancel.clone())
            .with_progress(progress);

        self.inner.running.fetch_add(1, Ordering::SeqCst);
        let running = Arc::clone(&self.inner.running);
        tokio::spawn(async move {
            let _guard = scopeguard::guard(running, |count| {
                count.fetch_sub(1, Ordering::SeqCst);
            });

            let runner = tool.runner;
            let mut handle = tokio::spawn(async move { runner.execute(input, ctx).await });
            let outcome = tokio::select! {
                joined = &mut handle => match joined {
                    Ok(result) => RunOutcome::Finished(result),
                    Err(e) => RunOutcome::Finished(Err(RunnerError::Failed(format!(
                        "runner task failed: {e}"
                    )))),
                },
                _ = tokio::time::sleep(timeout) => RunOutcome::TimedOut(timeout),
                _ = cancel.cancelled() => RunOutcome::Cancelled,
            };
            if !handle.is_finished() {
                cancel.cancel();
                handle.abort();
            }
            registry.finish(&id, outcome);
        });
    }

    fn finish(&self, id: &ExecutionId, outcome: RunOutcome) {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.get_mut(id) else {
            return;
        };
        if entry.status() != ExecutionStatus::Executing {
            // Cancelled or shut down while the runner was still going
            debug!(
                execution_id = %id,
                status = %entry.status(),
                "Runner finished after execution left executing"
            );
            return;
        }

        let (status, kind) = match outcome {
            RunOutcome::Finished(Ok(output)) => {
                entry.execution.output = Some(output);
                (ExecutionStatus::Completed, EventKind::ExecutionCompleted)
            }
            RunOutcome::Finished(Err(e)) => {
                entry.execution.error = Some(ExecutionFailure::from(&e));
                (ExecutionStatus::Error, EventKind::ExecutionFailed)
            }
            RunOutcome::TimedOut(after) => {
                entry.execution.error = Some(ExecutionFailure::new(
                    "timeout",
                    format!("tool did not finish within {}s", after.as_secs()),
                ));
                (ExecutionStatus::Timeout, EventKind::ExecutionFailed)
            }
            RunOutcome::Cancelled => (ExecutionStatus::Cancelled, EventKind::ExecutionCancelled),
        };
        if let Err(e) = entry.transition(status) {
            warn!(error = %e, "Could not record runner outcome");
            return;
        }

        self.emit(kind, &entry.execution);
        self.persist(&entry.execution);
        let execution = &entry.execution;
        self.inner.metrics.record_finished(
            &execution.tool_id,
            status,
            execution.resource_usage.duration_ms,
        );
        match status {
            ExecutionStatus::Completed => info!(
                execution_id = %id,
                tool_id = %execution.tool_id,
                duration_ms = execution.resource_usage.duration_ms,
                "Tool execution completed"
            ),
            _ => warn!(
                execution_id = %id,
                tool_id = %execution.tool_id,
                status = %status,
                error = execution.error.as_ref().map(|f| f.message.as_str()),
                "Tool execution did not complete"
            ),
        }
    }

    fn record_progress(&self, id: &ExecutionId, partial: Value) {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.get_mut(id) {
            if entry.status() == ExecutionStatus::Executing {
                entry.execution.resource_usage.progress_updates += 1;
                self.inner
                    .notifier
                    .emit(LifecycleEvent::progress(&entry.execution, partial));
            }
        }
    }

    /// Cancels an execution. `Ok(false)` when it already finished.
    pub fn cancel(&self, id: &ExecutionId) -> GateResult<bool> {
        let mut state = self.inner.state.lock();
        let entry = state
            .get_mut(id)
            .ok_or_else(|| GateError::ExecutionNotFound(id.to_string()))?;
        if entry.execution.is_terminal() {
            debug!(
                execution_id = %id,
                status = %entry.status(),
                "Cancel on finished execution ignored"
            );
            return Ok(false);
        }

        let was_pending = entry.status() == ExecutionStatus::Pending;
        self.cancel_locked(entry);
        if was_pending {
            if let Some(handoff) = self.handoff() {
                handoff.close_for_execution(id, "execution cancelled");
            }
        }
        info!(execution_id = %id, "Tool execution cancelled");
        Ok(true)
    }

    fn cancel_locked(&self, entry: &mut ExecutionEntry) {
        if entry.transition(ExecutionStatus::Cancelled).is_err() {
            return;
        }
        entry.cancel.cancel();
        self.emit(EventKind::ExecutionCancelled, &entry.execution);
        self.persist(&entry.execution);
        self.inner.metrics.record_finished(
            &entry.execution.tool_id,
            ExecutionStatus::Cancelled,
            entry.execution.resource_usage.duration_ms,
        );
    }

    pub fn get(&self, id: &ExecutionId) -> Option<ToolExecution> {
        self.inner
            .state
            .lock()
            .get(id)
            .map(|entry| entry.execution.clone())
    }

    /// Like [`get`](Self::get), falling back to the durable store for
    /// executions already dropped from memory.
    pub async fn find(&self, id: &ExecutionId) -> Option<ToolExecution> {
        if let Some(execution) = self.get(id) {
            return Some(execution);
        }
        let writer = self.inner.writer.as_ref()?;
        match writer.store().load(id.as_str()).await {
            Ok(found) => found,
            Err(e) => {
                warn!(execution_id = %id, error = %e, "Failed to load execution from store");
                None
            }
        }
    }

    /// Non-terminal executions, oldest first.
    pub fn list_active(&self, user_id: Option<&UserId>) -> Vec<ToolExecution> {
        let state = self.inner.state.lock();
        let mut active: Vec<_> = state
            .values()
            .map(|entry| &entry.execution)
            .filter(|e| e.status.is_active())
            .filter(|e| user_id.map_or(true, |user| &e.user_id == user))
            .cloned()
            .collect();
        active.sort_by_key(|e| e.requested_at);
        active
    }

    /// Executions matching `filter`, newest first.
    pub fn list_history(&self, filter: &ExecutionFilter) -> Vec<ToolExecution> {
        let state = self.inner.state.lock();
        let mut history: Vec<_> = state
            .values()
            .map(|entry| &entry.execution)
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        history.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        if let Some(limit) = filter.limit {
            history.truncate(limit);
        }
        history
    }

    /// Number of executions currently `executing`.
    pub fn executing_count(&self) -> usize {
        self.inner.admission.executing_global()
    }

    /// Drops terminal executions finished longer than `retention` ago.
    /// Persisted copies are kept.
    pub fn cleanup_history(&self, retention: Duration) -> usize {
        let Some(cutoff) = TimeDelta::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };

        let mut state = self.inner.state.lock();
        let before = state.len();
        state.retain(|_, entry| {
            !(entry.execution.is_terminal()
                && entry.execution.completed_at.is_some_and(|at| at < cutoff))
        });
        self.inner.admission.prune_idle();
        let removed = before - state.len();
        if removed > 0 {
            debug!(removed, "Cleaned up execution history");
        }
        removed
    }

    /// Loads persisted executions. Ones that were still active when the
    /// process stopped cannot resume and are closed out.
    pub async fn restore(&self) -> GateResult<usize> {
        let Some(writer) = &self.inner.writer else {
            return Ok(0);
        };
        let stored = writer.store().list().await.map_err(|e| {
            GateError::Storage(format!("failed to restore executions: {e}"))
        })?;

        let mut state = self.inner.state.lock();
        let mut restored = 0;
        for execution in stored {
            if state.contains_key(&execution.id) {
                continue;
            }
            let mut entry = ExecutionEntry::new(execution, self.inner.shutdown.child_token());
            let interrupted = match entry.status() {
                ExecutionStatus::Pending | ExecutionStatus::Approved => {
                    entry.transition(ExecutionStatus::Cancelled).is_ok()
                }
                ExecutionStatus::Executing => {
                    let ok = entry.transition(ExecutionStatus::Error).is_ok();
                    entry.execution.error = Some(ExecutionFailure::new(
                        "interrupted",
                        "process stopped while the tool was running",
                    ));
                    ok
                }
                _ => false,
            };
            if interrupted {
                self.persist(&entry.execution);
            }
            state.insert(entry.execution.id.clone(), entry);
            restored += 1;
        }
        info!(restored, "Restored executions from store");
        Ok(restored)
    }

    /// Cancels everything still running and waits (bounded) for runners to
    /// wind down.
    pub async fn shutdown(&self) {
        info!("Shutting down execution registry");

        {
            let mut state = self.inner.state.lock();
            for entry in state.values_mut() {
                if entry.status() == ExecutionStatus::Executing {
                    self.cancel_locked(entry);
                }
            }
        }
        self.inner.shutdown.cancel();

        let start = tokio::time::Instant::now();
        while self.inner.running.load(Ordering::SeqCst) > 0 {
            if start.elapsed() >= self.inner.shutdown_timeout {
                warn!(
                    running = self.inner.running.load(Ordering::SeqCst),
                    "Shutdown timeout reached; runners still active"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if let Some(writer) = &self.inner.writer {
            writer.flush().await;
        }
        info!("Execution registry shutdown complete");
    }
}
