use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    admission::ExecutionPermit,
    error::{GateError, GateResult},
    model::{ExecutionStatus, ToolExecution},
};

/// Registry-side bookkeeping for one execution.
pub(super) struct ExecutionEntry {
    pub execution: ToolExecution,
    pub cancel: CancellationToken,
    permit: Option<ExecutionPermit>,
    started: Option<Instant>,
}

impl ExecutionEntry {
    pub fn new(execution: ToolExecution, cancel: CancellationToken) -> Self {
        Self {
            execution,
            cancel,
            permit: None,
            started: None,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.execution.status
    }

    /// Moves to `to`, stamping timestamps. Leaving `executing` releases the
    /// concurrency slot.
    pub fn transition(&mut self, to: ExecutionStatus) -> GateResult<()> {
        let from = self.execution.status;
        if !from.can_transition_to(to) {
            return Err(GateError::InvalidTransition {
                id: self.execution.id.to_string(),
                from,
                to,
            });
        }

        let now = Utc::now();
        self.execution.status = to;
        match to {
            ExecutionStatus::Approved => self.execution.approved_at = Some(now),
            ExecutionStatus::Executing => {
                self.execution.started_at = Some(now);
                self.started = Some(Instant::now());
            }
            _ => {}
        }
        if to.is_terminal() {
            self.execution.completed_at = Some(now);
            self.execution.resource_usage.duration_ms = self
                .started
                .map(|started| started.elapsed().as_millis() as u64);
            self.permit = None;
        }
        Ok(())
    }

    /// Moves to `executing` holding `permit`.
    pub fn start(&mut self, permit: ExecutionPermit) -> GateResult<()> {
        self.transition(ExecutionStatus::Executing)?;
        self.permit = Some(permit);
        Ok(())
    }

    pub fn holds_permit(&self) -> bool {
        self.permit.is_some()
    }
}
