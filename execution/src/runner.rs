//! The tool runner contract and built-in runners.
//!
//! Runners are registered at compile time and selected by configuration.
//! The registry owns the timeout clock: a runner that never returns is
//! dropped when its deadline fires. Cancellation, timeout and rejection all
//! reach the runner through the same [`CancellationToken`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Value};
use tg_auth::UserId;
use tokio_util::sync::CancellationToken;

use crate::{error::RunnerError, model::ExecutionId};

/// Callback receiving partial output from a running tool.
pub type ProgressSink = Arc<dyn Fn(Value) + Send + Sync>;

/// Per-execution context handed to a runner.
#[derive(Clone)]
pub struct RunContext {
    pub execution_id: ExecutionId,
    pub user_id: UserId,
    pub cancel: CancellationToken,
    progress: Option<ProgressSink>,
}

impl RunContext {
    pub fn new(execution_id: ExecutionId, user_id: UserId, cancel: CancellationToken) -> Self {
        Self {
            execution_id,
            user_id,
            cancel,
            progress: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Publishes partial output. No-op when nobody listens.
    pub fn report_progress(&self, partial: Value) {
        if let Some(sink) = &self.progress {
            sink(partial);
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("execution_id", &self.execution_id)
            .field("user_id", &self.user_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Executes a tool.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn execute(&self, input: Value, ctx: RunContext) -> Result<Value, RunnerError>;
}

/// Returns its input unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoRunner;

#[async_trait]
impl ToolRunner for EchoRunner {
    async fn execute(&self, input: Value, _ctx: RunContext) -> Result<Value, RunnerError> {
        Ok(json!({ "echo": input }))
    }
}

/// Waits for a fixed delay, reporting progress once per step, then echoes.
#[derive(Debug, Clone)]
pub struct DelayRunner {
    delay: Duration,
    steps: u32,
}

impl DelayRunner {
    pub fn new(delay: Duration) -> Self {
        Self { delay, steps: 1 }
    }

    #[must_use]
    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps.max(1);
        self
    }
}

#[async_trait]
impl ToolRunner for DelayRunner {
    async fn execute(&self, input: Value, ctx: RunContext) -> Result<Value, RunnerError> {
        let step = self.delay / self.steps;
        for i in 1..=self.steps {
            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                _ = ctx.cancel.cancelled() => return Err(RunnerError::Cancelled),
            }
            ctx.report_progress(json!({ "step": i, "of": self.steps }));
        }
        Ok(json!({ "echo": input }))
    }
}

/// Always fails with the configured message.
#[derive(Debug, Clone)]
pub struct FailingRunner {
    message: String,
}

impl FailingRunner {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl ToolRunner for FailingRunner {
    async fn execute(&self, _input: Value, _ctx: RunContext) -> Result<Value, RunnerError> {
        Err(RunnerError::Failed(self.message.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn ctx() -> RunContext {
        RunContext::new(
            ExecutionId::new("exec-1"),
            UserId::new("alice"),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_echo_runner() {
        let out = EchoRunner.execute(json!({"a": 1}), ctx()).await.unwrap();
        assert_eq!(out, json!({"echo": {"a": 1}}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_runner_reports_progress() {
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        let ctx = ctx().with_progress(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let runner = DelayRunner::new(Duration::from_secs(3)).with_steps(3);
        let out = runner.execute(json!("hi"), ctx).await.unwrap();

        assert_eq!(out, json!({"echo": "hi"}));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_runner_honors_cancel() {
        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        let handle = tokio::spawn(async move {
            DelayRunner::new(Duration::from_secs(60))
                .execute(json!(null), ctx)
                .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), Err(RunnerError::Cancelled));
    }

    #[tokio::test]
    async fn test_failing_runner() {
        let err = FailingRunner::new("boom")
            .execute(json!({}), ctx())
            .await
            .unwrap_err();
        assert_eq!(err, RunnerError::Failed("boom".into()));
    }
}
