//! Periodic housekeeping: approval deadlines, retention and expired sessions.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tg_auth::SessionRegistry;
use tg_execution::{ApprovalCoordinator, ExecutionRegistry};
use tokio::{sync::watch, task::JoinHandle, time::interval};
use tracing::{debug, info, warn};

/// What one maintenance pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub approvals_processed: usize,
    pub approvals_purged: usize,
    pub executions_purged: usize,
    pub sessions_expired: usize,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct MaintenanceTask {
    sessions: Arc<SessionRegistry>,
    executions: ExecutionRegistry,
    approvals: Arc<ApprovalCoordinator>,
    interval: Duration,
    approval_retention: Duration,
    history_retention: Duration,
}

impl MaintenanceTask {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        executions: ExecutionRegistry,
        approvals: Arc<ApprovalCoordinator>,
        interval: Duration,
        history_retention: Duration,
    ) -> Self {
        let approval_retention = approvals.settings().retention();
        Self {
            sessions,
            executions,
            approvals,
            interval,
            approval_retention,
            history_retention,
        }
    }

    /// Runs every housekeeping step once.
    pub fn run_once(&self) -> MaintenanceReport {
        MaintenanceReport {
            approvals_processed: self.approvals.process_deadlines(Utc::now()),
            approvals_purged: self.approvals.cleanup_expired(self.approval_retention),
            executions_purged: self.executions.cleanup_history(self.history_retention),
            sessions_expired: self.sessions.cleanup_expired(),
        }
    }

    /// Runs until `shutdown_rx` changes or its sender is dropped.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        info!(
            "Starting maintenance task with {}s interval",
            self.interval.as_secs()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_once();
                    if !report.is_empty() {
                        debug!(?report, "Maintenance pass");
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Maintenance task received shutdown signal");
                    break;
                }
            }
        }

        info!("Maintenance task stopped");
    }

    /// Spawns [`run`](Self::run) on the current runtime.
    pub fn spawn(self) -> MaintenanceHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        MaintenanceHandle { shutdown_tx, task }
    }
}

/// Stops the spawned maintenance task.
pub struct MaintenanceHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    pub async fn stop(self) {
        if self.shutdown_tx.send(true).is_err() {
            debug!("Maintenance task already gone");
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "Maintenance task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tg_auth::{JwtConfig, Role, TokenAuthority, User};
    use tg_execution::{
        Actor, ApprovalSettings, EchoRunner, ExecutionRequest, ExecutionStatus, PermissionPolicy,
        SandboxFlags, ToolCatalog, ToolCategory, ToolDefinition,
    };

    use super::*;

    fn task(settings: ApprovalSettings) -> (MaintenanceTask, ExecutionRegistry) {
        let authority =
            TokenAuthority::new(&JwtConfig::with_secret("0123456789abcdef0123456789abcdef"))
                .unwrap();
        let sessions = Arc::new(SessionRegistry::new(Arc::new(authority), 5));

        let catalog = ToolCatalog::new();
        catalog.register(
            ToolDefinition::new("write_file", ToolCategory::Filesystem)
                .with_sandbox(SandboxFlags::new().with_writes_filesystem(true)),
            Arc::new(EchoRunner),
        );
        let executions =
            ExecutionRegistry::builder(Arc::new(catalog), Arc::new(PermissionPolicy::new()))
                .build();
        let approvals = ApprovalCoordinator::new(
            executions.clone(),
            Arc::new(tg_execution::TracingNotifier),
            settings,
        );

        sessions
            .create_session(&User::new("alice", "alice", Role::User), false, None, None)
            .unwrap();

        let task = MaintenanceTask::new(
            sessions,
            executions.clone(),
            approvals,
            Duration::from_secs(1),
            Duration::from_secs(3600),
        );
        (task, executions)
    }

    #[tokio::test]
    async fn test_run_once_on_idle_state() {
        let (task, _) = task(ApprovalSettings::default());
        assert!(task.run_once().is_empty());
    }

    #[tokio::test]
    async fn test_run_once_expires_overdue_approvals() {
        let (task, executions) = task(ApprovalSettings {
            max_escalation_levels: 0,
            ..Default::default()
        });
        let actor = Actor::new("alice", Role::User);
        let execution = executions
            .submit(ExecutionRequest::new("write_file", &actor, json!({})))
            .unwrap();

        // Nothing is due yet
        assert_eq!(task.run_once().approvals_processed, 0);

        let report = task.approvals.process_deadlines(Utc::now() + chrono::TimeDelta::hours(1));
        assert_eq!(report, 1);
        assert_eq!(
            executions.get(&execution.id).unwrap().status,
            ExecutionStatus::Timeout
        );
    }

    #[tokio::test]
    async fn test_spawned_task_stops() {
        let (task, _) = task(ApprovalSettings::default());
        let handle = task.spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .unwrap();
    }
}
