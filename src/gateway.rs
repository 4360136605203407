//! The gateway facade.
//!
//! [`Gateway`] wires the session registry, the execution registry and the
//! approval coordinator together from a [`GatewayConfig`], and puts an
//! access-token check in front of every user-facing operation. The transport
//! layer is expected to call these methods with the bearer token it received.

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tg_auth::{
    IssuedSession, Principal, SessionId, SessionPayload, SessionRegistry, TokenAuthority,
    TokenRefresh, User, UserId,
};
use tg_data_connector::{create_store, StorageBackend};
use tg_execution::{
    Actor, ApprovalCoordinator, ApprovalDecision, ApprovalId, ApprovalRequest, AuditEntry,
    BroadcastNotifier, EventNotifier, ExecutionFilter, ExecutionId, ExecutionRegistry,
    ExecutionRequest, FanoutNotifier, GateError, LifecycleEvent, MetricsSnapshot, PermissionPolicy,
    ToolCatalog, ToolDefinition, ToolExecution, TracingNotifier,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    config::GatewayConfig,
    error::{GatewayError, GatewayResult},
    maintenance::{MaintenanceHandle, MaintenanceTask},
    runners::RunnerRegistry,
};

/// Conversation a tool call belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRef {
    pub conversation_id: String,
    pub message_id: String,
}

impl ConversationRef {
    pub fn new(conversation_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
        }
    }
}

pub struct Gateway {
    config: GatewayConfig,
    sessions: Arc<SessionRegistry>,
    executions: ExecutionRegistry,
    approvals: Arc<ApprovalCoordinator>,
    events: Arc<BroadcastNotifier>,
}

impl Gateway {
    /// Builds every component from `config`.
    ///
    /// Must be called inside a tokio runtime when a storage backend is
    /// configured, because the write-behind writers spawn their tasks here.
    pub fn new(config: GatewayConfig, runners: &RunnerRegistry) -> GatewayResult<Self> {
        config.validate()?;

        let authority = TokenAuthority::new(&config.auth.jwt)
            .map_err(|e| GatewayError::Config(e.into()))?;
        let mut sessions =
            SessionRegistry::new(Arc::new(authority), config.auth.max_sessions_per_user);
        if config.auth.storage != StorageBackend::None {
            sessions = sessions.with_store(create_store(config.auth.storage));
        }

        let execution_config = &config.execution;
        let catalog = ToolCatalog::new();
        for tool in &execution_config.tools {
            let runner = runners.build(&tool.id, &tool.runner, &tool.runner_options)?;
            catalog.register(
                tool.to_definition(execution_config.default_tool_timeout()),
                runner,
            );
        }
        let policy = PermissionPolicy::from_config(&execution_config.policy)?;

        let events = Arc::new(BroadcastNotifier::default());
        let notifier: Arc<dyn EventNotifier> = Arc::new(
            FanoutNotifier::new()
                .with(events.clone())
                .with(Arc::new(TracingNotifier)),
        );

        let mut builder = ExecutionRegistry::builder(Arc::new(catalog), Arc::new(policy))
            .limits(execution_config.limits)
            .notifier(notifier.clone());
        if execution_config.storage != StorageBackend::None {
            builder = builder.store(create_store(execution_config.storage));
        }
        let executions = builder.build();
        let approvals = ApprovalCoordinator::new(
            executions.clone(),
            notifier,
            execution_config.approval,
        );

        info!(
            tools = executions.catalog().len(),
            max_global = execution_config.limits.max_global,
            max_per_user = execution_config.limits.max_per_user,
            max_sessions_per_user = config.auth.max_sessions_per_user,
            "Gateway initialized"
        );

        Ok(Self {
            config,
            sessions: Arc::new(sessions),
            executions,
            approvals,
            events,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn executions(&self) -> &ExecutionRegistry {
        &self.executions
    }

    pub fn approvals(&self) -> &Arc<ApprovalCoordinator> {
        &self.approvals
    }

    /// Reloads sessions and executions from their stores.
    pub async fn restore(&self) -> GatewayResult<(usize, usize)> {
        let sessions = self.sessions.restore().await?;
        let executions = self.executions.restore().await?;
        Ok((sessions, executions))
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Opens a session for a user whose credentials were already checked
    /// upstream.
    pub fn login(
        &self,
        user: &User,
        remember_me: bool,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> GatewayResult<IssuedSession> {
        Ok(self
            .sessions
            .create_session(user, remember_me, ip_address, user_agent)?)
    }

    /// Validates an access token against its live session.
    pub fn authenticate(&self, access_token: &str) -> GatewayResult<Principal> {
        Ok(self.sessions.authenticate(access_token)?)
    }

    /// Rotates a refresh token. `None` means the session is gone.
    pub fn refresh(&self, refresh_token: &str) -> GatewayResult<Option<TokenRefresh>> {
        Ok(self.sessions.refresh_access_token(refresh_token)?)
    }

    /// Whether the client should refresh before its next call.
    pub fn should_refresh(&self, access_token: &str) -> bool {
        let secs = u64::try_from(self.config.auth.refresh_threshold_secs).unwrap_or(0);
        let threshold = Duration::from_secs(secs);
        self.sessions
            .authority()
            .is_expiring_soon(access_token, threshold)
    }

    pub fn logout(&self, access_token: &str) -> GatewayResult<bool> {
        let principal = self.authenticate(access_token)?;
        Ok(self.sessions.destroy_session(&principal.session_id))
    }

    /// Ends every session of the caller, including the current one.
    pub fn logout_all(&self, access_token: &str) -> GatewayResult<usize> {
        let principal = self.authenticate(access_token)?;
        Ok(self.sessions.destroy_all_sessions(&principal.user_id))
    }

    /// Ends every session of the caller except the current one.
    pub fn logout_others(&self, access_token: &str) -> GatewayResult<usize> {
        let principal = self.authenticate(access_token)?;
        Ok(self
            .sessions
            .destroy_other_sessions(&principal.user_id, &principal.session_id))
    }

    pub fn list_sessions(&self, access_token: &str) -> GatewayResult<Vec<SessionPayload>> {
        let principal = self.authenticate(access_token)?;
        Ok(self
            .sessions
            .get_user_sessions(&principal.user_id, Some(&principal.session_id)))
    }

    /// Sessions of another user. Admin only.
    pub fn list_user_sessions(
        &self,
        access_token: &str,
        user_id: &UserId,
    ) -> GatewayResult<Vec<SessionPayload>> {
        let principal = self.authenticate(access_token)?;
        if !principal.is_admin() && principal.user_id != *user_id {
            return Err(GatewayError::Forbidden(
                "only admins can list other users' sessions".to_string(),
            ));
        }
        Ok(self
            .sessions
            .get_user_sessions(user_id, Some(&principal.session_id)))
    }

    /// Revokes one session. Users may revoke their own; admins any.
    pub fn revoke_session(&self, access_token: &str, session_id: &SessionId) -> GatewayResult<()> {
        let principal = self.authenticate(access_token)?;
        let session = self
            .sessions
            .get_session(session_id)
            .filter(|s| s.is_active)
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))?;

        if session.user_id != principal.user_id && !principal.is_admin() {
            warn!(
                user_id = %principal.user_id,
                session_id = %session_id,
                "Refused to revoke another user's session"
            );
            return Err(GatewayError::Forbidden(
                "cannot revoke another user's session".to_string(),
            ));
        }

        if !self.sessions.destroy_session(session_id) {
            return Err(GatewayError::SessionNotFound(session_id.to_string()));
        }
        info!(
            revoked_by = %principal.user_id,
            owner = %session.user_id,
            session_id = %session_id,
            "Session revoked"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Executions
    // ------------------------------------------------------------------

    /// Submits a tool call on behalf of the token's user.
    pub fn submit(
        &self,
        access_token: &str,
        tool_id: &str,
        input: Value,
        conversation: Option<ConversationRef>,
    ) -> GatewayResult<ToolExecution> {
        let actor = self.actor(access_token)?;
        let mut request = ExecutionRequest::new(tool_id, &actor, input);
        if let Some(c) = conversation {
            request = request.with_conversation(c.conversation_id, c.message_id);
        }
        Ok(self.executions.submit(request)?)
    }

    pub async fn get_execution(
        &self,
        access_token: &str,
        id: &ExecutionId,
    ) -> GatewayResult<ToolExecution> {
        let actor = self.actor(access_token)?;
        let execution = self
            .executions
            .find(id)
            .await
            .ok_or_else(|| GateError::ExecutionNotFound(id.to_string()))?;
        Self::check_owner(&actor, &execution)?;
        Ok(execution)
    }

    /// Cancels a pending, approved or executing call. Owner or admin only.
    pub fn cancel_execution(&self, access_token: &str, id: &ExecutionId) -> GatewayResult<bool> {
        let actor = self.actor(access_token)?;
        let execution = self
            .executions
            .get(id)
            .ok_or_else(|| GateError::ExecutionNotFound(id.to_string()))?;
        Self::check_owner(&actor, &execution)?;
        Ok(self.executions.cancel(id)?)
    }

    /// Non-terminal executions. Admins see every user's.
    pub fn list_active(&self, access_token: &str) -> GatewayResult<Vec<ToolExecution>> {
        let actor = self.actor(access_token)?;
        let user = (!actor.is_admin()).then_some(&actor.user_id);
        Ok(self.executions.list_active(user))
    }

    /// Execution history. Non-admins only ever see their own.
    pub fn list_history(
        &self,
        access_token: &str,
        mut filter: ExecutionFilter,
    ) -> GatewayResult<Vec<ToolExecution>> {
        let actor = self.actor(access_token)?;
        if !actor.is_admin() {
            filter.user_id = Some(actor.user_id);
        }
        Ok(self.executions.list_history(&filter))
    }

    pub fn tools(&self) -> Vec<Arc<ToolDefinition>> {
        self.executions.catalog().definitions()
    }

    // ------------------------------------------------------------------
    // Approvals
    // ------------------------------------------------------------------

    pub fn resolve_approval(
        &self,
        access_token: &str,
        id: &ApprovalId,
        decision: ApprovalDecision,
        reason: Option<String>,
    ) -> GatewayResult<ApprovalRequest> {
        let actor = self.actor(access_token)?;
        Ok(self.approvals.resolve(id, decision, &actor, reason)?)
    }

    /// Requests the caller may resolve right now.
    pub fn pending_approvals(&self, access_token: &str) -> GatewayResult<Vec<ApprovalRequest>> {
        let actor = self.actor(access_token)?;
        Ok(self.approvals.list_pending(Some(&actor)))
    }

    /// Most recent authorization decisions. Admin only.
    pub fn audit_log(&self, access_token: &str, limit: usize) -> GatewayResult<Vec<AuditEntry>> {
        let actor = self.actor(access_token)?;
        if !actor.is_admin() {
            return Err(GatewayError::Forbidden(
                "audit log requires the admin role".to_string(),
            ));
        }
        Ok(self.executions.audit_log().recent(limit))
    }

    /// Decisions made by or for one user, newest first. Admins may read
    /// anyone's; other users only their own.
    pub fn user_audit_log(
        &self,
        access_token: &str,
        user_id: &UserId,
        limit: usize,
    ) -> GatewayResult<Vec<AuditEntry>> {
        let actor = self.actor(access_token)?;
        if !actor.is_admin() && actor.user_id != *user_id {
            return Err(GatewayError::Forbidden(
                "only admins can read other users' audit entries".to_string(),
            ));
        }
        Ok(self.executions.audit_log().for_actor(user_id, limit))
    }

    // ------------------------------------------------------------------
    // Events, metrics, lifecycle
    // ------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.executions.metrics().snapshot()
    }

    /// Spawns the periodic maintenance task.
    pub fn start_maintenance(&self) -> MaintenanceHandle {
        MaintenanceTask::new(
            self.sessions.clone(),
            self.executions.clone(),
            self.approvals.clone(),
            self.config.maintenance_interval(),
            self.config.execution.history_retention(),
        )
        .spawn()
    }

    /// Stops approval timers, cancels running tools and flushes the stores.
    pub async fn shutdown(&self) {
        info!("Shutting down gateway");
        self.approvals.shutdown();
        self.executions.shutdown().await;
        self.sessions.flush().await;
    }

    fn actor(&self, access_token: &str) -> GatewayResult<Actor> {
        Ok(Actor::from(&self.authenticate(access_token)?))
    }

    fn check_owner(actor: &Actor, execution: &ToolExecution) -> GatewayResult<()> {
        if actor.is_admin() || execution.user_id == actor.user_id {
            Ok(())
        } else {
            Err(GatewayError::Forbidden(format!(
                "execution {} belongs to another user",
                execution.id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tg_auth::Role;
    use tg_execution::{ExecutionStatus, ToolConfig};

    use super::*;

    fn config() -> GatewayConfig {
        GatewayConfig::from_yaml(
            r#"
auth:
  jwt:
    secret: "0123456789abcdef0123456789abcdef"
execution:
  tools:
    - id: read_file
      category: filesystem
      sandbox:
        read_only: true
      runner: echo
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_builds_catalog_from_config() {
        let gateway = Gateway::new(config(), &RunnerRegistry::default()).unwrap();
        let tools = gateway.tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].id, "read_file");
    }

    #[tokio::test]
    async fn test_unknown_runner_is_a_config_error() {
        let mut config = config();
        let mut tool: ToolConfig = config.execution.tools[0].clone();
        tool.id = "shell".to_string();
        tool.runner = "bash".to_string();
        config.execution.tools.push(tool);

        let err = Gateway::new(config, &RunnerRegistry::default()).err().unwrap();
        assert_eq!(err.code(), "config");
    }

    #[tokio::test]
    async fn test_operations_require_a_valid_token() {
        let gateway = Gateway::new(config(), &RunnerRegistry::default()).unwrap();
        let err = gateway
            .submit("not-a-token", "read_file", json!({}), None)
            .unwrap_err();
        assert!(err.is_unauthenticated());
    }

    #[tokio::test]
    async fn test_other_users_executions_are_hidden() {
        let gateway = Gateway::new(config(), &RunnerRegistry::default()).unwrap();
        let alice = gateway
            .login(&User::new("alice", "alice", Role::User), false, None, None)
            .unwrap();
        let bob = gateway
            .login(&User::new("bob", "bob", Role::User), false, None, None)
            .unwrap();
        let admin = gateway
            .login(&User::new("root", "root", Role::Admin), false, None, None)
            .unwrap();

        let execution = gateway
            .submit(
                &alice.access_token,
                "read_file",
                json!({"path": "/tmp/a"}),
                Some(ConversationRef::new("c1", "m1")),
            )
            .unwrap();
        assert_eq!(execution.conversation_id.as_deref(), Some("c1"));

        let err = gateway
            .get_execution(&bob.access_token, &execution.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");

        let seen = gateway
            .get_execution(&admin.access_token, &execution.id)
            .await
            .unwrap();
        assert_eq!(seen.user_id, execution.user_id);

        let history = gateway
            .list_history(&bob.access_token, ExecutionFilter::default())
            .unwrap();
        assert!(history.is_empty());

        assert!(matches!(
            gateway.audit_log(&bob.access_token, 10),
            Err(GatewayError::Forbidden(_))
        ));
        assert!(!gateway.audit_log(&admin.access_token, 10).unwrap().is_empty());

        let own = gateway
            .user_audit_log(&alice.access_token, &execution.user_id, 10)
            .unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].execution_id, execution.id);
        assert!(matches!(
            gateway.user_audit_log(&bob.access_token, &execution.user_id, 10),
            Err(GatewayError::Forbidden(_))
        ));
        assert_eq!(
            gateway
                .user_audit_log(&admin.access_token, &execution.user_id, 10)
                .unwrap()
                .len(),
            1
        );

        for _ in 0..100 {
            let status = gateway.executions().get(&execution.id).unwrap().status;
            if status == ExecutionStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        gateway.shutdown().await;
    }
}
