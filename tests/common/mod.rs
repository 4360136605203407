#![allow(dead_code)]

use std::{sync::Once, time::Duration};

use tg_auth::{IssuedSession, Role, User};
use tg_execution::{ExecutionId, ExecutionStatus, ToolExecution};
use toolgate::{Gateway, GatewayConfig, RunnerRegistry};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

pub const SECRET: &str = "integration-test-secret-0123456789abcdef";

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::WARN.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

/// Tools covering every permission level:
/// `read_file` auto, `write_file` user approval, `shell` admin approval,
/// `wipe_disk` denied, `slow_read` auto and slow.
pub fn test_config() -> GatewayConfig {
    let yaml = format!(
        r#"
auth:
  jwt:
    secret: "{SECRET}"
  max_sessions_per_user: 3
execution:
  limits:
    max_global: 10
    max_per_user: 2
  approval:
    deadline_secs: 10
    max_escalation_levels: 1
  policy:
    tools:
      wipe_disk: denied
  tools:
    - id: read_file
      category: filesystem
      sandbox:
        read_only: true
      params:
        - name: path
          type: string
          required: true
      runner: echo
    - id: write_file
      category: filesystem
      sandbox:
        writes_filesystem: true
      runner: echo
    - id: shell
      category: system
      sandbox:
        executes_commands: true
      runner: echo
    - id: wipe_disk
      category: system
      runner: echo
    - id: slow_read
      category: filesystem
      sandbox:
        read_only: true
      runner: delay
      runner_options:
        delay_ms: 60000
"#
    );
    GatewayConfig::from_yaml(&yaml).expect("test config parses")
}

pub fn gateway() -> Gateway {
    gateway_with(|_| {})
}

pub fn gateway_with(customize: impl FnOnce(&mut GatewayConfig)) -> Gateway {
    init_test_logging();
    let mut config = test_config();
    customize(&mut config);
    Gateway::new(config, &RunnerRegistry::default()).expect("gateway builds")
}

pub fn login(gateway: &Gateway, id: &str, role: Role) -> IssuedSession {
    gateway
        .login(&User::new(id, id, role), false, None, None)
        .expect("login succeeds")
}

/// Polls until the execution reaches `status`.
pub async fn wait_for_status(
    gateway: &Gateway,
    id: &ExecutionId,
    status: ExecutionStatus,
) -> ToolExecution {
    for _ in 0..500 {
        if let Some(execution) = gateway.executions().get(id) {
            if execution.status == status {
                return execution;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution {id} never reached {status}");
}
