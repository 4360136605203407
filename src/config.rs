//! Top-level configuration file.
//!
//! ```yaml
//! auth:
//!   jwt:
//!     secret: "..."
//!   max_sessions_per_user: 5
//! execution:
//!   limits: { max_global: 20, max_per_user: 3 }
//!   approval: { deadline_secs: 300, max_escalation_levels: 3 }
//!   tools:
//!     - id: read_file
//!       category: filesystem
//!       sandbox: { read_only: true }
//!       runner: echo
//! logging:
//!   level: info
//! ```

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tg_auth::{AuthConfig, AuthConfigError};
use tg_execution::{ExecutionConfig, ExecutionConfigError};
use thiserror::Error;

use crate::logging::LoggingConfig;

const MAX_MAINTENANCE_INTERVAL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid auth config: {0}")]
    Auth(#[from] AuthConfigError),

    #[error("invalid execution config: {0}")]
    Execution(#[from] ExecutionConfigError),

    #[error("maintenance_interval_secs must be at most {max}")]
    MaintenanceInterval { max: u64 },

    #[error("invalid logging config: {0}")]
    Logging(String),

    #[error("tool '{tool_id}' uses unknown runner '{kind}'")]
    UnknownRunner { tool_id: String, kind: String },

    #[error("tool '{tool_id}' has invalid runner options: {reason}")]
    RunnerOptions { tool_id: String, reason: String },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Interval of the background maintenance pass.
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            auth: AuthConfig::default(),
            execution: ExecutionConfig::default(),
            logging: LoggingConfig::default(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
        }
    }
}

impl GatewayConfig {
    pub fn from_yaml(source: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&source)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.auth.validate()?;
        self.execution.validate()?;
        if self.maintenance_interval_secs > MAX_MAINTENANCE_INTERVAL_SECS {
            return Err(ConfigError::MaintenanceInterval {
                max: MAX_MAINTENANCE_INTERVAL_SECS,
            });
        }
        self.logging.level_filter().map_err(ConfigError::Logging)?;
        Ok(())
    }
}

fn default_maintenance_interval_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use tg_execution::{PermissionLevel, ToolCategory};

    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_defaults_need_a_secret() {
        let config = GatewayConfig::from_yaml("{}").unwrap();
        assert_eq!(config.auth.max_sessions_per_user, 5);
        assert_eq!(config.execution.limits.max_per_user, 3);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Auth(AuthConfigError::SecretTooShort { .. }))
        ));
    }

    #[test]
    fn test_full_config() {
        let yaml = format!(
            r#"
auth:
  jwt:
    secret: "{SECRET}"
  max_sessions_per_user: 2
execution:
  limits:
    max_global: 4
    max_per_user: 1
  approval:
    deadline_secs: 60
  policy:
    tools:
      git_push: admin_approval
  tools:
    - id: read_file
      category: filesystem
      sandbox:
        read_only: true
      runner: echo
    - id: git_push
      category: git
      runner: delay
      runner_options:
        delay_ms: 10
logging:
  level: debug
  json: true
"#
        );
        let config = GatewayConfig::from_yaml(&yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.auth.max_sessions_per_user, 2);
        assert_eq!(config.execution.approval.deadline_secs, 60);
        assert_eq!(
            config.execution.policy.tools.get("git_push"),
            Some(&PermissionLevel::AdminApproval)
        );
        assert_eq!(config.execution.tools[1].category, ToolCategory::Git);
        assert!(config.logging.json);
    }

    #[test]
    fn test_invalid_execution_config() {
        let yaml = format!(
            r#"
auth:
  jwt:
    secret: "{SECRET}"
execution:
  limits:
    max_global: 0
"#
        );
        let config = GatewayConfig::from_yaml(&yaml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Execution(ExecutionConfigError::NotPositive(
                "max_global"
            )))
        ));
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let yaml = format!(
            r#"
auth:
  jwt:
    secret: "{SECRET}"
execution:
  approval:
    deadline_secs: 10000000000000
"#
        );
        let config = GatewayConfig::from_yaml(&yaml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Execution(ExecutionConfigError::TooLarge { .. }))
        ));

        let mut config = GatewayConfig::default();
        config.auth.jwt.secret = SECRET.to_string();
        config.auth.jwt.refresh_token_ttl_secs = i64::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Auth(AuthConfigError::TtlTooLong(
                "refresh_token_ttl_secs"
            )))
        ));

        let mut config = GatewayConfig::default();
        config.auth.jwt.secret = SECRET.to_string();
        config.maintenance_interval_secs = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MaintenanceInterval { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = GatewayConfig::from_file("/nonexistent/toolgate.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
