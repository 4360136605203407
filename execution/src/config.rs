//! Configuration types for execution gating.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};
use tg_data_connector::StorageBackend;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::{
    policy::PermissionLevel,
    tool::{ParamSpec, SandboxFlag, SandboxFlags, ToolCategory, ToolDefinition},
};

/// Upper bound for every configured duration: ten years.
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutionConfigError {
    #[error("{0} must be positive")]
    NotPositive(&'static str),

    #[error("{field} must be at most {max}")]
    TooLarge { field: &'static str, max: u64 },

    #[error("max_per_user ({per_user}) exceeds max_global ({global})")]
    PerUserExceedsGlobal { per_user: usize, global: usize },

    #[error("tool id must not be empty")]
    EmptyToolId,

    #[error("duplicate tool id '{0}'")]
    DuplicateTool(String),

    #[error("tool '{0}': timeout_secs must be between 1 and {MAX_DURATION_SECS}")]
    ToolTimeout(String),
}

fn check_duration(field: &'static str, secs: u64) -> Result<(), ExecutionConfigError> {
    if secs == 0 {
        return Err(ExecutionConfigError::NotPositive(field));
    }
    if secs > MAX_DURATION_SECS {
        return Err(ExecutionConfigError::TooLarge {
            field,
            max: MAX_DURATION_SECS,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub limits: ConcurrencyLimits,

    #[serde(default)]
    pub approval: ApprovalSettings,

    /// Timeout for tools that do not declare one.
    #[serde(default = "default_tool_timeout_secs")]
    pub default_tool_timeout_secs: u64,

    /// How long terminal executions stay in memory.
    #[serde(default = "default_history_retention_secs")]
    pub history_retention_secs: u64,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub tools: Vec<ToolConfig>,

    #[serde(default)]
    pub storage: StorageBackend,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            limits: ConcurrencyLimits::default(),
            approval: ApprovalSettings::default(),
            default_tool_timeout_secs: default_tool_timeout_secs(),
            history_retention_secs: default_history_retention_secs(),
            policy: PolicyConfig::default(),
            tools: Vec::new(),
            storage: StorageBackend::default(),
        }
    }
}

impl ExecutionConfig {
    pub fn default_tool_timeout(&self) -> Duration {
        Duration::from_secs(self.default_tool_timeout_secs)
    }

    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(self.history_retention_secs)
    }

    pub fn validate(&self) -> Result<(), ExecutionConfigError> {
        self.limits.validate()?;
        self.approval.validate()?;
        check_duration("default_tool_timeout_secs", self.default_tool_timeout_secs)?;
        check_duration("history_retention_secs", self.history_retention_secs)?;
        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            if tool.id.is_empty() {
                return Err(ExecutionConfigError::EmptyToolId);
            }
            if !seen.insert(tool.id.as_str()) {
                return Err(ExecutionConfigError::DuplicateTool(tool.id.clone()));
            }
            if let Some(secs) = tool.timeout_secs {
                if secs == 0 || secs > MAX_DURATION_SECS {
                    return Err(ExecutionConfigError::ToolTimeout(tool.id.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Admission limits. Counts cover executions in the `executing` state only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConcurrencyLimits {
    #[serde(default = "default_max_global")]
    pub max_global: usize,

    #[serde(default = "default_max_per_user")]
    pub max_per_user: usize,

    /// Optional per-user submission rate window.
    #[serde(default)]
    pub max_submissions_per_minute: Option<usize>,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            max_global: default_max_global(),
            max_per_user: default_max_per_user(),
            max_submissions_per_minute: None,
        }
    }
}

impl ConcurrencyLimits {
    pub fn validate(&self) -> Result<(), ExecutionConfigError> {
        if self.max_global == 0 {
            return Err(ExecutionConfigError::NotPositive("max_global"));
        }
        if self.max_per_user == 0 {
            return Err(ExecutionConfigError::NotPositive("max_per_user"));
        }
        if self.max_global > Semaphore::MAX_PERMITS {
            return Err(ExecutionConfigError::TooLarge {
                field: "max_global",
                max: Semaphore::MAX_PERMITS as u64,
            });
        }
        if self.max_per_user > self.max_global {
            return Err(ExecutionConfigError::PerUserExceedsGlobal {
                per_user: self.max_per_user,
                global: self.max_global,
            });
        }
        if self.max_submissions_per_minute == Some(0) {
            return Err(ExecutionConfigError::NotPositive("max_submissions_per_minute"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ApprovalSettings {
    /// Deadline for each escalation level.
    #[serde(default = "default_approval_deadline_secs")]
    pub deadline_secs: u64,

    #[serde(default = "default_max_escalation_levels")]
    pub max_escalation_levels: u32,

    /// How long resolved or expired requests are kept.
    #[serde(default = "default_approval_retention_secs")]
    pub retention_secs: u64,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            deadline_secs: default_approval_deadline_secs(),
            max_escalation_levels: default_max_escalation_levels(),
            retention_secs: default_approval_retention_secs(),
        }
    }
}

impl ApprovalSettings {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn validate(&self) -> Result<(), ExecutionConfigError> {
        check_duration("approval.deadline_secs", self.deadline_secs)?;
        check_duration("approval.retention_secs", self.retention_secs)
    }
}

/// Policy configuration.
///
/// Evaluation order:
/// 1. Explicit tool overrides (tool id -> level)
/// 2. Rules, in order
/// 3. Category defaults
/// 4. Sandbox-flag defaults, with `fallback` for tools without flags
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    #[serde(default = "default_fallback")]
    pub fallback: PermissionLevel,

    #[serde(default)]
    pub tools: HashMap<String, PermissionLevel>,

    #[serde(default)]
    pub categories: HashMap<ToolCategory, PermissionLevel>,

    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            fallback: default_fallback(),
            tools: HashMap::new(),
            categories: HashMap::new(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleConfig {
    pub name: String,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub pattern: RulePatternConfig,
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub condition: RuleConditionConfig,
    pub level: PermissionLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePatternConfig {
    /// Regex over the tool id.
    Tool(String),
    Category(ToolCategory),
    Any,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleConditionConfig {
    #[default]
    Always,
    HasFlag(SandboxFlag),
    LacksFlag(SandboxFlag),
}

/// A tool declared in configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolConfig {
    pub id: String,

    #[serde(default)]
    pub description: Option<String>,

    pub category: ToolCategory,

    /// Conservative flags when omitted.
    #[serde(default)]
    pub sandbox: Option<SandboxFlags>,

    #[serde(default)]
    pub params: Vec<ParamSpec>,

    /// Reject parameters that are not declared.
    #[serde(default)]
    pub strict_params: bool,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Name of a compiled-in runner.
    pub runner: String,

    /// Runner-specific options.
    #[serde(default)]
    pub runner_options: serde_json::Value,
}

impl ToolConfig {
    pub fn to_definition(&self, default_timeout: Duration) -> ToolDefinition {
        let mut def = ToolDefinition::new(self.id.clone(), self.category)
            .with_sandbox(self.sandbox.unwrap_or_else(SandboxFlags::conservative))
            .with_timeout(
                self.timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(default_timeout),
            );
        def.description = self.description.clone();
        def.params = self.params.clone();
        def.allow_unknown_params = !self.strict_params;
        def
    }
}

fn default_tool_timeout_secs() -> u64 {
    120
}

fn default_history_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_global() -> usize {
    20
}

fn default_max_per_user() -> usize {
    3
}

fn default_approval_deadline_secs() -> u64 {
    300
}

fn default_max_escalation_levels() -> u32 {
    3
}

fn default_approval_retention_secs() -> u64 {
    60 * 60
}

fn default_fallback() -> PermissionLevel {
    PermissionLevel::UserApproval
}
