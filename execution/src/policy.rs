//! Permission policy for tool execution requests.
//!
//! Evaluation order:
//! 1. Explicit per-tool override
//! 2. Ordered pattern rules (first match wins)
//! 3. Per-category default
//! 4. Sandbox-flag default
//!
//! The caller's role is applied afterwards: `read_only` users may only run
//! read-only tools, admins may approve their own admin-level requests.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tg_auth::Role;

use crate::{
    approval::{ApproverClass, DecisionSource},
    config::{PolicyConfig, RuleConditionConfig, RuleConfig, RulePatternConfig},
    error::{GateError, GateResult},
    tool::{SandboxFlag, SandboxFlags, ToolCategory, ToolDefinition},
};

/// Classification of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Auto,
    UserApproval,
    AdminApproval,
    Denied,
}

impl PermissionLevel {
    pub fn requires_approval(&self) -> bool {
        matches!(
            self,
            PermissionLevel::UserApproval | PermissionLevel::AdminApproval
        )
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, PermissionLevel::Denied)
    }

    /// Who may resolve the approval for this level, if one is needed.
    pub fn approver_class(&self) -> Option<ApproverClass> {
        match self {
            PermissionLevel::UserApproval => Some(ApproverClass::UserSelf),
            PermissionLevel::AdminApproval => Some(ApproverClass::Admin),
            PermissionLevel::Auto | PermissionLevel::Denied => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::Auto => "auto",
            PermissionLevel::UserApproval => "user_approval",
            PermissionLevel::AdminApproval => "admin_approval",
            PermissionLevel::Denied => "denied",
        }
    }
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk attached to an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Pattern for matching in policy rules.
#[derive(Debug, Clone)]
pub enum RulePattern {
    Tool(Regex),
    Category(ToolCategory),
    Any,
}

impl RulePattern {
    pub fn matches(&self, tool_id: &str, category: ToolCategory) -> bool {
        match self {
            RulePattern::Tool(re) => re.is_match(tool_id),
            RulePattern::Category(c) => *c == category,
            RulePattern::Any => true,
        }
    }
}

/// Condition for policy rules.
#[derive(Debug, Clone)]
pub enum RuleCondition {
    Always,
    HasFlag(SandboxFlag),
    LacksFlag(SandboxFlag),
}

impl RuleCondition {
    pub fn evaluate(&self, flags: &SandboxFlags) -> bool {
        match self {
            RuleCondition::Always => true,
            RuleCondition::HasFlag(flag) => flag.matches(flags),
            RuleCondition::LacksFlag(flag) => !flag.matches(flags),
        }
    }
}

/// A policy rule combining pattern, condition, and level.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub name: String,
    pub pattern: RulePattern,
    pub condition: RuleCondition,
    pub level: PermissionLevel,
}

impl PolicyRule {
    pub fn new(
        name: impl Into<String>,
        pattern: RulePattern,
        condition: RuleCondition,
        level: PermissionLevel,
    ) -> Self {
        Self {
            name: name.into(),
            pattern,
            condition,
            level,
        }
    }

    pub fn evaluate(
        &self,
        tool: &ToolDefinition,
        category: ToolCategory,
    ) -> Option<PermissionLevel> {
        if self.pattern.matches(&tool.id, category) && self.condition.evaluate(&tool.sandbox) {
            Some(self.level)
        } else {
            None
        }
    }
}

/// Outcome of a policy evaluation with the step that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub level: PermissionLevel,
    pub source: DecisionSource,
    pub reason: Option<String>,
}

impl Classification {
    fn new(level: PermissionLevel, source: DecisionSource) -> Self {
        Self {
            level,
            source,
            reason: None,
        }
    }
}

/// Classifies tool calls. Holds no mutable state.
#[derive(Debug, Clone)]
pub struct PermissionPolicy {
    tool_overrides: HashMap<String, PermissionLevel>,
    rules: Vec<PolicyRule>,
    category_defaults: HashMap<ToolCategory, PermissionLevel>,
    fallback: PermissionLevel,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionPolicy {
    pub fn new() -> Self {
        Self {
            tool_overrides: HashMap::new(),
            rules: Vec::new(),
            category_defaults: HashMap::new(),
            fallback: PermissionLevel::UserApproval,
        }
    }

    #[must_use]
    pub fn with_tool_override(
        mut self,
        tool_id: impl Into<String>,
        level: PermissionLevel,
    ) -> Self {
        self.tool_overrides.insert(tool_id.into(), level);
        self
    }

    #[must_use]
    pub fn with_rule(mut self, rule: PolicyRule) -> Self {
        self.rules.push(rule);
        self
    }

    #[must_use]
    pub fn with_category_default(
        mut self,
        category: ToolCategory,
        level: PermissionLevel,
    ) -> Self {
        self.category_defaults.insert(category, level);
        self
    }

    /// Level for tools whose flags say nothing (not read-only, no writes,
    /// no network, no commands).
    #[must_use]
    pub fn with_fallback(mut self, level: PermissionLevel) -> Self {
        self.fallback = level;
        self
    }

    /// Classifies a call to `tool` by a user with `role`.
    pub fn classify(
        &self,
        tool: &ToolDefinition,
        role: Role,
        category: ToolCategory,
    ) -> PermissionLevel {
        self.explain(tool, role, category).level
    }

    /// Like [`classify`](Self::classify), also reporting which step decided.
    pub fn explain(
        &self,
        tool: &ToolDefinition,
        role: Role,
        category: ToolCategory,
    ) -> Classification {
        let base = self.base_classification(tool, category);
        Self::apply_role(base, tool, role)
    }

    fn base_classification(&self, tool: &ToolDefinition, category: ToolCategory) -> Classification {
        // 1. Explicit tool override
        if let Some(level) = self.tool_overrides.get(&tool.id) {
            return Classification::new(*level, DecisionSource::ExplicitToolPolicy);
        }

        // 2. Pattern rules in order
        for rule in &self.rules {
            if let Some(level) = rule.evaluate(tool, category) {
                let mut classification = Classification::new(level, DecisionSource::RuleMatch);
                if level.is_denied() {
                    classification.reason = Some(format!("denied by rule '{}'", rule.name));
                }
                return classification;
            }
        }

        // 3. Category default
        if let Some(level) = self.category_defaults.get(&category) {
            return Classification::new(*level, DecisionSource::CategoryDefault);
        }

        // 4. Sandbox flags
        Classification::new(self.flag_default(&tool.sandbox), DecisionSource::SandboxDefault)
    }

    fn flag_default(&self, flags: &SandboxFlags) -> PermissionLevel {
        if flags.executes_commands {
            PermissionLevel::AdminApproval
        } else if flags.writes_filesystem || flags.network_access {
            PermissionLevel::UserApproval
        } else if flags.read_only {
            PermissionLevel::Auto
        } else {
            self.fallback
        }
    }

    fn apply_role(mut base: Classification, tool: &ToolDefinition, role: Role) -> Classification {
        match role {
            Role::ReadOnly if !base.level.is_denied() && !tool.sandbox.read_only => {
                Classification {
                    level: PermissionLevel::Denied,
                    source: DecisionSource::RoleRestriction,
                    reason: Some(format!(
                        "role '{}' may only run read-only tools",
                        Role::ReadOnly
                    )),
                }
            }
            Role::Admin if base.level == PermissionLevel::AdminApproval => {
                base.level = PermissionLevel::UserApproval;
                base
            }
            _ => {
                if base.level.is_denied() && base.reason.is_none() {
                    base.reason = Some(format!("tool '{}' is denied by policy", tool.id));
                }
                base
            }
        }
    }

    /// Risk of running `tool`, from its category and sandbox flags.
    pub fn risk_level(tool: &ToolDefinition) -> RiskLevel {
        let flags = &tool.sandbox;
        if flags.executes_commands || (flags.writes_filesystem && flags.network_access) {
            RiskLevel::High
        } else if flags.writes_filesystem
            || flags.network_access
            || matches!(tool.category, ToolCategory::System)
        {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Builds a policy from configuration, compiling rule patterns.
    pub fn from_config(config: &PolicyConfig) -> GateResult<Self> {
        let mut policy = Self::new().with_fallback(config.fallback);
        policy.tool_overrides = config.tools.clone();
        policy.category_defaults = config.categories.clone();
        for rule in &config.rules {
            policy.rules.push(PolicyRule::try_from(rule)?);
        }
        Ok(policy)
    }
}

impl TryFrom<&RuleConfig> for PolicyRule {
    type Error = GateError;

    fn try_from(config: &RuleConfig) -> Result<Self, Self::Error> {
        let pattern = match &config.pattern {
            RulePatternConfig::Tool(expr) => RulePattern::Tool(Regex::new(expr).map_err(|e| {
                GateError::PolicyConfig(format!("rule '{}': invalid pattern: {}", config.name, e))
            })?),
            RulePatternConfig::Category(category) => RulePattern::Category(*category),
            RulePatternConfig::Any => RulePattern::Any,
        };
        let condition = match config.condition {
            RuleConditionConfig::Always => RuleCondition::Always,
            RuleConditionConfig::HasFlag(flag) => RuleCondition::HasFlag(flag),
            RuleConditionConfig::LacksFlag(flag) => RuleCondition::LacksFlag(flag),
        };
        Ok(PolicyRule::new(config.name.clone(), pattern, condition, config.level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_file() -> ToolDefinition {
        ToolDefinition::new("read_file", ToolCategory::Filesystem)
            .with_sandbox(SandboxFlags::read_only())
    }

    fn write_file() -> ToolDefinition {
        ToolDefinition::new("write_file", ToolCategory::Filesystem)
            .with_sandbox(SandboxFlags::new().with_writes_filesystem(true))
    }

    fn shell() -> ToolDefinition {
        ToolDefinition::new("shell", ToolCategory::System)
            .with_sandbox(SandboxFlags::new().with_executes_commands(true))
    }

    fn classify(policy: &PermissionPolicy, tool: &ToolDefinition, role: Role) -> PermissionLevel {
        policy.classify(tool, role, tool.category)
    }

    #[test]
    fn test_sandbox_defaults() {
        let policy = PermissionPolicy::new();
        assert_eq!(classify(&policy, &read_file(), Role::User), PermissionLevel::Auto);
        assert_eq!(
            classify(&policy, &write_file(), Role::User),
            PermissionLevel::UserApproval
        );
        assert_eq!(classify(&policy, &shell(), Role::User), PermissionLevel::AdminApproval);

        let inert =
            ToolDefinition::new("noop", ToolCategory::System).with_sandbox(SandboxFlags::new());
        assert_eq!(classify(&policy, &inert, Role::User), PermissionLevel::UserApproval);
        let lenient = PermissionPolicy::new().with_fallback(PermissionLevel::Auto);
        assert_eq!(classify(&lenient, &inert, Role::User), PermissionLevel::Auto);
    }

    #[test]
    fn test_tool_override_wins() {
        let policy = PermissionPolicy::new()
            .with_tool_override("read_file", PermissionLevel::Denied)
            .with_rule(PolicyRule::new(
                "allow_all",
                RulePattern::Any,
                RuleCondition::Always,
                PermissionLevel::Auto,
            ));

        let c = policy.explain(&read_file(), Role::User, ToolCategory::Filesystem);
        assert_eq!(c.level, PermissionLevel::Denied);
        assert_eq!(c.source, DecisionSource::ExplicitToolPolicy);
        assert!(c.reason.is_some());
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let policy = PermissionPolicy::new()
            .with_rule(PolicyRule::new(
                "deny_network_writes",
                RulePattern::Category(ToolCategory::Network),
                RuleCondition::HasFlag(SandboxFlag::WritesFilesystem),
                PermissionLevel::Denied,
            ))
            .with_rule(PolicyRule::new(
                "git_needs_admin",
                RulePattern::Tool(Regex::new("^git_").unwrap()),
                RuleCondition::LacksFlag(SandboxFlag::ReadOnly),
                PermissionLevel::AdminApproval,
            ));

        let push = ToolDefinition::new("git_push", ToolCategory::Git)
            .with_sandbox(SandboxFlags::new().with_network_access(true));
        let c = policy.explain(&push, Role::User, ToolCategory::Git);
        assert_eq!(c.level, PermissionLevel::AdminApproval);
        assert_eq!(c.source, DecisionSource::RuleMatch);

        let status = ToolDefinition::new("git_status", ToolCategory::Git)
            .with_sandbox(SandboxFlags::read_only());
        assert_eq!(classify(&policy, &status, Role::User), PermissionLevel::Auto);

        let download = ToolDefinition::new("download", ToolCategory::Network);
        let c = policy.explain(&download, Role::User, ToolCategory::Network);
        assert_eq!(c.level, PermissionLevel::Denied);
        assert_eq!(c.reason.as_deref(), Some("denied by rule 'deny_network_writes'"));
    }

    #[test]
    fn test_category_default() {
        let policy =
            PermissionPolicy::new()
                .with_category_default(ToolCategory::WebSearch, PermissionLevel::Auto);
        let search = ToolDefinition::new("search", ToolCategory::WebSearch)
            .with_sandbox(SandboxFlags::new().with_network_access(true));

        let c = policy.explain(&search, Role::User, ToolCategory::WebSearch);
        assert_eq!(c.level, PermissionLevel::Auto);
        assert_eq!(c.source, DecisionSource::CategoryDefault);
    }

    #[test]
    fn test_read_only_role() {
        let policy = PermissionPolicy::new();
        assert_eq!(classify(&policy, &read_file(), Role::ReadOnly), PermissionLevel::Auto);

        let c = policy.explain(&write_file(), Role::ReadOnly, ToolCategory::Filesystem);
        assert_eq!(c.level, PermissionLevel::Denied);
        assert_eq!(c.source, DecisionSource::RoleRestriction);
    }

    #[test]
    fn test_admin_self_approves() {
        let policy = PermissionPolicy::new();
        assert_eq!(classify(&policy, &shell(), Role::Admin), PermissionLevel::UserApproval);
        assert_eq!(
            classify(&policy, &write_file(), Role::Admin),
            PermissionLevel::UserApproval
        );
    }

    #[test]
    fn test_classify_is_deterministic() {
        let policy = PermissionPolicy::new();
        let tool = write_file();
        let first = classify(&policy, &tool, Role::User);
        for _ in 0..10 {
            assert_eq!(classify(&policy, &tool, Role::User), first);
        }
    }

    #[test]
    fn test_risk_level() {
        assert_eq!(PermissionPolicy::risk_level(&read_file()), RiskLevel::Low);
        assert_eq!(PermissionPolicy::risk_level(&write_file()), RiskLevel::Medium);
        assert_eq!(PermissionPolicy::risk_level(&shell()), RiskLevel::High);
        // conservative flags: writes + network
        assert_eq!(
            PermissionPolicy::risk_level(&ToolDefinition::new("x", ToolCategory::Network)),
            RiskLevel::High
        );
    }

    #[test]
    fn test_from_config() {
        let yaml = r#"
fallback: auto
tools:
  shell: denied
categories:
  web_search: auto
rules:
  - name: git_admin
    pattern: { tool: "^git_" }
    condition: { lacks_flag: read_only }
    level: admin_approval
"#;
        let config: PolicyConfig = serde_yaml::from_str(yaml).unwrap();
        let policy = PermissionPolicy::from_config(&config).unwrap();

        assert_eq!(classify(&policy, &shell(), Role::Admin), PermissionLevel::Denied);
        let commit = ToolDefinition::new("git_commit", ToolCategory::Git);
        assert_eq!(classify(&policy, &commit, Role::User), PermissionLevel::AdminApproval);
    }

    #[test]
    fn test_from_config_bad_regex() {
        let yaml = r#"
rules:
  - name: broken
    pattern: { tool: "([" }
    level: denied
"#;
        let config: PolicyConfig = serde_yaml::from_str(yaml).unwrap();
        let err = PermissionPolicy::from_config(&config).unwrap_err();
        assert!(matches!(err, GateError::PolicyConfig(_)));
        assert!(err.to_string().contains("broken"));
    }
}
