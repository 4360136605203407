//! Tool definitions, sandbox flags and the tool catalog.
//!
//! [`SandboxFlags`] are plain `bool`s. Tools declared without flags get
//! [`SandboxFlags::conservative`] (assume writes and network access).

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{GateError, GateResult},
    runner::ToolRunner,
};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Category a tool belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Filesystem,
    Git,
    Network,
    ImageProcessing,
    WebSearch,
    System,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCategory::Filesystem => "filesystem",
            ToolCategory::Git => "git",
            ToolCategory::Network => "network",
            ToolCategory::ImageProcessing => "image_processing",
            ToolCategory::WebSearch => "web_search",
            ToolCategory::System => "system",
        }
    }
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a tool is allowed to touch when it runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxFlags {
    pub read_only: bool,
    pub writes_filesystem: bool,
    pub network_access: bool,
    pub executes_commands: bool,
}

impl SandboxFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags assumed for tools that declare none.
    pub fn conservative() -> Self {
        Self {
            read_only: false,
            writes_filesystem: true,
            network_access: true,
            executes_commands: false,
        }
    }

    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_writes_filesystem(mut self, v: bool) -> Self {
        self.writes_filesystem = v;
        if v {
            self.read_only = false;
        }
        self
    }

    #[must_use]
    pub fn with_network_access(mut self, v: bool) -> Self {
        self.network_access = v;
        self
    }

    #[must_use]
    pub fn with_executes_commands(mut self, v: bool) -> Self {
        self.executes_commands = v;
        if v {
            self.read_only = false;
        }
        self
    }
}

/// Sandbox flag names for matching in policy rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxFlag {
    ReadOnly,
    WritesFilesystem,
    NetworkAccess,
    ExecutesCommands,
}

impl SandboxFlag {
    pub fn matches(&self, flags: &SandboxFlags) -> bool {
        match self {
            SandboxFlag::ReadOnly => flags.read_only,
            SandboxFlag::WritesFilesystem => flags.writes_filesystem,
            SandboxFlag::NetworkAccess => flags.network_access,
            SandboxFlag::ExecutesCommands => flags.executes_commands,
        }
    }
}

/// JSON type of a declared tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl ParamType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
            ParamType::Any => true,
        }
    }
}

/// A declared tool parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_param_type")]
    pub kind: ParamType,
    #[serde(default)]
    pub required: bool,
}

fn default_param_type() -> ParamType {
    ParamType::Any
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// Static description of a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub id: String,
    pub description: Option<String>,
    pub category: ToolCategory,
    pub sandbox: SandboxFlags,
    pub params: Vec<ParamSpec>,
    pub allow_unknown_params: bool,
    pub timeout: Duration,
}

impl ToolDefinition {
    pub fn new(id: impl Into<String>, category: ToolCategory) -> Self {
        Self {
            id: id.into(),
            description: None,
            category,
            sandbox: SandboxFlags::conservative(),
            params: Vec::new(),
            allow_unknown_params: true,
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_sandbox(mut self, sandbox: SandboxFlags) -> Self {
        self.sandbox = sandbox;
        self
    }

    #[must_use]
    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    #[must_use]
    pub fn with_strict_params(mut self) -> Self {
        self.allow_unknown_params = false;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Checks `input` against the declared parameters.
    pub fn validate_input(&self, input: &Value) -> GateResult<()> {
        let object = match input {
            Value::Object(map) => map,
            Value::Null if self.params.iter().all(|p| !p.required) => return Ok(()),
            other => {
                return Err(GateError::Validation(format!(
                    "input for '{}' must be an object, got {}",
                    self.id,
                    json_type_name(other)
                )))
            }
        };

        for param in &self.params {
            match object.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    return Err(GateError::Validation(format!(
                        "missing required parameter '{}' for '{}'",
                        param.name, self.id
                    )));
                }
                Some(value) if !value.is_null() && !param.kind.accepts(value) => {
                    return Err(GateError::Validation(format!(
                        "parameter '{}' for '{}' has type {}, expected {:?}",
                        param.name,
                        self.id,
                        json_type_name(value),
                        param.kind
                    )));
                }
                _ => {}
            }
        }

        if !self.allow_unknown_params {
            if let Some(unknown) = object
                .keys()
                .find(|key| !self.params.iter().any(|p| &p.name == *key))
            {
                return Err(GateError::Validation(format!(
                    "unknown parameter '{}' for '{}'",
                    unknown, self.id
                )));
            }
        }

        Ok(())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A tool definition paired with the runner that executes it.
#[derive(Clone)]
pub struct RegisteredTool {
    pub definition: Arc<ToolDefinition>,
    pub runner: Arc<dyn ToolRunner>,
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// Registry of executable tools keyed by tool id.
#[derive(Default)]
pub struct ToolCatalog {
    tools: DashMap<String, RegisteredTool>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, replacing any previous registration with the same id.
    pub fn register(&self, definition: ToolDefinition, runner: Arc<dyn ToolRunner>) {
        let id = definition.id.clone();
        self.tools.insert(
            id,
            RegisteredTool {
                definition: Arc::new(definition),
                runner,
            },
        );
    }

    pub fn get(&self, tool_id: &str) -> Option<RegisteredTool> {
        self.tools.get(tool_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, tool_id: &str) -> bool {
        self.tools.remove(tool_id).is_some()
    }

    pub fn definitions(&self) -> Vec<Arc<ToolDefinition>> {
        let mut defs: Vec<_> = self
            .tools
            .iter()
            .map(|entry| entry.value().definition.clone())
            .collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::runner::EchoRunner;

    fn write_file() -> ToolDefinition {
        ToolDefinition::new("write_file", ToolCategory::Filesystem)
            .with_param(ParamSpec::required("path", ParamType::String))
            .with_param(ParamSpec::optional("append", ParamType::Boolean))
    }

    #[test]
    fn test_conservative_defaults() {
        let tool = ToolDefinition::new("mystery", ToolCategory::System);
        assert!(!tool.sandbox.read_only); // assume writes
        assert!(tool.sandbox.writes_filesystem);
        assert!(tool.sandbox.network_access); // assume external access
        assert_eq!(tool.timeout, DEFAULT_TOOL_TIMEOUT);
    }

    #[test]
    fn test_flag_builders_clear_read_only() {
        let flags = SandboxFlags::read_only().with_executes_commands(true);
        assert!(!flags.read_only);
        assert!(SandboxFlag::ExecutesCommands.matches(&flags));
        assert!(!SandboxFlag::ReadOnly.matches(&flags));
    }

    #[test]
    fn test_validate_input_ok() {
        let tool = write_file();
        assert!(tool
            .validate_input(&json!({"path": "/tmp/a", "append": true}))
            .is_ok());
        assert!(tool.validate_input(&json!({"path": "/tmp/a", "extra": 1})).is_ok());
    }

    #[test]
    fn test_validate_input_missing_required() {
        let err = write_file().validate_input(&json!({"append": true})).unwrap_err();
        assert!(matches!(err, GateError::Validation(_)));
        assert!(err.to_string().contains("'path'"));
    }

    #[test]
    fn test_validate_input_wrong_type() {
        let err = write_file().validate_input(&json!({"path": 42})).unwrap_err();
        assert!(err.to_string().contains("expected String"));
    }

    #[test]
    fn test_validate_input_not_object() {
        assert!(write_file().validate_input(&json!("oops")).is_err());
        assert!(write_file().validate_input(&Value::Null).is_err());

        let no_params = ToolDefinition::new("list", ToolCategory::Filesystem);
        assert!(no_params.validate_input(&Value::Null).is_ok());
    }

    #[test]
    fn test_strict_params_reject_unknown() {
        let tool = write_file().with_strict_params();
        let err = tool
            .validate_input(&json!({"path": "/a", "mode": "0644"}))
            .unwrap_err();
        assert!(err.to_string().contains("'mode'"));
    }

    #[test]
    fn test_catalog_register_and_get() {
        let catalog = ToolCatalog::new();
        catalog.register(write_file(), Arc::new(EchoRunner));
        catalog.register(
            ToolDefinition::new("git_status", ToolCategory::Git),
            Arc::new(EchoRunner),
        );

        assert_eq!(catalog.len(), 2);
        assert!(catalog.get("write_file").is_some());
        assert!(catalog.get("nope").is_none());

        let ids: Vec<_> = catalog.definitions().iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec!["git_status", "write_file"]);

        assert!(catalog.remove("git_status"));
        assert!(!catalog.remove("git_status"));
    }
}
