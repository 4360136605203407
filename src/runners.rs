//! Compiled-in runner kinds selectable from configuration.
//!
//! Tools in the config name a runner kind (`runner: delay`) plus free-form
//! `runner_options`. Kinds are registered at compile time; an unknown kind is
//! a configuration error.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use tg_execution::{DelayRunner, EchoRunner, FailingRunner, ToolRunner};

use crate::config::ConfigError;

/// Builds a runner from its `runner_options`.
pub type RunnerFactory = fn(&Value) -> Result<Arc<dyn ToolRunner>, String>;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DelayOptions {
    delay_ms: u64,
    steps: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FailOptions {
    #[serde(default = "default_fail_message")]
    message: String,
}

impl Default for FailOptions {
    fn default() -> Self {
        Self {
            message: default_fail_message(),
        }
    }
}

fn default_fail_message() -> String {
    "tool failed".to_string()
}

fn options<T: DeserializeOwned + Default>(value: &Value) -> Result<T, String> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone()).map_err(|e| e.to_string())
}

fn echo(_: &Value) -> Result<Arc<dyn ToolRunner>, String> {
    Ok(Arc::new(EchoRunner))
}

fn delay(value: &Value) -> Result<Arc<dyn ToolRunner>, String> {
    let opts: DelayOptions = options(value)?;
    let mut runner = DelayRunner::new(Duration::from_millis(opts.delay_ms));
    if let Some(steps) = opts.steps {
        runner = runner.with_steps(steps);
    }
    Ok(Arc::new(runner))
}

fn fail(value: &Value) -> Result<Arc<dyn ToolRunner>, String> {
    let opts: FailOptions = options(value)?;
    Ok(Arc::new(FailingRunner::new(opts.message)))
}

/// Runner kinds available to configured tools.
pub struct RunnerRegistry {
    factories: HashMap<String, RunnerFactory>,
}

impl RunnerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// `echo`, `delay` and `fail`.
    pub fn with_builtins() -> Self {
        Self::new()
            .register("echo", echo)
            .register("delay", delay)
            .register("fail", fail)
    }

    #[must_use]
    pub fn register(mut self, kind: impl Into<String>, factory: RunnerFactory) -> Self {
        self.factories.insert(kind.into(), factory);
        self
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<_> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Instantiates the runner for `tool_id`.
    pub fn build(
        &self,
        tool_id: &str,
        kind: &str,
        options: &Value,
    ) -> Result<Arc<dyn ToolRunner>, ConfigError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| ConfigError::UnknownRunner {
                tool_id: tool_id.to_string(),
                kind: kind.to_string(),
            })?;
        factory(options).map_err(|reason| ConfigError::RunnerOptions {
            tool_id: tool_id.to_string(),
            reason,
        })
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_builtin_kinds() {
        assert_eq!(
            RunnerRegistry::with_builtins().kinds(),
            vec!["delay", "echo", "fail"]
        );
    }

    #[test]
    fn test_build_with_options() {
        let runners = RunnerRegistry::with_builtins();
        assert!(runners.build("slow", "delay", &json!({"delay_ms": 50, "steps": 2})).is_ok());
        assert!(runners.build("echo", "echo", &Value::Null).is_ok());
        assert!(runners.build("broken", "fail", &Value::Null).is_ok());
    }

    #[test]
    fn test_unknown_kind_and_bad_options() {
        let runners = RunnerRegistry::with_builtins();

        let err = runners.build("x", "python", &Value::Null).err().unwrap();
        assert!(matches!(err, ConfigError::UnknownRunner { .. }));

        let err = runners
            .build("x", "delay", &json!({"delay": "soon"}))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::RunnerOptions { .. }));
    }
}
