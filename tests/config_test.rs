//! Loading configuration files and installing the log subscriber.

use std::io::Write;

use serial_test::serial;
use tg_execution::{
    PermissionLevel, RuleConditionConfig, RulePatternConfig, SandboxFlag, ToolCategory,
};
use toolgate::{init_logging, ConfigError, Gateway, GatewayConfig, LoggingConfig, RunnerRegistry};

const EXAMPLE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/config/toolgate.example.yaml");

#[tokio::test]
async fn test_example_config_builds_a_gateway() {
    let config = GatewayConfig::from_file(EXAMPLE).unwrap();
    config.validate().unwrap();
    assert_eq!(config.execution.tools.len(), 5);
    assert_eq!(
        config.execution.policy.categories.get(&ToolCategory::ImageProcessing),
        Some(&PermissionLevel::Auto)
    );

    let rules = &config.execution.policy.rules;
    assert_eq!(rules.len(), 2);
    assert_eq!(
        rules[0].pattern,
        RulePatternConfig::Tool("^git_push_force$".to_string())
    );
    assert_eq!(rules[0].level, PermissionLevel::Denied);
    assert_eq!(rules[1].pattern, RulePatternConfig::Category(ToolCategory::Git));
    assert_eq!(
        rules[1].condition,
        RuleConditionConfig::HasFlag(SandboxFlag::NetworkAccess)
    );

    let gateway = Gateway::new(config, &RunnerRegistry::default()).unwrap();
    assert_eq!(gateway.tools().len(), 5);
    gateway.shutdown().await;
}

#[test]
fn test_config_from_temp_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "auth:\n  jwt:\n    secret: short").unwrap();

    let config = GatewayConfig::from_file(file.path()).unwrap();
    assert!(matches!(config.validate(), Err(ConfigError::Auth(_))));
}

#[test]
#[serial]
fn test_init_logging_with_file_output() {
    let dir = tempfile::tempdir().unwrap();
    let config = LoggingConfig {
        level: "debug".to_string(),
        log_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };

    let guard = init_logging(&config).unwrap();
    assert!(guard.is_some());
    tracing::info!("file logging initialized");

    // The global subscriber can only be installed once
    assert!(init_logging(&LoggingConfig::default()).is_err());
}
