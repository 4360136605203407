use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use toolgate::{init_logging, Gateway, GatewayConfig, RunnerRegistry};
use tracing::{error, info};

/// toolgate - authorization and session control for model-invoked tools
#[derive(Parser, Debug)]
#[command(name = "toolgate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "TOOLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,

    /// Also write daily-rotated logs to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Token signing secret (at least 32 bytes)
    #[arg(long, env = "TOOLGATE_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

impl Args {
    fn load_config(&self) -> Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) => GatewayConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => GatewayConfig::default(),
        };

        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.log_json {
            config.logging.json = true;
        }
        if let Some(dir) = &self.log_dir {
            config.logging.log_dir = Some(dir.clone());
        }
        if let Some(secret) = &self.jwt_secret {
            config.auth.jwt.secret = secret.clone();
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;

    let _log_guard = init_logging(&config.logging).map_err(anyhow::Error::msg)?;

    if args.check {
        info!(
            tools = config.execution.tools.len(),
            "Configuration is valid"
        );
        return Ok(());
    }

    let gateway =
        Gateway::new(config, &RunnerRegistry::default()).context("failed to build gateway")?;
    let (sessions, executions) = gateway
        .restore()
        .await
        .context("failed to restore state")?;
    info!(sessions, executions, "Restored persisted state");

    let maintenance = gateway.start_maintenance();
    info!("toolgate is running; press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");

    maintenance.stop().await;
    gateway.shutdown().await;
    info!("toolgate stopped");
    Ok(())
}
