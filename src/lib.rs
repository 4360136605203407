//! Authorization and session control for model-invoked tools.
//!
//! The [`Gateway`] is the entry point: it authenticates each call against
//! the session registry, then routes tool calls through the permission
//! policy, the execution registry and, when needed, the approval workflow.

pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod maintenance;
pub mod runners;

pub use config::{ConfigError, GatewayConfig};
pub use error::{GatewayError, GatewayResult};
pub use gateway::{ConversationRef, Gateway};
pub use logging::{init_logging, LoggingConfig};
pub use maintenance::{MaintenanceHandle, MaintenanceReport, MaintenanceTask};
pub use runners::{RunnerFactory, RunnerRegistry};
