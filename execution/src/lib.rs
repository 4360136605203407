//! Permission policy, approval workflow and execution state machine for
//! gated tool calls.
//!
//! A call enters through [`ExecutionRegistry::submit`]. The
//! [`PermissionPolicy`] classifies it; `auto` calls start immediately,
//! approval-required calls wait on the [`ApprovalCoordinator`], and denied
//! calls never get a record. Every state change is published through an
//! [`EventNotifier`].

pub mod admission;
pub mod approval;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod model;
pub mod policy;
pub mod registry;
pub mod runner;
pub mod tool;

pub use admission::AdmissionController;
pub use approval::{
    ApprovalCoordinator, ApprovalDecision, ApprovalId, ApprovalRequest, ApprovalStatus,
    ApproverClass, AuditEntry, AuditLog, DecisionResult, DecisionSource,
};
pub use config::{
    ApprovalSettings, ConcurrencyLimits, ExecutionConfig, ExecutionConfigError, PolicyConfig,
    RuleConditionConfig, RuleConfig, RulePatternConfig, ToolConfig,
};
pub use error::{AdmissionError, ExecutionFailure, GateError, GateResult, RunnerError};
pub use events::{
    BroadcastNotifier, EventKind, EventNotifier, FanoutNotifier, LifecycleEvent, TracingNotifier,
};
pub use metrics::{GateMetrics, MetricsSnapshot};
pub use model::{
    Actor, ExecutionFilter, ExecutionId, ExecutionRequest, ExecutionStatus, ToolExecution,
};
pub use policy::{PermissionLevel, PermissionPolicy, RiskLevel};
pub use registry::{ApprovalHandoff, ExecutionRegistry};
pub use runner::{DelayRunner, EchoRunner, FailingRunner, RunContext, ToolRunner};
pub use tool::{
    ParamSpec, ParamType, SandboxFlag, SandboxFlags, ToolCatalog, ToolCategory, ToolDefinition,
};
