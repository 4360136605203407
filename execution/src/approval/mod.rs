//! Approval workflow for tools that need a human decision before running.

pub mod audit;
pub mod coordinator;
pub mod request;

pub use audit::{AuditEntry, AuditLog, DecisionResult, DecisionSource};
pub use coordinator::ApprovalCoordinator;
pub use request::{
    ApprovalDecision, ApprovalId, ApprovalPayload, ApprovalRequest, ApprovalStatus,
    ApproverClass,
};
