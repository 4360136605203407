//! Errors surfaced by the gateway facade.

use tg_auth::AuthError;
use tg_data_connector::StorageError;
use tg_execution::GateError;
use thiserror::Error;

use crate::config::ConfigError;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Authenticated, but not allowed to touch this resource.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

impl GatewayError {
    /// Stable machine-readable code for transport status mapping.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Auth(e) => e.code(),
            GatewayError::Gate(e) => e.code(),
            GatewayError::Config(_) => "config",
            GatewayError::Storage(_) => "storage",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::SessionNotFound(_) => "session_not_found",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Gate(e) => e.is_retryable(),
            GatewayError::Storage(_) => true,
            _ => false,
        }
    }

    /// The caller must log in again.
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, GatewayError::Auth(_))
    }
}
