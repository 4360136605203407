//! Authentication and session control for the tool gateway.
//!
//! This module provides:
//! - Signed access/refresh token issuance and verification
//! - A session registry with per-user caps and refresh-token rotation
//! - Identity types (users, roles, principals) shared with the execution core

mod config;
mod identity;
mod jwt;
mod session;

pub use config::{AuthConfig, AuthConfigError, JwtConfig, MAX_TTL_SECS, MIN_SECRET_LEN};
pub use identity::{Principal, Role, SessionId, User, UserId};
pub use jwt::{AccessTokenPayload, AuthError, RefreshTokenPayload, TokenAuthority, TokenType};
pub use session::{
    IssuedSession, Session, SessionPayload, SessionRegistry, TokenRefresh,
};
