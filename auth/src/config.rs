//! Configuration for token issuance and session limits.

use std::fmt;

use serde::{Deserialize, Serialize};
use tg_data_connector::StorageBackend;
use thiserror::Error;

/// Minimum length of the HMAC signing secret, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

const DEFAULT_ACCESS_TTL_SECS: i64 = 15 * 60;
const DEFAULT_REFRESH_TTL_SECS: i64 = 7 * 24 * 60 * 60;
const DEFAULT_REMEMBER_ME_TTL_SECS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_MAX_SESSIONS_PER_USER: usize = 5;
const DEFAULT_REFRESH_THRESHOLD_SECS: i64 = 5 * 60;

/// Longest lifetime any token or threshold may be configured with: ten years.
pub const MAX_TTL_SECS: i64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthConfigError {
    #[error("JWT secret must be at least {min} bytes (got {actual})")]
    SecretTooShort { min: usize, actual: usize },

    #[error("{0} must be positive")]
    NonPositiveTtl(&'static str),

    #[error("{0} must be at most {MAX_TTL_SECS} seconds")]
    TtlTooLong(&'static str),

    #[error("access token TTL must be shorter than refresh token TTL")]
    AccessOutlivesRefresh,

    #[error("max_sessions_per_user must be at least 1")]
    InvalidSessionLimit,
}

/// Signing and lifetime settings for issued tokens.
#[derive(Clone, Deserialize, Serialize)]
pub struct JwtConfig {
    /// HMAC-SHA256 signing secret.
    #[serde(default)]
    pub secret: String,

    /// Value of the `iss` claim; tokens with another issuer are rejected.
    #[serde(default = "default_issuer")]
    pub issuer: String,

    #[serde(default = "default_access_ttl")]
    pub access_token_ttl_secs: i64,

    #[serde(default = "default_refresh_ttl")]
    pub refresh_token_ttl_secs: i64,

    /// Refresh token lifetime for sessions created with "remember me".
    #[serde(default = "default_remember_me_ttl")]
    pub remember_me_ttl_secs: i64,
}

impl fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtConfig")
            .field("secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("access_token_ttl_secs", &self.access_token_ttl_secs)
            .field("refresh_token_ttl_secs", &self.refresh_token_ttl_secs)
            .field("remember_me_ttl_secs", &self.remember_me_ttl_secs)
            .finish()
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            issuer: default_issuer(),
            access_token_ttl_secs: DEFAULT_ACCESS_TTL_SECS,
            refresh_token_ttl_secs: DEFAULT_REFRESH_TTL_SECS,
            remember_me_ttl_secs: DEFAULT_REMEMBER_ME_TTL_SECS,
        }
    }
}

impl JwtConfig {
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), AuthConfigError> {
        if self.secret.len() < MIN_SECRET_LEN {
            return Err(AuthConfigError::SecretTooShort {
                min: MIN_SECRET_LEN,
                actual: self.secret.len(),
            });
        }
        check_ttl("access_token_ttl_secs", self.access_token_ttl_secs)?;
        check_ttl("refresh_token_ttl_secs", self.refresh_token_ttl_secs)?;
        check_ttl("remember_me_ttl_secs", self.remember_me_ttl_secs)?;
        if self.access_token_ttl_secs >= self.refresh_token_ttl_secs {
            return Err(AuthConfigError::AccessOutlivesRefresh);
        }
        Ok(())
    }
}

/// Session control settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub jwt: JwtConfig,

    /// Active sessions allowed per user before the oldest is evicted.
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_user: usize,

    /// Window before access-token expiry in which clients are told to refresh.
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: i64,

    /// Where session snapshots are persisted.
    #[serde(default)]
    pub storage: StorageBackend,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt: JwtConfig::default(),
            max_sessions_per_user: DEFAULT_MAX_SESSIONS_PER_USER,
            refresh_threshold_secs: DEFAULT_REFRESH_THRESHOLD_SECS,
            storage: StorageBackend::default(),
        }
    }
}

impl AuthConfig {
    pub fn validate(&self) -> Result<(), AuthConfigError> {
        self.jwt.validate()?;
        if self.max_sessions_per_user == 0 {
            return Err(AuthConfigError::InvalidSessionLimit);
        }
        check_ttl("refresh_threshold_secs", self.refresh_threshold_secs)
    }
}

fn check_ttl(field: &'static str, secs: i64) -> Result<(), AuthConfigError> {
    if secs <= 0 {
        return Err(AuthConfigError::NonPositiveTtl(field));
    }
    if secs > MAX_TTL_SECS {
        return Err(AuthConfigError::TtlTooLong(field));
    }
    Ok(())
}

fn default_issuer() -> String {
    "toolgate".to_string()
}

fn default_access_ttl() -> i64 {
    DEFAULT_ACCESS_TTL_SECS
}

fn default_refresh_ttl() -> i64 {
    DEFAULT_REFRESH_TTL_SECS
}

fn default_remember_me_ttl() -> i64 {
    DEFAULT_REMEMBER_ME_TTL_SECS
}

fn default_max_sessions() -> usize {
    DEFAULT_MAX_SESSIONS_PER_USER
}

fn default_refresh_threshold() -> i64 {
    DEFAULT_REFRESH_THRESHOLD_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_secret_rejected() {
        let config = JwtConfig::with_secret("too-short");
        assert_eq!(
            config.validate(),
            Err(AuthConfigError::SecretTooShort {
                min: MIN_SECRET_LEN,
                actual: 9
            })
        );
    }

    #[test]
    fn test_defaults_validate_with_secret() {
        let config = AuthConfig {
            jwt: JwtConfig::with_secret("0123456789abcdef0123456789abcdef"),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.max_sessions_per_user, 5);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = JwtConfig::with_secret("0123456789abcdef0123456789abcdef");
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("0123456789abcdef"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_access_must_be_shorter_than_refresh() {
        let config = JwtConfig {
            access_token_ttl_secs: 3600,
            refresh_token_ttl_secs: 60,
            ..JwtConfig::with_secret("0123456789abcdef0123456789abcdef")
        };
        assert_eq!(config.validate(), Err(AuthConfigError::AccessOutlivesRefresh));
    }

    #[test]
    fn test_ttl_upper_bound() {
        let config = JwtConfig {
            refresh_token_ttl_secs: i64::MAX,
            ..JwtConfig::with_secret("0123456789abcdef0123456789abcdef")
        };
        assert_eq!(
            config.validate(),
            Err(AuthConfigError::TtlTooLong("refresh_token_ttl_secs"))
        );

        let config = JwtConfig {
            remember_me_ttl_secs: MAX_TTL_SECS,
            ..JwtConfig::with_secret("0123456789abcdef0123456789abcdef")
        };
        assert!(config.validate().is_ok());

        let config = AuthConfig {
            jwt: JwtConfig::with_secret("0123456789abcdef0123456789abcdef"),
            refresh_threshold_secs: MAX_TTL_SECS + 1,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(AuthConfigError::TtlTooLong("refresh_threshold_secs"))
        );
    }
}
