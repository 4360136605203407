//! Signed access and refresh tokens.
//!
//! `TokenAuthority` is stateless apart from its keys: every operation is a
//! pure function of the secret, the clock and the token, so one instance can
//! be shared freely across tasks.

use std::{fmt, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::{AuthConfigError, JwtConfig},
    identity::{Role, SessionId, UserId},
};

/// Distinguishes access tokens from refresh tokens so one can never be
/// presented in place of the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenType::Access => f.write_str("access"),
            TokenType::Refresh => f.write_str("refresh"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("token has expired")]
    Expired,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token signature is invalid")]
    SignatureInvalid,

    #[error("expected {expected} token, got {found} token")]
    WrongTokenType {
        expected: TokenType,
        found: TokenType,
    },

    #[error("session {0} is not active")]
    SessionRevoked(String),

    #[error("refresh token has already been used")]
    RefreshTokenReused,

    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl AuthError {
    /// Stable machine-readable code for transport-level mapping.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Expired => "token_expired",
            AuthError::Malformed(_) => "token_malformed",
            AuthError::SignatureInvalid => "token_signature_invalid",
            AuthError::WrongTokenType { .. } => "token_type_mismatch",
            AuthError::SessionRevoked(_) => "session_revoked",
            AuthError::RefreshTokenReused => "refresh_token_reused",
            AuthError::Signing(_) => "token_signing_failed",
        }
    }
}

/// Wire-level JWT claims. Access-only fields are absent from refresh tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenClaims {
    sub: String,
    sid: String,
    typ: TokenType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<Role>,
    iss: String,
    iat: i64,
    exp: i64,
    jti: String,
}

/// Verified contents of an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessTokenPayload {
    pub user_id: UserId,
    pub username: String,
    pub role: Role,
    pub session_id: SessionId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Verified contents of a refresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenPayload {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub token_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues and verifies HS256-signed tokens.
pub struct TokenAuthority {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    access_ttl: TimeDelta,
    refresh_ttl: TimeDelta,
    remember_me_ttl: TimeDelta,
}

impl TokenAuthority {
    pub fn new(config: &JwtConfig) -> Result<Self, AuthConfigError> {
        config.validate()?;
        Ok(Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            issuer: config.issuer.clone(),
            access_ttl: TimeDelta::seconds(config.access_token_ttl_secs),
            refresh_ttl: TimeDelta::seconds(config.refresh_token_ttl_secs),
            remember_me_ttl: TimeDelta::seconds(config.remember_me_ttl_secs),
        })
    }

    /// Override the access token lifetime (tests use negative values to mint
    /// already-expired tokens).
    #[must_use]
    pub fn with_access_ttl(mut self, ttl: TimeDelta) -> Self {
        self.access_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl(mut self, ttl: TimeDelta) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    pub fn access_ttl(&self) -> TimeDelta {
        self.access_ttl
    }

    /// Refresh lifetime for a session, honoring "remember me".
    pub fn refresh_ttl(&self, remember_me: bool) -> TimeDelta {
        if remember_me {
            self.remember_me_ttl
        } else {
            self.refresh_ttl
        }
    }

    pub fn issue_access_token(
        &self,
        user_id: &UserId,
        username: &str,
        role: Role,
        session_id: &SessionId,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        self.sign(&TokenClaims {
            sub: user_id.to_string(),
            sid: session_id.to_string(),
            typ: TokenType::Access,
            username: Some(username.to_string()),
            role: Some(role),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
        })
    }

    pub fn issue_refresh_token(
        &self,
        user_id: &UserId,
        session_id: &SessionId,
    ) -> Result<String, AuthError> {
        self.issue_refresh_token_with_ttl(user_id, session_id, self.refresh_ttl)
    }

    pub fn issue_refresh_token_with_ttl(
        &self,
        user_id: &UserId,
        session_id: &SessionId,
        ttl: TimeDelta,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        self.sign(&TokenClaims {
            sub: user_id.to_string(),
            sid: session_id.to_string(),
            typ: TokenType::Refresh,
            username: None,
            role: None,
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
        })
    }

    pub fn verify_access_token(&self, token: &str) -> Result<AccessTokenPayload, AuthError> {
        let claims = self.decode_claims(token, true)?;
        if claims.typ != TokenType::Access {
            return Err(AuthError::WrongTokenType {
                expected: TokenType::Access,
                found: claims.typ,
            });
        }

        let username = claims
            .username
            .ok_or_else(|| AuthError::Malformed("missing username claim".to_string()))?;
        let role = claims
            .role
            .ok_or_else(|| AuthError::Malformed("missing role claim".to_string()))?;

        Ok(AccessTokenPayload {
            user_id: UserId::new(claims.sub),
            username,
            role,
            session_id: SessionId::new(claims.sid),
            issued_at: timestamp_to_datetime(claims.iat)?,
            expires_at: timestamp_to_datetime(claims.exp)?,
        })
    }

    pub fn verify_refresh_token(&self, token: &str) -> Result<RefreshTokenPayload, AuthError> {
        let claims = self.decode_claims(token, true)?;
        if claims.typ != TokenType::Refresh {
            return Err(AuthError::WrongTokenType {
                expected: TokenType::Refresh,
                found: claims.typ,
            });
        }

        Ok(RefreshTokenPayload {
            user_id: UserId::new(claims.sub),
            session_id: SessionId::new(claims.sid),
            token_id: claims.jti,
            expires_at: timestamp_to_datetime(claims.exp)?,
        })
    }

    /// Whether a token expires within `threshold`. Tokens that cannot be
    /// verified at all count as expiring so clients refresh or re-login.
    pub fn is_expiring_soon(&self, token: &str, threshold: Duration) -> bool {
        let Ok(claims) = self.decode_claims(token, false) else {
            return true;
        };
        let threshold_secs = TimeDelta::from_std(threshold)
            .map(|d| d.num_seconds())
            .unwrap_or(i64::MAX);
        claims.exp - Utc::now().timestamp() <= threshold_secs
    }

    fn sign(&self, claims: &TokenClaims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    fn decode_claims(&self, token: &str, validate_exp: bool) -> Result<TokenClaims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = validate_exp;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(map_jwt_error)
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::SignatureInvalid,
        _ => AuthError::Malformed(err.to_string()),
    }
}

fn timestamp_to_datetime(ts: i64) -> Result<DateTime<Utc>, AuthError> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| AuthError::Malformed(format!("timestamp out of range: {}", ts)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-test-secret-test-secret!";

    fn authority() -> TokenAuthority {
        TokenAuthority::new(&JwtConfig::with_secret(SECRET)).unwrap()
    }

    fn ids() -> (UserId, SessionId) {
        (UserId::new("u1"), SessionId::new("s1"))
    }

    #[test]
    fn test_access_token_round_trip() {
        let authority = authority();
        let (user, session) = ids();
        let token = authority
            .issue_access_token(&user, "alice", Role::Admin, &session)
            .unwrap();

        let payload = authority.verify_access_token(&token).unwrap();
        assert_eq!(payload.user_id, user);
        assert_eq!(payload.username, "alice");
        assert_eq!(payload.role, Role::Admin);
        assert_eq!(payload.session_id, session);
        assert!(payload.expires_at > payload.issued_at);
    }

    #[test]
    fn test_refresh_token_rejected_as_access() {
        let authority = authority();
        let (user, session) = ids();
        let refresh = authority.issue_refresh_token(&user, &session).unwrap();

        assert_eq!(
            authority.verify_access_token(&refresh),
            Err(AuthError::WrongTokenType {
                expected: TokenType::Access,
                found: TokenType::Refresh,
            })
        );
        assert!(authority.verify_refresh_token(&refresh).is_ok());
    }

    #[test]
    fn test_access_token_rejected_as_refresh() {
        let authority = authority();
        let (user, session) = ids();
        let access = authority
            .issue_access_token(&user, "alice", Role::User, &session)
            .unwrap();

        assert!(matches!(
            authority.verify_refresh_token(&access),
            Err(AuthError::WrongTokenType { .. })
        ));
    }

    #[test]
    fn test_expired_token() {
        let authority = authority().with_access_ttl(TimeDelta::seconds(-30));
        let (user, session) = ids();
        let token = authority
            .issue_access_token(&user, "alice", Role::User, &session)
            .unwrap();

        assert_eq!(authority.verify_access_token(&token), Err(AuthError::Expired));
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let (user, session) = ids();
        let other = TokenAuthority::new(&JwtConfig::with_secret(
            "another-secret-another-secret-12345",
        ))
        .unwrap();
        let token = other
            .issue_access_token(&user, "alice", Role::User, &session)
            .unwrap();

        assert_eq!(
            authority().verify_access_token(&token),
            Err(AuthError::SignatureInvalid)
        );
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            authority().verify_access_token("not-a-jwt"),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn test_rotated_tokens_differ() {
        let authority = authority();
        let (user, session) = ids();
        let a = authority.issue_refresh_token(&user, &session).unwrap();
        let b = authority.issue_refresh_token(&user, &session).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_is_expiring_soon() {
        let authority = authority();
        let (user, session) = ids();
        let token = authority
            .issue_access_token(&user, "alice", Role::User, &session)
            .unwrap();

        // 15 minute token
        assert!(!authority.is_expiring_soon(&token, Duration::from_secs(5 * 60)));
        assert!(authority.is_expiring_soon(&token, Duration::from_secs(20 * 60)));
        assert!(authority.is_expiring_soon("garbage", Duration::from_secs(1)));
    }

    #[test]
    fn test_expired_token_is_expiring_soon() {
        let authority = authority().with_access_ttl(TimeDelta::seconds(-30));
        let (user, session) = ids();
        let token = authority
            .issue_access_token(&user, "alice", Role::User, &session)
            .unwrap();
        assert!(authority.is_expiring_soon(&token, Duration::from_secs(60)));
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(AuthError::Expired.code(), "token_expired");
        assert_eq!(
            AuthError::SessionRevoked("s".to_string()).code(),
            "session_revoked"
        );
    }
}
