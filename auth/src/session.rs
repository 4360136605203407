//! Session registry: the authority on which sessions are alive.
//!
//! Every access token carries the id of the session it was minted for; a
//! token is only honored while that session is present and active here.
//! Per-user session count is capped, evicting the oldest-created session when
//! a new one pushes the user over the limit.

use std::{collections::HashMap, fmt::Write, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tg_data_connector::{EntityStore, StorageResult, StoreWriter, StoredEntity};
use tracing::{debug, info, warn};

use crate::{
    identity::{Principal, Role, SessionId, User, UserId},
    jwt::{AuthError, TokenAuthority},
};

/// A login session owned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub username: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub is_active: bool,
    pub remember_me: bool,
    /// SHA-256 of the only refresh token currently accepted for this session.
    refresh_token_digest: String,
    /// Creation order; breaks ties between equal `created_at` values.
    sequence: u64,
}

impl Session {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at > now
    }

    pub fn to_payload(&self, is_current: bool) -> SessionPayload {
        SessionPayload {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            access_token: None,
            refresh_token: None,
            expires_in: (self.expires_at - Utc::now()).num_seconds().max(0),
            ip_address: self.ip_address.clone(),
            user_agent: self.user_agent.clone(),
            created_at: self.created_at,
            is_current,
        }
    }
}

impl StoredEntity for Session {
    fn entity_id(&self) -> String {
        self.id.to_string()
    }
}

/// Session as exposed to clients.
///
/// Tokens are only present in the response that issued them; `expires_in` is
/// the access-token lifetime on issuance and the remaining session lifetime
/// in listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPayload {
    pub id: SessionId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_current: bool,
}

/// Result of a successful login.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session: Session,
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
}

impl IssuedSession {
    pub fn payload(&self) -> SessionPayload {
        SessionPayload {
            access_token: Some(self.access_token.clone()),
            refresh_token: Some(self.refresh_token.clone()),
            expires_in: self.expires_in,
            ..self.session.to_payload(true)
        }
    }
}

/// New token pair handed out by a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRefresh {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

#[derive(Default)]
struct SessionState {
    sessions: HashMap<SessionId, Session>,
    /// Per-user session ids in creation order.
    by_user: HashMap<UserId, Vec<SessionId>>,
    next_sequence: u64,
}

impl SessionState {
    fn insert(&mut self, session: Session) {
        let ids = self.by_user.entry(session.user_id.clone()).or_default();
        ids.push(session.id.clone());
        self.sessions.insert(session.id.clone(), session);
    }

    fn remove(&mut self, id: &SessionId) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        if let Some(ids) = self.by_user.get_mut(&session.user_id) {
            ids.retain(|s| s != id);
            if ids.is_empty() {
                self.by_user.remove(&session.user_id);
            }
        }
        Some(session)
    }

    fn user_session_ids(&self, user_id: &UserId) -> Vec<SessionId> {
        self.by_user.get(user_id).cloned().unwrap_or_default()
    }
}

/// Tracks live sessions per user.
pub struct SessionRegistry {
    authority: Arc<TokenAuthority>,
    max_sessions_per_user: usize,
    state: Mutex<SessionState>,
    writer: Option<StoreWriter<Session>>,
}

impl SessionRegistry {
    pub fn new(authority: Arc<TokenAuthority>, max_sessions_per_user: usize) -> Self {
        Self {
            authority,
            max_sessions_per_user: max_sessions_per_user.max(1),
            state: Mutex::new(SessionState::default()),
            writer: None,
        }
    }

    /// Persist session snapshots to `store`. Must be called within a tokio
    /// runtime.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn EntityStore<Session>>) -> Self {
        self.writer = Some(StoreWriter::spawn(store));
        self
    }

    pub fn authority(&self) -> &Arc<TokenAuthority> {
        &self.authority
    }

    pub fn max_sessions_per_user(&self) -> usize {
        self.max_sessions_per_user
    }

    /// Reload live sessions from the configured store. Returns how many were
    /// restored.
    pub async fn restore(&self) -> StorageResult<usize> {
        let Some(writer) = &self.writer else {
            return Ok(0);
        };

        let now = Utc::now();
        let mut stored: Vec<Session> = writer
            .store()
            .list()
            .await?
            .into_iter()
            .filter(|s| s.is_live(now))
            .collect();
        stored.sort_by_key(|s| s.sequence);

        let mut state = self.state.lock();
        let mut restored = 0;
        for session in stored {
            if state.sessions.contains_key(&session.id) {
                continue;
            }
            state.next_sequence = state.next_sequence.max(session.sequence + 1);
            state.insert(session);
            restored += 1;
        }

        info!("Restored {} sessions from store", restored);
        Ok(restored)
    }

    /// Create a session for an already-authenticated user.
    ///
    /// If this pushes the user past the session cap, the oldest-created other
    /// session is destroyed.
    pub fn create_session(
        &self,
        user: &User,
        remember_me: bool,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<IssuedSession, AuthError> {
        let session_id = SessionId::default();
        let refresh_ttl = self.authority.refresh_ttl(remember_me);

        let access_token =
            self.authority
                .issue_access_token(&user.id, &user.username, user.role, &session_id)?;
        let refresh_token =
            self.authority
                .issue_refresh_token_with_ttl(&user.id, &session_id, refresh_ttl)?;

        let now = Utc::now();
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let session = Session {
            id: session_id.clone(),
            user_id: user.id.clone(),
            username: user.username.clone(),
            role: user.role,
            created_at: now,
            expires_at: now + refresh_ttl,
            last_active_at: now,
            ip_address,
            user_agent,
            is_active: true,
            remember_me,
            refresh_token_digest: token_digest(&refresh_token),
            sequence,
        };
        state.insert(session.clone());

        let mut user_ids = state.user_session_ids(&user.id);
        while user_ids.len() > self.max_sessions_per_user {
            let oldest = user_ids.remove(0);
            if oldest == session_id {
                continue;
            }
            if let Some(evicted) = state.remove(&oldest) {
                info!(
                    user_id = %user.id,
                    session_id = %evicted.id,
                    "Session limit reached; evicted oldest session"
                );
                self.persist_delete(&evicted.id);
            }
        }
        drop(state);

        self.persist(&session);
        info!(user_id = %user.id, session_id = %session_id, remember_me, "Session created");

        Ok(IssuedSession {
            session,
            access_token,
            refresh_token,
            expires_in: self.authority.access_ttl().num_seconds(),
        })
    }

    /// Destroy one session. Returns false when it does not exist.
    pub fn destroy_session(&self, session_id: &SessionId) -> bool {
        let removed = self.state.lock().remove(session_id);
        match removed {
            Some(session) => {
                self.persist_delete(&session.id);
                info!(user_id = %session.user_id, session_id = %session_id, "Session destroyed");
                true
            }
            None => {
                debug!(session_id = %session_id, "Destroy requested for unknown session");
                false
            }
        }
    }

    /// Destroy every session of a user. Returns how many were destroyed.
    pub fn destroy_all_sessions(&self, user_id: &UserId) -> usize {
        self.destroy_matching(user_id, |_| true)
    }

    /// Destroy every session of a user except `except` (e.g. after a password
    /// change from that session).
    pub fn destroy_other_sessions(&self, user_id: &UserId, except: &SessionId) -> usize {
        self.destroy_matching(user_id, |id| id != except)
    }

    fn destroy_matching(&self, user_id: &UserId, keep_out: impl Fn(&SessionId) -> bool) -> usize {
        let removed: Vec<Session> = {
            let mut state = self.state.lock();
            state
                .user_session_ids(user_id)
                .into_iter()
                .filter(|id| keep_out(id))
                .filter_map(|id| state.remove(&id))
                .collect()
        };

        for session in &removed {
            self.persist_delete(&session.id);
        }
        if !removed.is_empty() {
            info!(user_id = %user_id, count = removed.len(), "Sessions destroyed");
        }
        removed.len()
    }

    /// Exchange a refresh token for a new token pair, rotating the refresh
    /// token.
    ///
    /// Returns `Ok(None)` when the session no longer exists or has expired;
    /// token problems (including replay of an already-rotated refresh token)
    /// are `Err`.
    pub fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<Option<TokenRefresh>, AuthError> {
        let claims = self.authority.verify_refresh_token(refresh_token)?;
        let now = Utc::now();

        let mut state = self.state.lock();
        let Some(session) = state.sessions.get_mut(&claims.session_id) else {
            debug!(session_id = %claims.session_id, "Refresh for unknown session");
            return Ok(None);
        };
        if !session.is_live(now) || session.user_id != claims.user_id {
            debug!(session_id = %claims.session_id, "Refresh for inactive session");
            return Ok(None);
        }

        let presented = token_digest(refresh_token);
        let matches: bool = presented
            .as_bytes()
            .ct_eq(session.refresh_token_digest.as_bytes())
            .into();
        if !matches {
            warn!(
                user_id = %session.user_id,
                session_id = %session.id,
                "Rejected reuse of a rotated refresh token"
            );
            return Err(AuthError::RefreshTokenReused);
        }

        let refresh_ttl = self.authority.refresh_ttl(session.remember_me);
        let access_token = self.authority.issue_access_token(
            &session.user_id,
            &session.username,
            session.role,
            &session.id,
        )?;
        let new_refresh =
            self.authority
                .issue_refresh_token_with_ttl(&session.user_id, &session.id, refresh_ttl)?;

        session.refresh_token_digest = token_digest(&new_refresh);
        session.expires_at = now + refresh_ttl;
        session.last_active_at = now;
        let snapshot = session.clone();
        drop(state);

        self.persist(&snapshot);
        debug!(session_id = %snapshot.id, "Refresh token rotated");

        Ok(Some(TokenRefresh {
            access_token,
            refresh_token: new_refresh,
            expires_in: self.authority.access_ttl().num_seconds(),
        }))
    }

    /// Verify an access token and confirm its session is still alive.
    pub fn authenticate(&self, access_token: &str) -> Result<Principal, AuthError> {
        let claims = self.authority.verify_access_token(access_token)?;
        let now = Utc::now();

        let mut state = self.state.lock();
        let session = state
            .sessions
            .get_mut(&claims.session_id)
            .filter(|s| s.is_live(now) && s.user_id == claims.user_id)
            .ok_or_else(|| AuthError::SessionRevoked(claims.session_id.to_string()))?;
        session.last_active_at = now;

        Ok(Principal {
            user_id: claims.user_id,
            username: claims.username,
            role: claims.role,
            session_id: claims.session_id,
        })
    }

    /// Sessions of a user, oldest first.
    pub fn get_user_sessions(
        &self,
        user_id: &UserId,
        current: Option<&SessionId>,
    ) -> Vec<SessionPayload> {
        let state = self.state.lock();
        state
            .user_session_ids(user_id)
            .iter()
            .filter_map(|id| state.sessions.get(id))
            .map(|s| s.to_payload(current == Some(&s.id)))
            .collect()
    }

    pub fn get_session(&self, session_id: &SessionId) -> Option<Session> {
        self.state.lock().sessions.get(session_id).cloned()
    }

    pub fn active_session_count(&self, user_id: &UserId) -> usize {
        let now = Utc::now();
        let state = self.state.lock();
        state
            .user_session_ids(user_id)
            .iter()
            .filter_map(|id| state.sessions.get(id))
            .filter(|s| s.is_live(now))
            .count()
    }

    /// Drop sessions whose refresh lifetime has passed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let removed: Vec<Session> = {
            let mut state = self.state.lock();
            let expired: Vec<SessionId> = state
                .sessions
                .values()
                .filter(|s| !s.is_live(now))
                .map(|s| s.id.clone())
                .collect();
            expired
                .iter()
                .filter_map(|id| state.remove(id))
                .collect()
        };

        for session in &removed {
            self.persist_delete(&session.id);
        }
        if !removed.is_empty() {
            debug!("Cleaned up {} expired sessions", removed.len());
        }
        removed.len()
    }

    /// Wait for pending store writes. No-op without a store.
    pub async fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.flush().await;
        }
    }

    fn persist(&self, session: &Session) {
        if let Some(writer) = &self.writer {
            writer.save(session.clone());
        }
    }

    fn persist_delete(&self, session_id: &SessionId) {
        if let Some(writer) = &self.writer {
            writer.delete(session_id.to_string());
        }
    }
}

fn token_digest(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for b in digest.iter() {
        // Writing to a String is infallible.
        let _ = write!(hex, "{b:02x}");
    }
    hex
}
