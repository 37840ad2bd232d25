//! In-memory registry of live sessions and revoked tokens.
//!
//! Sessions move through `Active -> Expired -> Removed` (expiry is observed
//! lazily on read, removal happens in [`SessionStore::cleanup_expired_sessions`])
//! or `Active -> Invalidated -> Removed`. Expired and invalidated sessions are
//! never reactivated.
//!
//! Revocation is tracked separately from the session table: a blacklisted
//! token stays rejected after its session record has been swept.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use warden_core::{SessionId, SharedClock, UserId};

use crate::token::{fingerprint, TokenCodec, TokenError, VerifiedIdentity};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,

    #[error("Session expired")]
    Expired,

    #[error("Token has been revoked")]
    Blacklisted,

    #[error("Token was issued to a different user")]
    SubjectMismatch,

    #[error("Token rejected: {0}")]
    Token(#[from] TokenError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// A live binding between a bearer token and a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub username: String,
    pub role: String,
    #[serde(skip)]
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub ip_address: String,
    pub user_agent: String,
    pub is_active: bool,
}

impl Session {
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && now < self.expires_at
    }
}

/// Counters reported by [`SessionStore::get_stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub active: usize,
    pub expired: usize,
    pub blacklisted: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
struct BlacklistEntry {
    revoked_at: DateTime<Utc>,
    /// When the token would have expired on its own
    token_expires_at: DateTime<Utc>,
}

/// Concurrent session table.
///
/// Each operation holds a map lock only for the duration of one map access;
/// no lock is held across token verification or logging.
pub struct SessionStore {
    codec: Arc<TokenCodec>,
    clock: SharedClock,
    sessions: DashMap<SessionId, Session>,
    tokens: DashMap<String, SessionId>,
    blacklist: DashMap<String, BlacklistEntry>,
}

impl SessionStore {
    pub fn new(codec: Arc<TokenCodec>) -> Self {
        let clock = codec.clock().clone();
        Self {
            codec,
            clock,
            sessions: DashMap::new(),
            tokens: DashMap::new(),
            blacklist: DashMap::new(),
        }
    }

    /// Register a session for a freshly issued token.
    ///
    /// The session expires when the token does.
    pub fn create_session(
        &self,
        user: &VerifiedIdentity,
        token: &str,
        ip_address: &str,
        user_agent: &str,
    ) -> SessionResult<Session> {
        if self.is_blacklisted(token) {
            return Err(SessionError::Blacklisted);
        }

        let claims = self.codec.verify(token)?;
        if claims.user_id != user.user_id {
            return Err(SessionError::SubjectMismatch);
        }

        let now = self.clock.now();
        let session = Session {
            id: SessionId::new(),
            user_id: user.user_id,
            username: user.username.clone(),
            role: user.role.clone(),
            token: token.to_string(),
            created_at: now,
            expires_at: claims.expires_at(),
            last_seen: now,
            ip_address: ip_address.to_string(),
            user_agent: user_agent.to_string(),
            is_active: true,
        };

        self.tokens.insert(session.token.clone(), session.id);
        self.sessions.insert(session.id, session.clone());

        info!(
            session_id = %session.id,
            user_id = %session.user_id,
            expires_at = %session.expires_at,
            "Session created"
        );

        Ok(session)
    }

    pub fn get_session(&self, id: &SessionId) -> SessionResult<Session> {
        self.resolve(id, false)
    }

    /// Look a session up by the exact token string presented by a client
    pub fn get_session_by_token(&self, token: &str) -> SessionResult<Session> {
        if self.is_blacklisted(token) {
            return Err(SessionError::Blacklisted);
        }

        let id = self
            .tokens
            .get(token)
            .map(|entry| *entry.value())
            .ok_or(SessionError::NotFound)?;

        self.resolve(&id, false)
    }

    pub fn update_last_seen(&self, id: &SessionId) -> SessionResult<()> {
        self.resolve(id, true).map(|_| ())
    }

    /// Deactivate a session and revoke its token. Repeating the call is harmless.
    pub fn invalidate_session(&self, id: &SessionId) -> SessionResult<()> {
        let token = self
            .sessions
            .get(id)
            .map(|entry| entry.token.clone())
            .ok_or(SessionError::NotFound)?;

        // Revoke first so a concurrent lookup by token never sees a usable session
        self.blacklist_token(&token);

        if let Some(mut session) = self.sessions.get_mut(id) {
            if session.is_active {
                session.is_active = false;
                info!(session_id = %id, user_id = %session.user_id, "Session invalidated");
            }
        }

        Ok(())
    }

    /// Invalidate every active session of a user, returning how many were affected
    pub fn invalidate_user_sessions(&self, user_id: &UserId) -> usize {
        let ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.user_id == *user_id && entry.is_active)
            .map(|entry| entry.id)
            .collect();

        let count = ids
            .iter()
            .filter(|id| self.invalidate_session(id).is_ok())
            .count();

        info!(user_id = %user_id, count, "Invalidated all sessions for user");
        count
    }

    /// Revoke a token whether or not a session was ever registered for it
    pub fn blacklist_token(&self, token: &str) {
        let now = self.clock.now();
        let token_expires_at = self
            .codec
            .peek_expiry(token)
            .unwrap_or_else(|| now + self.codec.lifetime());

        self.blacklist
            .entry(token.to_string())
            .or_insert_with(|| BlacklistEntry {
                revoked_at: now,
                token_expires_at,
            });

        debug!(token = %fingerprint(token), "Token blacklisted");
    }

    pub fn is_blacklisted(&self, token: &str) -> bool {
        self.blacklist.contains_key(token)
    }

    /// When a token was revoked, if it was
    pub fn revoked_at(&self, token: &str) -> Option<DateTime<Utc>> {
        self.blacklist.get(token).map(|entry| entry.revoked_at)
    }

    pub fn get_user_sessions(&self, user_id: &UserId) -> Vec<Session> {
        self.snapshot(|session| session.user_id == *user_id)
    }

    pub fn get_all_sessions(&self) -> Vec<Session> {
        self.snapshot(|_| true)
    }

    /// Revoke and drop every session that is expired or already inactive.
    ///
    /// Returns the number of records removed.
    pub fn cleanup_expired_sessions(&self) -> usize {
        let now = self.clock.now();

        // Includes sessions already marked inactive when their expiry was seen on access
        let mut newly_expired = Vec::new();
        for mut session in self.sessions.iter_mut() {
            if now >= session.expires_at {
                session.is_active = false;
                newly_expired.push(session.token.clone());
            }
        }
        for token in &newly_expired {
            self.blacklist_token(token);
        }

        let mut removed_tokens = Vec::new();
        self.sessions.retain(|_, session| {
            if session.is_active {
                true
            } else {
                removed_tokens.push(session.token.clone());
                false
            }
        });
        for token in &removed_tokens {
            self.tokens.remove(token);
        }

        if !removed_tokens.is_empty() {
            info!(
                removed = removed_tokens.len(),
                expired = newly_expired.len(),
                remaining = self.sessions.len(),
                "Session sweep completed"
            );
        }

        removed_tokens.len()
    }

    /// Drop blacklist entries for tokens that have expired on their own.
    ///
    /// Never called implicitly; a purged token that is presented again is
    /// reported as unknown rather than revoked.
    pub fn purge_blacklist(&self) -> usize {
        let now = self.clock.now();
        let before = self.blacklist.len();
        self.blacklist
            .retain(|_, entry| entry.token_expires_at > now);
        let purged = before.saturating_sub(self.blacklist.len());

        if purged > 0 {
            warn!(purged, remaining = self.blacklist.len(), "Purged expired tokens from blacklist");
        }
        purged
    }

    pub fn get_stats(&self) -> SessionStats {
        let now = self.clock.now();
        let mut stats = SessionStats {
            blacklisted: self.blacklist.len(),
            ..SessionStats::default()
        };

        for session in self.sessions.iter() {
            stats.total += 1;
            if session.is_usable_at(now) {
                stats.active += 1;
            } else {
                stats.expired += 1;
            }
        }

        stats
    }

    fn resolve(&self, id: &SessionId, touch: bool) -> SessionResult<Session> {
        let now = self.clock.now();
        let mut session = self.sessions.get_mut(id).ok_or(SessionError::NotFound)?;

        if !session.is_active {
            return Err(SessionError::NotFound);
        }

        if now >= session.expires_at {
            session.is_active = false;
            debug!(session_id = %id, "Session expired on access");
            return Err(SessionError::Expired);
        }

        if touch {
            session.last_seen = now;
        }

        Ok(session.clone())
    }

    fn snapshot(&self, filter: impl Fn(&Session) -> bool) -> Vec<Session> {
        let now = self.clock.now();
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_usable_at(now) && filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by_key(|session| session.created_at);
        sessions
    }
}
