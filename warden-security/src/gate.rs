//! Request-boundary pipeline: token, session, role, rate limit.
//!
//! Every denial is recorded in the audit log before it is returned. Audit
//! failures are logged and never change the outcome of a check.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};
use uuid::Uuid;
use warden_core::{SessionId, SharedClock, UserId};

use crate::audit::{events, AuditEvent, AuditLogger, AuditStatus, AuditStore};
use crate::config::SecurityConfig;
use crate::error::SecurityResult;
use crate::maintenance::MaintenanceScheduler;
use crate::rate_limit::{RateLimitDecision, RateLimitManager};
use crate::rbac::RoleRegistry;
use crate::session::{Session, SessionError, SessionStore};
use crate::token::{fingerprint, TokenCodec, VerifiedIdentity};

/// The caller resolved from a bearer token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub username: String,
    pub role: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&Session> for AuthContext {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id,
            user_id: session.user_id,
            username: session.username.clone(),
            role: session.role.clone(),
            expires_at: session.expires_at,
        }
    }
}

/// Where a request came from, for audit records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOrigin {
    pub ip_address: String,
    pub user_agent: String,
    pub request_id: String,
}

impl RequestOrigin {
    pub fn new(ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            user_agent: user_agent.into(),
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// A full access check for one request
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    pub token: &'a str,
    pub permission: &'a str,
    pub endpoint: &'a str,
    pub origin: &'a RequestOrigin,
}

/// Result of a successful login
#[derive(Debug, Clone, Serialize)]
pub struct LoginGrant {
    pub token: String,
    pub session: Session,
}

#[derive(Clone)]
pub struct SecurityGate {
    codec: Arc<TokenCodec>,
    sessions: Arc<SessionStore>,
    roles: RoleRegistry,
    rate_limits: Arc<RateLimitManager>,
    audit: AuditLogger,
    trust_forwarded_headers: bool,
}

impl SecurityGate {
    pub fn new(
        codec: Arc<TokenCodec>,
        sessions: Arc<SessionStore>,
        rate_limits: Arc<RateLimitManager>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            codec,
            sessions,
            roles: RoleRegistry::new(),
            rate_limits,
            audit,
            trust_forwarded_headers: false,
        }
    }

    pub fn with_trusted_forwarding(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    /// Build every service from configuration around the given audit store
    pub fn from_config(config: &SecurityConfig, clock: SharedClock, store: Arc<dyn AuditStore>) -> Self {
        let codec = Arc::new(TokenCodec::new(config.token.clone(), clock.clone()));
        let sessions = Arc::new(SessionStore::new(Arc::clone(&codec)));
        let rate_limits = Arc::new(RateLimitManager::new(config.rate_limit_table(), clock.clone()));
        let audit = AuditLogger::new(store, clock);
        Self::new(codec, sessions, rate_limits, audit).with_trusted_forwarding(config.trust_forwarded_headers)
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn roles(&self) -> &RoleRegistry {
        &self.roles
    }

    pub fn rate_limits(&self) -> &RateLimitManager {
        &self.rate_limits
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Whether client addresses are read from forwarding headers
    pub fn trusts_forwarded_headers(&self) -> bool {
        self.trust_forwarded_headers
    }

    pub fn start_maintenance(&self, config: &SecurityConfig) -> MaintenanceScheduler {
        MaintenanceScheduler::start(
            Arc::clone(&self.sessions),
            Arc::clone(&self.rate_limits),
            self.audit.clone(),
            &config.maintenance_settings(),
        )
    }

    /// Issue a token and open a session for an identity whose password
    /// has already been checked
    #[instrument(skip(self, identity, origin), fields(user_id = %identity.user_id))]
    pub async fn login(&self, identity: &VerifiedIdentity, origin: &RequestOrigin) -> SecurityResult<LoginGrant> {
        let token = self.codec.issue(identity)?;
        let session = self
            .sessions
            .create_session(identity, &token, &origin.ip_address, &origin.user_agent)?;

        self.audit
            .record(
                event(events::LOGIN_SUCCESS, "auth", AuditStatus::Success, origin)
                    .with_user(identity.user_id)
                    .with_session_id(session.id.to_string())
                    .with_details(json!({ "username": identity.username, "role": identity.role })),
            )
            .await;

        Ok(LoginGrant { token, session })
    }

    /// Record a failed credential check made outside this crate
    pub async fn login_failed(&self, username: &str, reason: &str, origin: &RequestOrigin) {
        self.audit
            .record(
                event(events::LOGIN_FAILED, "auth", AuditStatus::Failure, origin)
                    .with_details(json!({ "username": username, "reason": reason })),
            )
            .await;
    }

    /// End the session behind a token and revoke the token
    pub async fn logout(&self, token: &str, origin: &RequestOrigin) -> SecurityResult<()> {
        let claims = self.codec.verify(token)?;

        let session_id = match self.sessions.get_session_by_token(token) {
            Ok(session) => {
                self.sessions.invalidate_session(&session.id)?;
                Some(session.id)
            }
            Err(SessionError::Blacklisted) => return Err(SessionError::Blacklisted.into()),
            Err(_) => {
                self.sessions.blacklist_token(token);
                None
            }
        };

        let mut logout = event(events::LOGOUT, "auth", AuditStatus::Success, origin).with_user(claims.user_id);
        if let Some(id) = session_id {
            logout = logout.with_session_id(id.to_string());
        }
        self.audit.record(logout).await;

        Ok(())
    }

    /// Resolve a bearer token to a live session and refresh its last-seen time
    pub async fn authenticate(&self, token: &str, origin: &RequestOrigin) -> SecurityResult<AuthContext> {
        if let Err(e) = self.codec.verify(token) {
            self.audit
                .record(
                    event(events::TOKEN_REJECTED, "auth", AuditStatus::Failure, origin)
                        .with_details(json!({ "token": fingerprint(token), "reason": e.to_string() })),
                )
                .await;
            return Err(e.into());
        }

        let session = match self.sessions.get_session_by_token(token) {
            Ok(session) => session,
            Err(e) => {
                let key = match e {
                    SessionError::Expired => events::SESSION_EXPIRED,
                    _ => events::TOKEN_REJECTED,
                };
                self.audit
                    .record(
                        event(key, "session", AuditStatus::Failure, origin)
                            .with_details(json!({ "token": fingerprint(token), "reason": e.to_string() })),
                    )
                    .await;
                return Err(e.into());
            }
        };

        self.sessions.update_last_seen(&session.id)?;
        debug!(session_id = %session.id, user_id = %session.user_id, "Request authenticated");

        Ok(AuthContext::from(&session))
    }

    pub async fn authorize(
        &self,
        context: &AuthContext,
        permission: &str,
        origin: &RequestOrigin,
    ) -> SecurityResult<()> {
        if let Err(e) = self.roles.require_permission(&context.role, permission) {
            let resource = permission.split_once('.').map_or(permission, |(r, _)| r);
            self.audit
                .record(
                    event(events::PERMISSION_DENIED, resource, AuditStatus::Failure, origin)
                        .with_user(context.user_id)
                        .with_session_id(context.session_id.to_string())
                        .with_details(json!({ "role": context.role, "permission": permission })),
                )
                .await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Count a request against an endpoint's limit.
    ///
    /// `None` means the endpoint has no limit configured.
    pub async fn admit(
        &self,
        endpoint: &str,
        identity: &str,
        origin: &RequestOrigin,
    ) -> SecurityResult<Option<RateLimitDecision>> {
        match self.rate_limits.check(endpoint, identity) {
            Ok(decision) => Ok(decision),
            Err(e) => {
                self.audit
                    .record(
                        event(events::RATE_LIMIT_EXCEEDED, endpoint, AuditStatus::Failure, origin).with_details(
                            json!({
                                "identity": identity,
                                "limit": e.decision().limit,
                                "window_secs": e.decision().window,
                                "reset_time": e.decision().reset_time,
                            }),
                        ),
                    )
                    .await;
                Err(e.into())
            }
        }
    }

    /// Authenticate, authorize and admit in that order
    pub async fn check(&self, request: &AccessRequest<'_>) -> SecurityResult<AuthContext> {
        let context = self.authenticate(request.token, request.origin).await?;
        self.authorize(&context, request.permission, request.origin).await?;
        self.admit(request.endpoint, &context.user_id.to_string(), request.origin)
            .await?;
        Ok(context)
    }

    /// Approve a role change and revoke the target's sessions so the new
    /// role takes effect on next login. Returns the number of sessions revoked.
    pub async fn assign_role(
        &self,
        actor: &AuthContext,
        target_user: UserId,
        target_role: &str,
        origin: &RequestOrigin,
    ) -> SecurityResult<usize> {
        if let Err(e) = self.roles.authorize_assignment(&actor.role, target_role) {
            self.audit
                .record(
                    event(events::ROLE_ASSIGNMENT_DENIED, "users", AuditStatus::Failure, origin)
                        .with_user(actor.user_id)
                        .with_resource_id(target_user.to_string())
                        .with_details(json!({ "actor_role": actor.role, "target_role": target_role })),
                )
                .await;
            return Err(e.into());
        }

        let revoked = self.sessions.invalidate_user_sessions(&target_user);

        self.audit
            .record(
                event(events::ROLE_ASSIGNED, "users", AuditStatus::Success, origin)
                    .with_user(actor.user_id)
                    .with_resource_id(target_user.to_string())
                    .with_details(json!({ "role": target_role, "sessions_revoked": revoked })),
            )
            .await;

        Ok(revoked)
    }
}

impl std::fmt::Debug for SecurityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityGate")
            .field("sessions", &self.sessions.get_stats())
            .field("rate_limits", &self.rate_limits)
            .field("trust_forwarded_headers", &self.trust_forwarded_headers)
            .finish_non_exhaustive()
    }
}

fn event(key: &str, resource: &str, status: AuditStatus, origin: &RequestOrigin) -> AuditEvent {
    AuditEvent::new(key, resource, status)
        .with_origin(origin.ip_address.clone(), origin.user_agent.clone())
        .with_request_id(origin.request_id.clone())
}
