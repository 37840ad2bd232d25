use std::sync::Arc;

use chrono::Duration;
use pretty_assertions::assert_eq;
use warden_core::{ManualClock, UserId};
use warden_security::{
    AccessRequest, AuditLogFilter, AuditSeverity, AuditStatus, MemoryAuditStore, RequestOrigin, SecurityConfig,
    SecurityError, SecurityGate, SecurityOutcome, SessionError, TokenCodec, TokenConfig, TokenError,
    VerifiedIdentity,
};

// ===== Test Helper Functions =====

const SECRET: &str = "gate-integration-secret-0123456789abcdef";

struct Harness {
    clock: ManualClock,
    gate: SecurityGate,
}

impl Harness {
    fn new() -> Self {
        let clock = ManualClock::starting_now();
        let mut config = SecurityConfig::default();
        config.token = TokenConfig::new(SECRET);
        let gate = SecurityGate::from_config(&config, clock.shared(), Arc::new(MemoryAuditStore::new()));
        Self { clock, gate }
    }

    /// (event_type, event_action, status) of every audit entry, oldest first
    async fn audit_trail(&self) -> Vec<(String, String, AuditStatus)> {
        let mut entries = self
            .gate
            .audit()
            .get_audit_logs(&AuditLogFilter::new(), 1000, 0)
            .await
            .unwrap();
        entries.reverse();
        entries
            .into_iter()
            .map(|e| (e.event_type, e.event_action, e.status))
            .collect()
    }
}

fn origin() -> RequestOrigin {
    RequestOrigin::new("198.51.100.4", "integration-test").with_request_id("req-1")
}

fn identity(role: &str) -> VerifiedIdentity {
    VerifiedIdentity::new(UserId::new(), format!("{role}-user"), role)
}

fn trail(items: &[(&str, &str, AuditStatus)]) -> Vec<(String, String, AuditStatus)> {
    items
        .iter()
        .map(|(t, a, s)| (t.to_string(), a.to_string(), *s))
        .collect()
}

// ===== Login / Logout =====

#[tokio::test]
async fn test_login_then_authenticate() {
    let h = Harness::new();
    let user = identity("user");

    let grant = h.gate.login(&user, &origin()).await.unwrap();
    assert_eq!(grant.session.user_id, user.user_id);
    assert_eq!(grant.session.ip_address, "198.51.100.4");

    let context = h.gate.authenticate(&grant.token, &origin()).await.unwrap();
    assert_eq!(context.session_id, grant.session.id);
    assert_eq!(context.role, "user");

    assert_eq!(
        h.audit_trail().await,
        trail(&[("authentication", "login", AuditStatus::Success)])
    );
}

#[tokio::test]
async fn test_logout_revokes_token() {
    let h = Harness::new();
    let grant = h.gate.login(&identity("user"), &origin()).await.unwrap();

    h.gate.logout(&grant.token, &origin()).await.unwrap();

    let err = h.gate.authenticate(&grant.token, &origin()).await.unwrap_err();
    assert!(matches!(err, SecurityError::Session(SessionError::Blacklisted)));
    assert_eq!(err.outcome(), SecurityOutcome::Unauthenticated);

    // A second logout with the same token is refused
    assert!(h.gate.logout(&grant.token, &origin()).await.is_err());

    assert_eq!(
        h.audit_trail().await,
        trail(&[
            ("authentication", "login", AuditStatus::Success),
            ("authentication", "logout", AuditStatus::Success),
            ("security", "token_reject", AuditStatus::Failure),
        ])
    );
}

#[tokio::test]
async fn test_logout_of_unregistered_token_blacklists_it() {
    let h = Harness::new();
    let token = h.gate.codec().issue(&identity("user")).unwrap();

    h.gate.logout(&token, &origin()).await.unwrap();
    assert!(h.gate.sessions().is_blacklisted(&token));
}

#[tokio::test]
async fn test_login_failed_is_recorded() {
    let h = Harness::new();
    h.gate.login_failed("mallory", "bad password", &origin()).await;

    let logs = h
        .gate
        .audit()
        .get_audit_logs(&AuditLogFilter::new().status(AuditStatus::Failure), 10, 0)
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].details["username"], "mallory");
    assert_eq!(logs[0].ip_address, "198.51.100.4");
    assert_eq!(logs[0].request_id, "req-1");
}

// ===== Authentication =====

#[tokio::test]
async fn test_garbage_token_rejected() {
    let h = Harness::new();
    let err = h.gate.authenticate("not-a-token", &origin()).await.unwrap_err();

    assert!(matches!(err, SecurityError::Token(TokenError::Malformed(_))));
    assert_eq!(
        h.audit_trail().await,
        trail(&[("security", "token_reject", AuditStatus::Failure)])
    );
}

#[tokio::test]
async fn test_foreign_signature_rejected() {
    let h = Harness::new();
    let foreign = TokenCodec::new(
        TokenConfig::new("some-other-secret-that-is-long-enough-0000"),
        h.clock.shared(),
    );
    let token = foreign.issue(&identity("admin")).unwrap();

    let err = h.gate.authenticate(&token, &origin()).await.unwrap_err();
    assert!(matches!(err, SecurityError::Token(TokenError::BadSignature)));
}

#[tokio::test]
async fn test_valid_token_without_session_rejected() {
    let h = Harness::new();
    let token = h.gate.codec().issue(&identity("user")).unwrap();

    let err = h.gate.authenticate(&token, &origin()).await.unwrap_err();
    assert!(matches!(err, SecurityError::Session(SessionError::NotFound)));

    assert_eq!(
        h.audit_trail().await,
        trail(&[("security", "token_reject", AuditStatus::Failure)])
    );
}

#[tokio::test]
async fn test_session_expires_after_a_day() {
    let h = Harness::new();
    let grant = h.gate.login(&identity("user"), &origin()).await.unwrap();

    h.clock.advance(Duration::hours(23));
    assert!(h.gate.authenticate(&grant.token, &origin()).await.is_ok());

    h.clock.advance(Duration::hours(1));
    let err = h.gate.authenticate(&grant.token, &origin()).await.unwrap_err();
    assert!(matches!(err, SecurityError::Token(TokenError::Expired)));
}

#[tokio::test]
async fn test_authenticate_refreshes_last_seen() {
    let h = Harness::new();
    let grant = h.gate.login(&identity("user"), &origin()).await.unwrap();

    h.clock.advance(Duration::minutes(10));
    h.gate.authenticate(&grant.token, &origin()).await.unwrap();

    let session = h.gate.sessions().get_session(&grant.session.id).unwrap();
    assert_eq!(session.last_seen, grant.session.created_at + Duration::minutes(10));
}

// ===== Full Pipeline =====

#[tokio::test]
async fn test_check_denies_missing_permission() {
    let h = Harness::new();
    let grant = h.gate.login(&identity("guest"), &origin()).await.unwrap();
    let origin = origin();

    let err = h
        .gate
        .check(&AccessRequest {
            token: &grant.token,
            permission: "users.delete",
            endpoint: "api",
            origin: &origin,
        })
        .await
        .unwrap_err();

    assert_eq!(err.outcome(), SecurityOutcome::Forbidden);

    let denied = h
        .gate
        .audit()
        .get_audit_logs(&AuditLogFilter::new().event_type("authorization"), 10, 0)
        .await
        .unwrap();
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].resource, "users");
    assert_eq!(denied[0].user_id, Some(grant.session.user_id));
}

#[tokio::test]
async fn test_check_throttles_after_limit() {
    let h = Harness::new();
    let grant = h.gate.login(&identity("user"), &origin()).await.unwrap();
    let origin = origin();
    let request = AccessRequest {
        token: &grant.token,
        permission: "commands.execute",
        endpoint: "commands",
        origin: &origin,
    };

    for _ in 0..20 {
        h.gate.check(&request).await.unwrap();
    }

    let err = h.gate.check(&request).await.unwrap_err();
    assert_eq!(err.outcome(), SecurityOutcome::Throttled);

    h.clock.advance(Duration::seconds(61));
    assert!(h.gate.check(&request).await.is_ok());

    let throttled = h
        .gate
        .audit()
        .get_audit_logs(&AuditLogFilter::new().event_type("security"), 10, 0)
        .await
        .unwrap();
    assert_eq!(throttled.len(), 1);
    assert_eq!(throttled[0].resource, "commands");
}

#[tokio::test]
async fn test_unconfigured_endpoint_is_never_throttled() {
    let h = Harness::new();
    let grant = h.gate.login(&identity("user"), &origin()).await.unwrap();
    let origin = origin();
    let request = AccessRequest {
        token: &grant.token,
        permission: "content.read",
        endpoint: "content",
        origin: &origin,
    };

    for _ in 0..500 {
        h.gate.check(&request).await.unwrap();
    }
}

// ===== Role Assignment =====

#[tokio::test]
async fn test_moderator_cannot_grant_admin() {
    let h = Harness::new();
    let grant = h.gate.login(&identity("moderator"), &origin()).await.unwrap();
    let actor = h.gate.authenticate(&grant.token, &origin()).await.unwrap();

    let err = h
        .gate
        .assign_role(&actor, UserId::new(), "admin", &origin())
        .await
        .unwrap_err();
    assert_eq!(err.outcome(), SecurityOutcome::Forbidden);

    let logs = h
        .gate
        .audit()
        .get_audit_logs(&AuditLogFilter::new().severity(AuditSeverity::High), 10, 0)
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, AuditStatus::Failure);
}

#[tokio::test]
async fn test_role_change_revokes_target_sessions() {
    let h = Harness::new();
    let admin = h.gate.login(&identity("admin"), &origin()).await.unwrap();
    let actor = h.gate.authenticate(&admin.token, &origin()).await.unwrap();

    let target = identity("user");
    let first = h.gate.login(&target, &origin()).await.unwrap();
    let second = h.gate.login(&target, &origin()).await.unwrap();

    let revoked = h
        .gate
        .assign_role(&actor, target.user_id, "moderator", &origin())
        .await
        .unwrap();
    assert_eq!(revoked, 2);

    assert!(h.gate.sessions().get_user_sessions(&target.user_id).is_empty());
    assert!(h.gate.sessions().is_blacklisted(&first.token));
    assert!(h.gate.sessions().is_blacklisted(&second.token));

    // The actor is unaffected
    assert!(h.gate.authenticate(&admin.token, &origin()).await.is_ok());
}
