//! Append-only security audit trail
//!
//! Events are identified by a key from a fixed taxonomy that decides the
//! stored type, action, description and severity. Persistence goes through
//! an [`AuditStore`]; the logger itself holds no state beyond the store
//! handle and clock.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use warden_core::{AuditEntryId, SharedClock, UserId};

use crate::audit_query::{AuditLogFilter, AuditStats, MAX_QUERY_LIMIT};

/// Result type for audit operations
pub type AuditResult<T> = Result<T, AuditError>;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Unknown audit event: {0}")]
    UnknownEvent(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audit store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Low => "low",
            AuditSeverity::Medium => "medium",
            AuditSeverity::High => "high",
            AuditSeverity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(AuditSeverity::Low),
            "medium" => Some(AuditSeverity::Medium),
            "high" => Some(AuditSeverity::High),
            "critical" => Some(AuditSeverity::Critical),
            _ => None,
        }
    }

    pub fn is_high_or_above(&self) -> bool {
        *self >= AuditSeverity::High
    }
}

impl fmt::Display for AuditSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failure,
    Error,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::Failure => "failure",
            AuditStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(AuditStatus::Success),
            "failure" => Some(AuditStatus::Failure),
            "error" => Some(AuditStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registered event keys
pub mod events {
    pub const LOGIN_SUCCESS: &str = "login_success";
    pub const LOGIN_FAILED: &str = "login_failed";
    pub const LOGOUT: &str = "logout";
    pub const REGISTER: &str = "register";
    pub const TOKEN_REFRESH: &str = "token_refresh";
    pub const SESSION_EXPIRED: &str = "session_expired";
    pub const SESSION_INVALIDATED: &str = "session_invalidated";
    pub const SESSIONS_REVOKED_ALL: &str = "sessions_revoked_all";
    pub const PASSWORD_CHANGE: &str = "password_change";
    pub const PERMISSION_DENIED: &str = "permission_denied";
    pub const ROLE_ASSIGNED: &str = "role_assigned";
    pub const ROLE_ASSIGNMENT_DENIED: &str = "role_assignment_denied";
    pub const USER_CREATED: &str = "user_created";
    pub const USER_DELETED: &str = "user_deleted";
    pub const COMMAND_EXECUTE: &str = "command_execute";
    pub const FILE_UPLOAD: &str = "file_upload";
    pub const FILE_DELETE: &str = "file_delete";
    pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
    pub const TOKEN_REJECTED: &str = "token_rejected";
    pub const SUSPICIOUS_ACTIVITY: &str = "suspicious_activity";
    pub const ADMIN_ACTION: &str = "admin_action";
}

/// How an event key is classified when stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventDefinition {
    pub key: &'static str,
    pub event_type: &'static str,
    pub action: &'static str,
    pub description: &'static str,
    pub severity: AuditSeverity,
}

const fn define(
    key: &'static str,
    event_type: &'static str,
    action: &'static str,
    description: &'static str,
    severity: AuditSeverity,
) -> EventDefinition {
    EventDefinition {
        key,
        event_type,
        action,
        description,
        severity,
    }
}

static EVENT_TAXONOMY: &[EventDefinition] = &[
    define(events::LOGIN_SUCCESS, "authentication", "login", "User logged in", AuditSeverity::Low),
    define(events::LOGIN_FAILED, "authentication", "login", "Login attempt failed", AuditSeverity::Medium),
    define(events::LOGOUT, "authentication", "logout", "User logged out", AuditSeverity::Low),
    define(events::REGISTER, "authentication", "register", "New account registered", AuditSeverity::Low),
    define(events::TOKEN_REFRESH, "authentication", "token_refresh", "Access token refreshed", AuditSeverity::Low),
    define(events::SESSION_EXPIRED, "session", "expire", "Session expired", AuditSeverity::Low),
    define(events::SESSION_INVALIDATED, "session", "invalidate", "Session invalidated", AuditSeverity::Medium),
    define(events::SESSIONS_REVOKED_ALL, "session", "revoke_all", "All sessions of a user revoked", AuditSeverity::High),
    define(events::PASSWORD_CHANGE, "account", "password_change", "Password changed", AuditSeverity::Medium),
    define(events::PERMISSION_DENIED, "authorization", "deny", "Permission denied", AuditSeverity::Medium),
    define(events::ROLE_ASSIGNED, "authorization", "role_assign", "Role assigned to user", AuditSeverity::High),
    define(events::ROLE_ASSIGNMENT_DENIED, "authorization", "role_assign", "Role assignment refused", AuditSeverity::High),
    define(events::USER_CREATED, "account", "create", "User account created", AuditSeverity::Medium),
    define(events::USER_DELETED, "account", "delete", "User account deleted", AuditSeverity::High),
    define(events::COMMAND_EXECUTE, "command", "execute", "Command executed", AuditSeverity::Medium),
    define(events::FILE_UPLOAD, "file", "upload", "File uploaded", AuditSeverity::Low),
    define(events::FILE_DELETE, "file", "delete", "File deleted", AuditSeverity::Medium),
    define(events::RATE_LIMIT_EXCEEDED, "security", "rate_limit", "Rate limit exceeded", AuditSeverity::Medium),
    define(events::TOKEN_REJECTED, "security", "token_reject", "Bearer token rejected", AuditSeverity::Medium),
    define(events::SUSPICIOUS_ACTIVITY, "security", "suspicious", "Suspicious activity detected", AuditSeverity::Critical),
    define(events::ADMIN_ACTION, "admin", "action", "Administrative action performed", AuditSeverity::High),
];

pub fn event_taxonomy() -> &'static [EventDefinition] {
    EVENT_TAXONOMY
}

pub fn event_definition(key: &str) -> Option<&'static EventDefinition> {
    EVENT_TAXONOMY.iter().find(|def| def.key == key)
}

/// One persisted audit record. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub user_id: Option<UserId>,
    pub event_type: String,
    pub event_action: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub ip_address: String,
    pub user_agent: String,
    pub request_id: String,
    pub session_id: String,
    pub details: Value,
    pub severity: AuditSeverity,
    pub status: AuditStatus,
    pub created_at: DateTime<Utc>,
}

/// An event to be recorded, before it is classified and timestamped
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub key: String,
    pub user_id: Option<UserId>,
    pub resource: String,
    pub resource_id: Option<String>,
    pub ip_address: String,
    pub user_agent: String,
    pub request_id: String,
    pub session_id: String,
    pub details: Value,
    pub status: AuditStatus,
}

impl AuditEvent {
    pub fn new(key: impl Into<String>, resource: impl Into<String>, status: AuditStatus) -> Self {
        Self {
            key: key.into(),
            user_id: None,
            resource: resource.into(),
            resource_id: None,
            ip_address: String::new(),
            user_agent: String::new(),
            request_id: String::new(),
            session_id: String::new(),
            details: Value::Null,
            status,
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_origin(mut self, ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.ip_address = ip_address.into();
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Serialize arbitrary details into the event
    pub fn with_serialized_details<T: Serialize + ?Sized>(mut self, details: &T) -> AuditResult<Self> {
        self.details = serde_json::to_value(details)?;
        Ok(self)
    }
}

/// Durable backend for audit entries
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert(&self, entry: &AuditEntry) -> AuditResult<()>;

    /// Matching entries, newest first
    async fn query(&self, filter: &AuditLogFilter, limit: u32, offset: u32) -> AuditResult<Vec<AuditEntry>>;

    async fn stats(&self) -> AuditResult<AuditStats>;

    /// Delete entries created strictly before `cutoff`
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> AuditResult<u64>;
}

/// Audit store kept in process memory, for development and tests
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn insert(&self, entry: &AuditEntry) -> AuditResult<()> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn query(&self, filter: &AuditLogFilter, limit: u32, offset: u32) -> AuditResult<Vec<AuditEntry>> {
        let entries = self.entries.read().await;
        // Reverse insertion order first so entries sharing a timestamp also come out newest first
        let mut matching: Vec<&AuditEntry> = entries.iter().rev().filter(|e| filter.matches(e)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> AuditResult<AuditStats> {
        let entries = self.entries.read().await;
        Ok(AuditStats::from_entries(entries.iter()))
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> AuditResult<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.created_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }
}

/// Classifies, timestamps and persists audit events
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
    clock: SharedClock,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuditStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Record one event, failing on unknown keys or store errors
    pub async fn log_event(&self, event: AuditEvent) -> AuditResult<AuditEntry> {
        let definition =
            event_definition(&event.key).ok_or_else(|| AuditError::UnknownEvent(event.key.clone()))?;

        let entry = AuditEntry {
            id: AuditEntryId::new(),
            user_id: event.user_id,
            event_type: definition.event_type.to_string(),
            event_action: definition.action.to_string(),
            resource: event.resource,
            resource_id: event.resource_id,
            ip_address: event.ip_address,
            user_agent: event.user_agent,
            request_id: event.request_id,
            session_id: event.session_id,
            details: event.details,
            severity: definition.severity,
            status: event.status,
            created_at: self.clock.now(),
        };

        self.store.insert(&entry).await?;

        if entry.severity.is_high_or_above() {
            warn!(
                event = definition.key,
                severity = %entry.severity,
                status = %entry.status,
                user_id = ?entry.user_id,
                resource = %entry.resource,
                "Audit event recorded"
            );
        } else {
            info!(
                event = definition.key,
                severity = %entry.severity,
                status = %entry.status,
                user_id = ?entry.user_id,
                "Audit event recorded"
            );
        }

        Ok(entry)
    }

    /// Record an event without surfacing failures to the caller
    pub async fn record(&self, event: AuditEvent) {
        let key = event.key.clone();
        if let Err(e) = self.log_event(event).await {
            error!(event = %key, error = %e, "Failed to record audit event");
        }
    }

    pub async fn get_audit_logs(
        &self,
        filter: &AuditLogFilter,
        limit: u32,
        offset: u32,
    ) -> AuditResult<Vec<AuditEntry>> {
        self.store
            .query(filter, limit.min(MAX_QUERY_LIMIT), offset)
            .await
    }

    pub async fn get_audit_stats(&self) -> AuditResult<AuditStats> {
        self.store.stats().await
    }

    /// Delete entries older than `retention_days`, returning how many were removed
    pub async fn cleanup_old_audit_logs(&self, retention_days: u32) -> AuditResult<u64> {
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(Duration::days(i64::from(retention_days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.store.delete_before(cutoff).await?;
        if removed > 0 {
            info!(removed, retention_days, %cutoff, "Old audit logs cleaned up");
        }
        Ok(removed)
    }
}

impl fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLogger").finish_non_exhaustive()
    }
}
