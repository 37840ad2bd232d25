//! Filters and aggregates over stored audit entries

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_core::UserId;

use crate::audit::{AuditEntry, AuditSeverity, AuditStatus};

/// Page size used when a caller does not ask for one
pub const DEFAULT_QUERY_LIMIT: u32 = 100;

/// Largest page a single query may return
pub const MAX_QUERY_LIMIT: u32 = 1000;

/// Number of high/critical entries reported in [`AuditStats::recent_critical`]
pub const RECENT_CRITICAL_LIMIT: usize = 10;

/// Filters for querying audit logs. Absent fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogFilter {
    pub user_id: Option<UserId>,

    pub event_type: Option<String>,

    pub severity: Option<AuditSeverity>,

    pub status: Option<AuditStatus>,

    /// Exact origin address
    pub ip_address: Option<String>,

    /// Inclusive lower bound on `created_at`
    pub start_date: Option<DateTime<Utc>>,

    /// Inclusive upper bound on `created_at`
    pub end_date: Option<DateTime<Utc>>,
}

impl AuditLogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn status(mut self, status: AuditStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_date = Some(start);
        self.end_date = Some(end);
        self
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.user_id.map_or(true, |id| entry.user_id == Some(id))
            && self
                .event_type
                .as_deref()
                .map_or(true, |t| entry.event_type == t)
            && self.severity.map_or(true, |s| entry.severity == s)
            && self.status.map_or(true, |s| entry.status == s)
            && self
                .ip_address
                .as_deref()
                .map_or(true, |ip| entry.ip_address == ip)
            && self.start_date.map_or(true, |start| entry.created_at >= start)
            && self.end_date.map_or(true, |end| entry.created_at <= end)
    }
}

/// Aggregate view over the whole audit log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditStats {
    pub total: u64,
    pub by_severity: BTreeMap<String, u64>,
    pub by_event_type: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
    /// Newest high and critical entries, newest first
    pub recent_critical: Vec<AuditEntry>,
}

impl AuditStats {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a AuditEntry>) -> Self {
        let mut stats = Self::default();
        let mut critical: Vec<&AuditEntry> = Vec::new();

        for entry in entries {
            stats.total += 1;
            *stats
                .by_severity
                .entry(entry.severity.as_str().to_string())
                .or_default() += 1;
            *stats.by_event_type.entry(entry.event_type.clone()).or_default() += 1;
            *stats
                .by_status
                .entry(entry.status.as_str().to_string())
                .or_default() += 1;

            if entry.severity.is_high_or_above() {
                critical.push(entry);
            }
        }

        critical.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        stats.recent_critical = critical
            .into_iter()
            .take(RECENT_CRITICAL_LIMIT)
            .cloned()
            .collect();

        stats
    }

    pub fn count_for_severity(&self, severity: AuditSeverity) -> u64 {
        self.by_severity
            .get(severity.as_str())
            .copied()
            .unwrap_or(0)
    }
}
