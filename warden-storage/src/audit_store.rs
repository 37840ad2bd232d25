//! PostgreSQL-backed audit trail (`audit_logs` table)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;
use warden_core::{AuditEntryId, UserId};
use warden_security::audit::{AuditEntry, AuditError, AuditResult, AuditSeverity, AuditStatus, AuditStore};
use warden_security::audit_query::{AuditLogFilter, AuditStats, RECENT_CRITICAL_LIMIT};

const ENTRY_COLUMNS: &str = "id, user_id, event_type, event_action, resource, resource_id, ip_address, \
     user_agent, request_id, session_id, details, severity, status, created_at";

pub struct PostgresAuditStore {
    pool: PgPool,
}

impl PostgresAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn grouped_counts(&self, column: &str) -> AuditResult<Vec<(String, u64)>> {
        let sql = format!("SELECT {column} AS key, COUNT(*) AS count FROM audit_logs GROUP BY {column}");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

        rows.iter()
            .map(|row| {
                let key: String = row.try_get("key").map_err(store_error)?;
                let count: i64 = row.try_get("count").map_err(store_error)?;
                Ok((key, count.max(0) as u64))
            })
            .collect()
    }
}

/// `SELECT ... FROM audit_logs WHERE <filter> ORDER BY created_at DESC LIMIT .. OFFSET ..`
pub fn build_query(filter: &AuditLogFilter, limit: u32, offset: u32) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!("SELECT {ENTRY_COLUMNS} FROM audit_logs WHERE 1=1"));

    if let Some(user_id) = filter.user_id {
        builder.push(" AND user_id = ").push_bind(user_id.0);
    }
    if let Some(event_type) = &filter.event_type {
        builder.push(" AND event_type = ").push_bind(event_type.clone());
    }
    if let Some(severity) = filter.severity {
        builder.push(" AND severity = ").push_bind(severity.as_str());
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(ip) = &filter.ip_address {
        builder.push(" AND ip_address = ").push_bind(ip.clone());
    }
    if let Some(start) = filter.start_date {
        builder.push(" AND created_at >= ").push_bind(start);
    }
    if let Some(end) = filter.end_date {
        builder.push(" AND created_at <= ").push_bind(end);
    }

    builder
        .push(" ORDER BY created_at DESC LIMIT ")
        .push_bind(i64::from(limit))
        .push(" OFFSET ")
        .push_bind(i64::from(offset));

    builder
}

#[async_trait]
impl AuditStore for PostgresAuditStore {
    async fn insert(&self, entry: &AuditEntry) -> AuditResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (
                id, user_id, event_type, event_action, resource, resource_id, ip_address,
                user_agent, request_id, session_id, details, severity, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(entry.id.0)
        .bind(entry.user_id.map(|id| id.0))
        .bind(&entry.event_type)
        .bind(&entry.event_action)
        .bind(&entry.resource)
        .bind(&entry.resource_id)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(&entry.request_id)
        .bind(&entry.session_id)
        .bind(&entry.details)
        .bind(entry.severity.as_str())
        .bind(entry.status.as_str())
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(())
    }

    async fn query(&self, filter: &AuditLogFilter, limit: u32, offset: u32) -> AuditResult<Vec<AuditEntry>> {
        let rows = build_query(filter, limit, offset)
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn stats(&self) -> AuditResult<AuditStats> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_logs")
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;

        let recent = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM audit_logs WHERE severity IN ('high', 'critical') \
             ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(RECENT_CRITICAL_LIMIT as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(AuditStats {
            total: total.max(0) as u64,
            by_severity: self.grouped_counts("severity").await?.into_iter().collect(),
            by_event_type: self.grouped_counts("event_type").await?.into_iter().collect(),
            by_status: self.grouped_counts("status").await?.into_iter().collect(),
            recent_critical: recent.iter().map(row_to_entry).collect::<AuditResult<_>>()?,
        })
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> AuditResult<u64> {
        let result = sqlx::query("DELETE FROM audit_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;

        Ok(result.rows_affected())
    }
}

fn store_error(err: sqlx::Error) -> AuditError {
    AuditError::Store(err.to_string())
}

fn row_to_entry(row: &PgRow) -> AuditResult<AuditEntry> {
    let severity: String = row.try_get("severity").map_err(store_error)?;
    let status: String = row.try_get("status").map_err(store_error)?;

    Ok(AuditEntry {
        id: AuditEntryId::from_uuid(row.try_get::<Uuid, _>("id").map_err(store_error)?),
        user_id: row
            .try_get::<Option<Uuid>, _>("user_id")
            .map_err(store_error)?
            .map(UserId::from_uuid),
        event_type: row.try_get("event_type").map_err(store_error)?,
        event_action: row.try_get("event_action").map_err(store_error)?,
        resource: row.try_get("resource").map_err(store_error)?,
        resource_id: row.try_get("resource_id").map_err(store_error)?,
        ip_address: row.try_get("ip_address").map_err(store_error)?,
        user_agent: row.try_get("user_agent").map_err(store_error)?,
        request_id: row.try_get("request_id").map_err(store_error)?,
        session_id: row.try_get("session_id").map_err(store_error)?,
        details: row.try_get::<Value, _>("details").map_err(store_error)?,
        severity: AuditSeverity::parse(&severity)
            .ok_or_else(|| AuditError::Store(format!("unknown severity in audit_logs: {severity}")))?,
        status: AuditStatus::parse(&status)
            .ok_or_else(|| AuditError::Store(format!("unknown status in audit_logs: {status}")))?,
        created_at: row.try_get("created_at").map_err(store_error)?,
    })
}
