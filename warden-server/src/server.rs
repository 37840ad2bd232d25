use axum::{
    extract::{FromRef, Query, State},
    http::{HeaderMap, StatusCode},
    middleware::from_fn_with_state,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use warden_core::UserId;
use warden_security::{
    audit_query::DEFAULT_QUERY_LIMIT, auth_middleware, middleware::bearer_token, permission_middleware,
    rate_limit::endpoints, rate_limit_middleware, AuditEntry, AuditLogFilter, AuditSeverity, AuditStats,
    AuditStatus, AuthContext, EndpointLimit, PermissionGuard, RequestOrigin, RoleInfo, SecurityError,
    SecurityGate, Session, SessionStats,
};

use warden_storage::PgPool;

type ApiResult<T> = Result<Json<T>, SecurityError>;

#[derive(Clone)]
pub struct AppState {
    pub gate: SecurityGate,
    /// Present when the audit trail is stored in PostgreSQL
    pub database: Option<PgPool>,
}

impl FromRef<AppState> for SecurityGate {
    fn from_ref(state: &AppState) -> Self {
        state.gate.clone()
    }
}

pub fn router(state: AppState) -> Router {
    let gate = state.gate.clone();

    let sessions_admin = Router::new()
        .route("/sessions/stats", get(session_stats))
        .route_layer(from_fn_with_state(
            PermissionGuard::new(gate.clone(), "sessions.read"),
            permission_middleware,
        ));

    let audit = Router::new()
        .route("/audit/stats", get(audit_stats))
        .route("/audit/logs", get(audit_logs))
        .route_layer(from_fn_with_state(
            PermissionGuard::new(gate.clone(), "audit.read"),
            permission_middleware,
        ));

    let security = Router::new()
        .route("/sessions/me", get(my_sessions))
        .route("/roles", get(roles))
        .route("/logout", post(logout))
        .merge(sessions_admin)
        .merge(audit)
        .route_layer(from_fn_with_state(
            EndpointLimit::new(gate.clone(), endpoints::API),
            rate_limit_middleware,
        ))
        .route_layer(from_fn_with_state(gate.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1/security", security)
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let Some(pool) = &state.database else {
        return (StatusCode::OK, Json(json!({ "status": "ok", "audit_store": "memory" })));
    };

    let pool_status = warden_storage::pool_status(pool);
    match warden_storage::health_check(pool).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "audit_store": "postgres", "pool": pool_status })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, pool = %pool_status, "Database health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "audit_store": "postgres", "pool": pool_status })),
            )
        }
    }
}

async fn session_stats(State(gate): State<SecurityGate>) -> Json<SessionStats> {
    Json(gate.sessions().get_stats())
}

async fn my_sessions(
    State(gate): State<SecurityGate>,
    Extension(context): Extension<AuthContext>,
) -> Json<Vec<Session>> {
    Json(gate.sessions().get_user_sessions(&context.user_id))
}

async fn roles(State(gate): State<SecurityGate>) -> Json<Vec<RoleInfo>> {
    Json(gate.roles().get_all_roles())
}

async fn logout(
    State(gate): State<SecurityGate>,
    Extension(origin): Extension<RequestOrigin>,
    headers: HeaderMap,
) -> ApiResult<Value> {
    let token = bearer_token(&headers).ok_or(SecurityError::MissingCredentials)?;
    gate.logout(token, &origin).await?;
    Ok(Json(json!({ "status": "logged_out" })))
}

async fn audit_stats(State(gate): State<SecurityGate>) -> ApiResult<AuditStats> {
    Ok(Json(gate.audit().get_audit_stats().await?))
}

/// Query-string form of [`AuditLogFilter`] plus paging
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AuditLogQuery {
    user_id: Option<UserId>,
    event_type: Option<String>,
    severity: Option<AuditSeverity>,
    status: Option<AuditStatus>,
    ip_address: Option<String>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    limit: Option<u32>,
    offset: Option<u32>,
}

impl AuditLogQuery {
    fn filter(&self) -> AuditLogFilter {
        AuditLogFilter {
            user_id: self.user_id,
            event_type: self.event_type.clone(),
            severity: self.severity,
            status: self.status,
            ip_address: self.ip_address.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
        }
    }
}

async fn audit_logs(
    State(gate): State<SecurityGate>,
    Query(query): Query<AuditLogQuery>,
) -> ApiResult<Vec<AuditEntry>> {
    let entries = gate
        .audit()
        .get_audit_logs(
            &query.filter(),
            query.limit.unwrap_or(DEFAULT_QUERY_LIMIT),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(entries))
}
