//! Security core for the Warden API: bearer tokens, sessions, role policy,
//! rate limiting and the audit trail, plus the axum glue that puts them in
//! front of a router.

pub mod audit;
pub mod audit_query;
pub mod config;
pub mod error;
pub mod gate;
pub mod maintenance;
pub mod middleware;
pub mod rate_limit;
pub mod rbac;
pub mod session;
pub mod token;

pub use audit::{
    events, AuditEntry, AuditError, AuditEvent, AuditLogger, AuditResult, AuditSeverity, AuditStatus,
    AuditStore, EventDefinition, MemoryAuditStore,
};
pub use audit_query::{AuditLogFilter, AuditStats};
pub use config::SecurityConfig;
pub use error::{SecurityError, SecurityOutcome, SecurityResult};
pub use gate::{AccessRequest, AuthContext, LoginGrant, RequestOrigin, SecurityGate};
pub use maintenance::{MaintenanceScheduler, MaintenanceSettings, ScheduledTask};
pub use middleware::{auth_middleware, permission_middleware, rate_limit_middleware, EndpointLimit, PermissionGuard};
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimitError, RateLimitManager, SlidingWindowLimiter};
pub use rbac::{Permission, PermissionError, PermissionGrant, Role, RoleError, RoleInfo, RoleRegistry};
pub use session::{Session, SessionError, SessionStats, SessionStore};
pub use token::{TokenClaims, TokenCodec, TokenConfig, TokenError, VerifiedIdentity};
