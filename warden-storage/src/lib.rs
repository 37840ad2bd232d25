pub mod audit_store;
pub mod postgres;

pub use audit_store::PostgresAuditStore;
pub use postgres::{connect, health_check, migrate, pool_status, PoolStatus, PostgresConfig};
pub use sqlx::PgPool;
