use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use warden_core::SystemClock;
use warden_security::{AuditStore, MemoryAuditStore, SecurityGate};
use warden_storage::PostgresAuditStore;

mod config;
mod server;

use config::{Config, LogFormat};
use server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config);

    tracing::info!("Starting Warden security server");

    if config.security.token.uses_development_secret() {
        tracing::warn!("Using the development token secret; set WARDEN__SECURITY__TOKEN__SECRET");
    }

    let database = match config.postgres() {
        Some(postgres) => Some(warden_storage::connect(&postgres).await?),
        None => None,
    };

    let audit_store: Arc<dyn AuditStore> = match &database {
        Some(pool) => {
            tracing::info!("Audit log backed by PostgreSQL");
            Arc::new(PostgresAuditStore::new(pool.clone()))
        }
        None => {
            tracing::warn!("No database_url configured, audit log kept in memory");
            Arc::new(MemoryAuditStore::new())
        }
    };

    let gate = SecurityGate::from_config(&config.security, SystemClock::shared(), audit_store);
    let maintenance = gate.start_maintenance(&config.security);

    let app = server::router(AppState { gate, database }).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    maintenance.shutdown().await;
    tracing::info!("Server stopped");

    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
