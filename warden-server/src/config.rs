use anyhow::Result;
use config::{Config as ConfigLoader, Environment, File};
use serde::Deserialize;
use warden_security::SecurityConfig;
use warden_storage::PostgresConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Server settings, layered from `config/default`, `config/local` and
/// `WARDEN__*` environment variables (e.g. `WARDEN__SECURITY__TOKEN__SECRET`)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    /// Without a database the audit trail is kept in memory
    pub database_url: Option<String>,
    pub database: PostgresConfig,
    pub security: SecurityConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let loader = ConfigLoader::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("WARDEN")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = loader.try_deserialize()?;
        config.security.validate_all()?;
        Ok(config)
    }

    /// Pool settings with the configured URL, if a database is configured
    pub fn postgres(&self) -> Option<PostgresConfig> {
        self.database_url.as_ref().map(|url| PostgresConfig {
            database_url: url.clone(),
            ..self.database.clone()
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info,warden=debug,tower_http=debug".to_string(),
            log_format: LogFormat::Plain,
            database_url: None,
            database: PostgresConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_format, LogFormat::Plain);
        assert!(config.postgres().is_none());
    }

    #[test]
    fn test_postgres_uses_database_url() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "database_url": "postgres://db/warden",
            "database": { "max_connections": 3 },
            "log_format": "json"
        }))
        .unwrap();

        let postgres = config.postgres().unwrap();
        assert_eq!(postgres.database_url, "postgres://db/warden");
        assert_eq!(postgres.max_connections, 3);
        assert_eq!(config.log_format, LogFormat::Json);
    }
}
