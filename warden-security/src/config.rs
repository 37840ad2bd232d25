//! Runtime settings for the security services.
//!
//! Every section has defaults, so an empty source yields a working
//! development configuration (with a warning about the signing secret).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;
use warden_core::CoreError;

use crate::maintenance::MaintenanceSettings;
use crate::rate_limit::{default_limits, RateLimitConfig};
use crate::token::TokenConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SecurityConfig {
    #[validate(nested)]
    pub token: TokenConfig,

    /// Per-endpoint limits layered over the built-in defaults
    pub rate_limits: BTreeMap<String, RateLimitConfig>,

    #[validate(nested)]
    pub maintenance: MaintenanceConfig,

    #[validate(nested)]
    pub audit: AuditConfig,

    pub sessions: SessionConfig,

    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`.
    /// Only enable behind a proxy that overwrites those headers.
    pub trust_forwarded_headers: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MaintenanceConfig {
    #[validate(range(min = 1, max = 604800))]
    pub session_sweep_secs: u64,
    #[validate(range(min = 1, max = 604800))]
    pub rate_limit_cleanup_secs: u64,
    #[validate(range(min = 1, max = 604800))]
    pub audit_cleanup_secs: u64,
    #[validate(range(min = 1, max = 604800))]
    pub blacklist_purge_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        let defaults = MaintenanceSettings::default();
        Self {
            session_sweep_secs: defaults.session_sweep.as_secs(),
            rate_limit_cleanup_secs: defaults.rate_limit_cleanup.as_secs(),
            audit_cleanup_secs: defaults.audit_cleanup.as_secs(),
            blacklist_purge_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AuditConfig {
    /// Entries older than this are deleted by the retention job
    #[validate(range(min = 1, max = 3650))]
    pub retention_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { retention_days: 90 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Schedule the blacklist purge job
    pub purge_blacklist: bool,
}

impl SecurityConfig {
    /// Check every section, including each rate-limit override
    pub fn validate_all(&self) -> Result<(), CoreError> {
        self.validate()
            .map_err(|e| CoreError::Configuration(e.to_string()))?;

        for (endpoint, limits) in &self.rate_limits {
            limits.validate().map_err(|e| {
                CoreError::Configuration(format!("rate_limits.{endpoint}: {e}"))
            })?;
        }

        Ok(())
    }

    /// Default limits with configured overrides applied
    pub fn rate_limit_table(&self) -> BTreeMap<String, RateLimitConfig> {
        let mut table = default_limits();
        table.extend(self.rate_limits.iter().map(|(k, v)| (k.clone(), *v)));
        table
    }

    pub fn maintenance_settings(&self) -> MaintenanceSettings {
        MaintenanceSettings {
            session_sweep: Duration::from_secs(self.maintenance.session_sweep_secs),
            rate_limit_cleanup: Duration::from_secs(self.maintenance.rate_limit_cleanup_secs),
            audit_cleanup: Duration::from_secs(self.maintenance.audit_cleanup_secs),
            audit_retention_days: self.audit.retention_days,
            blacklist_purge: self
                .sessions
                .purge_blacklist
                .then(|| Duration::from_secs(self.maintenance.blacklist_purge_secs)),
        }
    }
}
