//! Fixed-interval background jobs with an explicit start/stop lifecycle.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::audit::AuditLogger;
use crate::rate_limit::RateLimitManager;
use crate::session::SessionStore;

/// A job re-run every `interval` until stopped.
///
/// The first run happens one full interval after spawning.
pub struct ScheduledTask {
    name: String,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn spawn<F, Fut>(name: impl Into<String>, interval: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!(task = %task_name, "Running scheduled task");
                        job().await;
                    }
                    _ = stop_rx.changed() => break,
                }
            }

            debug!(task = %task_name, "Scheduled task stopped");
        });

        info!(task = %name, interval_secs = interval.as_secs(), "Scheduled task started");
        Self {
            name,
            stop_tx,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the task and wait for its current run to finish
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(task = %self.name, error = %e, "Scheduled task ended abnormally");
        }
    }
}

/// Intervals for the maintenance jobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceSettings {
    pub session_sweep: Duration,
    pub rate_limit_cleanup: Duration,
    pub audit_cleanup: Duration,
    pub audit_retention_days: u32,
    /// `None` leaves the blacklist untouched
    pub blacklist_purge: Option<Duration>,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            session_sweep: Duration::from_secs(60 * 60),
            rate_limit_cleanup: Duration::from_secs(5 * 60),
            audit_cleanup: Duration::from_secs(24 * 60 * 60),
            audit_retention_days: 90,
            blacklist_purge: None,
        }
    }
}

pub const SESSION_SWEEP_TASK: &str = "session_sweep";
pub const RATE_LIMIT_CLEANUP_TASK: &str = "rate_limit_cleanup";
pub const AUDIT_RETENTION_TASK: &str = "audit_retention";
pub const BLACKLIST_PURGE_TASK: &str = "blacklist_purge";

/// Owns the running maintenance jobs
pub struct MaintenanceScheduler {
    tasks: Vec<ScheduledTask>,
}

impl MaintenanceScheduler {
    pub fn start(
        sessions: Arc<SessionStore>,
        rate_limits: Arc<RateLimitManager>,
        audit: AuditLogger,
        settings: &MaintenanceSettings,
    ) -> Self {
        let mut tasks = Vec::with_capacity(4);

        let sweep_sessions = Arc::clone(&sessions);
        tasks.push(ScheduledTask::spawn(
            SESSION_SWEEP_TASK,
            settings.session_sweep,
            move || {
                let sessions = Arc::clone(&sweep_sessions);
                async move {
                    sessions.cleanup_expired_sessions();
                }
            },
        ));

        tasks.push(ScheduledTask::spawn(
            RATE_LIMIT_CLEANUP_TASK,
            settings.rate_limit_cleanup,
            move || {
                let rate_limits = Arc::clone(&rate_limits);
                async move {
                    rate_limits.cleanup();
                }
            },
        ));

        let retention_days = settings.audit_retention_days;
        tasks.push(ScheduledTask::spawn(
            AUDIT_RETENTION_TASK,
            settings.audit_cleanup,
            move || {
                let audit = audit.clone();
                async move {
                    if let Err(e) = audit.cleanup_old_audit_logs(retention_days).await {
                        error!(error = %e, retention_days, "Audit retention cleanup failed");
                    }
                }
            },
        ));

        if let Some(period) = settings.blacklist_purge {
            tasks.push(ScheduledTask::spawn(BLACKLIST_PURGE_TASK, period, move || {
                let sessions = Arc::clone(&sessions);
                async move {
                    sessions.purge_blacklist();
                }
            }));
        }

        info!(tasks = tasks.len(), "Maintenance scheduler started");
        Self { tasks }
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(ScheduledTask::name).collect()
    }

    /// Stop every job and wait for them to finish
    pub async fn shutdown(self) {
        for task in self.tasks {
            task.stop().await;
        }
        info!("Maintenance scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{events, AuditEvent, AuditStatus, MemoryAuditStore};
    use crate::token::{TokenCodec, TokenConfig, VerifiedIdentity};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use warden_core::{ManualClock, UserId};

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_on_interval_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let task = ScheduledTask::spawn("counter", Duration::from_secs(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        task.stop().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_runs_maintenance_jobs() {
        let clock = ManualClock::starting_now();
        let codec = Arc::new(TokenCodec::new(
            TokenConfig::new("maintenance-test-secret-0123456789abcdef"),
            clock.shared(),
        ));
        let sessions = Arc::new(SessionStore::new(Arc::clone(&codec)));
        let rate_limits = Arc::new(RateLimitManager::with_defaults(clock.shared()));
        let store = Arc::new(MemoryAuditStore::new());
        let audit = AuditLogger::new(store.clone(), clock.shared());

        let user = VerifiedIdentity::new(UserId::new(), "alice", "user");
        let token = codec.issue(&user).unwrap();
        sessions.create_session(&user, &token, "::1", "test").unwrap();
        rate_limits.allow("api", "::1");
        audit
            .log_event(AuditEvent::new(events::LOGIN_SUCCESS, "auth", AuditStatus::Success))
            .await
            .unwrap();

        let settings = MaintenanceSettings {
            session_sweep: Duration::from_secs(60),
            rate_limit_cleanup: Duration::from_secs(60),
            audit_cleanup: Duration::from_secs(60),
            audit_retention_days: 30,
            blacklist_purge: Some(Duration::from_secs(120)),
        };
        let scheduler = MaintenanceScheduler::start(
            Arc::clone(&sessions),
            Arc::clone(&rate_limits),
            audit,
            &settings,
        );
        assert_eq!(
            scheduler.task_names(),
            vec![
                SESSION_SWEEP_TASK,
                RATE_LIMIT_CLEANUP_TASK,
                AUDIT_RETENTION_TASK,
                BLACKLIST_PURGE_TASK
            ]
        );

        // Everything created above is now stale
        clock.advance(chrono::Duration::days(60));
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(sessions.get_stats().total, 0);
        assert!(sessions.is_blacklisted(&token));
        assert_eq!(rate_limits.limiter("api").unwrap().tracked_keys(), 0);
        assert!(store.is_empty().await);

        // The purge runs on its own, slower interval
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!sessions.is_blacklisted(&token));

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_blacklist_purge_disabled_by_default() {
        let clock = ManualClock::starting_now();
        let codec = Arc::new(TokenCodec::new(
            TokenConfig::new("maintenance-test-secret-0123456789abcdef"),
            clock.shared(),
        ));
        let sessions = Arc::new(SessionStore::new(codec));
        let scheduler = MaintenanceScheduler::start(
            sessions,
            Arc::new(RateLimitManager::with_defaults(clock.shared())),
            AuditLogger::new(Arc::new(MemoryAuditStore::new()), clock.shared()),
            &MaintenanceSettings::default(),
        );

        assert!(!scheduler.task_names().contains(&BLACKLIST_PURGE_TASK));
        scheduler.shutdown().await;
    }
}
