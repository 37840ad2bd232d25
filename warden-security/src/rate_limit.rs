//! Sliding-window request throttling keyed by endpoint and caller identity.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};
use validator::Validate;
use warden_core::SharedClock;

/// Well-known endpoint names with default limits
pub mod endpoints {
    pub const LOGIN: &str = "login";
    pub const REGISTER: &str = "register";
    pub const UPLOAD: &str = "upload";
    pub const API: &str = "api";
    pub const COMMANDS: &str = "commands";
}

/// Longest window an endpoint may be configured with (one week)
pub const MAX_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

/// Limit and window for one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct RateLimitConfig {
    #[validate(range(min = 1))]
    pub limit: u32,
    #[validate(range(min = 1, max = 604800))]
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub fn new(limit: u32, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }

    /// 5 attempts per 15 minutes
    pub fn login() -> Self {
        Self::new(5, 15 * 60)
    }

    /// 3 registrations per hour
    pub fn register() -> Self {
        Self::new(3, 60 * 60)
    }

    pub fn upload() -> Self {
        Self::new(10, 60)
    }

    pub fn api() -> Self {
        Self::new(100, 60)
    }

    pub fn commands() -> Self {
        Self::new(20, 60)
    }

    pub fn window(&self) -> Duration {
        let secs = self.window_secs.min(MAX_WINDOW_SECS);
        Duration::seconds(i64::try_from(secs).unwrap_or(0))
    }
}

/// Default limits for the well-known endpoints
pub fn default_limits() -> BTreeMap<String, RateLimitConfig> {
    [
        (endpoints::LOGIN, RateLimitConfig::login()),
        (endpoints::REGISTER, RateLimitConfig::register()),
        (endpoints::UPLOAD, RateLimitConfig::upload()),
        (endpoints::API, RateLimitConfig::api()),
        (endpoints::COMMANDS, RateLimitConfig::commands()),
    ]
    .into_iter()
    .map(|(name, config)| (name.to_string(), config))
    .collect()
}

/// Outcome of a single admission check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
    pub limit: u32,
    /// Window length in seconds
    pub window: u64,
    /// Seconds until the oldest counted request leaves the window (0 when allowed)
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    /// Write the `X-RateLimit-*` headers describing this decision
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert("X-RateLimit-Limit", HeaderValue::from(self.limit));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from(self.remaining));
        headers.insert(
            "X-RateLimit-Reset",
            HeaderValue::from(self.reset_time.timestamp()),
        );
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Rate limit exceeded for {endpoint}, retry after {} seconds", .decision.retry_after_secs)]
    Exceeded {
        endpoint: String,
        decision: RateLimitDecision,
    },
}

impl RateLimitError {
    pub fn decision(&self) -> &RateLimitDecision {
        match self {
            RateLimitError::Exceeded { decision, .. } => decision,
        }
    }
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        let RateLimitError::Exceeded { endpoint, decision } = self;

        let mut headers = HeaderMap::new();
        headers.insert("Retry-After", HeaderValue::from(decision.retry_after_secs));
        decision.apply_headers(&mut headers);

        let body = Json(json!({
            "error": "Too Many Requests",
            "message": format!(
                "Rate limit exceeded. Retry after {} seconds",
                decision.retry_after_secs
            ),
            "endpoint": endpoint,
            "retry_after_seconds": decision.retry_after_secs,
        }));

        (StatusCode::TOO_MANY_REQUESTS, headers, body).into_response()
    }
}

/// Sliding-window counter for one endpoint.
///
/// After every check the window for a key holds no timestamp at or before
/// `now - window`.
pub struct SlidingWindowLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<String, VecDeque<DateTime<Utc>>>,
    clock: SharedClock,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig, clock: SharedClock) -> Self {
        Self {
            limit: config.limit,
            window: config.window(),
            windows: DashMap::new(),
            clock,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Prune, decide and record in a single step
    pub fn check(&self, key: &str) -> RateLimitDecision {
        let now = self.clock.now();
        let cutoff = now - self.window;

        let mut hits = self.windows.entry(key.to_string()).or_default();
        prune(&mut hits, cutoff);

        let allowed = (hits.len() as u64) < u64::from(self.limit);
        if allowed {
            hits.push_back(now);
        }

        let reset_time = hits.front().map_or(now, |oldest| *oldest + self.window);
        let remaining = self.remaining_for(hits.len());
        drop(hits);

        RateLimitDecision {
            allowed,
            remaining,
            reset_time,
            limit: self.limit,
            window: self.window.num_seconds().max(0) as u64,
            retry_after_secs: if allowed {
                0
            } else {
                seconds_until(now, reset_time)
            },
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        self.check(key).allowed
    }

    /// Requests left in the current window, without recording one
    pub fn remaining(&self, key: &str) -> u32 {
        let cutoff = self.clock.now() - self.window;
        let count = self
            .windows
            .get(key)
            .map_or(0, |hits| hits.iter().filter(|t| **t > cutoff).count());
        self.remaining_for(count)
    }

    /// When the oldest counted request leaves the window
    pub fn reset_time(&self, key: &str) -> DateTime<Utc> {
        let now = self.clock.now();
        let cutoff = now - self.window;
        self.windows
            .get(key)
            .and_then(|hits| hits.iter().find(|t| **t > cutoff).copied())
            .map_or(now, |oldest| oldest + self.window)
    }

    /// Drop keys with no request in the last two windows
    pub fn cleanup(&self) -> usize {
        let stale_before = self.clock.now() - self.window * 2;
        let before = self.windows.len();
        self.windows
            .retain(|_, hits| hits.back().is_some_and(|latest| *latest > stale_before));
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    fn remaining_for(&self, count: usize) -> u32 {
        let count = u32::try_from(count).unwrap_or(u32::MAX);
        self.limit.saturating_sub(count)
    }
}

impl fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("tracked_keys", &self.windows.len())
            .finish()
    }
}

fn prune(hits: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
    while hits.front().is_some_and(|oldest| *oldest <= cutoff) {
        hits.pop_front();
    }
}

fn seconds_until(now: DateTime<Utc>, then: DateTime<Utc>) -> u64 {
    let millis = (then - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000)
}

/// Maps endpoint names to independent limiters.
///
/// The endpoint table is fixed at construction; endpoints without a limiter
/// are never throttled.
#[derive(Debug)]
pub struct RateLimitManager {
    limiters: HashMap<String, SlidingWindowLimiter>,
}

impl RateLimitManager {
    pub fn new<I, S>(limits: I, clock: SharedClock) -> Self
    where
        I: IntoIterator<Item = (S, RateLimitConfig)>,
        S: Into<String>,
    {
        let limiters = limits
            .into_iter()
            .map(|(endpoint, config)| {
                (
                    endpoint.into(),
                    SlidingWindowLimiter::new(config, clock.clone()),
                )
            })
            .collect();
        Self { limiters }
    }

    pub fn with_defaults(clock: SharedClock) -> Self {
        Self::new(default_limits(), clock)
    }

    pub fn limiter(&self, endpoint: &str) -> Option<&SlidingWindowLimiter> {
        self.limiters.get(endpoint)
    }

    pub fn check(&self, endpoint: &str, identity: &str) -> Result<Option<RateLimitDecision>, RateLimitError> {
        let Some(limiter) = self.limiters.get(endpoint) else {
            return Ok(None);
        };

        let decision = limiter.check(identity);
        if decision.allowed {
            debug!(endpoint, remaining = decision.remaining, "Request admitted");
            Ok(Some(decision))
        } else {
            warn!(
                endpoint,
                retry_after_secs = decision.retry_after_secs,
                "Rate limit exceeded"
            );
            Err(RateLimitError::Exceeded {
                endpoint: endpoint.to_string(),
                decision,
            })
        }
    }

    pub fn allow(&self, endpoint: &str, identity: &str) -> bool {
        self.check(endpoint, identity).is_ok()
    }

    pub fn remaining(&self, endpoint: &str, identity: &str) -> Option<u32> {
        self.limiters.get(endpoint).map(|l| l.remaining(identity))
    }

    pub fn reset_time(&self, endpoint: &str, identity: &str) -> Option<DateTime<Utc>> {
        self.limiters.get(endpoint).map(|l| l.reset_time(identity))
    }

    /// Evict stale keys from every limiter
    pub fn cleanup(&self) -> usize {
        let removed: usize = self.limiters.values().map(SlidingWindowLimiter::cleanup).sum();
        if removed > 0 {
            debug!(removed, "Rate limiter cleanup");
        }
        removed
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;
    use warden_core::{Clock, ManualClock};

    fn limiter(limit: u32, window_secs: u64) -> (ManualClock, SlidingWindowLimiter) {
        let clock = ManualClock::starting_now();
        let limiter = SlidingWindowLimiter::new(RateLimitConfig::new(limit, window_secs), clock.shared());
        (clock, limiter)
    }

    #[test]
    fn test_five_per_minute() {
        let (clock, limiter) = limiter(5, 60);

        for _ in 0..5 {
            assert!(limiter.allow("10.0.0.1"));
        }
        assert!(!limiter.allow("10.0.0.1"));
        assert_eq!(limiter.remaining("10.0.0.1"), 0);

        clock.advance(Duration::seconds(61));
        assert_eq!(limiter.remaining("10.0.0.1"), 5);
        assert!(limiter.allow("10.0.0.1"));
        assert_eq!(limiter.remaining("10.0.0.1"), 4);
    }

    #[test]
    fn test_keys_are_independent() {
        let (_clock, limiter) = limiter(1, 60);
        assert!(limiter.allow("alice"));
        assert!(!limiter.allow("alice"));
        assert!(limiter.allow("bob"));
    }

    #[test]
    fn test_window_slides() {
        let (clock, limiter) = limiter(2, 60);
        let start = clock.now();

        assert!(limiter.allow("k"));
        clock.advance(Duration::seconds(30));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));

        // The first hit leaves the window, the second is still counted
        clock.advance(Duration::seconds(30));
        assert_eq!(limiter.remaining("k"), 1);
        assert_eq!(limiter.reset_time("k"), start + Duration::seconds(90));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
    }

    #[test]
    fn test_reset_time_and_retry_after() {
        let (clock, limiter) = limiter(1, 60);
        let start = clock.now();

        assert_eq!(limiter.reset_time("fresh"), start);

        let first = limiter.check("k");
        assert!(first.allowed);
        assert_eq!(first.reset_time, start + Duration::seconds(60));
        assert_eq!(first.retry_after_secs, 0);

        clock.advance(Duration::seconds(15));
        let denied = limiter.check("k");
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after_secs, 45);
        assert_eq!(denied.window, 60);
    }

    #[test]
    fn test_cleanup_drops_stale_keys() {
        let (clock, limiter) = limiter(5, 60);
        limiter.allow("old");
        clock.advance(Duration::seconds(90));
        limiter.allow("recent");

        assert_eq!(limiter.cleanup(), 0);
        clock.advance(Duration::seconds(31));
        assert_eq!(limiter.cleanup(), 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[rstest]
    #[case(endpoints::LOGIN, 5, 900)]
    #[case(endpoints::REGISTER, 3, 3600)]
    #[case(endpoints::UPLOAD, 10, 60)]
    #[case(endpoints::API, 100, 60)]
    #[case(endpoints::COMMANDS, 20, 60)]
    fn test_default_limits(#[case] endpoint: &str, #[case] limit: u32, #[case] window_secs: u64) {
        let limits = default_limits();
        assert_eq!(limits[endpoint], RateLimitConfig::new(limit, window_secs));
    }

    #[test]
    fn test_manager_throttles_per_endpoint() {
        let clock = ManualClock::starting_now();
        let manager = RateLimitManager::with_defaults(clock.shared());

        for _ in 0..3 {
            assert!(manager.allow(endpoints::REGISTER, "10.0.0.1"));
        }
        let err = manager.check(endpoints::REGISTER, "10.0.0.1").unwrap_err();
        assert_eq!(err.decision().limit, 3);
        assert_eq!(err.decision().retry_after_secs, 3600);

        // Other endpoints keep their own windows
        assert!(manager.allow(endpoints::LOGIN, "10.0.0.1"));
        assert_eq!(manager.remaining(endpoints::LOGIN, "10.0.0.1"), Some(4));
    }

    #[test]
    fn test_manager_unconfigured_endpoint_always_allowed() {
        let manager = RateLimitManager::with_defaults(ManualClock::starting_now().shared());
        for _ in 0..1000 {
            assert_eq!(manager.check("metrics", "anyone"), Ok(None));
        }
        assert_eq!(manager.remaining("metrics", "anyone"), None);
        assert_eq!(manager.reset_time("metrics", "anyone"), None);
    }

    #[test]
    fn test_exceeded_response() {
        let clock = ManualClock::starting_now();
        let manager = RateLimitManager::new([("login", RateLimitConfig::new(1, 900))], clock.shared());
        manager.check("login", "ip").unwrap();
        let response = manager.check("login", "ip").unwrap_err().into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["Retry-After"], "900");
        assert_eq!(response.headers()["X-RateLimit-Limit"], "1");
        assert_eq!(response.headers()["X-RateLimit-Remaining"], "0");
    }

    #[test]
    fn test_config_validation() {
        assert!(RateLimitConfig::new(5, 60).validate().is_ok());
        assert!(RateLimitConfig::new(0, 60).validate().is_err());
        assert!(RateLimitConfig::new(5, 0).validate().is_err());
        assert!(RateLimitConfig::new(5, MAX_WINDOW_SECS).validate().is_ok());
        assert!(RateLimitConfig::new(5, MAX_WINDOW_SECS + 1).validate().is_err());
    }

    #[test]
    fn test_oversized_window_is_clamped() {
        let config = RateLimitConfig::new(1, u64::MAX);
        assert_eq!(config.window(), Duration::seconds(MAX_WINDOW_SECS as i64));

        let (_clock, limiter) = limiter(1, u64::MAX);
        assert!(limiter.allow("client"));
        assert!(!limiter.allow("client"));
    }

    proptest! {
        #[test]
        fn prop_never_more_than_limit_in_any_window(
            limit in 1u32..8,
            window_secs in 1u64..30,
            gaps in proptest::collection::vec(0i64..10, 1..60),
        ) {
            let (clock, limiter) = limiter(limit, window_secs);
            let window = Duration::seconds(window_secs as i64);
            let mut admitted: Vec<DateTime<Utc>> = Vec::new();

            for gap in gaps {
                clock.advance(Duration::seconds(gap));
                let now = clock.now();
                if limiter.allow("key") {
                    admitted.push(now);
                }
                let in_window = admitted.iter().filter(|t| **t > now - window).count();
                prop_assert!(in_window <= limit as usize);
                prop_assert_eq!(limiter.remaining("key") as usize, limit as usize - in_window);
            }
        }
    }
}
