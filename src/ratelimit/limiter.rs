//! Core rate limiter implementation.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, trace, warn};

use super::clock::{Clock, SystemClock};
use super::key::{Action, AttemptKey, Identifier};
use super::policy::{
    evaluate, saturating_sub, Horizon, LimitConfig, LimitOverride, RateLimitResult,
    RateLimitStatus, DEFAULT_RETENTION_HOURS,
};
use super::rules::RateLimitRules;
use crate::storage::{AdmissionGuard, AttemptRecord, AttemptStore, Metadata};

/// The rate limiter service.
///
/// Holds no per-key state of its own: every decision is recomputed from the
/// attempt log in the injected store. Storage faults never reach the caller.
/// Checks fail open, writes are dropped, and both are logged.
///
/// Time is kept at millisecond resolution, the finest every store preserves.
///
/// `check_rate_limit` followed by `record_attempt` is not atomic; concurrent
/// callers can briefly over-admit. Use `check_and_record` where the outcome is
/// known before the attempt is made.
pub struct RateLimiter {
    /// The attempt log
    store: Arc<dyn AttemptStore>,
    /// Source of "now"
    clock: Arc<dyn Clock>,
    /// Limits per action
    rules: RateLimitRules,
    /// Records older than this are ignored and eligible for cleanup
    retention: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter over `store` with default settings.
    pub fn new(store: Arc<dyn AttemptStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            rules: RateLimitRules::default(),
            retention: Duration::hours(i64::from(DEFAULT_RETENTION_HOURS)),
        }
    }

    pub fn with_rules(mut self, rules: RateLimitRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(3)
    }

    /// Get the limit configuration for an action.
    ///
    /// A per-call override wins over the configured rule, which wins over
    /// the default.
    pub fn limit_for(&self, action: &Action, overrides: Option<&LimitOverride>) -> LimitConfig {
        let config = self.rules.find_limit(action);
        match overrides {
            Some(overrides) => config.merge(overrides),
            None => config,
        }
    }

    /// Decide whether a new attempt for `key` should be allowed.
    #[instrument(
        skip(self, key, overrides),
        fields(identifier = %key.identifier, action = %key.action)
    )]
    pub async fn check_rate_limit(
        &self,
        key: &AttemptKey,
        overrides: Option<&LimitOverride>,
    ) -> RateLimitResult {
        let config = self.limit_for(&key.action, overrides);
        let now = self.now();
        let horizon = Horizon::new(now, &config, self.retention);

        let records = match self.store.attempts_since(key, horizon.earliest()).await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to read attempt log, failing open");
                return RateLimitResult::fail_open(&config, now);
            }
        };

        let evaluation = evaluate(&records, &config, &horizon);
        let result = RateLimitResult::from_evaluation(&evaluation, &config, now);

        if result.allowed {
            trace!(
                attempts = evaluation.attempt_count,
                remaining = result.remaining_attempts,
                "Attempt allowed"
            );
        } else {
            warn!(
                attempts = evaluation.attempt_count,
                failures = evaluation.recent_failures,
                locked = result.is_locked,
                "Rate limit exceeded"
            );
        }

        result
    }

    /// Append an attempt to the log. Failures are logged and dropped.
    #[instrument(
        skip(self, key, metadata),
        fields(identifier = %key.identifier, action = %key.action)
    )]
    pub async fn record_attempt(
        &self,
        key: &AttemptKey,
        success: bool,
        metadata: Option<Metadata>,
    ) {
        let record = AttemptRecord::new(key, success, metadata.unwrap_or_default(), self.now());

        match self.store.append(&record).await {
            Ok(()) => debug!(success, "Attempt recorded"),
            Err(e) => error!(error = %e, success, "Failed to record attempt"),
        }
    }

    /// Check the limit and record the attempt in one atomic store operation.
    ///
    /// The attempt is written only when admitted. `allowed` reports whether
    /// it was; the remaining fields describe the log after the decision.
    #[instrument(
        skip(self, key, metadata, overrides),
        fields(identifier = %key.identifier, action = %key.action)
    )]
    pub async fn check_and_record(
        &self,
        key: &AttemptKey,
        success: bool,
        metadata: Option<Metadata>,
        overrides: Option<&LimitOverride>,
    ) -> RateLimitResult {
        let config = self.limit_for(&key.action, overrides);
        let now = self.now();
        let horizon = Horizon::new(now, &config, self.retention);
        let guard = AdmissionGuard {
            window_start: horizon.window_start,
            lockout_start: horizon.lockout_start,
            max_attempts: config.max_attempts,
        };
        let record = AttemptRecord::new(key, success, metadata.unwrap_or_default(), now);

        let admitted = match self.store.append_if_admitted(&record, &guard).await {
            Ok(admitted) => admitted,
            Err(e) => {
                error!(error = %e, "Failed to check and record attempt, failing open");
                return RateLimitResult::fail_open(&config, now);
            }
        };

        let mut result = match self.store.attempts_since(key, horizon.earliest()).await {
            Ok(records) => {
                let evaluation = evaluate(&records, &config, &horizon);
                RateLimitResult::from_evaluation(&evaluation, &config, now)
            }
            Err(e) => {
                error!(error = %e, "Failed to read attempt log after admission");
                RateLimitResult::fail_open(&config, now)
            }
        };
        result.allowed = admitted;

        if admitted {
            debug!(
                success,
                remaining = result.remaining_attempts,
                "Attempt admitted and recorded"
            );
        } else {
            warn!(locked = result.is_locked, "Attempt rejected, rate limit exceeded");
        }

        result
    }

    /// Remove an identifier's attempts for one action, or for all of them.
    ///
    /// Returns the number of deleted records, or `None` if the store failed
    /// and the clear may not have happened.
    #[instrument(skip(self, identifier, action), fields(identifier = %identifier))]
    pub async fn clear_rate_limit(
        &self,
        identifier: &Identifier,
        action: Option<&Action>,
    ) -> Option<u64> {
        match self.store.delete(identifier, action).await {
            Ok(deleted) => {
                info!(
                    action = action.map(Action::as_str).unwrap_or("*"),
                    deleted,
                    "Rate limit cleared"
                );
                Some(deleted)
            }
            Err(e) => {
                error!(error = %e, "Failed to clear rate limit");
                None
            }
        }
    }

    /// Read-only view of a key's current standing.
    #[instrument(
        skip(self, key, overrides),
        fields(identifier = %key.identifier, action = %key.action)
    )]
    pub async fn get_rate_limit_status(
        &self,
        key: &AttemptKey,
        overrides: Option<&LimitOverride>,
    ) -> RateLimitStatus {
        let config = self.limit_for(&key.action, overrides);
        let now = self.now();
        let horizon = Horizon::new(now, &config, self.retention);

        let records = match self.store.attempts_since(key, horizon.earliest()).await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to read attempt log for status");
                return RateLimitStatus::empty();
            }
        };

        let last_attempt = match self.store.latest_attempt(key).await {
            Ok(latest) => latest,
            Err(e) => {
                error!(error = %e, "Failed to read latest attempt for status");
                records.first().map(|r| r.created_at)
            }
        };

        RateLimitStatus::new(&evaluate(&records, &config, &horizon), last_attempt, &config)
    }

    /// Delete every record older than the retention horizon.
    ///
    /// Returns the number of deleted records, or `None` if the store failed.
    #[instrument(skip(self))]
    pub async fn cleanup(&self) -> Option<u64> {
        let cutoff = saturating_sub(self.now(), self.retention);

        match self.store.delete_before(cutoff).await {
            Ok(deleted) => {
                info!(deleted, cutoff = %cutoff, "Expired attempts cleaned up");
                Some(deleted)
            }
            Err(e) => {
                error!(error = %e, "Failed to clean up expired attempts");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BulwarkError, Result};
    use crate::ratelimit::{LimitState, ManualClock};
    use crate::storage::{MemoryStore, SqliteStore};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn login() -> AttemptKey {
        AttemptKey::parse("user@example.com", "login").unwrap()
    }

    fn setup() -> (RateLimiter, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let limiter = RateLimiter::new(store.clone()).with_clock(clock.clone());
        (limiter, store, clock)
    }

    fn strict() -> LimitOverride {
        LimitConfig {
            max_attempts: 3,
            window_minutes: 15,
            lockout_minutes: 30,
        }
        .into()
    }

    /// A store whose every operation fails.
    struct FailingStore;

    #[async_trait]
    impl AttemptStore for FailingStore {
        async fn append(&self, _record: &AttemptRecord) -> Result<()> {
            Err(BulwarkError::Storage("unavailable".to_string()))
        }

        async fn append_if_admitted(
            &self,
            _record: &AttemptRecord,
            _guard: &AdmissionGuard,
        ) -> Result<bool> {
            Err(BulwarkError::Storage("unavailable".to_string()))
        }

        async fn attempts_since(
            &self,
            _key: &AttemptKey,
            _since: DateTime<Utc>,
        ) -> Result<Vec<AttemptRecord>> {
            Err(BulwarkError::Storage("unavailable".to_string()))
        }

        async fn latest_attempt(&self, _key: &AttemptKey) -> Result<Option<DateTime<Utc>>> {
            Err(BulwarkError::Storage("unavailable".to_string()))
        }

        async fn delete(&self, _identifier: &Identifier, _action: Option<&Action>) -> Result<u64> {
            Err(BulwarkError::Storage("unavailable".to_string()))
        }

        async fn delete_before(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
            Err(BulwarkError::Storage("unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_fresh_identifier_is_allowed() {
        let (limiter, _, _) = setup();

        let result = limiter.check_rate_limit(&login(), None).await;

        assert!(result.allowed);
        assert!(!result.is_locked);
        assert_eq!(result.remaining_attempts, 5);
        assert_eq!(result.reset_time, start() + Duration::minutes(15));
    }

    #[tokio::test]
    async fn test_failures_lock_then_expire() {
        let (limiter, _, clock) = setup();
        let key = login();
        let overrides = strict();

        for _ in 0..3 {
            limiter.record_attempt(&key, false, None).await;
            clock.advance(Duration::seconds(20));
        }

        let result = limiter.check_rate_limit(&key, Some(&overrides)).await;
        assert!(!result.allowed);
        assert!(result.is_locked);
        assert_eq!(result.remaining_attempts, 0);
        assert_eq!(result.state(), LimitState::Locked);

        // Last failure was 20s ago; move to 31 minutes past it.
        clock.advance(Duration::minutes(31) - Duration::seconds(20));

        let result = limiter.check_rate_limit(&key, Some(&overrides)).await;
        assert!(!result.is_locked);
        assert!(result.allowed);
        assert_eq!(result.remaining_attempts, 3);
    }

    #[tokio::test]
    async fn test_lock_reached_with_default_limits() {
        let (limiter, _, _) = setup();
        let key = login();

        for i in 0..5 {
            let result = limiter.check_rate_limit(&key, None).await;
            assert!(result.allowed, "attempt {} should be allowed", i + 1);
            limiter.record_attempt(&key, false, None).await;
        }

        let result = limiter.check_rate_limit(&key, None).await;
        assert!(result.is_locked);
        assert!(!result.allowed);
    }

    #[tokio::test]
    async fn test_successes_never_lock() {
        let (limiter, _, _) = setup();
        let key = login();

        limiter.record_attempt(&key, true, None).await;
        limiter.record_attempt(&key, true, None).await;

        let result = limiter.check_rate_limit(&key, None).await;
        assert!(result.allowed);
        assert!(!result.is_locked);
        assert_eq!(result.remaining_attempts, 3);
    }

    #[tokio::test]
    async fn test_throttled_until_window_rolls_over() {
        let (limiter, _, clock) = setup();
        let key = login();
        let overrides = strict();

        for _ in 0..3 {
            limiter.record_attempt(&key, true, None).await;
        }

        let result = limiter.check_rate_limit(&key, Some(&overrides)).await;
        assert_eq!(result.state(), LimitState::Throttled);
        assert_eq!(result.remaining_attempts, 0);

        clock.advance(Duration::minutes(15) + Duration::seconds(1));
        let result = limiter.check_rate_limit(&key, Some(&overrides)).await;
        assert_eq!(result.state(), LimitState::Open);
    }

    #[tokio::test]
    async fn test_attempt_just_outside_window_ignored() {
        let (limiter, store, _) = setup();
        let key = login();
        let old = AttemptRecord::new(
            &key,
            true,
            Metadata::new(),
            start() - Duration::minutes(15) - Duration::seconds(1),
        );
        store.append(&old).await.unwrap();

        let result = limiter.check_rate_limit(&key, None).await;
        assert_eq!(result.remaining_attempts, 5);
    }

    #[tokio::test]
    async fn test_remaining_never_negative() {
        let (limiter, _, _) = setup();
        let key = login();

        for _ in 0..8 {
            limiter.record_attempt(&key, true, None).await;
        }

        let result = limiter.check_rate_limit(&key, None).await;
        assert_eq!(result.remaining_attempts, 0);
        assert!(!result.allowed);
    }

    #[tokio::test]
    async fn test_actions_are_independent() {
        let (limiter, _, _) = setup();
        let key = login();
        let reset = AttemptKey::parse("user@example.com", "password_reset").unwrap();

        for _ in 0..5 {
            limiter.record_attempt(&key, false, None).await;
        }

        assert!(limiter.check_rate_limit(&key, None).await.is_locked);
        let result = limiter.check_rate_limit(&reset, None).await;
        assert!(result.allowed);
        assert_eq!(result.remaining_attempts, 5);
    }

    #[tokio::test]
    async fn test_clear_all_actions_resets_identifier() {
        let (limiter, _, _) = setup();
        let key = login();
        let reset = AttemptKey::parse("user@example.com", "password_reset").unwrap();

        for _ in 0..5 {
            limiter.record_attempt(&key, false, None).await;
            limiter.record_attempt(&reset, false, None).await;
        }

        let deleted = limiter.clear_rate_limit(&key.identifier, None).await;
        assert_eq!(deleted, Some(10));

        for k in [&key, &reset] {
            let result = limiter.check_rate_limit(k, None).await;
            assert!(result.allowed);
            assert!(!result.is_locked);
            assert_eq!(result.remaining_attempts, 5);
        }
    }

    #[tokio::test]
    async fn test_clear_single_action() {
        let (limiter, _, _) = setup();
        let key = login();
        let reset = AttemptKey::parse("user@example.com", "password_reset").unwrap();

        limiter.record_attempt(&key, false, None).await;
        limiter.record_attempt(&reset, false, None).await;

        let deleted = limiter.clear_rate_limit(&key.identifier, Some(&key.action)).await;
        assert_eq!(deleted, Some(1));
        assert_eq!(limiter.check_rate_limit(&reset, None).await.remaining_attempts, 4);
    }

    #[tokio::test]
    async fn test_status_reports_lock_expiry() {
        let (limiter, _, clock) = setup();
        let key = login();
        let overrides = strict();

        let mut metadata = Metadata::new();
        metadata.insert("ip_address".to_string(), "10.0.0.1".into());
        for _ in 0..3 {
            limiter.record_attempt(&key, false, Some(metadata.clone())).await;
            clock.advance(Duration::seconds(10));
        }
        let last_failure = start() + Duration::seconds(20);

        let status = limiter.get_rate_limit_status(&key, Some(&overrides)).await;
        assert_eq!(status.attempts, 3);
        assert_eq!(status.last_attempt, Some(last_failure));
        assert!(status.is_locked);
        assert_eq!(status.lock_expires_at, Some(last_failure + Duration::minutes(30)));
    }

    #[tokio::test]
    async fn test_status_for_unknown_key() {
        let (limiter, _, _) = setup();

        let status = limiter.get_rate_limit_status(&login(), None).await;
        assert_eq!(status, RateLimitStatus::empty());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_records() {
        let (limiter, store, _) = setup();
        let key = login();

        let ages = [
            Duration::hours(25),
            Duration::hours(24) + Duration::seconds(1),
            Duration::hours(1),
        ];
        for age in ages {
            let record = AttemptRecord::new(&key, false, Metadata::new(), start() - age);
            store.append(&record).await.unwrap();
        }

        assert_eq!(limiter.cleanup().await, Some(2));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_rules_apply_per_action() {
        let store = Arc::new(MemoryStore::new());
        let rules = RateLimitRules::new().with_action(
            "password_reset",
            LimitOverride {
                max_attempts: Some(1),
                ..Default::default()
            },
        );
        let limiter = RateLimiter::new(store).with_rules(rules);
        let reset = AttemptKey::parse("user@example.com", "password_reset").unwrap();

        limiter.record_attempt(&reset, true, None).await;

        assert!(!limiter.check_rate_limit(&reset, None).await.allowed);
        assert!(limiter.check_rate_limit(&login(), None).await.allowed);

        // A per-call override beats the rule.
        let overrides = LimitOverride {
            max_attempts: Some(2),
            ..Default::default()
        };
        assert!(limiter.check_rate_limit(&reset, Some(&overrides)).await.allowed);
    }

    #[tokio::test]
    async fn test_check_and_record_admits_up_to_limit() {
        let (limiter, store, _) = setup();
        let key = login();
        let overrides = strict();

        for expected_remaining in [2, 1, 0] {
            let result = limiter.check_and_record(&key, true, None, Some(&overrides)).await;
            assert!(result.allowed);
            assert_eq!(result.remaining_attempts, expected_remaining);
        }

        let result = limiter.check_and_record(&key, true, None, Some(&overrides)).await;
        assert!(!result.allowed);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_check_and_record_concurrent_callers() {
        let (limiter, store, _) = setup();
        let limiter = Arc::new(limiter);
        let overrides = strict();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter.check_and_record(&login(), true, None, Some(&overrides)).await.allowed
                })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 3);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_storage_failures_fail_open() {
        let limiter = RateLimiter::new(Arc::new(FailingStore));
        let key = login();

        let result = limiter.check_rate_limit(&key, None).await;
        assert!(result.allowed);
        assert!(!result.is_locked);
        assert_eq!(result.remaining_attempts, 5);

        let result = limiter.check_and_record(&key, false, None, None).await;
        assert!(result.allowed);

        // Writes and maintenance are absorbed.
        limiter.record_attempt(&key, false, None).await;
        assert_eq!(limiter.clear_rate_limit(&key.identifier, None).await, None);
        assert_eq!(limiter.cleanup().await, None);
        assert_eq!(limiter.get_rate_limit_status(&key, None).await, RateLimitStatus::empty());
    }

    #[tokio::test]
    async fn test_sqlite_backed_lockout_scenario() {
        let store = SqliteStore::connect("sqlite::memory:", 1).await.unwrap();
        store.migrate().await.unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let limiter = RateLimiter::new(Arc::new(store)).with_clock(clock.clone());
        let key = login();
        let overrides = strict();

        for _ in 0..3 {
            limiter.record_attempt(&key, false, None).await;
            clock.advance(Duration::seconds(15));
        }

        let result = limiter.check_rate_limit(&key, Some(&overrides)).await;
        assert!(result.is_locked);
        assert!(!result.allowed);

        clock.advance(Duration::minutes(31));
        let result = limiter.check_rate_limit(&key, Some(&overrides)).await;
        assert!(!result.is_locked);
        assert!(result.allowed);

        clock.advance(Duration::hours(24));
        assert_eq!(limiter.cleanup().await, Some(3));
    }

    async fn remaining_at_window_edge(store: Arc<dyn AttemptStore>) -> (u32, u32, RateLimitStatus) {
        let recorded_at = start() + Duration::nanoseconds(20_123_456_789);
        let clock = Arc::new(ManualClock::new(recorded_at));
        let limiter = RateLimiter::new(store).with_clock(clock.clone());
        let key = login();

        limiter.record_attempt(&key, true, None).await;
        let status = limiter.get_rate_limit_status(&key, None).await;

        clock.advance(Duration::minutes(15));
        let at_edge = limiter.check_rate_limit(&key, None).await.remaining_attempts;

        clock.advance(Duration::milliseconds(1));
        let past_edge = limiter.check_rate_limit(&key, None).await.remaining_attempts;

        (at_edge, past_edge, status)
    }

    #[tokio::test]
    async fn test_window_edge_matches_across_backends() {
        let sqlite = SqliteStore::connect("sqlite::memory:", 1).await.unwrap();
        sqlite.migrate().await.unwrap();

        let from_sqlite = remaining_at_window_edge(Arc::new(sqlite)).await;
        let from_memory = remaining_at_window_edge(Arc::new(MemoryStore::new())).await;

        assert_eq!(from_sqlite.0, 4);
        assert_eq!(from_sqlite.1, 5);
        assert_eq!(from_sqlite, from_memory);

        let recorded_at = start() + Duration::milliseconds(20_123);
        assert_eq!(from_sqlite.2.last_attempt, Some(recorded_at));
        assert_eq!(from_sqlite.2.attempts, 1);
    }

    #[tokio::test]
    async fn test_oversized_retention_never_panics() {
        let (limiter, store, _) = setup();
        let limiter = limiter.with_retention(Duration::hours(i64::from(u32::MAX)));
        let key = login();

        limiter.record_attempt(&key, false, None).await;

        let result = limiter.check_rate_limit(&key, None).await;
        assert!(result.allowed);
        assert_eq!(result.remaining_attempts, 4);
        assert_eq!(limiter.get_rate_limit_status(&key, None).await.attempts, 1);
        assert!(limiter.check_and_record(&key, false, None, None).await.allowed);
        assert_eq!(limiter.cleanup().await, Some(0));
        assert_eq!(store.len(), 2);
    }
}
