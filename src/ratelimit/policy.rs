//! Limit configuration and attempt-log evaluation.
//!
//! Decisions are always recomputed from the attempt log; nothing in here
//! holds state between calls.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BulwarkError, Result};
use crate::storage::AttemptRecord;

/// Default number of attempts allowed within the window.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default sliding window length in minutes.
pub const DEFAULT_WINDOW_MINUTES: u32 = 15;
/// Default lockout length in minutes.
pub const DEFAULT_LOCKOUT_MINUTES: u32 = 30;
/// Records older than this never influence a decision.
pub const DEFAULT_RETENTION_HOURS: u32 = 24;
/// Upper bound accepted for the retention horizon (one year).
pub const MAX_RETENTION_HOURS: u32 = 8760;

/// Configuration for a rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Attempts allowed within the window
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Sliding window length in minutes
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u32,
    /// How long failures keep counting toward a lockout, in minutes
    #[serde(default = "default_lockout_minutes")]
    pub lockout_minutes: u32,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_window_minutes() -> u32 {
    DEFAULT_WINDOW_MINUTES
}

fn default_lockout_minutes() -> u32 {
    DEFAULT_LOCKOUT_MINUTES
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            window_minutes: DEFAULT_WINDOW_MINUTES,
            lockout_minutes: DEFAULT_LOCKOUT_MINUTES,
        }
    }
}

impl LimitConfig {
    pub fn window(&self) -> Duration {
        Duration::minutes(i64::from(self.window_minutes))
    }

    pub fn lockout(&self) -> Duration {
        Duration::minutes(i64::from(self.lockout_minutes))
    }

    /// Reject limits that would deny or lock everyone unconditionally.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(BulwarkError::InvalidInput(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.window_minutes == 0 {
            return Err(BulwarkError::InvalidInput(
                "window_minutes must be at least 1".to_string(),
            ));
        }
        if self.lockout_minutes == 0 {
            return Err(BulwarkError::InvalidInput(
                "lockout_minutes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Layer a partial override on top of this configuration.
    pub fn merge(&self, overrides: &LimitOverride) -> Self {
        Self {
            max_attempts: overrides.max_attempts.unwrap_or(self.max_attempts),
            window_minutes: overrides.window_minutes.unwrap_or(self.window_minutes),
            lockout_minutes: overrides.lockout_minutes.unwrap_or(self.lockout_minutes),
        }
    }
}

/// A partial limit configuration. Unset fields fall through to the next layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverride {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub window_minutes: Option<u32>,
    #[serde(default)]
    pub lockout_minutes: Option<u32>,
}

impl LimitOverride {
    pub fn is_empty(&self) -> bool {
        self.max_attempts.is_none()
            && self.window_minutes.is_none()
            && self.lockout_minutes.is_none()
    }
}

impl From<LimitConfig> for LimitOverride {
    fn from(config: LimitConfig) -> Self {
        Self {
            max_attempts: Some(config.max_attempts),
            window_minutes: Some(config.window_minutes),
            lockout_minutes: Some(config.lockout_minutes),
        }
    }
}

/// The time bounds used for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Horizon {
    pub now: DateTime<Utc>,
    /// Oldest attempt that counts toward the window budget
    pub window_start: DateTime<Utc>,
    /// Oldest failure that counts toward a lockout
    pub lockout_start: DateTime<Utc>,
}

impl Horizon {
    /// Both bounds are clamped so nothing past the retention horizon counts.
    pub fn new(now: DateTime<Utc>, config: &LimitConfig, retention: Duration) -> Self {
        let retention_start = saturating_sub(now, retention);
        Self {
            now,
            window_start: saturating_sub(now, config.window()).max(retention_start),
            lockout_start: saturating_sub(now, config.lockout()).max(retention_start),
        }
    }

    /// The earliest timestamp either rule looks at.
    pub fn earliest(&self) -> DateTime<Utc> {
        self.window_start.min(self.lockout_start)
    }
}

/// `at - by`, pinned to the earliest representable instant on overflow.
pub fn saturating_sub(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(by).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Counts derived from an attempt log for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// Attempts of any outcome inside the window
    pub attempt_count: u32,
    /// Failures inside the lockout window
    pub recent_failures: u32,
    /// Newest failure inside the lockout window
    pub latest_failure: Option<DateTime<Utc>>,
    pub is_locked: bool,
}

/// Evaluate a newest-first attempt log against a limit.
///
/// Successful attempts consume the window budget but never contribute to a
/// lockout.
pub fn evaluate(records: &[AttemptRecord], config: &LimitConfig, horizon: &Horizon) -> Evaluation {
    let attempt_count = records
        .iter()
        .filter(|r| r.created_at >= horizon.window_start)
        .count();

    let mut failures = records
        .iter()
        .filter(|r| !r.success && r.created_at >= horizon.lockout_start);
    let latest_failure = failures.next().map(|r| r.created_at);
    let recent_failures = latest_failure.map_or(0, |_| 1 + failures.count());

    let attempt_count = u32::try_from(attempt_count).unwrap_or(u32::MAX);
    let recent_failures = u32::try_from(recent_failures).unwrap_or(u32::MAX);

    Evaluation {
        attempt_count,
        recent_failures,
        latest_failure,
        is_locked: recent_failures >= config.max_attempts,
    }
}

/// Derived state of an identifier+action pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitState {
    /// Attempts are allowed
    Open,
    /// The window budget is spent; clears as the window rolls forward
    Throttled,
    /// The failure threshold was reached; clears as failures age out
    Locked,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining_attempts: u32,
    /// When the current window fully rolls over
    pub reset_time: DateTime<Utc>,
    pub is_locked: bool,
}

impl RateLimitResult {
    pub fn from_evaluation(
        evaluation: &Evaluation,
        config: &LimitConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            allowed: evaluation.attempt_count < config.max_attempts && !evaluation.is_locked,
            remaining_attempts: config.max_attempts.saturating_sub(evaluation.attempt_count),
            reset_time: now + config.window(),
            is_locked: evaluation.is_locked,
        }
    }

    /// The result handed out when the attempt log cannot be read.
    pub fn fail_open(config: &LimitConfig, now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining_attempts: config.max_attempts,
            reset_time: now + config.window(),
            is_locked: false,
        }
    }

    pub fn state(&self) -> LimitState {
        if self.is_locked {
            LimitState::Locked
        } else if !self.allowed {
            LimitState::Throttled
        } else {
            LimitState::Open
        }
    }
}

/// Read-only diagnostic view of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    /// Attempts inside the current window
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub is_locked: bool,
    /// Newest qualifying failure plus the lockout length, when locked
    pub lock_expires_at: Option<DateTime<Utc>>,
}

impl RateLimitStatus {
    pub fn new(
        evaluation: &Evaluation,
        last_attempt: Option<DateTime<Utc>>,
        config: &LimitConfig,
    ) -> Self {
        let lock_expires_at = if evaluation.is_locked {
            evaluation.latest_failure.map(|at| at + config.lockout())
        } else {
            None
        };

        Self {
            attempts: evaluation.attempt_count,
            last_attempt,
            is_locked: evaluation.is_locked,
            lock_expires_at,
        }
    }

    pub fn empty() -> Self {
        Self {
            attempts: 0,
            last_attempt: None,
            is_locked: false,
            lock_expires_at: None,
        }
    }
}
