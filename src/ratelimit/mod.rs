//! Rate limiting logic.
//!
//! Limits are evaluated against an append-only attempt log; see
//! [`crate::storage`] for the log itself.

mod clock;
mod key;
mod limiter;
mod policy;
mod rules;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{Action, AttemptKey, Identifier};
pub use limiter::RateLimiter;
pub use policy::{
    evaluate, Evaluation, Horizon, LimitConfig, LimitOverride, LimitState, RateLimitResult,
    RateLimitStatus, DEFAULT_LOCKOUT_MINUTES, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETENTION_HOURS,
    DEFAULT_WINDOW_MINUTES, MAX_RETENTION_HOURS,
};
pub use rules::RateLimitRules;
