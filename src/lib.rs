//! Bulwark - Attempt-Log Rate Limiting Service
//!
//! This crate throttles sensitive actions (logins, password resets, ...) per
//! identifier. Every attempt is appended to a log; each check counts the
//! recent attempts in a sliding window and the recent failures in a lockout
//! window. The limiter degrades to "no limiting" rather than blocking users
//! when its storage is unavailable.

pub mod config;
pub mod error;
pub mod janitor;
pub mod ratelimit;
pub mod storage;
