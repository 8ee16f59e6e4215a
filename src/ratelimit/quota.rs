//! Validated request quotas.

use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// Minimum time a limiter is retained after it is created.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(30 * 60);
/// How often expired limiters are swept from a store.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Allow up to `num_requests` every `per`, refilled continuously.
///
/// A quota can only be built through [`Quota::new`] (or one of its
/// shorthands), so every value in circulation has a positive request count
/// and a positive period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    num_requests: u32,
    per: Duration,
}

impl Quota {
    /// Create a quota, rejecting a zero request count or a zero period.
    pub fn new(num_requests: u32, per: Duration) -> Result<Self> {
        if num_requests == 0 {
            return Err(TurnstileError::Config(
                "num_requests must be greater than zero".to_string(),
            ));
        }
        if per.is_zero() {
            return Err(TurnstileError::Config(
                "per must be a positive duration".to_string(),
            ));
        }
        Ok(Self { num_requests, per })
    }

    pub fn per_second(num_requests: u32) -> Result<Self> {
        Self::new(num_requests, Duration::from_secs(1))
    }

    pub fn per_minute(num_requests: u32) -> Result<Self> {
        Self::new(num_requests, Duration::from_secs(60))
    }

    pub fn per_hour(num_requests: u32) -> Result<Self> {
        Self::new(num_requests, Duration::from_secs(3600))
    }

    /// Bucket capacity, i.e. the largest burst admitted at once.
    pub fn num_requests(&self) -> u32 {
        self.num_requests
    }

    /// Interval over which a full bucket is replenished.
    pub fn per(&self) -> Duration {
        self.per
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.num_requests) / self.per.as_secs_f64()
    }

    /// How long a limiter for this quota should stay in a store.
    ///
    /// Twice the period, but never less than [`DEFAULT_EXPIRY`]: evicting a
    /// throttled key early would hand it a full bucket.
    pub fn expiry(&self) -> Duration {
        self.per.saturating_mul(2).max(DEFAULT_EXPIRY)
    }
}
