//! Token bucket limiter.

use parking_lot::Mutex;
use tokio::time::Instant;

use super::quota::Quota;

/// A token bucket holding up to `num_requests` tokens, refilled at
/// `num_requests / per`.
///
/// Tokens are counted in fixed point: one token is `per` worth of
/// nanoseconds, and every elapsed nanosecond adds `num_requests` units. Refill
/// is exact integer arithmetic, so retrying while waiting never loses time to
/// rounding.
///
/// This struct is thread-safe; refill and consumption for one bucket are
/// serialized by an internal mutex, so racing callers never spend the same
/// token twice.
pub struct TokenBucket {
    quota: Quota,
    /// Units in one token
    token_units: u128,
    /// Units in a full bucket
    capacity_units: u128,
    /// Units added per elapsed nanosecond
    units_per_nano: u128,
    state: Mutex<BucketState>,
}

struct BucketState {
    /// Always within `[0, capacity_units]`
    units: u128,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant, units_per_nano: u128, capacity_units: u128) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_nanos();
        self.units = self
            .units
            .saturating_add(elapsed.saturating_mul(units_per_nano))
            .min(capacity_units);
        self.last_refill = now;
    }
}

impl TokenBucket {
    /// Create a full bucket for the given quota.
    pub fn new(quota: Quota) -> Self {
        let token_units = quota.per().as_nanos();
        let units_per_nano = u128::from(quota.num_requests());
        let capacity_units = token_units.saturating_mul(units_per_nano);
        Self {
            quota,
            token_units,
            capacity_units,
            units_per_nano,
            state: Mutex::new(BucketState {
                units: capacity_units,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    ///
    /// Returns `true` if the request may proceed. A denied request leaves the
    /// token count untouched.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        state.refill(Instant::now(), self.units_per_nano, self.capacity_units);

        if state.units >= self.token_units {
            state.units -= self.token_units;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, without consuming any.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        state.refill(Instant::now(), self.units_per_nano, self.capacity_units);
        self.to_tokens(state.units)
    }

    pub fn quota(&self) -> Quota {
        self.quota
    }

    fn to_tokens(&self, units: u128) -> f64 {
        units as f64 / self.token_units as f64
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("quota", &self.quota)
            .field("tokens", &self.to_tokens(self.state.lock().units))
            .finish()
    }
}
