//! Expiring key to limiter store.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::bucket::TokenBucket;
use super::quota::{DEFAULT_CLEANUP_INTERVAL, DEFAULT_EXPIRY};
use crate::error::{Result, TurnstileError};

/// A limiter together with the instant it stops being served.
struct StoreEntry {
    limiter: Arc<TokenBucket>,
    /// `None` when `now + ttl` does not fit in an `Instant`
    expires_at: Option<Instant>,
}

impl StoreEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Maps keys to their token buckets, creating them on first sight and
/// forgetting them once their TTL runs out.
///
/// The expiry instant is fixed when an entry is inserted; lookups do not
/// extend it. A key still active when its entry expires therefore starts
/// over with a full bucket.
pub struct LimiterStore {
    entries: Arc<DashMap<String, StoreEntry>>,
    default_ttl: Duration,
    sweeper: Option<JoinHandle<()>>,
}

impl LimiterStore {
    /// Create a store without a background sweeper.
    ///
    /// Expired entries are still never served; they are only removed by
    /// [`sweep`](Self::sweep) or when their key is looked up again. Without
    /// periodic sweeps memory grows with the number of distinct keys ever
    /// seen, so servers facing arbitrary clients should prefer
    /// [`with_default_cleanup`](Self::with_default_cleanup).
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            default_ttl: DEFAULT_EXPIRY,
            sweeper: None,
        }
    }

    /// Create a store that sweeps expired entries every
    /// [`DEFAULT_CLEANUP_INTERVAL`] (one hour).
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_default_cleanup() -> Result<Self> {
        Self::with_cleanup(DEFAULT_CLEANUP_INTERVAL)
    }

    /// Create a store that sweeps expired entries every `cleanup_interval`.
    ///
    /// Must be called from within a tokio runtime. The sweeper stops when the
    /// store is dropped.
    pub fn with_cleanup(cleanup_interval: Duration) -> Result<Self> {
        if cleanup_interval.is_zero() {
            return Err(TurnstileError::Config(
                "cleanup interval must be a positive duration".to_string(),
            ));
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| TurnstileError::Runtime(e.to_string()))?;

        let entries = Arc::new(DashMap::new());
        let sweeper = handle.spawn(run_sweeper(Arc::clone(&entries), cleanup_interval));

        info!(
            interval_secs = cleanup_interval.as_secs(),
            "Limiter store cleanup started"
        );

        Ok(Self {
            entries,
            default_ttl: DEFAULT_EXPIRY,
            sweeper: Some(sweeper),
        })
    }

    /// TTL applied when a factory hands back `Duration::ZERO`.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Return the live limiter for `key`, or insert the one built by
    /// `factory`.
    ///
    /// `factory` returns the new limiter and how long it should be kept; it
    /// runs at most once per miss, under the lock of the key's shard, so
    /// concurrent first requests for a key all receive the same limiter.
    pub fn get_or_create<F>(&self, key: &str, factory: F) -> Arc<TokenBucket>
    where
        F: FnOnce() -> (TokenBucket, Duration),
    {
        let now = Instant::now();

        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Arc::clone(&entry.limiter);
            }
        }

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now) {
                    // Another caller inserted it between the two lookups
                    return Arc::clone(&occupied.get().limiter);
                }
                trace!(key = %key, "Replacing expired limiter");
                let entry = self.new_entry(key, now, factory);
                let limiter = Arc::clone(&entry.limiter);
                occupied.insert(entry);
                limiter
            }
            Entry::Vacant(vacant) => {
                let entry = self.new_entry(key, now, factory);
                let limiter = Arc::clone(&entry.limiter);
                vacant.insert(entry);
                limiter
            }
        }
    }

    fn new_entry<F>(&self, key: &str, now: Instant, factory: F) -> StoreEntry
    where
        F: FnOnce() -> (TokenBucket, Duration),
    {
        let (limiter, ttl) = factory();
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };

        debug!(
            key = %key,
            num_requests = limiter.quota().num_requests(),
            per_ms = limiter.quota().per().as_millis() as u64,
            ttl_secs = ttl.as_secs(),
            "Creating new limiter"
        );

        StoreEntry {
            limiter: Arc::new(limiter),
            expires_at: now.checked_add(ttl),
        }
    }

    /// Get the live limiter for `key`, if any.
    pub fn get(&self, key: &str) -> Option<Arc<TokenBucket>> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| Arc::clone(&entry.limiter))
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn sweep(&self) -> usize {
        sweep_expired(&self.entries, Instant::now())
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for LimiterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LimiterStore {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

fn sweep_expired(entries: &DashMap<String, StoreEntry>, now: Instant) -> usize {
    let mut removed = 0;
    entries.retain(|_, entry| {
        let expired = entry.is_expired(now);
        if expired {
            removed += 1;
        }
        !expired
    });
    removed
}

async fn run_sweeper(entries: Arc<DashMap<String, StoreEntry>>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let removed = sweep_expired(&entries, Instant::now());
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Swept expired limiters");
        }
    }
}
