//! Per-user rate limiting for privileged access.
//!
//! Each user gets a token bucket keyed by their anonymized hash. The
//! registry lock is only held for the map lookup; the bucket decides
//! admission under its own lock, so a slow bucket never blocks unrelated
//! users. A background task reaps buckets that have been idle longer than
//! the configured expiry.
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::identity::anonymize;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

// Classic token bucket: refill on demand, capped at the burst ceiling.
struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                // Fresh buckets start full.
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    fn admit(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct RegistryEntry {
    bucket: Arc<TokenBucket>,
    last_seen: Instant,
}

/// Registry of per-user token buckets with background idle expiry.
pub struct RateLimiterRegistry {
    rate: f64,
    burst: f64,
    idle_expiry: Duration,
    entries: Mutex<HashMap<String, RegistryEntry>>,
    stop: CancellationToken,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RateLimiterRegistry {
    /// Create a registry and spawn its reaper task.
    ///
    /// Must be called from within a tokio runtime. The reaper wakes every
    /// `cleanup_interval` and drops entries not seen for `idle_expiry`.
    pub fn new(
        rate: f64,
        burst: u32,
        cleanup_interval: Duration,
        idle_expiry: Duration,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            rate,
            burst: f64::from(burst),
            idle_expiry,
            entries: Mutex::new(HashMap::new()),
            stop: CancellationToken::new(),
            reaper: Mutex::new(None),
        });
        let handle = tokio::spawn(reap_loop(registry.clone(), cleanup_interval));
        *registry.reaper.lock() = Some(handle);
        registry
    }

    /// Whether one more privileged request from this caller is admitted.
    ///
    /// Looks up or creates the caller's bucket under the registry lock,
    /// refreshes the last-seen timestamp, then consults the bucket after the
    /// registry lock is released.
    pub fn admit(&self, identifier: &str) -> bool {
        let user_hash = anonymize(identifier);
        let bucket = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(user_hash).or_insert_with(|| RegistryEntry {
                bucket: Arc::new(TokenBucket::new(self.rate, self.burst)),
                last_seen: Instant::now(),
            });
            entry.last_seen = Instant::now();
            entry.bucket.clone()
        };
        bucket.admit()
    }

    /// Number of tracked users. Exposed for observability and tests.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Stop the reaper and wait for it to exit. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let handle = self.reaper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn reap(&self) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.last_seen.elapsed() <= self.idle_expiry);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(removed, "reaped idle rate limiter entries");
        }
    }
}

async fn reap_loop(registry: Arc<RateLimiterRegistry>, cleanup_interval: Duration) {
    let mut ticker = tokio::time::interval(cleanup_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick of an interval completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = registry.stop.cancelled() => break,
            _ = ticker.tick() => registry.reap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_is_honored_and_then_exhausted() {
        let registry = RateLimiterRegistry::new(
            1.0,
            2,
            Duration::from_secs(300),
            Duration::from_secs(600),
        );
        assert!(registry.admit("bob@x"));
        assert!(registry.admit("bob@x"));
        assert!(!registry.admit("bob@x"));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn users_have_independent_buckets() {
        let registry = RateLimiterRegistry::new(
            1.0,
            1,
            Duration::from_secs(300),
            Duration::from_secs(600),
        );
        assert!(registry.admit("alice@example.com"));
        assert!(!registry.admit("alice@example.com"));
        assert!(registry.admit("bob@example.com"));
        assert_eq!(registry.entry_count(), 2);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn tokens_refill_over_time() {
        let registry = RateLimiterRegistry::new(
            100.0,
            1,
            Duration::from_secs(300),
            Duration::from_secs(600),
        );
        assert!(registry.admit("alice@example.com"));
        assert!(!registry.admit("alice@example.com"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.admit("alice@example.com"));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn idle_entries_are_reaped() {
        let registry = RateLimiterRegistry::new(
            10.0,
            20,
            Duration::from_millis(10),
            Duration::from_millis(20),
        );
        assert!(registry.admit("alice@example.com"));
        assert_eq!(registry.entry_count(), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.entry_count(), 0);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let registry = RateLimiterRegistry::new(
            10.0,
            20,
            Duration::from_secs(300),
            Duration::from_secs(600),
        );
        registry.shutdown().await;
        registry.shutdown().await;
        registry.shutdown().await;
    }
}
