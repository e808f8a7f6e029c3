use crate::config::RateLimitConfig;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

/// Sliding-window rate limiter with sub-window precision.
///
/// Each key maps to buckets of `precision_ms` width covering `window_ms`.
/// Buckets are keyed by wall-clock time so `reset_at` is meaningful to
/// clients as a unix timestamp.
pub struct RateLimiter {
    config: RateLimitConfig,
    keys: DashMap<String, Arc<KeyState>>,
}

struct KeyState {
    inner: Mutex<KeyWindow>,
    /// Last access in unix ms, for the GC sweep. Updated outside the lock.
    last_updated: AtomicU64,
}

struct KeyWindow {
    /// bucket id (unix_ms / precision) → weight credited in that bucket.
    buckets: HashMap<u64, u64>,
    total: u64,
}

/// Outcome of an `increment` or `check`.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds when the oldest counted bucket leaves the window.
    pub reset_at: u64,
    pub retry_after_secs: u64,
}

const GC_INTERVAL_SECS: u64 = 60;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            keys: DashMap::new(),
        }
    }

    /// Effective limit for a key: custom override or the default.
    pub fn limit(&self, key: &str) -> u64 {
        self.config
            .custom_limits
            .get(key)
            .copied()
            .unwrap_or(self.config.max_requests)
    }

    /// Charge `weight` against the key's window. Denied requests leave the
    /// counter unchanged.
    pub async fn increment(&self, key: &str, weight: u64) -> RateDecision {
        let state = self.state_for(key);
        state.last_updated.store(now_ms(), Ordering::Relaxed);

        let limit = self.limit(key);
        let now = now_ms();
        let precision = self.config.precision_ms.max(1);
        let window = self.config.window_ms;
        let horizon_bucket = now.saturating_sub(window) / precision;
        let current_bucket = now / precision;

        let mut w = state.inner.lock().await;

        // Prune buckets that fell out of the window.
        w.buckets.retain(|&id, _| id > horizon_bucket);
        w.total = w.buckets.values().sum();

        let reset_at = self.reset_at(&w, now);

        if w.total + weight > limit {
            let remaining = limit.saturating_sub(w.total);
            return RateDecision {
                allowed: false,
                limit,
                remaining,
                reset_at,
                retry_after_secs: reset_at.saturating_sub(now / 1000).max(1),
            };
        }

        *w.buckets.entry(current_bucket).or_insert(0) += weight;
        w.total += weight;

        RateDecision {
            allowed: true,
            limit,
            remaining: limit.saturating_sub(w.total),
            reset_at: self.reset_at(&w, now),
            retry_after_secs: 0,
        }
    }

    /// Non-mutating read of the key's current standing.
    pub async fn check(&self, key: &str) -> RateDecision {
        let limit = self.limit(key);
        let now = now_ms();
        let precision = self.config.precision_ms.max(1);
        let horizon_bucket = now.saturating_sub(self.config.window_ms) / precision;

        let Some(state) = self.keys.get(key).map(|e| e.value().clone()) else {
            return RateDecision {
                allowed: true,
                limit,
                remaining: limit,
                reset_at: (now + self.config.window_ms) / 1000,
                retry_after_secs: 0,
            };
        };

        let w = state.inner.lock().await;
        let total: u64 = w
            .buckets
            .iter()
            .filter(|(&id, _)| id > horizon_bucket)
            .map(|(_, &c)| c)
            .sum();

        RateDecision {
            allowed: total < limit,
            limit,
            remaining: limit.saturating_sub(total),
            reset_at: self.reset_at(&w, now),
            retry_after_secs: 0,
        }
    }

    /// Drop a key's window entirely.
    pub fn reset(&self, key: &str) {
        self.keys.remove(key);
    }

    pub fn window_secs(&self) -> u64 {
        self.config.window_ms / 1000
    }

    fn reset_at(&self, w: &KeyWindow, now: u64) -> u64 {
        let precision = self.config.precision_ms.max(1);
        match w.buckets.keys().min() {
            Some(&oldest) => (oldest * precision + self.config.window_ms) / 1000,
            None => (now + self.config.window_ms) / 1000,
        }
    }

    fn state_for(&self, key: &str) -> Arc<KeyState> {
        if let Some(entry) = self.keys.get(key) {
            return entry.value().clone();
        }
        self.keys
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(KeyState {
                    inner: Mutex::new(KeyWindow {
                        buckets: HashMap::new(),
                        total: 0,
                    }),
                    last_updated: AtomicU64::new(now_ms()),
                })
            })
            .clone()
    }

    /// Spawn the background sweep that drops keys idle for two windows.
    pub fn start_gc(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                interval.tick().await;
                limiter.evict_stale();
            }
        });
    }

    fn evict_stale(&self) {
        let cutoff = now_ms().saturating_sub(2 * self.config.window_ms);
        self.keys
            .retain(|_, v| v.last_updated.load(Ordering::Relaxed) >= cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u64, window_ms: u64, precision_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            window_ms,
            max_requests: max,
            precision_ms,
            custom_limits: HashMap::new(),
        })
    }

    #[tokio::test]
    async fn test_allows_until_limit() {
        let rl = limiter(3, 60_000, 1_000);
        for i in 0..3 {
            let d = rl.increment("k", 1).await;
            assert!(d.allowed, "request {} should pass", i);
        }
        let d = rl.increment("k", 1).await;
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert!(d.retry_after_secs >= 1);
    }

    #[tokio::test]
    async fn test_denied_request_leaves_counter_unchanged() {
        let rl = limiter(2, 60_000, 1_000);
        rl.increment("k", 1).await;
        rl.increment("k", 1).await;
        let denied = rl.increment("k", 1).await;
        assert!(!denied.allowed);

        // The denial charged nothing; standing is still 2/2.
        let check = rl.check("k").await;
        assert_eq!(check.remaining, 0);
        assert_eq!(check.limit, 2);
    }

    #[tokio::test]
    async fn test_weight_larger_than_remaining_denied() {
        let rl = limiter(5, 60_000, 1_000);
        rl.increment("k", 4).await;
        let d = rl.increment("k", 3).await;
        assert!(!d.allowed);
        assert_eq!(d.remaining, 1);
        // Counter unchanged; a weight-1 request still fits.
        let d = rl.increment("k", 1).await;
        assert!(d.allowed);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let rl = limiter(2, 100, 20);
        assert!(rl.increment("k", 1).await.allowed);
        assert!(rl.increment("k", 1).await.allowed);
        assert!(!rl.increment("k", 1).await.allowed);
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        assert!(rl.increment("k", 1).await.allowed);
    }

    #[tokio::test]
    async fn test_custom_limit_overrides_default() {
        let mut custom = HashMap::new();
        custom.insert("vip".to_string(), 10u64);
        let rl = RateLimiter::new(RateLimitConfig {
            window_ms: 60_000,
            max_requests: 2,
            precision_ms: 1_000,
            custom_limits: custom,
        });
        assert_eq!(rl.limit("vip"), 10);
        assert_eq!(rl.limit("anon"), 2);
        for _ in 0..10 {
            assert!(rl.increment("vip", 1).await.allowed);
        }
        assert!(!rl.increment("vip", 1).await.allowed);
    }

    #[tokio::test]
    async fn test_check_is_non_mutating() {
        let rl = limiter(2, 60_000, 1_000);
        for _ in 0..10 {
            let d = rl.check("k").await;
            assert!(d.allowed);
            assert_eq!(d.remaining, 2);
        }
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let rl = limiter(1, 60_000, 1_000);
        assert!(rl.increment("a", 1).await.allowed);
        assert!(rl.increment("b", 1).await.allowed);
        assert!(!rl.increment("a", 1).await.allowed);
    }

    #[tokio::test]
    async fn test_gc_drops_idle_keys() {
        let rl = limiter(5, 50, 10);
        rl.increment("k", 1).await;
        assert!(rl.keys.contains_key("k"));
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        rl.evict_stale();
        assert!(!rl.keys.contains_key("k"));
    }

    #[tokio::test]
    async fn test_reset() {
        let rl = limiter(1, 60_000, 1_000);
        rl.increment("k", 1).await;
        assert!(!rl.increment("k", 1).await.allowed);
        rl.reset("k");
        assert!(rl.increment("k", 1).await.allowed);
    }
}
