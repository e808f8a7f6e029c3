use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Per-upstream availability bookkeeping.
///
/// A quota-class error marks the upstream exhausted until `cooldown_secs`
/// elapses. `cooldown_secs == 0` means the upstream never cools down —
/// local inference has no provider-side quota to respect.
#[derive(Debug)]
pub struct QuotaState {
    cooldown: Duration,
    window: Duration,
    inner: Mutex<QuotaInner>,
}

#[derive(Debug)]
struct QuotaInner {
    available: bool,
    cooldown_until: Option<Instant>,
    last_error: Option<String>,
    request_count: u64,
    last_reset: Instant,
}

/// Serializable view for `/api/quota`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QuotaSnapshot {
    pub available: bool,
    /// Seconds until the cooldown lifts; `null` when not cooling down.
    pub cooldown_remaining_secs: Option<u64>,
    pub last_error: Option<String>,
    pub request_count: u64,
    pub last_reset_unix: u64,
}

impl QuotaState {
    pub fn new(cooldown_secs: u64, window_secs: u64) -> Self {
        Self {
            cooldown: Duration::from_secs(cooldown_secs),
            window: Duration::from_secs(window_secs.max(1)),
            inner: Mutex::new(QuotaInner {
                available: true,
                cooldown_until: None,
                last_error: None,
                request_count: 0,
                last_reset: Instant::now(),
            }),
        }
    }

    /// Current availability. Lifting an expired cooldown happens here, so the
    /// invariant `available == (cooldown_until == nil || now >= cooldown_until)`
    /// holds for every observer.
    pub fn is_available(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some(until) = inner.cooldown_until {
            if Instant::now() >= until {
                inner.cooldown_until = None;
                inner.available = true;
            }
        }
        inner.available
    }

    /// Count a dispatch toward the quota window; the counter resets when the
    /// window rolls over.
    pub fn record_dispatch(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        if now.duration_since(inner.last_reset) >= self.window {
            inner.request_count = 0;
            inner.last_reset = now;
        }
        inner.request_count += 1;
    }

    /// Mark the upstream quota-exhausted and start the cooldown clock.
    /// With a zero cooldown only the error string is recorded.
    pub fn mark_exhausted(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_error = Some(error.to_string());
        if self.cooldown.is_zero() {
            return;
        }
        inner.available = false;
        inner.cooldown_until = Some(Instant::now() + self.cooldown);
    }

    pub fn record_error(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_error = Some(error.to_string());
    }

    /// Admin reset: clear cooldown, error, and the window counter.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.available = true;
        inner.cooldown_until = None;
        inner.last_error = None;
        inner.request_count = 0;
        inner.last_reset = Instant::now();
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        if let Some(until) = inner.cooldown_until {
            if now >= until {
                inner.cooldown_until = None;
                inner.available = true;
            }
        }
        let elapsed_in_window = now.duration_since(inner.last_reset);
        let last_reset_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .saturating_sub(elapsed_in_window.as_secs());
        QuotaSnapshot {
            available: inner.available,
            cooldown_remaining_secs: inner
                .cooldown_until
                .map(|until| until.saturating_duration_since(now).as_secs()),
            last_error: inner.last_error.clone(),
            request_count: inner.request_count,
            last_reset_unix,
        }
    }
}
