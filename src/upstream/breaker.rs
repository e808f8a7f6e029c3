use crate::config::BreakerConfig;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Result of checking the breaker before a request.
pub enum BreakerCheck {
    /// Closed — proceed normally.
    Allowed,
    /// Half-open — this request is the probe.
    Probe,
    /// Open — reject immediately.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerEvent {
    pub provider: String,
    pub from: BreakerState,
    pub to: BreakerState,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejects: u64,
    pub state_changes: u64,
}

/// Per-upstream circuit breaker driven by the rolling failure ratio.
///
/// Closed → Open once the failure ratio over the rolling window reaches
/// `error_threshold_pct` with at least `volume_threshold` observations;
/// Open → HalfOpen after `reset_timeout_secs`; the half-open probe's outcome
/// decides between Closed and Open.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    config: BreakerConfig,
    /// 0 = Closed, 1 = Open, 2 = HalfOpen.
    state: AtomicU8,
    opened_at: Mutex<Option<Instant>>,
    window: Mutex<RollingWindow>,
    rejects: AtomicU64,
    timeouts: AtomicU64,
    state_changes: AtomicU64,
    events: broadcast::Sender<BreakerEvent>,
}

/// Per-second buckets of (successes, failures) spanning the rolling window.
#[derive(Debug)]
struct RollingWindow {
    buckets: Vec<Bucket>,
    width: Duration,
    start: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    epoch_sec: u64,
    successes: u64,
    failures: u64,
}

impl RollingWindow {
    fn new(window_secs: u64) -> Self {
        let len = window_secs.max(1) as usize;
        Self {
            buckets: vec![Bucket::default(); len],
            width: Duration::from_secs(window_secs.max(1)),
            start: Instant::now(),
        }
    }

    fn current_sec(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    fn bucket_mut(&mut self) -> &mut Bucket {
        let sec = self.current_sec();
        let idx = (sec % self.buckets.len() as u64) as usize;
        let b = &mut self.buckets[idx];
        if b.epoch_sec != sec {
            *b = Bucket {
                epoch_sec: sec,
                ..Bucket::default()
            };
        }
        b
    }

    fn totals(&self) -> (u64, u64) {
        let now_sec = self.current_sec();
        let horizon = now_sec.saturating_sub(self.width.as_secs().saturating_sub(1));
        let mut successes = 0;
        let mut failures = 0;
        for b in &self.buckets {
            if b.epoch_sec >= horizon && (b.successes > 0 || b.failures > 0) {
                successes += b.successes;
                failures += b.failures;
            }
        }
        (successes, failures)
    }

    fn clear(&mut self) {
        for b in &mut self.buckets {
            *b = Bucket::default();
        }
    }
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: BreakerConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            provider: provider.into(),
            window: Mutex::new(RollingWindow::new(config.rolling_window_secs)),
            config,
            state: AtomicU8::new(STATE_CLOSED),
            opened_at: Mutex::new(None),
            rejects: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            state_changes: AtomicU64::new(0),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    /// Check whether a request may pass. Open breakers transition to
    /// half-open after the reset timeout; the CAS ensures a single winner
    /// takes the probe slot.
    pub fn check(&self) -> BreakerCheck {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => BreakerCheck::Allowed,
            STATE_OPEN => {
                let opened_at = self.opened_at.lock().unwrap();
                if let Some(at) = *opened_at {
                    if at.elapsed() >= Duration::from_secs(self.config.reset_timeout_secs) {
                        drop(opened_at);
                        if self
                            .state
                            .compare_exchange(
                                STATE_OPEN,
                                STATE_HALF_OPEN,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            self.note_transition(BreakerState::Open, BreakerState::HalfOpen);
                            return BreakerCheck::Probe;
                        }
                    }
                }
                self.rejects.fetch_add(1, Ordering::Relaxed);
                BreakerCheck::Rejected
            }
            STATE_HALF_OPEN => BreakerCheck::Probe,
            _ => BreakerCheck::Allowed,
        }
    }

    /// True when requests would currently be rejected (candidate filtering).
    pub fn is_open(&self) -> bool {
        if self.state.load(Ordering::Acquire) != STATE_OPEN {
            return false;
        }
        let opened_at = self.opened_at.lock().unwrap();
        match *opened_at {
            Some(at) => at.elapsed() < Duration::from_secs(self.config.reset_timeout_secs),
            None => false,
        }
    }

    pub fn record_success(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                // Probe succeeded — close and start from a clean window.
                self.state.store(STATE_CLOSED, Ordering::Release);
                self.window.lock().unwrap().clear();
                self.note_transition(BreakerState::HalfOpen, BreakerState::Closed);
                tracing::info!("breaker: closed, provider={}", self.provider);
            }
            _ => {
                self.window.lock().unwrap().bucket_mut().successes += 1;
            }
        }
    }

    pub fn record_failure(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                self.trip(BreakerState::HalfOpen);
                tracing::warn!("breaker: re-opened, provider={}", self.provider);
            }
            STATE_CLOSED => {
                let (successes, failures) = {
                    let mut window = self.window.lock().unwrap();
                    window.bucket_mut().failures += 1;
                    window.totals()
                };
                let volume = successes + failures;
                if volume >= self.config.volume_threshold as u64 {
                    let ratio_pct = (failures as f64 / volume as f64) * 100.0;
                    if ratio_pct >= self.config.error_threshold_pct as f64 {
                        self.trip(BreakerState::Closed);
                        tracing::warn!(
                            "breaker: opened, provider={}, failure_ratio={:.0}%, volume={}",
                            self.provider,
                            ratio_pct,
                            volume
                        );
                    }
                }
            }
            _ => {}
        }
    }

    /// Timeouts count as failures but are tracked separately.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.record_failure();
    }

    pub fn stats(&self) -> BreakerStats {
        let (successes, failures) = self.window.lock().unwrap().totals();
        BreakerStats {
            state: self.current_state(),
            successes,
            failures,
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rejects: self.rejects.load(Ordering::Relaxed),
            state_changes: self.state_changes.load(Ordering::Relaxed),
        }
    }

    pub fn current_state(&self) -> BreakerState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    fn trip(&self, from: BreakerState) {
        self.state.store(STATE_OPEN, Ordering::Release);
        *self.opened_at.lock().unwrap() = Some(Instant::now());
        self.note_transition(from, BreakerState::Open);
    }

    fn note_transition(&self, from: BreakerState, to: BreakerState) {
        self.state_changes.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(BreakerEvent {
            provider: self.provider.clone(),
            from,
            to,
        });
    }
}
