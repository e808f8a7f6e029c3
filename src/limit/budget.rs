use crate::config::{BudgetConfig, BudgetPeriod};
use crate::error::GatewayError;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

const HISTORY_CAP: usize = 1000;
const HISTORY_TRIM_TO: usize = 500;

/// One recorded usage, appended to the per-key history ring.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UsageRecord {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
    pub model: String,
    pub provider: String,
    pub at_unix: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetEventKind {
    Warning,
    Exceeded,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BudgetEvent {
    pub kind: BudgetEventKind,
    pub api_key: String,
    pub tokens_used: u64,
    pub token_limit: u64,
    pub cost_used: f64,
    pub cost_limit: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BudgetSnapshot {
    pub tokens_used: u64,
    pub token_limit: u64,
    pub cost_used: f64,
    pub cost_limit: f64,
    pub request_count: u64,
    pub period_start_unix: u64,
    pub next_reset_unix: u64,
}

struct QuotaEntry {
    tokens_used: u64,
    cost_used: f64,
    request_count: u64,
    period_start_unix: u64,
    history: VecDeque<UsageRecord>,
}

/// Per-key token and cost budgets with period resets and warning/exceeded
/// events. Event sends never block; slow subscribers drop.
pub struct BudgetManager {
    config: BudgetConfig,
    keys: DashMap<String, Arc<Mutex<QuotaEntry>>>,
    events: broadcast::Sender<BudgetEvent>,
}

pub struct Usage<'a> {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub model: &'a str,
    pub provider: &'a str,
}

impl BudgetManager {
    pub fn new(config: BudgetConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            keys: DashMap::new(),
            events,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BudgetEvent> {
        self.events.subscribe()
    }

    /// Dollars for `tokens` under the model's price table entry.
    fn cost_of(&self, model: &str, tokens: u64) -> f64 {
        let per_1k = self
            .config
            .prices
            .get(model)
            .copied()
            .unwrap_or(self.config.default_price);
        (tokens as f64 / 1000.0) * per_1k
    }

    /// Record a usage against the key's period counters. The request that
    /// would breach a limit is denied and not charged.
    pub fn record_usage(&self, api_key: &str, usage: Usage<'_>) -> Result<(), GatewayError> {
        let now = now_unix();
        let entry = self.entry_for(api_key, now);
        let mut e = entry.lock().unwrap();

        // Roll the period over lazily if the boundary passed.
        let current_start = period_start_unix(now, &self.config.period);
        if e.period_start_unix < current_start {
            e.tokens_used = 0;
            e.cost_used = 0.0;
            e.request_count = 0;
            e.period_start_unix = current_start;
        }

        let tokens = usage.prompt_tokens + usage.completion_tokens;
        let cost = self.cost_of(usage.model, tokens);

        let new_tokens = e.tokens_used + tokens;
        let new_cost = e.cost_used + cost;

        if new_tokens > self.config.token_limit || new_cost > self.config.cost_limit {
            let _ = self.events.send(BudgetEvent {
                kind: BudgetEventKind::Exceeded,
                api_key: api_key.to_string(),
                tokens_used: e.tokens_used,
                token_limit: self.config.token_limit,
                cost_used: e.cost_used,
                cost_limit: self.config.cost_limit,
            });
            return Err(GatewayError::BudgetExceeded(format!(
                "tokens {}/{} cost {:.4}/{:.2}",
                e.tokens_used, self.config.token_limit, e.cost_used, self.config.cost_limit
            )));
        }

        e.tokens_used = new_tokens;
        e.cost_used = new_cost;
        e.request_count += 1;

        e.history.push_back(UsageRecord {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cost,
            model: usage.model.to_string(),
            provider: usage.provider.to_string(),
            at_unix: now,
        });
        if e.history.len() > HISTORY_CAP {
            let drop = e.history.len() - HISTORY_TRIM_TO;
            e.history.drain(..drop);
        }

        let token_ratio = new_tokens as f64 / self.config.token_limit as f64;
        let cost_ratio = new_cost / self.config.cost_limit;
        if token_ratio >= self.config.warn_ratio || cost_ratio >= self.config.warn_ratio {
            let _ = self.events.send(BudgetEvent {
                kind: BudgetEventKind::Warning,
                api_key: api_key.to_string(),
                tokens_used: new_tokens,
                token_limit: self.config.token_limit,
                cost_used: new_cost,
                cost_limit: self.config.cost_limit,
            });
        }

        Ok(())
    }

    /// Pre-execution gate: true once either counter has reached its limit.
    /// The breaching request itself is denied inside `record_usage`.
    pub fn is_exhausted(&self, api_key: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        let snap = self.snapshot(api_key);
        snap.tokens_used >= snap.token_limit || snap.cost_used >= snap.cost_limit
    }

    pub fn snapshot(&self, api_key: &str) -> BudgetSnapshot {
        let now = now_unix();
        let entry = self.entry_for(api_key, now);
        let e = entry.lock().unwrap();
        BudgetSnapshot {
            tokens_used: e.tokens_used,
            token_limit: self.config.token_limit,
            cost_used: e.cost_used,
            cost_limit: self.config.cost_limit,
            request_count: e.request_count,
            period_start_unix: e.period_start_unix,
            next_reset_unix: next_reset_unix(now, &self.config.period),
        }
    }

    /// Reset every key's counters. Driven by the period timer and the admin
    /// surface.
    pub fn reset_all(&self) {
        let now = now_unix();
        let start = period_start_unix(now, &self.config.period);
        for entry in self.keys.iter() {
            let mut e = entry.value().lock().unwrap();
            e.tokens_used = 0;
            e.cost_used = 0.0;
            e.request_count = 0;
            e.period_start_unix = start;
        }
        tracing::info!("budget: all keys reset, period_start={}", start);
    }

    /// Unix time of the next period boundary, for the reset timer.
    pub fn next_reset_unix(&self) -> u64 {
        next_reset_unix(now_unix(), &self.config.period)
    }

    fn entry_for(&self, api_key: &str, now: u64) -> Arc<Mutex<QuotaEntry>> {
        if let Some(e) = self.keys.get(api_key) {
            return e.value().clone();
        }
        self.keys
            .entry(api_key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(QuotaEntry {
                    tokens_used: 0,
                    cost_used: 0.0,
                    request_count: 0,
                    period_start_unix: period_start_unix(now, &self.config.period),
                    history: VecDeque::new(),
                }))
            })
            .clone()
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

const SECS_PER_DAY: u64 = 86_400;

/// Start of the period containing `now` (unix seconds, UTC).
pub fn period_start_unix(now: u64, period: &BudgetPeriod) -> u64 {
    let days = now / SECS_PER_DAY;
    match period {
        BudgetPeriod::Daily => days * SECS_PER_DAY,
        BudgetPeriod::Weekly => {
            // Unix day 0 was a Thursday; ISO weeks start Monday.
            let weekday = (days + 3) % 7;
            (days - weekday) * SECS_PER_DAY
        }
        BudgetPeriod::Monthly => {
            let (y, m, _) = civil_from_days(days as i64);
            days_from_civil(y, m, 1) as u64 * SECS_PER_DAY
        }
    }
}

/// First instant of the next period (unix seconds, UTC).
pub fn next_reset_unix(now: u64, period: &BudgetPeriod) -> u64 {
    let days = now / SECS_PER_DAY;
    match period {
        BudgetPeriod::Daily => (days + 1) * SECS_PER_DAY,
        BudgetPeriod::Weekly => {
            let weekday = (days + 3) % 7;
            (days - weekday + 7) * SECS_PER_DAY
        }
        BudgetPeriod::Monthly => {
            let (y, m, _) = civil_from_days(days as i64);
            let (ny, nm) = if m == 12 { (y + 1, 1) } else { (y, m + 1) };
            days_from_civil(ny, nm, 1) as u64 * SECS_PER_DAY
        }
    }
}

/// Days-since-epoch → (year, month, day), proleptic Gregorian.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// (year, month, day) → days-since-epoch, proleptic Gregorian.
fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = if m > 2 { m - 3 } else { m + 9 } as i64;
    let doy = (153 * mp + 2) / 5 + d as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(token_limit: u64, cost_limit: f64) -> BudgetConfig {
        BudgetConfig {
            enabled: true,
            period: BudgetPeriod::Daily,
            token_limit,
            cost_limit,
            warn_ratio: 0.8,
            prices: [("pricey".to_string(), 1.0)].into_iter().collect(),
            default_price: 0.002,
        }
    }

    fn usage(prompt: u64, completion: u64) -> Usage<'static> {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            model: "plain",
            provider: "p",
        }
    }

    #[test]
    fn test_accepted_usage_advances_totals() {
        let mgr = BudgetManager::new(config(1000, 100.0));
        mgr.record_usage("k", usage(100, 200)).unwrap();
        mgr.record_usage("k", usage(50, 50)).unwrap();
        let snap = mgr.snapshot("k");
        assert_eq!(snap.tokens_used, 400);
        assert_eq!(snap.request_count, 2);
    }

    #[test]
    fn test_breach_denied_and_not_charged() {
        let mgr = BudgetManager::new(config(100, 100.0));
        let mut rx = mgr.subscribe();
        mgr.record_usage("k", usage(40, 40)).unwrap();
        let err = mgr.record_usage("k", usage(40, 40)).unwrap_err();
        assert!(matches!(err, GatewayError::BudgetExceeded(_)));
        // Not charged: still 80.
        assert_eq!(mgr.snapshot("k").tokens_used, 80);
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.kind, BudgetEventKind::Exceeded);
    }

    #[test]
    fn test_cost_limit_breach() {
        // "pricey" costs $1 per 1k tokens; limit $0.05.
        let mgr = BudgetManager::new(config(1_000_000, 0.05));
        let u = Usage {
            prompt_tokens: 60,
            completion_tokens: 0,
            model: "pricey",
            provider: "p",
        };
        let err = mgr.record_usage("k", u).unwrap_err();
        assert!(matches!(err, GatewayError::BudgetExceeded(_)));
    }

    #[test]
    fn test_warning_at_ratio() {
        let mgr = BudgetManager::new(config(100, 100.0));
        let mut rx = mgr.subscribe();
        mgr.record_usage("k", usage(40, 40)).unwrap();
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.kind, BudgetEventKind::Warning);
        assert_eq!(ev.tokens_used, 80);
    }

    #[test]
    fn test_no_warning_below_ratio() {
        let mgr = BudgetManager::new(config(100, 100.0));
        let mut rx = mgr.subscribe();
        mgr.record_usage("k", usage(10, 10)).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reset_all() {
        let mgr = BudgetManager::new(config(100, 100.0));
        mgr.record_usage("k", usage(10, 10)).unwrap();
        mgr.reset_all();
        assert_eq!(mgr.snapshot("k").tokens_used, 0);
    }

    #[test]
    fn test_history_trims_on_overflow() {
        let mgr = BudgetManager::new(config(u64::MAX, f64::MAX));
        for _ in 0..(HISTORY_CAP + 1) {
            mgr.record_usage("k", usage(1, 0)).unwrap();
        }
        let entry = mgr.entry_for("k", now_unix());
        let len = entry.lock().unwrap().history.len();
        assert_eq!(len, HISTORY_TRIM_TO);
    }

    #[test]
    fn test_civil_roundtrip() {
        // 2024-02-29 is day 19_782.
        assert_eq!(civil_from_days(19_782), (2024, 2, 29));
        assert_eq!(days_from_civil(2024, 2, 29), 19_782);
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(days_from_civil(1970, 1, 1), 0);
    }

    #[test]
    fn test_weekly_anchor_is_monday() {
        // 2024-01-01 was a Monday: day 19_723.
        let monday = 19_723 * SECS_PER_DAY;
        let thursday = monday + 3 * SECS_PER_DAY;
        assert_eq!(period_start_unix(thursday, &BudgetPeriod::Weekly), monday);
        assert_eq!(
            next_reset_unix(thursday, &BudgetPeriod::Weekly),
            monday + 7 * SECS_PER_DAY
        );
    }

    #[test]
    fn test_monthly_anchor_is_first() {
        // 2024-03-15 → period start 2024-03-01, next reset 2024-04-01.
        let mar15 = days_from_civil(2024, 3, 15) as u64 * SECS_PER_DAY + 3600;
        assert_eq!(
            period_start_unix(mar15, &BudgetPeriod::Monthly),
            days_from_civil(2024, 3, 1) as u64 * SECS_PER_DAY
        );
        assert_eq!(
            next_reset_unix(mar15, &BudgetPeriod::Monthly),
            days_from_civil(2024, 4, 1) as u64 * SECS_PER_DAY
        );
    }

    #[test]
    fn test_daily_boundaries() {
        let now = 19_782 * SECS_PER_DAY + 12_345;
        assert_eq!(
            period_start_unix(now, &BudgetPeriod::Daily),
            19_782 * SECS_PER_DAY
        );
        assert_eq!(
            next_reset_unix(now, &BudgetPeriod::Daily),
            19_783 * SECS_PER_DAY
        );
    }
}
