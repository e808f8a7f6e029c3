use crate::classify::TaskType;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// One judged outcome for a (provider, task type) pair.
#[derive(Debug, Clone)]
pub struct Datum {
    pub won: bool,
    pub tied: bool,
    pub score: f64,
    pub latency_ms: u64,
}

/// Aggregated view over one rolling window.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PerUpstreamMetric {
    pub count: usize,
    pub win_rate: f64,
    pub avg_score: f64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
    pub last_updated_unix: u64,
}

/// Summary across all task types, consumed by the weight optimizer.
#[derive(Debug, Clone)]
pub struct ProviderSummary {
    pub count: usize,
    pub win_rate: f64,
}

/// Rolling windows of judged outcomes, keyed provider → task type.
///
/// Ties carry half credit toward `win_rate`, so a provider that only ever
/// ties trends to 0.5 rather than 0.
pub struct MetricsCollector {
    window: usize,
    data: Mutex<HashMap<String, HashMap<TaskType, WindowState>>>,
}

struct WindowState {
    ring: VecDeque<Datum>,
    last_updated_unix: u64,
}

impl MetricsCollector {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            data: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, provider: &str, task: TaskType, datum: Datum) {
        let mut data = self.data.lock().unwrap();
        let state = data
            .entry(provider.to_string())
            .or_default()
            .entry(task)
            .or_insert_with(|| WindowState {
                ring: VecDeque::new(),
                last_updated_unix: 0,
            });
        if state.ring.len() >= self.window {
            state.ring.pop_front();
        }
        state.ring.push_back(datum);
        state.last_updated_unix = now_unix();
    }

    /// Full aggregation for the evaluation admin surface.
    pub fn aggregate(&self) -> HashMap<String, HashMap<&'static str, PerUpstreamMetric>> {
        let data = self.data.lock().unwrap();
        data.iter()
            .map(|(provider, tasks)| {
                let aggregated = tasks
                    .iter()
                    .map(|(task, state)| (task.as_str(), aggregate_window(state)))
                    .collect();
                (provider.clone(), aggregated)
            })
            .collect()
    }

    /// Cross-task summary for one provider.
    pub fn provider_summary(&self, provider: &str) -> Option<ProviderSummary> {
        let data = self.data.lock().unwrap();
        let tasks = data.get(provider)?;
        let mut count = 0usize;
        let mut credit = 0.0f64;
        for state in tasks.values() {
            for d in &state.ring {
                count += 1;
                if d.won {
                    credit += 1.0;
                } else if d.tied {
                    credit += 0.5;
                }
            }
        }
        if count == 0 {
            return None;
        }
        Some(ProviderSummary {
            count,
            win_rate: credit / count as f64,
        })
    }
}

fn aggregate_window(state: &WindowState) -> PerUpstreamMetric {
    let count = state.ring.len();
    let mut credit = 0.0;
    let mut score_sum = 0.0;
    let mut latencies: Vec<u64> = Vec::with_capacity(count);
    for d in &state.ring {
        if d.won {
            credit += 1.0;
        } else if d.tied {
            credit += 0.5;
        }
        score_sum += d.score;
        latencies.push(d.latency_ms);
    }
    latencies.sort_unstable();

    PerUpstreamMetric {
        count,
        win_rate: if count == 0 { 0.0 } else { credit / count as f64 },
        avg_score: if count == 0 {
            0.0
        } else {
            score_sum / count as f64
        },
        p50_latency_ms: percentile(&latencies, 50),
        p95_latency_ms: percentile(&latencies, 95),
        p99_latency_ms: percentile(&latencies, 99),
        last_updated_unix: state.last_updated_unix,
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[u64], pct: u32) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (pct as f64 / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
