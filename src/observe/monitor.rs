use crate::config::MonitorConfig;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// System health label fed into routing decisions and `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthLabel {
    Healthy,
    Degraded,
    Critical,
}

impl HealthLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLabel::Healthy => "HEALTHY",
            HealthLabel::Degraded => "DEGRADED",
            HealthLabel::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSample {
    pub label: HealthLabel,
    /// 1-minute load average divided by the CPU count.
    pub normalized_load: f64,
    /// Used-memory fraction in [0, 1].
    pub memory_fraction: f64,
    /// Timer drift of the sampling loop, a proxy for scheduler lag.
    pub loop_lag_ms: u64,
}

/// Periodic sampler of CPU load, memory pressure, and scheduler lag.
///
/// The latest sample is published through an `ArcSwap` so readers (router,
/// `/health`) never block the sampling loop.
pub struct ResourceMonitor {
    config: MonitorConfig,
    cpu_count: usize,
    latest: ArcSwap<HealthSample>,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            cpu_count: detect_cpu_limit(),
            latest: ArcSwap::from_pointee(HealthSample {
                label: HealthLabel::Healthy,
                normalized_load: 0.0,
                memory_fraction: 0.0,
                loop_lag_ms: 0,
            }),
        }
    }

    pub fn current(&self) -> Arc<HealthSample> {
        self.latest.load_full()
    }

    pub fn label(&self) -> HealthLabel {
        self.latest.load().label
    }

    /// Take one sample. `observed_lag_ms` comes from the caller's timer drift
    /// measurement.
    pub fn sample_once(&self, observed_lag_ms: u64) {
        let normalized_load = read_loadavg()
            .map(|l| l / self.cpu_count.max(1) as f64)
            .unwrap_or(0.0);
        let memory_fraction = read_memory_fraction().unwrap_or(0.0);

        let label = self.classify(normalized_load, memory_fraction, observed_lag_ms);
        let sample = HealthSample {
            label,
            normalized_load,
            memory_fraction,
            loop_lag_ms: observed_lag_ms,
        };

        metrics::gauge!("gateway_system_load_normalized").set(normalized_load);
        metrics::gauge!("gateway_system_memory_fraction").set(memory_fraction);
        metrics::gauge!("gateway_system_loop_lag_ms").set(observed_lag_ms as f64);

        if label != self.latest.load().label {
            tracing::warn!(
                "monitor: health changed to {}, load={:.2}, mem={:.2}, lag_ms={}",
                label.as_str(),
                normalized_load,
                memory_fraction,
                observed_lag_ms
            );
        }
        self.latest.store(Arc::new(sample));
    }

    fn classify(&self, load: f64, mem: f64, lag_ms: u64) -> HealthLabel {
        let c = &self.config;
        if load >= c.critical_load || mem >= c.critical_mem || lag_ms >= c.critical_lag_ms {
            HealthLabel::Critical
        } else if load >= c.degraded_load || mem >= c.degraded_mem || lag_ms >= c.degraded_lag_ms {
            HealthLabel::Degraded
        } else {
            HealthLabel::Healthy
        }
    }

    /// Run the sampling loop until `shutdown` is notified. The sleep's drift
    /// beyond the configured interval is the loop-lag measurement.
    pub async fn run(self: Arc<Self>, shutdown: Arc<tokio::sync::Notify>) {
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        loop {
            let slept_at = Instant::now();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.notified() => return,
            }
            let lag = slept_at.elapsed().saturating_sub(interval);
            self.sample_once(lag.as_millis() as u64);
        }
    }
}

/// 1-minute load average from `/proc/loadavg` (Linux). `None` elsewhere.
fn read_loadavg() -> Option<f64> {
    let content = std::fs::read_to_string("/proc/loadavg").ok()?;
    content.split_whitespace().next()?.parse().ok()
}

/// Used-memory fraction from `/proc/meminfo`: 1 − MemAvailable/MemTotal.
fn read_memory_fraction() -> Option<f64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total = None;
    let mut available = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_meminfo_kb(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_meminfo_kb(rest);
        }
        if total.is_some() && available.is_some() {
            break;
        }
    }
    let (total, available) = (total?, available?);
    if total == 0 {
        return None;
    }
    Some(1.0 - available as f64 / total as f64)
}

fn parse_meminfo_kb(rest: &str) -> Option<u64> {
    rest.split_whitespace().next()?.parse().ok()
}

/// Container-aware CPU count used to normalize the load average and size the
/// tokio worker pool.
///
/// Detection order: cgroup v2 `cpu.max`, cgroup v1 quota/period, then host
/// parallelism. A container limited to 4 cores on a 64-core host should
/// normalize against 4.
pub fn detect_cpu_limit() -> usize {
    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_cgroup_v2_cpu(&max) {
            return cores.max(1);
        }
    }
    if let (Ok(quota), Ok(period)) = (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        if let Some(cores) = parse_cgroup_quota(quota.trim(), period.trim()) {
            return cores.max(1);
        }
    }
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// cgroup v2 `cpu.max` — "quota period" or "max period".
fn parse_cgroup_v2_cpu(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period: i64 = parts.next()?.parse().ok()?;
    if quota == "max" || period <= 0 {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    if quota <= 0 {
        return None;
    }
    Some((quota / period) as usize)
}

fn parse_cgroup_quota(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.parse().ok()?;
    let period: i64 = period.parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period) as usize)
    } else {
        None
    }
}
