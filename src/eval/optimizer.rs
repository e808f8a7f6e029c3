use super::collector::MetricsCollector;
use crate::config::OptimizerConfig;
use crate::routing::DynamicWeights;
use std::collections::HashMap;
use std::sync::Arc;

/// One accepted weight adjustment from an optimizer run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WeightChange {
    pub provider: String,
    pub old_weight: f64,
    pub new_weight: f64,
    pub win_rate: f64,
    pub comparisons: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct OptimizerReport {
    pub changes: Vec<WeightChange>,
    pub weights: HashMap<String, f64>,
}

/// Periodically rebalances dynamic weights from judged win rates:
/// `w' = w · (1 + η·(win_rate − 0.5))`, clamped, step-bounded, then
/// normalized back to Σ = 100.
pub struct WeightOptimizer {
    config: OptimizerConfig,
    weights: Arc<DynamicWeights>,
    collector: Arc<MetricsCollector>,
}

impl WeightOptimizer {
    pub fn new(
        config: OptimizerConfig,
        weights: Arc<DynamicWeights>,
        collector: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            config,
            weights,
            collector,
        }
    }

    pub fn update_interval_secs(&self) -> u64 {
        self.config.update_interval_secs
    }

    /// One optimization pass. Providers below `min_comparisons` keep their
    /// weight; adjustments smaller than 0.5 are discarded as noise.
    pub fn run_once(&self) -> OptimizerReport {
        let snapshot = self.weights.snapshot();
        let mut next: HashMap<String, f64> = (*snapshot).clone();
        let mut changes = Vec::new();

        for (provider, &current) in snapshot.iter() {
            let Some(summary) = self.collector.provider_summary(provider) else {
                continue;
            };
            if summary.count < self.config.min_comparisons {
                continue;
            }

            let raw = current * (1.0 + self.config.learning_rate * (summary.win_rate - 0.5));
            let clamped = raw.clamp(self.config.min_weight, self.config.max_weight);

            // Bound the per-run step before rounding.
            let delta = (clamped - current).clamp(-self.config.max_change, self.config.max_change);
            let proposed = ((current + delta) * 10.0).round() / 10.0;

            if (proposed - current).abs() >= 0.5 {
                changes.push(WeightChange {
                    provider: provider.clone(),
                    old_weight: current,
                    new_weight: proposed,
                    win_rate: summary.win_rate,
                    comparisons: summary.count,
                });
                next.insert(provider.clone(), proposed);
            }
        }

        if !changes.is_empty() {
            self.weights.store_normalized(next);
            for c in &changes {
                tracing::info!(
                    "optimizer: weight updated, provider={}, {:.1} -> {:.1}, win_rate={:.2}, n={}",
                    c.provider,
                    c.old_weight,
                    c.new_weight,
                    c.win_rate,
                    c.comparisons
                );
                metrics::counter!(
                    "gateway_weight_updates_total",
                    "provider" => c.provider.clone(),
                )
                .increment(1);
            }
        }

        let weights = (*self.weights.snapshot()).clone();
        for (provider, w) in &weights {
            metrics::gauge!(
                "gateway_dynamic_weight",
                "provider" => provider.clone(),
            )
            .set(*w);
        }

        OptimizerReport { changes, weights }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::TaskType;
    use crate::eval::collector::Datum;

    fn setup(
        weights: &[(&str, f64)],
        config: OptimizerConfig,
    ) -> (WeightOptimizer, Arc<DynamicWeights>, Arc<MetricsCollector>) {
        let dw = Arc::new(DynamicWeights::from_config(&[]));
        dw.store_normalized(weights.iter().map(|(n, w)| (n.to_string(), *w)).collect());
        let collector = Arc::new(MetricsCollector::new(500));
        let opt = WeightOptimizer::new(config, dw.clone(), collector.clone());
        (opt, dw, collector)
    }

    fn feed(collector: &MetricsCollector, provider: &str, wins: usize, losses: usize) {
        for _ in 0..wins {
            collector.record(
                provider,
                TaskType::General,
                Datum {
                    won: true,
                    tied: false,
                    score: 40.0,
                    latency_ms: 100,
                },
            );
        }
        for _ in 0..losses {
            collector.record(
                provider,
                TaskType::General,
                Datum {
                    won: false,
                    tied: false,
                    score: 30.0,
                    latency_ms: 100,
                },
            );
        }
    }

    fn config() -> OptimizerConfig {
        OptimizerConfig {
            enabled: true,
            update_interval_secs: 86_400,
            min_comparisons: 20,
            learning_rate: 0.2,
            min_weight: 5.0,
            max_weight: 70.0,
            max_change: 10.0,
            metric_window: 500,
        }
    }

    #[test]
    fn test_winner_moves_up_and_sum_stays_100() {
        let (opt, dw, collector) = setup(&[("a", 50.0), ("b", 50.0)], config());
        // A wins 70% of 100 comparisons; B loses the complement.
        feed(&collector, "a", 70, 30);
        feed(&collector, "b", 30, 70);

        let report = opt.run_once();
        assert_eq!(report.changes.len(), 2);

        let sum: f64 = report.weights.values().sum();
        assert!((sum - 100.0).abs() < 0.5, "sum: {}", sum);
        assert!(dw.get("a") > dw.get("b"));
        // η=0.2, win_rate=0.7 → raw Δ = 50·0.04 = 2 ≤ max_change.
        let a_change = report.changes.iter().find(|c| c.provider == "a").unwrap();
        assert!((a_change.new_weight - a_change.old_weight).abs() <= 10.0);
    }

    #[test]
    fn test_below_min_comparisons_unchanged() {
        let (opt, dw, collector) = setup(&[("a", 60.0), ("b", 40.0)], config());
        feed(&collector, "a", 10, 0); // only 10 < min_comparisons
        let report = opt.run_once();
        assert!(report.changes.is_empty());
        assert_eq!(dw.get("a"), 60.0);
    }

    #[test]
    fn test_step_bounded_by_max_change() {
        let mut cfg = config();
        cfg.learning_rate = 2.0; // raw step would be 50 · 1.0 = 50
        let (opt, _, collector) = setup(&[("a", 50.0), ("b", 50.0)], cfg);
        feed(&collector, "a", 100, 0);
        feed(&collector, "b", 0, 100);

        let report = opt.run_once();
        for c in &report.changes {
            assert!(
                (c.new_weight - c.old_weight).abs() <= 10.0 + 1e-9,
                "step too large: {:?}",
                c
            );
        }
    }

    #[test]
    fn test_clamped_to_weight_bounds() {
        let mut cfg = config();
        cfg.max_change = 100.0;
        cfg.learning_rate = 5.0;
        let (opt, _, collector) = setup(&[("a", 60.0), ("b", 40.0)], cfg.clone());
        feed(&collector, "a", 100, 0);
        feed(&collector, "b", 0, 100);

        let report = opt.run_once();
        // Before normalization each accepted weight respected the clamp.
        for c in &report.changes {
            assert!(c.new_weight <= cfg.max_weight);
            assert!(c.new_weight >= cfg.min_weight);
        }
    }

    #[test]
    fn test_sub_half_point_changes_discarded() {
        let mut cfg = config();
        cfg.learning_rate = 0.01; // 50 · 0.01·0.2 = 0.1 < 0.5
        let (opt, dw, collector) = setup(&[("a", 50.0), ("b", 50.0)], cfg);
        feed(&collector, "a", 70, 30);
        let report = opt.run_once();
        assert!(report.changes.is_empty());
        assert_eq!(dw.get("a"), 50.0);
    }

    #[test]
    fn test_all_ties_move_nothing() {
        let (opt, dw, collector) = setup(&[("a", 50.0), ("b", 50.0)], config());
        for _ in 0..50 {
            collector.record(
                "a",
                TaskType::General,
                Datum {
                    won: false,
                    tied: true,
                    score: 30.0,
                    latency_ms: 100,
                },
            );
        }
        // win_rate = 0.5 exactly → multiplier 1.0.
        let report = opt.run_once();
        assert!(report.changes.is_empty());
        assert_eq!(dw.get("a"), 50.0);
    }
}
