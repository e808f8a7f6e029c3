use crate::config::UpstreamConfig;
use crate::upstream::UpstreamHandle;
use arc_swap::ArcSwap;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

/// Dynamic per-provider weights, normalized to sum to 100.
///
/// Reads are lock-free snapshots; the optimizer swaps in a freshly
/// normalized table so concurrent weighted draws always see a coherent map.
pub struct DynamicWeights {
    table: ArcSwap<HashMap<String, f64>>,
}

impl DynamicWeights {
    pub fn from_config(configs: &[UpstreamConfig]) -> Self {
        let table: HashMap<String, f64> = configs
            .iter()
            .map(|c| (c.name.clone(), c.weight as f64))
            .collect();
        Self {
            table: ArcSwap::from_pointee(table),
        }
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, f64>> {
        self.table.load_full()
    }

    pub fn get(&self, provider: &str) -> f64 {
        self.table.load().get(provider).copied().unwrap_or(0.0)
    }

    /// Normalize to Σ = 100 and atomically replace the table. An all-zero
    /// map is stored as-is; draws against it fall back to heuristics.
    pub fn store_normalized(&self, mut table: HashMap<String, f64>) {
        let sum: f64 = table.values().sum();
        if sum > 0.0 {
            for w in table.values_mut() {
                *w = *w / sum * 100.0;
            }
        }
        self.table.store(Arc::new(table));
    }

    /// Weighted random draw over `candidates` via prefix sums. Returns `None`
    /// when the candidates' weights sum to zero.
    pub fn select_weighted(
        &self,
        candidates: &[Arc<UpstreamHandle>],
    ) -> Option<Arc<UpstreamHandle>> {
        if candidates.is_empty() {
            return None;
        }
        let table = self.table.load();
        let mut prefix = Vec::with_capacity(candidates.len());
        let mut sum = 0.0;
        for handle in candidates {
            sum += table.get(handle.name()).copied().unwrap_or(0.0).max(0.0);
            prefix.push(sum);
        }
        if sum <= 0.0 {
            return None;
        }
        let target = rand::thread_rng().gen_range(0.0..sum);
        let idx = prefix.partition_point(|&p| p <= target);
        candidates.get(idx).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::mock_handle;

    fn weights_for(entries: &[(&str, f64)]) -> DynamicWeights {
        let w = DynamicWeights {
            table: ArcSwap::from_pointee(HashMap::new()),
        };
        w.store_normalized(entries.iter().map(|(n, v)| (n.to_string(), *v)).collect());
        w
    }

    #[test]
    fn test_normalization_to_100() {
        let w = weights_for(&[("a", 2.0), ("b", 3.0)]);
        let snap = w.snapshot();
        let sum: f64 = snap.values().sum();
        assert!((sum - 100.0).abs() < 0.5);
        assert!((w.get("a") - 40.0).abs() < 1e-9);
        assert!((w.get("b") - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_distribution() {
        let w = weights_for(&[("a", 20.0), ("b", 80.0)]);
        let candidates = vec![mock_handle("a"), mock_handle("b")];
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..10_000 {
            let pick = w.select_weighted(&candidates).unwrap();
            *counts.entry(pick.name().to_string()).or_insert(0) += 1;
        }
        let a = *counts.get("a").unwrap_or(&0);
        let b = *counts.get("b").unwrap_or(&0);
        // ±2% absolute tolerance on share.
        assert!((1800..=2200).contains(&a), "a count: {}", a);
        assert!((7800..=8200).contains(&b), "b count: {}", b);
    }

    #[test]
    fn test_zero_weight_sum_returns_none() {
        let w = weights_for(&[("a", 0.0), ("b", 0.0)]);
        let candidates = vec![mock_handle("a"), mock_handle("b")];
        assert!(w.select_weighted(&candidates).is_none());
    }

    #[test]
    fn test_unknown_candidates_have_zero_weight() {
        let w = weights_for(&[("a", 100.0)]);
        let candidates = vec![mock_handle("b")];
        assert!(w.select_weighted(&candidates).is_none());
    }

    #[test]
    fn test_empty_candidates() {
        let w = weights_for(&[("a", 100.0)]);
        assert!(w.select_weighted(&[]).is_none());
    }
}
