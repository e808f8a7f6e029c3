pub mod weights;

pub use weights::DynamicWeights;

use crate::classify::{Classification, Complexity, PrivacyLevel, TaskType};
use crate::config::RouterConfig;
use crate::observe::HealthLabel;
use crate::upstream::UpstreamHandle;
use rand::Rng;
use std::sync::Arc;

/// Selection strategy that produced a routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStrategy {
    Heuristic,
    Weighted,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RouteRationale {
    pub privacy_mode: String,
    pub optimization: &'static str,
    pub system_health: &'static str,
    pub reason: String,
}

#[derive(Debug)]
pub struct RouteDecision {
    pub handle: Arc<UpstreamHandle>,
    pub strategy: RouteStrategy,
    pub task_type: TaskType,
    pub rationale: RouteRationale,
}

/// Routing failed before any upstream was tried.
#[derive(Debug, Clone)]
pub struct RouteRejection {
    pub reason: String,
}

/// Picks one upstream per request from classifier output, dynamic weights,
/// and system health.
pub struct Router {
    config: RouterConfig,
    weights: Arc<DynamicWeights>,
}

impl Router {
    pub fn new(config: RouterConfig, weights: Arc<DynamicWeights>) -> Self {
        Self { config, weights }
    }

    pub fn weights(&self) -> &Arc<DynamicWeights> {
        &self.weights
    }

    /// Route over the available candidates (quota-clear, breaker-clear).
    pub fn route(
        &self,
        class: &Classification,
        candidates: &[Arc<UpstreamHandle>],
        health: HealthLabel,
    ) -> Result<RouteDecision, RouteRejection> {
        // Privacy filter: non-PUBLIC prompts only leave through secure
        // upstreams.
        let filtered: Vec<Arc<UpstreamHandle>> = if class.privacy != PrivacyLevel::Public {
            candidates
                .iter()
                .filter(|h| h.config.secure)
                .cloned()
                .collect()
        } else {
            candidates.to_vec()
        };

        if filtered.is_empty() {
            return Err(RouteRejection {
                reason: if class.privacy != PrivacyLevel::Public {
                    "No Secure Provider Available".to_string()
                } else {
                    "No Provider Available".to_string()
                },
            });
        }

        let optimization = if class.complexity.category == Complexity::Simple
            || health != HealthLabel::Healthy
        {
            "SPEED"
        } else {
            "QUALITY"
        };

        // Bucket assignment: a fraction of traffic takes the heuristic
        // preference order, the rest draws from the dynamic weights.
        let heuristic_bucket = rand::thread_rng().gen::<f64>() < self.config.ai_routing_rate;

        let (handle, strategy) = if heuristic_bucket {
            (
                self.heuristic_pick(&filtered, optimization, class.task_type),
                RouteStrategy::Heuristic,
            )
        } else {
            match self.weights.select_weighted(&filtered) {
                Some(h) => (h, RouteStrategy::Weighted),
                // Restricted candidate sets can carry no weight at all;
                // fall back to the heuristic order instead of failing.
                None => (
                    self.heuristic_pick(&filtered, optimization, class.task_type),
                    RouteStrategy::Heuristic,
                ),
            }
        };

        let rationale = RouteRationale {
            privacy_mode: class.privacy.as_str().to_string(),
            optimization,
            system_health: health.as_str(),
            reason: format!(
                "{} routing selected {} for {} task",
                match strategy {
                    RouteStrategy::Heuristic => "preference-order",
                    RouteStrategy::Weighted => "weighted",
                },
                handle.name(),
                class.task_type.as_str()
            ),
        };

        Ok(RouteDecision {
            handle,
            strategy,
            task_type: class.task_type,
            rationale,
        })
    }

    /// Walk the preference order for the optimization mode and task type;
    /// ties break on config priority, then input order.
    fn heuristic_pick(
        &self,
        candidates: &[Arc<UpstreamHandle>],
        optimization: &str,
        task: TaskType,
    ) -> Arc<UpstreamHandle> {
        let order = preference_order(optimization, task);
        let mut best: Option<(&Arc<UpstreamHandle>, u32)> = None;
        for handle in candidates {
            let rank = tier_rank(&handle.config.strengths, order);
            let better = match best {
                None => true,
                Some((current, current_rank)) => {
                    rank < current_rank
                        || (rank == current_rank && handle.config.priority < current.config.priority)
                }
            };
            if better {
                best = Some((handle, rank));
            }
        }
        best.map(|(h, _)| h.clone()).expect("candidates non-empty")
    }
}

/// (tag, rank) pairs; untagged upstreams take `DEFAULT_RANK`.
type TierOrder = &'static [(&'static str, u32)];

const DEFAULT_RANK: u32 = 2;

/// SIMPLE prompts and degraded hosts prefer cheap, close upstreams:
/// local, then flash-tier, then default-tier, then strong-tier.
const SPEED_ORDER: TierOrder = &[("local", 0), ("fast", 1), ("strong", 3)];

const CODE_ORDER: TierOrder = &[("code", 0), ("strong", 1), ("fast", 3), ("local", 4)];
const REASONING_ORDER: TierOrder = &[("reasoning", 0), ("strong", 1), ("fast", 3), ("local", 4)];
const CREATIVE_ORDER: TierOrder = &[("creative", 0), ("strong", 1), ("fast", 3), ("local", 4)];
const GENERAL_ORDER: TierOrder = &[("strong", 0), ("fast", 3), ("local", 4)];

fn preference_order(optimization: &str, task: TaskType) -> TierOrder {
    if optimization == "SPEED" {
        return SPEED_ORDER;
    }
    match task {
        TaskType::Code => CODE_ORDER,
        TaskType::Math | TaskType::Analysis => REASONING_ORDER,
        TaskType::Creative => CREATIVE_ORDER,
        _ => GENERAL_ORDER,
    }
}

fn tier_rank(strengths: &[String], order: TierOrder) -> u32 {
    strengths
        .iter()
        .filter_map(|s| {
            order
                .iter()
                .find(|(tag, _)| tag == &s.as_str())
                .map(|(_, rank)| *rank)
        })
        .min()
        .unwrap_or(DEFAULT_RANK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify, ComplexityReport};
    use crate::testutil::{handle_from, mock_config};
    use crate::upstream::mock::MockUpstream;

    fn tagged(name: &str, secure: bool, strengths: &[&str], priority: i32) -> Arc<UpstreamHandle> {
        let mut cfg = mock_config(name);
        cfg.secure = secure;
        cfg.priority = priority;
        cfg.strengths = strengths.iter().map(|s| s.to_string()).collect();
        handle_from(cfg, MockUpstream::new(name))
    }

    fn router(ai_rate: f64, weights: &[(&str, f64)]) -> Router {
        let dw = DynamicWeights::from_config(&[]);
        dw.store_normalized(weights.iter().map(|(n, w)| (n.to_string(), *w)).collect());
        Router::new(
            RouterConfig {
                ai_routing_rate: ai_rate,
            },
            Arc::new(dw),
        )
    }

    fn classification(prompt: &str) -> Classification {
        classify(prompt, None)
    }

    fn simple_public() -> Classification {
        Classification {
            privacy: PrivacyLevel::Public,
            complexity: ComplexityReport {
                score: 5.0,
                category: Complexity::Simple,
            },
            task_type: TaskType::General,
        }
    }

    #[test]
    fn test_privacy_restricts_to_secure() {
        let r = router(1.0, &[]);
        let candidates = vec![
            tagged("cloud", false, &["strong"], 0),
            tagged("ollama", true, &["local"], 5),
        ];
        let class = classification("Email me at a@b.com");
        assert_eq!(class.privacy, PrivacyLevel::Sensitive);
        let decision = r.route(&class, &candidates, HealthLabel::Healthy).unwrap();
        assert_eq!(decision.handle.name(), "ollama");
        assert_eq!(decision.rationale.privacy_mode, "SENSITIVE");
    }

    #[test]
    fn test_no_secure_provider_rejection() {
        let r = router(1.0, &[]);
        let candidates = vec![tagged("cloud", false, &["strong"], 0)];
        let class = classification("my ssn is 123-45-6789");
        let err = r
            .route(&class, &candidates, HealthLabel::Healthy)
            .unwrap_err();
        assert_eq!(err.reason, "No Secure Provider Available");
    }

    #[test]
    fn test_simple_prompt_prefers_local() {
        let r = router(1.0, &[]);
        let candidates = vec![
            tagged("big", false, &["strong"], 0),
            tagged("flash", false, &["fast"], 1),
            tagged("ollama", false, &["local"], 2),
        ];
        let decision = r
            .route(&simple_public(), &candidates, HealthLabel::Healthy)
            .unwrap();
        assert_eq!(decision.handle.name(), "ollama");
        assert_eq!(decision.rationale.optimization, "SPEED");
    }

    #[test]
    fn test_degraded_health_forces_speed() {
        let r = router(1.0, &[]);
        let candidates = vec![
            tagged("big", false, &["strong"], 0),
            tagged("flash", false, &["fast"], 1),
        ];
        let class = classification(
            "Analyze and compare the tradeoffs between optimistic and pessimistic locking in long paragraphs of text that go on for a while to raise the length component of the score meaningfully.",
        );
        let decision = r.route(&class, &candidates, HealthLabel::Degraded).unwrap();
        assert_eq!(decision.rationale.optimization, "SPEED");
        assert_eq!(decision.handle.name(), "flash");
        assert_eq!(decision.rationale.system_health, "DEGRADED");
    }

    #[test]
    fn test_code_task_prefers_code_specialist() {
        let r = router(1.0, &[]);
        let candidates = vec![
            tagged("generalist", false, &["strong"], 0),
            tagged("coder", false, &["code"], 5),
        ];
        let class = classification(
            "Refactor this function and explain each change step by step:\n```rust\nfn add(a: i32, b: i32) -> i32 { a + b }\n```",
        );
        assert_eq!(class.task_type, TaskType::Code);
        assert_eq!(class.complexity.category, Complexity::Moderate);
        let decision = r.route(&class, &candidates, HealthLabel::Healthy).unwrap();
        assert_eq!(decision.handle.name(), "coder");
        assert_eq!(decision.strategy, RouteStrategy::Heuristic);
    }

    #[test]
    fn test_weighted_strategy_distribution() {
        let r = router(0.0, &[("a", 70.0), ("b", 30.0)]);
        let candidates = vec![tagged("a", false, &[], 0), tagged("b", false, &[], 1)];
        let class = simple_public();
        let mut a_count = 0;
        for _ in 0..2_000 {
            let d = r.route(&class, &candidates, HealthLabel::Healthy).unwrap();
            assert_eq!(d.strategy, RouteStrategy::Weighted);
            if d.handle.name() == "a" {
                a_count += 1;
            }
        }
        // 70% with slack for 2k draws.
        assert!((1250..=1550).contains(&a_count), "a: {}", a_count);
    }

    #[test]
    fn test_zero_weight_candidates_fall_back_to_heuristic() {
        // Secure-only candidate with no weight entry: the weighted branch
        // must fall back rather than reject.
        let r = router(0.0, &[("other", 100.0)]);
        let candidates = vec![tagged("ollama", true, &["local"], 0)];
        let class = classification("contact a@b.com");
        let d = r.route(&class, &candidates, HealthLabel::Healthy).unwrap();
        assert_eq!(d.handle.name(), "ollama");
        assert_eq!(d.strategy, RouteStrategy::Heuristic);
    }

    #[test]
    fn test_tie_breaks_on_priority() {
        let r = router(1.0, &[]);
        let candidates = vec![
            tagged("second", false, &["fast"], 2),
            tagged("first", false, &["fast"], 1),
        ];
        let d = r
            .route(&simple_public(), &candidates, HealthLabel::Healthy)
            .unwrap();
        assert_eq!(d.handle.name(), "first");
    }
}
