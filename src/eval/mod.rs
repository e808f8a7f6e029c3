pub mod collector;
pub mod judge;
pub mod optimizer;
pub mod shadow;

pub use collector::{MetricsCollector, PerUpstreamMetric};
pub use judge::{Judge, JudgeVerdict, Winner};
pub use optimizer::{WeightChange, WeightOptimizer};
pub use shadow::{ShadowComparison, ShadowRouter, ShadowSide};
