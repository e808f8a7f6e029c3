use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level gateway configuration: listener settings, the provider table,
/// and one section per runtime subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Provider used when the client names none and routing is bypassed.
    #[serde(default)]
    pub default_provider: Option<String>,

    /// Whole-request wall clock budget in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub shadow: ShadowConfig,

    #[serde(default)]
    pub judge: JudgeConfig,

    #[serde(default)]
    pub optimizer: OptimizerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Consumed by context-injection plugins, not by the core pipeline.
    #[serde(default)]
    pub context: ContextConfig,
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout_ms() -> u64 {
    120_000
}

/// Transport variant of an upstream adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamKind {
    /// JSON over HTTP, optional newline-delimited streaming.
    Http,
    /// Child-process CLI: prompt on stdin, completion on stdout.
    Process,
}

/// One LLM backend entry of the provider table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,

    pub kind: UpstreamKind,

    /// Base URL for `Http`; ignored for `Process`.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Executable + fixed arguments for `Process`; ignored for `Http`.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,

    /// API key forwarded as a bearer token for `Http` adapters.
    #[serde(default)]
    pub api_key: Option<String>,

    pub default_model: String,

    /// Client-facing alias → concrete model identifier.
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,

    /// Lower = preferred by the fallback executor.
    #[serde(default)]
    pub priority: i32,

    /// Initial dynamic weight, 0..=100. All configured weights must sum to 100.
    #[serde(default)]
    pub weight: u32,

    /// Quota accounting window in seconds.
    #[serde(default = "default_quota_window_secs")]
    pub quota_window_secs: u64,

    /// Cooldown applied after a quota-class error, in seconds.
    /// 0 means the upstream never cools down (local inference).
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    #[serde(default)]
    pub timeout: TimeoutConfig,

    #[serde(default = "default_true")]
    pub supports_stream: bool,

    /// Secure upstreams are the only candidates for non-PUBLIC prompts.
    #[serde(default)]
    pub secure: bool,

    /// Capability tags consumed by the router's preference orders:
    /// "local", "fast", "strong", "code", "reasoning", "creative".
    #[serde(default)]
    pub strengths: Vec<String>,

    #[serde(default)]
    pub breaker: BreakerConfig,
}

fn default_quota_window_secs() -> u64 {
    60
}

fn default_cooldown_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

/// Per-adapter timeouts in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_first_byte_ms")]
    pub first_byte_ms: u64,
    #[serde(default = "default_total_ms")]
    pub total_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            first_byte_ms: default_first_byte_ms(),
            total_ms: default_total_ms(),
        }
    }
}

fn default_connect_ms() -> u64 {
    5_000
}

fn default_first_byte_ms() -> u64 {
    30_000
}

fn default_total_ms() -> u64 {
    120_000
}

/// Rolling-ratio circuit breaker settings, one breaker per upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Open once the rolling failure ratio reaches this percentage.
    #[serde(default = "default_error_threshold_pct")]
    pub error_threshold_pct: u32,

    /// Minimum observations in the rolling window before the breaker may open.
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold: u32,

    /// Rolling window length in seconds.
    #[serde(default = "default_rolling_window_secs")]
    pub rolling_window_secs: u64,

    /// Open → half-open after this many seconds.
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold_pct: default_error_threshold_pct(),
            volume_threshold: default_volume_threshold(),
            rolling_window_secs: default_rolling_window_secs(),
            reset_timeout_secs: default_reset_timeout_secs(),
        }
    }
}

fn default_error_threshold_pct() -> u32 {
    50
}

fn default_volume_threshold() -> u32 {
    10
}

fn default_rolling_window_secs() -> u64 {
    30
}

fn default_reset_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    #[default]
    Memory,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackendKind,

    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,

    /// HTTP key-value endpoint for the remote backend (Redis REST bridge).
    #[serde(default)]
    pub remote_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            ttl_secs: default_cache_ttl_secs(),
            max_size: default_cache_max_size(),
            remote_url: None,
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_cache_max_size() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rl_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_rl_max_requests")]
    pub max_requests: u64,

    /// Bucket width inside the window, in milliseconds.
    #[serde(default = "default_rl_precision_ms")]
    pub precision_ms: u64,

    /// Per-key overrides of `max_requests`.
    #[serde(default)]
    pub custom_limits: HashMap<String, u64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_rl_window_ms(),
            max_requests: default_rl_max_requests(),
            precision_ms: default_rl_precision_ms(),
            custom_limits: HashMap::new(),
        }
    }
}

fn default_rl_window_ms() -> u64 {
    60_000
}

fn default_rl_max_requests() -> u64 {
    100
}

fn default_rl_precision_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub period: BudgetPeriod,

    #[serde(default = "default_token_limit")]
    pub token_limit: u64,

    /// Monetary limit in dollars per period.
    #[serde(default = "default_cost_limit")]
    pub cost_limit: f64,

    /// Emit a warning event once either ratio reaches this fraction.
    #[serde(default = "default_warn_ratio")]
    pub warn_ratio: f64,

    /// Dollars per 1000 tokens, by model; `default_price` covers the rest.
    #[serde(default)]
    pub prices: HashMap<String, f64>,

    #[serde(default = "default_price")]
    pub default_price: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            period: BudgetPeriod::Daily,
            token_limit: default_token_limit(),
            cost_limit: default_cost_limit(),
            warn_ratio: default_warn_ratio(),
            prices: HashMap::new(),
            default_price: default_price(),
        }
    }
}

fn default_token_limit() -> u64 {
    1_000_000
}

fn default_cost_limit() -> f64 {
    50.0
}

fn default_warn_ratio() -> f64 {
    0.8
}

fn default_price() -> f64 {
    0.002
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Fraction of traffic routed by the heuristic pick; the complement uses
    /// the weighted random draw over dynamic weights.
    #[serde(default = "default_ai_routing_rate")]
    pub ai_routing_rate: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            ai_routing_rate: default_ai_routing_rate(),
        }
    }
}

fn default_ai_routing_rate() -> f64 {
    0.3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Fraction of primary successes that get a shadow call.
    #[serde(default = "default_shadow_rate")]
    pub rate: f64,

    #[serde(default = "default_shadow_max_concurrent")]
    pub max_concurrent: usize,

    /// Providers never used as shadow targets.
    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default = "default_shadow_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate: default_shadow_rate(),
            max_concurrent: default_shadow_max_concurrent(),
            exclude: Vec::new(),
            queue_capacity: default_shadow_queue_capacity(),
        }
    }
}

fn default_shadow_rate() -> f64 {
    0.05
}

fn default_shadow_max_concurrent() -> usize {
    1
}

fn default_shadow_queue_capacity() -> usize {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Upstream used for scoring.
    #[serde(default)]
    pub provider: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    /// Comparisons drained per judge pass.
    #[serde(default = "default_judge_drain_limit")]
    pub drain_limit: usize,

    /// Pause between judge calls, to stay under the judge's own rate limits.
    #[serde(default = "default_judge_pause_ms")]
    pub pause_ms: u64,

    #[serde(default = "default_judge_interval_secs")]
    pub interval_secs: u64,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: None,
            model: None,
            drain_limit: default_judge_drain_limit(),
            pause_ms: default_judge_pause_ms(),
            interval_secs: default_judge_interval_secs(),
        }
    }
}

fn default_judge_drain_limit() -> usize {
    10
}

fn default_judge_pause_ms() -> u64 {
    500
}

fn default_judge_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,

    #[serde(default = "default_min_comparisons")]
    pub min_comparisons: usize,

    /// Learning rate η in w' = w · (1 + η·(win_rate − 0.5)).
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default = "default_min_weight")]
    pub min_weight: f64,

    #[serde(default = "default_max_weight")]
    pub max_weight: f64,

    /// Bound on |Δweight| per run, before normalization.
    #[serde(default = "default_max_change")]
    pub max_change: f64,

    /// Collector ring capacity per (provider, task type).
    #[serde(default = "default_metric_window")]
    pub metric_window: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            update_interval_secs: default_update_interval_secs(),
            min_comparisons: default_min_comparisons(),
            learning_rate: default_learning_rate(),
            min_weight: default_min_weight(),
            max_weight: default_max_weight(),
            max_change: default_max_change(),
            metric_window: default_metric_window(),
        }
    }
}

fn default_update_interval_secs() -> u64 {
    86_400
}

fn default_min_comparisons() -> usize {
    20
}

fn default_learning_rate() -> f64 {
    0.2
}

fn default_min_weight() -> f64 {
    5.0
}

fn default_max_weight() -> f64 {
    70.0
}

fn default_max_change() -> f64 {
    10.0
}

fn default_metric_window() -> usize {
    100
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub api_key_required: bool,

    /// Accepted bearer keys.
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Key gating `/api/evaluation/*` and other admin surfaces.
    #[serde(default)]
    pub admin_key: Option<String>,
}

/// Backoff applied inside a single upstream attempt for retryable transport
/// errors. Quota errors are never retried here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,

    /// Normalized 1-minute load (load / cpu count) thresholds.
    #[serde(default = "default_degraded_load")]
    pub degraded_load: f64,
    #[serde(default = "default_critical_load")]
    pub critical_load: f64,

    /// Used-memory fraction thresholds.
    #[serde(default = "default_degraded_mem")]
    pub degraded_mem: f64,
    #[serde(default = "default_critical_mem")]
    pub critical_mem: f64,

    /// Event-loop (timer drift) lag thresholds in milliseconds.
    #[serde(default = "default_degraded_lag_ms")]
    pub degraded_lag_ms: u64,
    #[serde(default = "default_critical_lag_ms")]
    pub critical_lag_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval_secs(),
            degraded_load: default_degraded_load(),
            critical_load: default_critical_load(),
            degraded_mem: default_degraded_mem(),
            critical_mem: default_critical_mem(),
            degraded_lag_ms: default_degraded_lag_ms(),
            critical_lag_ms: default_critical_lag_ms(),
        }
    }
}

fn default_monitor_interval_secs() -> u64 {
    10
}

fn default_degraded_load() -> f64 {
    0.7
}

fn default_critical_load() -> f64 {
    0.9
}

fn default_degraded_mem() -> f64 {
    0.8
}

fn default_critical_mem() -> f64 {
    0.95
}

fn default_degraded_lag_ms() -> u64 {
    100
}

fn default_critical_lag_ms() -> u64 {
    500
}

/// Settings surfaced to context-injection plugins via the hook context.
/// The core pipeline parses them but does not act on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default)]
    pub injection_enabled: bool,

    #[serde(default = "default_max_context_chunks")]
    pub max_chunks: usize,

    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            injection_enabled: false,
            max_chunks: default_max_context_chunks(),
            relevance_threshold: default_relevance_threshold(),
        }
    }
}

fn default_max_context_chunks() -> usize {
    5
}

fn default_relevance_threshold() -> f64 {
    0.7
}
