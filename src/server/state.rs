use crate::cache::ResponseCache;
use crate::config::GatewayConfig;
use crate::eval::{Judge, MetricsCollector, ShadowRouter, WeightOptimizer};
use crate::limit::{BudgetManager, RateLimiter};
use crate::metrics::Metrics;
use crate::observe::{Inspector, ResourceMonitor};
use crate::pipeline::FallbackExecutor;
use crate::plugin::PluginRegistry;
use crate::routing::{DynamicWeights, Router};
use crate::upstream::UpstreamSet;
use anyhow::Result;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

const TRACE_RING_CAPACITY: usize = 1000;

/// Shared gateway state, cheaply cloneable.
///
/// One instance of every runtime singleton lives here; the pipeline
/// receives the aggregate explicitly instead of reaching for globals.
/// Each singleton is internally concurrency-safe.
#[derive(Clone)]
pub struct GatewayState {
    inner: Arc<StateInner>,
}

pub struct StateInner {
    pub config: Arc<GatewayConfig>,
    pub metrics: Metrics,
    pub upstreams: UpstreamSet,
    pub cache: ResponseCache,
    pub limiter: Arc<RateLimiter>,
    pub budget: Arc<BudgetManager>,
    pub weights: Arc<DynamicWeights>,
    pub router: Router,
    pub executor: FallbackExecutor,
    pub shadow: Arc<ShadowRouter>,
    pub judge: Arc<Judge>,
    pub collector: Arc<MetricsCollector>,
    pub optimizer: Arc<WeightOptimizer>,
    pub inspector: Arc<Inspector>,
    pub monitor: Arc<ResourceMonitor>,
    pub plugins: Arc<PluginRegistry>,
    pub active_requests: AtomicI64,
    pub started_at: Instant,
}

impl std::ops::Deref for GatewayState {
    type Target = StateInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let config = Arc::new(config);

        let upstreams = UpstreamSet::from_config(&config.upstreams)?;
        let weights = Arc::new(DynamicWeights::from_config(&config.upstreams));
        let cache = ResponseCache::from_config(&config.cache)?;
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let budget = Arc::new(BudgetManager::new(config.budget.clone()));
        let router = Router::new(config.router.clone(), weights.clone());
        let executor = FallbackExecutor::new(
            upstreams.clone(),
            config.retry.clone(),
            config.request_timeout_ms,
        );
        let shadow = Arc::new(ShadowRouter::new(config.shadow.clone(), upstreams.clone()));
        let judge = Arc::new(Judge::new(config.judge.clone(), upstreams.clone()));
        let collector = Arc::new(MetricsCollector::new(config.optimizer.metric_window));
        let optimizer = Arc::new(WeightOptimizer::new(
            config.optimizer.clone(),
            weights.clone(),
            collector.clone(),
        ));

        Ok(Self {
            inner: Arc::new(StateInner {
                metrics: install_metrics(),
                upstreams,
                cache,
                limiter,
                budget,
                weights,
                router,
                executor,
                shadow,
                judge,
                collector,
                optimizer,
                inspector: Arc::new(Inspector::new(TRACE_RING_CAPACITY)),
                monitor: Arc::new(ResourceMonitor::new(config.monitor.clone())),
                plugins: Arc::new(PluginRegistry::new()),
                active_requests: AtomicI64::new(0),
                started_at: Instant::now(),
                config,
            }),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// The Prometheus recorder installs process-wide exactly once; later state
/// constructions (tests) reuse the same handle.
fn install_metrics() -> Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::install).clone()
}
