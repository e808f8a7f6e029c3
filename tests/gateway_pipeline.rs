//! End-to-end pipeline tests over in-process mock upstreams: routing,
//! fallback, caching, the shadow/judge/optimizer loop, and streaming.

use prism_gateway::cache::ResponseCache;
use prism_gateway::classify::{classify, PrivacyLevel, TaskType};
use prism_gateway::config::{
    BreakerConfig, CacheBackendKind, CacheConfig, JudgeConfig, OptimizerConfig, RetryConfig,
    RouterConfig, ShadowConfig, TimeoutConfig, UpstreamConfig, UpstreamKind,
};
use prism_gateway::error::GatewayError;
use prism_gateway::eval::{Judge, MetricsCollector, ShadowRouter, WeightOptimizer};
use prism_gateway::observe::HealthLabel;
use prism_gateway::pipeline::executor::{ExecRequest, FallbackExecutor};
use prism_gateway::routing::{DynamicWeights, Router};
use prism_gateway::upstream::mock::{MockBehavior, MockUpstream};
use prism_gateway::upstream::{
    CallOptions, CircuitBreaker, QuotaState, StreamEvent, StreamSink, Upstream, UpstreamHandle,
    UpstreamSet,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_test::assert_ok;

fn upstream_config(name: &str, priority: i32, weight: u32) -> UpstreamConfig {
    UpstreamConfig {
        name: name.into(),
        kind: UpstreamKind::Http,
        endpoint: Some("http://unused".into()),
        command: None,
        args: Vec::new(),
        api_key: None,
        default_model: format!("{}-model", name),
        model_aliases: HashMap::new(),
        priority,
        weight,
        quota_window_secs: 60,
        cooldown_secs: 600,
        timeout: TimeoutConfig::default(),
        supports_stream: true,
        secure: false,
        strengths: Vec::new(),
        breaker: BreakerConfig::default(),
    }
}

fn handle(config: UpstreamConfig, mock: MockUpstream) -> Arc<UpstreamHandle> {
    Arc::new(UpstreamHandle {
        quota: QuotaState::new(config.cooldown_secs, config.quota_window_secs),
        breaker: CircuitBreaker::new(config.name.clone(), config.breaker.clone()),
        adapter: Upstream::Mock(mock),
        config,
    })
}

fn executor(handles: Vec<Arc<UpstreamHandle>>) -> FallbackExecutor {
    FallbackExecutor::new(
        UpstreamSet::from_handles(handles),
        RetryConfig {
            max_retries: 1,
            base_delay_ms: 1,
            max_delay_ms: 5,
        },
        5_000,
    )
}

fn memory_cache() -> ResponseCache {
    ResponseCache::from_config(&CacheConfig {
        backend: CacheBackendKind::Memory,
        ttl_secs: 300,
        max_size: 100,
        remote_url: None,
    })
    .unwrap()
}

fn exec_request<'a>(prompt: &'a str, opts: &'a CallOptions) -> ExecRequest<'a> {
    ExecRequest {
        prompt,
        opts,
        primary: None,
        cache: None,
        use_cache: false,
        privacy: PrivacyLevel::Public,
        request_id: "itest000",
        inspector: None,
    }
}

#[tokio::test]
async fn cache_hit_across_providers() {
    let ex = executor(vec![handle(
        upstream_config("a", 0, 100),
        MockUpstream::new("a").with_text("pong"),
    )]);
    let cache = memory_cache();
    let opts = CallOptions::default();

    let mut first = exec_request("ping", &opts);
    first.cache = Some(&cache);
    first.use_cache = true;
    let r1 = ex.execute(first).await.unwrap();
    assert!(!r1.cached);

    let mut second = exec_request("ping", &opts);
    second.cache = Some(&cache);
    second.use_cache = true;
    let r2 = ex.execute(second).await.unwrap();
    assert!(r2.cached);
    assert_eq!(r2.text, "pong");

    let stats = cache.stats().await;
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn pii_routes_to_secure_provider_only() {
    let mut local = upstream_config("ollama", 5, 50);
    local.secure = true;
    local.strengths = vec!["local".into()];
    let cloud = upstream_config("cloud", 0, 50);

    let handles = vec![
        handle(cloud, MockUpstream::new("cloud")),
        handle(local, MockUpstream::new("ollama").with_text("handled locally")),
    ];
    let weights = Arc::new(DynamicWeights::from_config(&[]));
    let router = Router::new(RouterConfig { ai_routing_rate: 1.0 }, weights);

    let class = classify("Email me at a@b.com when done", None);
    assert_eq!(class.privacy, PrivacyLevel::Sensitive);

    let decision = router
        .route(&class, &handles, HealthLabel::Healthy)
        .unwrap();
    assert_eq!(decision.handle.name(), "ollama");

    // And with no secure provider at all, routing is rejected.
    let insecure_only = vec![handle(
        upstream_config("cloud2", 0, 100),
        MockUpstream::new("cloud2"),
    )];
    let weights = Arc::new(DynamicWeights::from_config(&[]));
    let router = Router::new(RouterConfig { ai_routing_rate: 1.0 }, weights);
    let rejection = router
        .route(&class, &insecure_only, HealthLabel::Healthy)
        .unwrap_err();
    assert_eq!(rejection.reason, "No Secure Provider Available");
}

#[tokio::test]
async fn fallback_on_quota_cools_primary() {
    let primary_mock = MockUpstream::new("primary");
    primary_mock.push(MockBehavior::Quota("429 rate limit".into()));
    let primary = handle(upstream_config("primary", 0, 50), primary_mock);
    let secondary = handle(
        upstream_config("secondary", 1, 50),
        MockUpstream::new("secondary").with_text("served by fallback"),
    );
    let primary_ref = primary.clone();

    let ex = executor(vec![primary, secondary]);
    let opts = CallOptions::default();
    let completion = ex.execute(exec_request("x", &opts)).await.unwrap();

    assert_eq!(completion.provider, "secondary");
    assert!(!primary_ref.quota.is_available());
    let snap = primary_ref.quota.snapshot();
    assert!(snap.cooldown_remaining_secs.unwrap() > 0);
    assert!(snap.last_error.unwrap().contains("429"));
}

#[tokio::test]
async fn weighted_distribution_matches_configured_weights() {
    let names = [("a", 50u32), ("b", 30), ("c", 15), ("d", 5)];
    let configs: Vec<UpstreamConfig> = names
        .iter()
        .enumerate()
        .map(|(i, (n, w))| upstream_config(n, i as i32, *w))
        .collect();
    let handles: Vec<Arc<UpstreamHandle>> = configs
        .iter()
        .map(|c| handle(c.clone(), MockUpstream::new(c.name.clone())))
        .collect();

    let weights = Arc::new(DynamicWeights::from_config(&configs));
    let router = Router::new(RouterConfig { ai_routing_rate: 0.0 }, weights);
    let class = classify("hello", None);

    let mut counts: HashMap<String, u32> = HashMap::new();
    for _ in 0..10_000 {
        let d = router.route(&class, &handles, HealthLabel::Healthy).unwrap();
        *counts.entry(d.handle.name().to_string()).or_insert(0) += 1;
    }

    for (name, weight) in names {
        let observed = *counts.get(name).unwrap_or(&0) as f64 / 10_000.0;
        let expected = weight as f64 / 100.0;
        assert!(
            (observed - expected).abs() <= 0.02,
            "{}: observed {:.3}, expected {:.3}",
            name,
            observed,
            expected
        );
    }
}

#[tokio::test]
async fn judge_verdicts_drive_optimizer_step() {
    // Judge always declares A (the primary) the winner.
    let judge_reply = r#"{"winner": "A", "scores": {
        "a": {"correctness": 9, "relevance": 8, "clarity": 8, "completeness": 8, "conciseness": 8},
        "b": {"correctness": 5, "relevance": 5, "clarity": 5, "completeness": 5, "conciseness": 5}},
        "reasoning": "primary clearly better"}"#;
    let judge_handle = handle(
        upstream_config("judge-llm", 9, 0),
        MockUpstream::new("judge-llm").with_text(judge_reply),
    );
    let shadow_target = handle(
        upstream_config("b", 0, 0),
        MockUpstream::new("b").with_text("shadow answer"),
    );
    let set = UpstreamSet::from_handles(vec![judge_handle, shadow_target]);

    let shadow = Arc::new(ShadowRouter::new(
        ShadowConfig {
            enabled: true,
            rate: 1.0,
            max_concurrent: 1,
            exclude: vec!["judge-llm".into()],
            queue_capacity: 200,
        },
        set.clone(),
    ));

    // Mirror 30 primary successes of provider "a" onto shadow target "b".
    let primary_completion = prism_gateway::upstream::Completion {
        model: "a-model".into(),
        text: "primary answer".into(),
        provider: "a".into(),
        duration_ms: 10,
        cached: false,
        prompt_tokens: None,
        completion_tokens: None,
    };
    for i in 0..30 {
        shadow.dispatch(
            format!("req{}", i),
            "the prompt".into(),
            TaskType::General,
            &primary_completion,
            None,
        );
    }
    for _ in 0..100 {
        if shadow.queue_len() == 30 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(shadow.queue_len(), 30);

    let judge = Judge::new(
        JudgeConfig {
            enabled: true,
            provider: Some("judge-llm".into()),
            model: None,
            drain_limit: 100,
            pause_ms: 0,
            interval_secs: 60,
        },
        set,
    );

    let collector = Arc::new(MetricsCollector::new(500));
    let judged = judge.run_once(&shadow, &collector, None).await;
    assert_eq!(judged, 30);

    let weights = Arc::new(DynamicWeights::from_config(&[]));
    weights.store_normalized(HashMap::from([("a".to_string(), 50.0), ("b".to_string(), 50.0)]));

    let optimizer = WeightOptimizer::new(
        OptimizerConfig {
            enabled: true,
            update_interval_secs: 86_400,
            min_comparisons: 20,
            learning_rate: 0.2,
            min_weight: 5.0,
            max_weight: 70.0,
            max_change: 10.0,
            metric_window: 500,
        },
        weights.clone(),
        collector,
    );

    let report = optimizer.run_once();
    assert!(!report.changes.is_empty());

    let sum: f64 = report.weights.values().sum();
    assert!((sum - 100.0).abs() < 0.5, "sum: {}", sum);
    assert!(weights.get("a") > weights.get("b"));
    for w in report.weights.values() {
        assert!(*w >= 5.0 && *w <= 70.0, "weight out of bounds: {}", w);
    }
    for c in &report.changes {
        assert!((c.new_weight - c.old_weight).abs() <= 10.0 + 1e-9);
    }
}

#[tokio::test]
async fn stream_concatenation_matches_unary_response() {
    let text = "the quick brown fox jumps over the lazy dog";
    let build = || {
        executor(vec![handle(
            upstream_config("a", 0, 100),
            MockUpstream::new("a").with_text(text),
        )])
    };
    let opts = CallOptions::default();

    let unary = assert_ok!(build().execute(exec_request("p", &opts)).await);

    let (sink, mut rx) = StreamSink::channel(64);
    let provider = build()
        .execute_stream(exec_request("p", &opts), &sink)
        .await
        .unwrap();
    assert_eq!(provider, "a");
    // Delivered-byte accounting feeds the streamed budget charge.
    assert_eq!(sink.delivered_bytes() as usize, text.len());
    drop(sink);

    let mut streamed = String::new();
    while let Some(ev) = rx.recv().await {
        if let StreamEvent::Chunk(c) = ev {
            streamed.push_str(&c);
        }
    }
    assert_eq!(streamed, unary.text);
}

#[tokio::test]
async fn all_quota_failures_surface_provider_errors() {
    let a_mock = MockUpstream::new("a");
    a_mock.push(MockBehavior::Quota("quota a".into()));
    let b_mock = MockUpstream::new("b");
    b_mock.push(MockBehavior::Quota("quota b".into()));

    let ex = executor(vec![
        handle(upstream_config("a", 0, 50), a_mock),
        handle(upstream_config("b", 1, 50), b_mock),
    ]);
    let opts = CallOptions::default();
    let err = ex.execute(exec_request("x", &opts)).await.unwrap_err();
    match err {
        GatewayError::AllProvidersFailed(failures) => {
            assert_eq!(failures.len(), 2);
        }
        other => panic!("unexpected: {:?}", other),
    }

    // Both upstreams are now cooling down; the next request short-circuits.
    let err = ex.execute(exec_request("x", &opts)).await.unwrap_err();
    assert!(matches!(err, GatewayError::AllQuotasExhausted));
}

#[tokio::test]
async fn classifier_task_detection_feeds_routing() {
    let class = classify("Write a function that reverses a linked list", None);
    assert_eq!(class.task_type, TaskType::Code);

    let mut coder = upstream_config("coder", 5, 50);
    coder.strengths = vec!["code".into()];
    let generalist = upstream_config("generalist", 0, 50);

    let handles = vec![
        handle(generalist, MockUpstream::new("generalist")),
        handle(coder, MockUpstream::new("coder")),
    ];
    let weights = Arc::new(DynamicWeights::from_config(&[]));
    let router = Router::new(RouterConfig { ai_routing_rate: 1.0 }, weights);

    // A fenced code block pushes complexity to MODERATE → QUALITY mode →
    // code specialist first.
    let class = classify(
        "Explain step by step how this function reverses a linked list in place:\n\
         ```c\nstruct node { struct node *next; int v; };\n```",
        None,
    );
    let d = router.route(&class, &handles, HealthLabel::Healthy).unwrap();
    assert_eq!(d.handle.name(), "coder");
}
