use crate::cache::{cache_key, ResponseCache, ANY_PROVIDER};
use crate::classify::PrivacyLevel;
use crate::config::RetryConfig;
use crate::error::{GatewayError, ProviderFailure};
use crate::observe::{Inspector, TraceStage};
use crate::upstream::{BreakerCheck, CallOptions, Completion, StreamSink, UpstreamHandle, UpstreamSet};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One execution request flowing through the fallback chain.
pub struct ExecRequest<'a> {
    pub prompt: &'a str,
    pub opts: &'a CallOptions,
    /// Router's pick; tried first, ahead of the priority order.
    pub primary: Option<Arc<UpstreamHandle>>,
    pub cache: Option<&'a ResponseCache>,
    pub use_cache: bool,
    pub privacy: PrivacyLevel,
    pub request_id: &'a str,
    pub inspector: Option<&'a Inspector>,
}

/// Drives the router's first pick and cascades through the priority order on
/// quota and transport errors. Retry with backoff happens inside a single
/// upstream attempt; quota errors advance immediately after starting that
/// upstream's cooldown.
pub struct FallbackExecutor {
    upstreams: UpstreamSet,
    retry: RetryConfig,
    request_timeout: Duration,
}

impl FallbackExecutor {
    pub fn new(upstreams: UpstreamSet, retry: RetryConfig, request_timeout_ms: u64) -> Self {
        Self {
            upstreams,
            retry,
            request_timeout: Duration::from_millis(request_timeout_ms.max(1)),
        }
    }

    pub fn upstreams(&self) -> &UpstreamSet {
        &self.upstreams
    }

    /// Non-streaming execution: cache lookup, candidate walk, write-through.
    pub async fn execute(&self, req: ExecRequest<'_>) -> Result<Completion, GatewayError> {
        let model_label = req.opts.model.clone().unwrap_or_else(|| "default".into());
        let key = cache_key(ANY_PROVIDER, &model_label, req.prompt, req.privacy);

        if req.use_cache {
            if let Some(cache) = req.cache {
                if let Some(hit) = cache.get(&key).await {
                    metrics::counter!("gateway_cache_events_total", "result" => "hit")
                        .increment(1);
                    trace(&req, TraceStage::CacheHit, serde_json::json!({ "key": key }));
                    return Ok(hit);
                }
                metrics::counter!("gateway_cache_events_total", "result" => "miss").increment(1);
                trace(&req, TraceStage::CacheMiss, serde_json::json!({ "key": key }));
            }
        }

        let candidates = self.candidates(req.primary.clone(), false);
        if candidates.is_empty() {
            return Err(GatewayError::AllQuotasExhausted);
        }

        let deadline = Instant::now() + self.request_timeout;
        let mut failures: Vec<ProviderFailure> = Vec::new();

        for (i, handle) in candidates.iter().enumerate() {
            if i > 0 {
                trace(
                    &req,
                    TraceStage::Fallback,
                    serde_json::json!({ "to": handle.name(), "attempted": i }),
                );
            }

            let start = Instant::now();
            match self.attempt(handle, req.prompt, req.opts, deadline).await {
                Ok(completion) => {
                    let elapsed = start.elapsed();
                    metrics::counter!(
                        "gateway_upstream_requests_total",
                        "provider" => handle.name().to_string(),
                        "result" => "success",
                    )
                    .increment(1);
                    metrics::histogram!(
                        "gateway_upstream_request_duration_seconds",
                        "provider" => handle.name().to_string(),
                    )
                    .record(elapsed.as_secs_f64());

                    if req.use_cache {
                        if let Some(cache) = req.cache {
                            cache.set(&key, &completion, None).await;
                        }
                    }
                    return Ok(completion);
                }
                Err(err) => {
                    metrics::counter!(
                        "gateway_upstream_requests_total",
                        "provider" => handle.name().to_string(),
                        "result" => error_label(&err),
                    )
                    .increment(1);
                    trace(
                        &req,
                        TraceStage::UpstreamError,
                        serde_json::json!({
                            "provider": handle.name(),
                            "error": err.to_string(),
                        }),
                    );
                    tracing::warn!(
                        "executor: upstream failed, provider={}, request_id={}, error={}",
                        handle.name(),
                        req.request_id,
                        err
                    );
                    failures.push(ProviderFailure {
                        provider: handle.name().to_string(),
                        error: err.to_string(),
                    });
                    if !err.is_fallback_eligible() {
                        return Err(err);
                    }
                }
            }
        }

        Err(GatewayError::AllProvidersFailed(failures))
    }

    /// Streaming execution. Fails over only while nothing has reached the
    /// sink; after the first delivered chunk an error terminates the stream.
    /// Returns the provider that served the stream.
    pub async fn execute_stream(
        &self,
        req: ExecRequest<'_>,
        sink: &StreamSink,
    ) -> Result<String, GatewayError> {
        let candidates = self.candidates(req.primary.clone(), true);
        if candidates.is_empty() {
            return Err(GatewayError::AllQuotasExhausted);
        }

        let mut failures: Vec<ProviderFailure> = Vec::new();

        for handle in &candidates {
            match handle.breaker.check() {
                BreakerCheck::Rejected => {
                    failures.push(ProviderFailure {
                        provider: handle.name().to_string(),
                        error: "circuit open".into(),
                    });
                    continue;
                }
                BreakerCheck::Allowed | BreakerCheck::Probe => {}
            }

            match handle.call_stream(req.prompt, req.opts, sink).await {
                Ok(()) => {
                    handle.breaker.record_success();
                    metrics::counter!(
                        "gateway_upstream_requests_total",
                        "provider" => handle.name().to_string(),
                        "result" => "success",
                    )
                    .increment(1);
                    return Ok(handle.name().to_string());
                }
                Err(err) => {
                    self.record_failure_state(handle, &err);
                    trace(
                        &req,
                        TraceStage::UpstreamError,
                        serde_json::json!({
                            "provider": handle.name(),
                            "error": err.to_string(),
                            "mid_stream": sink.delivered(),
                        }),
                    );
                    if sink.delivered() {
                        // Bytes are on the wire; no restart is observable.
                        sink.error(err.clone()).await;
                        return Err(err);
                    }
                    failures.push(ProviderFailure {
                        provider: handle.name().to_string(),
                        error: err.to_string(),
                    });
                    if !err.is_fallback_eligible() {
                        return Err(err);
                    }
                }
            }
        }

        Err(GatewayError::AllProvidersFailed(failures))
    }

    /// Priority-ordered candidate list with the router's pick in front.
    fn candidates(
        &self,
        primary: Option<Arc<UpstreamHandle>>,
        streaming: bool,
    ) -> Vec<Arc<UpstreamHandle>> {
        let pool = if streaming {
            self.upstreams.streamable_available()
        } else {
            self.upstreams.available()
        };
        match primary {
            Some(p) => {
                let mut out = Vec::with_capacity(pool.len());
                if pool.iter().any(|h| h.name() == p.name()) {
                    out.push(p.clone());
                }
                out.extend(pool.into_iter().filter(|h| h.name() != p.name()));
                out
            }
            None => pool,
        }
    }

    /// One upstream attempt: breaker gate, call, and backoff-retry for
    /// retryable transport errors within the remaining request budget.
    async fn attempt(
        &self,
        handle: &Arc<UpstreamHandle>,
        prompt: &str,
        opts: &CallOptions,
        deadline: Instant,
    ) -> Result<Completion, GatewayError> {
        let mut attempt: u32 = 0;
        loop {
            if let BreakerCheck::Rejected = handle.breaker.check() {
                return Err(GatewayError::CircuitOpen(handle.name().to_string()));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GatewayError::TransportRetryable(
                    "timeout: request budget exhausted".into(),
                ));
            }

            let mut call_opts = opts.clone();
            let cap = remaining.as_millis() as u64;
            call_opts.timeout_ms = Some(match opts.timeout_ms {
                Some(t) => t.min(cap),
                None => cap,
            });

            match handle.call(prompt, &call_opts).await {
                Ok(completion) => {
                    handle.breaker.record_success();
                    return Ok(completion);
                }
                Err(err) => {
                    self.record_failure_state(handle, &err);
                    if err.is_retryable() && attempt < self.retry.max_retries {
                        let delay = self.backoff_delay(attempt);
                        if delay < deadline.saturating_duration_since(Instant::now()) {
                            metrics::counter!(
                                "gateway_upstream_retries_total",
                                "provider" => handle.name().to_string(),
                            )
                            .increment(1);
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Update quota/breaker state for one failed call.
    fn record_failure_state(&self, handle: &Arc<UpstreamHandle>, err: &GatewayError) {
        match err {
            GatewayError::Quota(msg) => {
                // Quota exhaustion cools the upstream down; it is not a
                // breaker-visible fault.
                handle.quota.mark_exhausted(msg);
            }
            GatewayError::TransportRetryable(msg) => {
                if msg.contains("timeout") {
                    handle.breaker.record_timeout();
                } else {
                    handle.breaker.record_failure();
                }
                handle.quota.record_error(msg);
            }
            GatewayError::CircuitOpen(_) => {}
            other => {
                handle.breaker.record_failure();
                handle.quota.record_error(&other.to_string());
            }
        }
    }

    /// `base · 2^attempt` capped at `max_delay`, plus jitter ≤ 10%.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.retry.base_delay_ms.max(1);
        let exp = base.saturating_mul(1u64 << attempt.min(16));
        let capped = exp.min(self.retry.max_delay_ms.max(base));
        let jitter = rand::thread_rng().gen_range(0..=capped / 10);
        Duration::from_millis(capped + jitter)
    }
}

fn error_label(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::Quota(_) => "quota",
        GatewayError::TransportRetryable(_) => "transport",
        GatewayError::CircuitOpen(_) => "circuit_open",
        GatewayError::Upstream(_) => "upstream_error",
        _ => "error",
    }
}

fn trace(req: &ExecRequest<'_>, stage: TraceStage, data: serde_json::Value) {
    if let Some(inspector) = req.inspector {
        inspector.record(req.request_id, stage, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheBackendKind, CacheConfig};
    use crate::testutil::{handle_from, mock_config};
    use crate::upstream::mock::{MockBehavior, MockUpstream};
    use crate::upstream::StreamEvent;

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

    fn req<'a>(prompt: &'a str, opts: &'a CallOptions) -> ExecRequest<'a> {
        ExecRequest {
            prompt,
            opts,
            primary: None,
            cache: None,
            use_cache: false,
            privacy: PrivacyLevel::Public,
            request_id: "test0000",
            inspector: None,
        }
    }

    fn prio(name: &str, priority: i32, mock: MockUpstream) -> Arc<UpstreamHandle> {
        let mut cfg = mock_config(name);
        cfg.priority = priority;
        handle_from(cfg, mock)
    }

    #[tokio::test]
    async fn test_success_on_first_candidate() {
        let a = prio("a", 0, MockUpstream::new("a").with_text("from a"));
        let b = prio("b", 1, MockUpstream::new("b").with_text("from b"));
        let ex = executor(vec![a, b]);
        let opts = CallOptions::default();
        let c = ex.execute(req("hi", &opts)).await.unwrap();
        assert_eq!(c.provider, "a");
        assert_eq!(c.text, "from a");
    }

    #[tokio::test]
    async fn test_quota_error_cools_down_and_falls_over() {
        let mock_a = MockUpstream::new("a");
        mock_a.push(MockBehavior::Quota("429 too many requests".into()));
        let a = prio("a", 0, mock_a);
        let b = prio("b", 1, MockUpstream::new("b").with_text("from b"));
        let a_handle = a.clone();
        let ex = executor(vec![a, b]);
        let opts = CallOptions::default();

        let c = ex.execute(req("hi", &opts)).await.unwrap();
        assert_eq!(c.provider, "b");

        // Primary is now cooling down.
        assert!(!a_handle.quota.is_available());
        let snap = a_handle.quota.snapshot();
        assert!(snap.cooldown_remaining_secs.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_transport_error_retries_then_falls_over() {
        let mock_a = MockUpstream::new("a");
        // max_retries = 1, so two transport errors exhaust upstream a.
        mock_a.push(MockBehavior::Transport("econnreset".into()));
        mock_a.push(MockBehavior::Transport("econnreset".into()));
        let a = prio("a", 0, mock_a);
        let b = prio("b", 1, MockUpstream::new("b").with_text("from b"));
        let a_handle = a.clone();
        let ex = executor(vec![a, b]);
        let opts = CallOptions::default();

        let c = ex.execute(req("hi", &opts)).await.unwrap();
        assert_eq!(c.provider, "b");
        // Both attempts hit upstream a.
        if let crate::upstream::Upstream::Mock(m) = &a_handle.adapter {
            assert_eq!(m.calls(), 2);
        }
    }

    #[tokio::test]
    async fn test_all_providers_failed_carries_errors() {
        let mock_a = MockUpstream::new("a");
        mock_a.push(MockBehavior::Fail("model exploded".into()));
        let mock_b = MockUpstream::new("b");
        mock_b.push(MockBehavior::Quota("quota".into()));
        let ex = executor(vec![prio("a", 0, mock_a), prio("b", 1, mock_b)]);
        let opts = CallOptions::default();

        let err = ex.execute(req("hi", &opts)).await.unwrap_err();
        match err {
            GatewayError::AllProvidersFailed(failures) => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].provider, "a");
                assert_eq!(failures[1].provider, "b");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exhausted_pool_is_all_quotas() {
        let a = prio("a", 0, MockUpstream::new("a"));
        a.quota.mark_exhausted("quota");
        let ex = executor(vec![a]);
        let opts = CallOptions::default();
        let err = ex.execute(req("hi", &opts)).await.unwrap_err();
        assert!(matches!(err, GatewayError::AllQuotasExhausted));
    }

    #[tokio::test]
    async fn test_primary_tried_first_despite_priority() {
        let a = prio("a", 0, MockUpstream::new("a").with_text("from a"));
        let b = prio("b", 9, MockUpstream::new("b").with_text("from b"));
        let primary = b.clone();
        let ex = executor(vec![a, b]);
        let opts = CallOptions::default();
        let mut r = req("hi", &opts);
        r.primary = Some(primary);
        let c = ex.execute(r).await.unwrap();
        assert_eq!(c.provider, "b");
    }

    #[tokio::test]
    async fn test_cache_hit_short_circuits() {
        let mock_a = MockUpstream::new("a").with_text("fresh");
        let a = prio("a", 0, mock_a);
        let a_handle = a.clone();
        let ex = executor(vec![a]);
        let cache = ResponseCache::from_config(&CacheConfig {
            backend: CacheBackendKind::Memory,
            ttl_secs: 60,
            max_size: 10,
            remote_url: None,
        })
        .unwrap();
        let opts = CallOptions::default();

        let mut r1 = req("ping", &opts);
        r1.cache = Some(&cache);
        r1.use_cache = true;
        let first = ex.execute(r1).await.unwrap();
        assert!(!first.cached);

        let mut r2 = req("ping", &opts);
        r2.cache = Some(&cache);
        r2.use_cache = true;
        let second = ex.execute(r2).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.text, "fresh");

        // Upstream was only called once.
        if let crate::upstream::Upstream::Mock(m) = &a_handle.adapter {
            assert_eq!(m.calls(), 1);
        }
        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_stream_fallback_before_first_chunk() {
        let mock_a = MockUpstream::new("a");
        mock_a.push(MockBehavior::Transport("econnrefused".into()));
        let a = prio("a", 0, mock_a);
        let b = prio("b", 1, MockUpstream::new("b").with_text("streamed text"));
        let ex = executor(vec![a, b]);
        let opts = CallOptions::default();
        let (sink, mut rx) = StreamSink::channel(32);

        let provider = ex.execute_stream(req("hi", &opts), &sink).await.unwrap();
        assert_eq!(provider, "b");
        drop(sink);

        let mut text = String::new();
        let mut ended = false;
        while let Some(ev) = rx.recv().await {
            match ev {
                StreamEvent::Chunk(c) => text.push_str(&c),
                StreamEvent::End { .. } => ended = true,
                StreamEvent::Error(e) => panic!("unexpected stream error: {}", e),
            }
        }
        assert_eq!(text, "streamed text");
        assert!(ended);
    }

    #[tokio::test]
    async fn test_stream_only_considers_streamable() {
        let mut cfg = mock_config("nostream");
        cfg.supports_stream = false;
        let a = handle_from(cfg, MockUpstream::new("nostream"));
        let ex = executor(vec![a]);
        let opts = CallOptions::default();
        let (sink, _rx) = StreamSink::channel(4);
        let err = ex.execute_stream(req("hi", &opts), &sink).await.unwrap_err();
        assert!(matches!(err, GatewayError::AllQuotasExhausted));
    }
}
