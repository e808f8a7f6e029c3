use super::auth::{authenticate, authenticate_admin};
use super::openai::{
    assemble_prompt, completion_response, error_envelope, estimate_tokens, unix_now,
    ChatCompletionRequest,
};
use super::sse::{full_body, sse_body, sse_response, BoxBody, SseDialect};
use super::GatewayState;
use crate::classify::{classify, Classification, PrivacyLevel, TaskType};
use crate::error::GatewayError;
use crate::limit::budget::Usage;
use crate::limit::RateDecision;
use crate::observe::TraceStage;
use crate::pipeline::executor::ExecRequest;
use crate::pipeline::sanitize;
use crate::plugin::{HookContext, HookPoint};
use crate::routing::RouteDecision;
use crate::upstream::{CallOptions, Completion, StreamSink, UpstreamHandle};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Top-level request dispatch. One phased lifecycle per generation request:
/// validate → sanitize → auth → rate-limit → budget → classify → cache →
/// route → execute (fallback) → shadow → shape.
pub async fn handle(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let request_id = new_request_id();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let started = Instant::now();

    state.active_requests.fetch_add(1, Ordering::Relaxed);
    metrics::gauge!("gateway_http_requests_in_flight").increment(1.0);

    let response = route(req, &state, &request_id, &query).await;

    state.active_requests.fetch_sub(1, Ordering::Relaxed);
    metrics::gauge!("gateway_http_requests_in_flight").decrement(1.0);

    let resp = match response {
        Ok(r) => r,
        Err(r) => r,
    };

    metrics::counter!(
        "gateway_http_requests_total",
        "method" => method.to_string(),
        "path" => path.clone(),
        "status" => resp.status().as_u16().to_string(),
    )
    .increment(1);
    metrics::histogram!("gateway_http_request_duration_seconds")
        .record(started.elapsed().as_secs_f64());

    tracing::info!(
        method = %method,
        path = %path,
        status = resp.status().as_u16(),
        request_id = %request_id,
        latency_ms = %started.elapsed().as_millis(),
        "access"
    );

    Ok(resp)
}

/// 8-hex prefix of a UUIDv4.
fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

type Routed = Result<Response<BoxBody>, Response<BoxBody>>;

async fn route(
    req: Request<Incoming>,
    state: &GatewayState,
    request_id: &str,
    query: &str,
) -> Routed {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let authorization = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    match (method.as_str(), path.as_str()) {
        ("GET", "/health") => handle_health(state, query).await,
        ("GET", "/metrics") => Ok(text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            state.metrics.render(),
        )),
        ("GET", "/v1/models") => handle_models(state),
        ("GET", "/api/tags") => handle_tags(state),
        ("GET", "/api/cache/stats") => Ok(json_response(
            StatusCode::OK,
            &serde_json::to_value(state.cache.stats().await).unwrap_or_default(),
        )),
        ("POST", "/api/cache/clear") => {
            let cleared = state.cache.clear().await;
            Ok(json_response(
                StatusCode::OK,
                &serde_json::json!({ "cleared": cleared }),
            ))
        }
        ("GET", "/api/quota") => handle_quota(state),
        ("POST", "/api/quota/reset") => handle_quota_reset(req, state).await,
        ("GET", "/api/evaluation/comparisons") => {
            admin(state, authorization.as_deref())?;
            Ok(json_response(
                StatusCode::OK,
                &serde_json::json!({ "pending": state.shadow.queue_len() }),
            ))
        }
        ("GET", "/api/evaluation/metrics") => {
            admin(state, authorization.as_deref())?;
            Ok(json_response(
                StatusCode::OK,
                &serde_json::to_value(state.collector.aggregate()).unwrap_or_default(),
            ))
        }
        ("GET", "/api/evaluation/weights") => {
            admin(state, authorization.as_deref())?;
            Ok(json_response(
                StatusCode::OK,
                &serde_json::to_value(&*state.weights.snapshot()).unwrap_or_default(),
            ))
        }
        ("POST", "/api/evaluation/weights/update") => {
            admin(state, authorization.as_deref())?;
            let report = state.optimizer.run_once();
            state.inspector.record(
                request_id,
                TraceStage::WeightsUpdated,
                serde_json::json!({ "changes": report.changes.len() }),
            );
            Ok(json_response(
                StatusCode::OK,
                &serde_json::to_value(report).unwrap_or_default(),
            ))
        }
        ("GET", "/api/traces") => {
            admin(state, authorization.as_deref())?;
            Ok(json_response(
                StatusCode::OK,
                &serde_json::to_value(state.inspector.recent(200)).unwrap_or_default(),
            ))
        }
        ("POST", "/api/generate") => {
            handle_generate(req, state, request_id, authorization.as_deref(), true).await
        }
        ("POST", "/api/smart") => {
            handle_generate(req, state, request_id, authorization.as_deref(), false).await
        }
        ("POST", "/v1/chat/completions") => {
            handle_chat_completions(req, state, request_id, authorization.as_deref()).await
        }
        _ => Ok(json_response(
            StatusCode::NOT_FOUND,
            &serde_json::json!({ "error": "not found" }),
        )),
    }
}

fn admin(state: &GatewayState, authorization: Option<&str>) -> Result<(), Response<BoxBody>> {
    authenticate_admin(&state.config.auth, authorization).map_err(|_| {
        json_response(
            StatusCode::FORBIDDEN,
            &serde_json::json!({ "error": "admin key required" }),
        )
    })
}

// ---------------------------------------------------------------------------
// Generation endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GenerateBody {
    #[serde(default)]
    provider: Option<String>,
    prompt: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    options: GenerateOptions,
    #[serde(default)]
    stream: bool,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateOptions {
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default, alias = "maxTokens")]
    max_tokens: Option<u32>,
    #[serde(default, alias = "useCache")]
    use_cache: Option<bool>,
    #[serde(default, alias = "taskType")]
    task_type: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
}

/// Everything the shared pipeline needs for one generation request.
struct PipelineArgs {
    prompt: String,
    provider_override: Option<String>,
    model: Option<String>,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    timeout_ms: Option<u64>,
    use_cache: bool,
    task_override: Option<TaskType>,
    rate_key: String,
    endpoint: &'static str,
}

async fn handle_generate(
    req: Request<Incoming>,
    state: &GatewayState,
    request_id: &str,
    authorization: Option<&str>,
    allow_provider_override: bool,
) -> Routed {
    let endpoint = if allow_provider_override {
        "/api/generate"
    } else {
        "/api/smart"
    };
    let started = Instant::now();
    state.inspector.record(
        request_id,
        TraceStage::RequestReceived,
        serde_json::json!({ "endpoint": endpoint }),
    );

    let body: GenerateBody = parse_body(req, state, request_id, started).await?;
    if body.prompt.trim().is_empty() {
        return Err(error_response(
            state,
            request_id,
            started,
            &GatewayError::Validation("prompt must be a non-empty string".into()),
            None,
        ));
    }
    state
        .inspector
        .record(request_id, TraceStage::Validated, serde_json::json!({}));

    let mut args = PipelineArgs {
        prompt: body.prompt,
        provider_override: if allow_provider_override {
            body.provider
        } else {
            None
        },
        model: body.model,
        temperature: body.options.temperature,
        max_tokens: body.options.max_tokens,
        timeout_ms: body.options.timeout,
        use_cache: body.options.use_cache.unwrap_or(true),
        task_override: body.options.task_type.as_deref().and_then(TaskType::parse),
        rate_key: String::new(),
        endpoint,
    };

    let decision = front_checks(state, request_id, authorization, &mut args, started).await?;

    if body.stream {
        run_stream(state, request_id, args, SseDialectKind::Native, decision).await
    } else {
        let (completion, _task) =
            run_unary(state, request_id, &args, started, decision.as_ref()).await?;
        let payload = serde_json::json!({
            "model": completion.model,
            "created_at": unix_now(),
            "response": completion.text,
            "done": true,
            "total_duration": completion.duration_ms * 1_000_000,
            "provider": completion.provider,
            "cached": completion.cached,
            "request_id": request_id,
        });
        Ok(with_rate_headers(
            json_response(StatusCode::OK, &payload),
            state,
            decision.as_ref(),
        ))
    }
}

async fn handle_chat_completions(
    req: Request<Incoming>,
    state: &GatewayState,
    request_id: &str,
    authorization: Option<&str>,
) -> Routed {
    let started = Instant::now();
    state.inspector.record(
        request_id,
        TraceStage::RequestReceived,
        serde_json::json!({ "endpoint": "/v1/chat/completions" }),
    );

    let body: ChatCompletionRequest = parse_openai_body(req, request_id).await?;
    if body.messages.is_empty() {
        return Err(openai_error(
            StatusCode::BAD_REQUEST,
            "messages must be a non-empty array",
            "invalid_request_error",
        ));
    }

    let prompt = assemble_prompt(&body.messages);
    let mut args = PipelineArgs {
        prompt,
        provider_override: None,
        model: body.model,
        temperature: body.temperature,
        max_tokens: body.max_tokens,
        timeout_ms: None,
        use_cache: true,
        task_override: None,
        rate_key: String::new(),
        endpoint: "/v1/chat/completions",
    };

    let decision = match front_checks(state, request_id, authorization, &mut args, started).await {
        Ok(d) => d,
        Err(resp) => {
            // Reshape the native error body into the OpenAI envelope.
            let status = resp.status();
            return Err(openai_error(
                status,
                &format!("request rejected ({})", status.as_u16()),
                if status == StatusCode::UNAUTHORIZED {
                    "authentication_error"
                } else if status == StatusCode::TOO_MANY_REQUESTS {
                    "rate_limit_error"
                } else {
                    "invalid_request_error"
                },
            ));
        }
    };

    if body.stream {
        run_stream(state, request_id, args, SseDialectKind::OpenAi, decision).await
    } else {
        let prompt_copy = args.prompt.clone();
        match run_unary(state, request_id, &args, started, decision.as_ref()).await {
            Ok((completion, _)) => {
                let payload = completion_response(request_id, &completion, &prompt_copy);
                Ok(with_rate_headers(
                    json_response(StatusCode::OK, &payload),
                    state,
                    decision.as_ref(),
                ))
            }
            Err(resp) => {
                let status = resp.status();
                Err(openai_error(
                    status,
                    &format!("upstream pipeline failed ({})", status.as_u16()),
                    "api_error",
                ))
            }
        }
    }
}

/// Sanitize → auth → rate limit → budget. Mutates `args` with the sanitized
/// prompt and accounting key; returns the rate decision for headers.
async fn front_checks(
    state: &GatewayState,
    request_id: &str,
    authorization: Option<&str>,
    args: &mut PipelineArgs,
    started: Instant,
) -> Result<Option<RateDecision>, Response<BoxBody>> {
    // Sanitizer
    let outcome = sanitize(&args.prompt);
    if let Some(pattern) = outcome.blocked {
        state.inspector.record(
            request_id,
            TraceStage::Sanitized,
            serde_json::json!({ "blocked": pattern }),
        );
        return Err(error_response(
            state,
            request_id,
            started,
            &GatewayError::PromptBlocked(pattern.to_string()),
            None,
        ));
    }
    state.inspector.record(
        request_id,
        TraceStage::Sanitized,
        serde_json::json!({ "suspicious": outcome.suspicious }),
    );
    args.prompt = outcome.text;

    // Auth
    let authed = match authenticate(&state.config.auth, authorization) {
        Ok(a) => a,
        Err(err) => {
            return Err(error_response(state, request_id, started, &err, None));
        }
    };
    state
        .inspector
        .record(request_id, TraceStage::AuthPassed, serde_json::json!({}));
    args.rate_key = authed.rate_key;

    // Rate limit
    let decision = state.limiter.increment(&args.rate_key, 1).await;
    state.inspector.record(
        request_id,
        TraceStage::RateLimit,
        serde_json::json!({ "allowed": decision.allowed, "remaining": decision.remaining }),
    );
    if !decision.allowed {
        metrics::counter!("gateway_rate_limit_rejected_total").increment(1);
        let err = GatewayError::RateLimited {
            retry_after_secs: decision.retry_after_secs,
        };
        return Err(error_response(
            state,
            request_id,
            started,
            &err,
            Some(&decision),
        ));
    }

    // Budget gate: a key over its period budget is denied before execution.
    if state.budget.is_exhausted(&args.rate_key) {
        metrics::counter!("gateway_budget_denied_total").increment(1);
        let err = GatewayError::BudgetExceeded("period budget exhausted".into());
        return Err(error_response(
            state,
            request_id,
            started,
            &err,
            Some(&decision),
        ));
    }

    // Plugins may rewrite the prompt (context injection).
    let mut ctx = HookContext::new(request_id, args.endpoint, (*state.config).context.clone());
    ctx.prompt = Some(args.prompt.clone());
    state.plugins.execute(HookPoint::OnRequest, &mut ctx);
    state.plugins.execute(HookPoint::OnPrompt, &mut ctx);
    if let Some(p) = ctx.prompt {
        args.prompt = p;
    }

    Ok(Some(decision))
}

/// Classify and route. Returns the primary handle for the executor.
fn resolve_route(
    state: &GatewayState,
    request_id: &str,
    args: &PipelineArgs,
) -> Result<(Classification, Option<Arc<UpstreamHandle>>, TaskType), GatewayError> {
    let class = classify(&args.prompt, args.task_override);
    state.inspector.record(
        request_id,
        TraceStage::Classified,
        serde_json::json!({
            "task_type": class.task_type.as_str(),
            "complexity": class.complexity.category.as_str(),
            "privacy": class.privacy.as_str(),
        }),
    );

    if class.privacy != PrivacyLevel::Public {
        state.inspector.record(
            request_id,
            TraceStage::PrivacyFilter,
            serde_json::json!({
                "reason": format!("Content is {}", class.privacy.as_str()),
            }),
        );
    }

    if let Some(ref name) = args.provider_override {
        let handle = state
            .upstreams
            .get(name)
            .ok_or_else(|| GatewayError::Validation(format!("unknown provider: {}", name)))?;
        let task = class.task_type;
        return Ok((class, Some(handle), task));
    }

    let decision: RouteDecision = state
        .router
        .route(&class, &state.upstreams.available(), state.monitor.label())
        .map_err(|rej| GatewayError::NoProvider(rej.reason))?;

    state.inspector.record(
        request_id,
        TraceStage::RouteSelected,
        serde_json::json!({
            "provider": decision.handle.name(),
            "strategy": decision.strategy,
            "rationale": decision.rationale,
        }),
    );

    let task = decision.task_type;
    Ok((class, Some(decision.handle), task))
}

fn call_options(args: &PipelineArgs, cancel: CancellationToken) -> CallOptions {
    CallOptions {
        model: args.model.clone(),
        temperature: args.temperature,
        max_tokens: args.max_tokens,
        timeout_ms: args.timeout_ms,
        user_id: Some(args.rate_key.clone()),
        session_id: None,
        metadata: None,
        cancel,
    }
}

/// Shared unary path: route, execute with fallback, account, shadow.
async fn run_unary(
    state: &GatewayState,
    request_id: &str,
    args: &PipelineArgs,
    started: Instant,
    rate: Option<&RateDecision>,
) -> Result<(Completion, TaskType), Response<BoxBody>> {
    let (class, primary, task) = match resolve_route(state, request_id, args) {
        Ok(v) => v,
        Err(err) => return Err(error_response(state, request_id, started, &err, rate)),
    };

    let opts = call_options(args, CancellationToken::new());
    let exec = ExecRequest {
        prompt: &args.prompt,
        opts: &opts,
        primary,
        cache: Some(&state.cache),
        use_cache: args.use_cache,
        privacy: class.privacy,
        request_id,
        inspector: Some(&state.inspector),
    };

    match state.executor.execute(exec).await {
        Ok(completion) => {
            account_and_shadow(state, request_id, args, &completion, task, &class);
            state.inspector.record(
                request_id,
                TraceStage::ResponseSent,
                serde_json::json!({
                    "provider": completion.provider,
                    "cached": completion.cached,
                    "duration_ms": started.elapsed().as_millis() as u64,
                }),
            );
            Ok((completion, task))
        }
        Err(err) => Err(error_response(state, request_id, started, &err, rate)),
    }
}

/// Post-success bookkeeping: budget charge, response hooks, shadow dispatch.
/// Never blocks the response path.
fn account_and_shadow(
    state: &GatewayState,
    request_id: &str,
    args: &PipelineArgs,
    completion: &Completion,
    task: TaskType,
    class: &Classification,
) {
    if state.budget.enabled() && !completion.cached {
        let prompt_tokens = completion
            .prompt_tokens
            .unwrap_or_else(|| estimate_tokens(&args.prompt));
        let completion_tokens = completion
            .completion_tokens
            .unwrap_or_else(|| estimate_tokens(&completion.text));
        // The served response stays served; a breach here flips the key's
        // gate for the next request.
        let _ = state.budget.record_usage(
            &args.rate_key,
            Usage {
                prompt_tokens,
                completion_tokens,
                model: &completion.model,
                provider: &completion.provider,
            },
        );
    }

    let mut ctx = HookContext::new(request_id, args.endpoint, (*state.config).context.clone());
    ctx.response = Some(completion.clone());
    state.plugins.execute(HookPoint::OnResponse, &mut ctx);

    // Shadow sampling happens only for fresh primary successes; a cache hit
    // exercised no upstream.
    if !completion.cached && class.privacy == PrivacyLevel::Public && state.shadow.should_sample() {
        state.shadow.dispatch(
            request_id.to_string(),
            args.prompt.clone(),
            task,
            completion,
            Some(state.inspector.clone()),
        );
    }
}

/// Budget charge for a streamed response: token counts are estimated from
/// the prompt and the bytes the sink actually delivered. Mirrors the unary
/// path's post-success charge; a breach flips the key's gate for the next
/// request.
fn charge_stream_usage(
    state: &GatewayState,
    args: &PipelineArgs,
    provider: &str,
    delivered_bytes: u64,
) {
    if !state.budget.enabled() || delivered_bytes == 0 {
        return;
    }
    let model = state
        .upstreams
        .get(provider)
        .map(|h| h.resolve_model(args.model.as_deref()))
        .or_else(|| args.model.clone())
        .unwrap_or_else(|| "default".into());
    let _ = state.budget.record_usage(
        &args.rate_key,
        Usage {
            prompt_tokens: estimate_tokens(&args.prompt),
            completion_tokens: delivered_bytes.div_ceil(4),
            model: &model,
            provider,
        },
    );
}

enum SseDialectKind {
    Native,
    OpenAi,
}

/// Shared streaming path. The response commits immediately; the executor
/// feeds the sink from a detached task, and dropping the body cancels it.
async fn run_stream(
    state: &GatewayState,
    request_id: &str,
    args: PipelineArgs,
    dialect: SseDialectKind,
    rate: Option<RateDecision>,
) -> Routed {
    let started = Instant::now();
    let (class, primary, _task) = match resolve_route(state, request_id, &args) {
        Ok(v) => v,
        Err(err) => return Err(error_response(state, request_id, started, &err, rate.as_ref())),
    };

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let opts = call_options(&args, cancel);
    let (sink, rx) = StreamSink::channel(64);

    let model_label = args.model.clone().unwrap_or_else(|| "default".into());

    {
        let state = state.clone();
        let request_id = request_id.to_string();
        let sink_task = sink.clone();
        tokio::spawn(async move {
            let exec = ExecRequest {
                prompt: &args.prompt,
                opts: &opts,
                primary,
                cache: None,
                use_cache: false,
                privacy: class.privacy,
                request_id: &request_id,
                inspector: Some(&state.inspector),
            };
            match state.executor.execute_stream(exec, &sink_task).await {
                Ok(provider) => {
                    charge_stream_usage(&state, &args, &provider, sink_task.delivered_bytes());
                    state.inspector.record(
                        &request_id,
                        TraceStage::ResponseSent,
                        serde_json::json!({ "provider": provider, "stream": true }),
                    );
                }
                Err(err) => {
                    if sink_task.delivered() {
                        // The executor already wrote the error frame. An
                        // aborted stream still charges what reached the wire;
                        // nothing more accrues after cancellation.
                        charge_stream_usage(&state, &args, "aborted", sink_task.delivered_bytes());
                    } else {
                        // Nothing on the wire yet: surface the failure as the
                        // stream's only event.
                        sink_task.error(err).await;
                    }
                }
            }
        });
    }

    let sse_dialect = match dialect {
        SseDialectKind::Native => SseDialect::Native,
        SseDialectKind::OpenAi => SseDialect::OpenAi {
            id: format!("chatcmpl-{}", request_id),
            model: model_label,
            created: unix_now(),
        },
    };

    let body = sse_body(rx, sse_dialect, Some(guard));
    Ok(with_rate_headers(
        sse_response(request_id, body),
        state,
        rate.as_ref(),
    ))
}

// ---------------------------------------------------------------------------
// Introspection endpoints
// ---------------------------------------------------------------------------

async fn handle_health(state: &GatewayState, query: &str) -> Routed {
    let deep = query.contains("deep=true");
    let sample = state.monitor.current();
    let cache_stats = state.cache.stats().await;

    let available: Vec<String> = state
        .upstreams
        .available()
        .iter()
        .map(|h| h.name().to_string())
        .collect();

    let providers: Vec<serde_json::Value> = state
        .upstreams
        .all()
        .iter()
        .map(|h| {
            serde_json::json!({
                "name": h.name(),
                "available": h.is_available(),
                "breaker": h.breaker.current_state(),
            })
        })
        .collect();

    let healthy = sample.label == crate::observe::HealthLabel::Healthy && !available.is_empty();

    let mut payload = serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": state.uptime_secs(),
        "providers": providers,
        "cache": {
            "size": cache_stats.size,
            "maxSize": cache_stats.max_size,
            "hitRate": cache_stats.hit_rate,
        },
        "activeRequests": state.active_requests.load(Ordering::Relaxed),
        "availableProviders": available,
        "defaultProvider": state.config.default_provider,
        "system": &*sample,
    });

    if deep {
        let reports = crate::upstream::health::run_health_checks(&state.upstreams).await;
        let deep_results: serde_json::Map<String, serde_json::Value> = reports
            .into_iter()
            .map(|(name, report)| (name, serde_json::to_value(report).unwrap_or_default()))
            .collect();
        payload["deepCheck"] = serde_json::Value::Object(deep_results);
    }

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(json_response(status, &payload))
}

fn handle_models(state: &GatewayState) -> Routed {
    let created = unix_now();
    let mut data = Vec::new();
    for handle in state.upstreams.all() {
        let mut names = vec![handle.config.default_model.clone()];
        names.extend(handle.config.model_aliases.keys().cloned());
        names.sort();
        names.dedup();
        for name in names {
            data.push(serde_json::json!({
                "id": name,
                "object": "model",
                "created": created,
                "owned_by": handle.name(),
            }));
        }
    }
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({ "object": "list", "data": data }),
    ))
}

fn handle_tags(state: &GatewayState) -> Routed {
    let models: Vec<serde_json::Value> = state
        .upstreams
        .all()
        .iter()
        .map(|h| {
            serde_json::json!({
                "name": h.config.default_model,
                "model": h.config.default_model,
                "details": { "provider": h.name() },
            })
        })
        .collect();
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({ "models": models }),
    ))
}

fn handle_quota(state: &GatewayState) -> Routed {
    let snapshots: serde_json::Map<String, serde_json::Value> = state
        .upstreams
        .all()
        .iter()
        .map(|h| {
            (
                h.name().to_string(),
                serde_json::json!({
                    "quota": h.quota.snapshot(),
                    "breaker": h.breaker.stats(),
                }),
            )
        })
        .collect();
    Ok(json_response(
        StatusCode::OK,
        &serde_json::Value::Object(snapshots),
    ))
}

#[derive(Deserialize)]
struct QuotaResetBody {
    #[serde(default)]
    provider: Option<String>,
}

async fn handle_quota_reset(req: Request<Incoming>, state: &GatewayState) -> Routed {
    let bytes = read_body(req).await?;
    let body: QuotaResetBody = if bytes.is_empty() {
        QuotaResetBody { provider: None }
    } else {
        serde_json::from_slice(&bytes).map_err(|e| {
            json_response(
                StatusCode::BAD_REQUEST,
                &serde_json::json!({ "error": format!("invalid JSON: {}", e) }),
            )
        })?
    };

    match body.provider {
        Some(name) => match state.upstreams.get(&name) {
            Some(handle) => {
                handle.quota.reset();
                Ok(json_response(
                    StatusCode::OK,
                    &serde_json::json!({ "success": true, "provider": name }),
                ))
            }
            None => Err(json_response(
                StatusCode::BAD_REQUEST,
                &serde_json::json!({ "error": format!("unknown provider: {}", name) }),
            )),
        },
        None => {
            for handle in state.upstreams.all() {
                handle.quota.reset();
            }
            Ok(json_response(
                StatusCode::OK,
                &serde_json::json!({ "success": true, "provider": "all" }),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Body and response plumbing
// ---------------------------------------------------------------------------

async fn read_body(req: Request<Incoming>) -> Result<bytes::Bytes, Response<BoxBody>> {
    if let Some(len) = req
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if len > MAX_BODY_BYTES {
            return Err(json_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &serde_json::json!({ "error": "payload too large" }),
            ));
        }
    }
    match req.into_body().collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(_) => Err(json_response(
            StatusCode::BAD_REQUEST,
            &serde_json::json!({ "error": "failed to read request body" }),
        )),
    }
}

async fn parse_body<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
    state: &GatewayState,
    request_id: &str,
    started: Instant,
) -> Result<T, Response<BoxBody>> {
    let bytes = read_body(req).await?;
    serde_json::from_slice(&bytes).map_err(|e| {
        error_response(
            state,
            request_id,
            started,
            &GatewayError::Validation(format!("invalid JSON body: {}", e)),
            None,
        )
    })
}

async fn parse_openai_body<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
    _request_id: &str,
) -> Result<T, Response<BoxBody>> {
    let bytes = read_body(req).await?;
    serde_json::from_slice(&bytes).map_err(|e| {
        openai_error(
            StatusCode::BAD_REQUEST,
            &format!("invalid request body: {}", e),
            "invalid_request_error",
        )
    })
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(value.to_string()))
        .unwrap_or_else(|_| Response::new(full_body("{}")))
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", content_type)
        .body(full_body(body))
        .unwrap_or_else(|_| Response::new(full_body("")))
}

fn openai_error(status: StatusCode, message: &str, kind: &str) -> Response<BoxBody> {
    json_response(status, &error_envelope(message, kind, status.as_u16()))
}

fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::Validation(_) | GatewayError::PromptBlocked(_) => StatusCode::BAD_REQUEST,
        GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
        GatewayError::RateLimited { .. } | GatewayError::BudgetExceeded(_) => {
            StatusCode::TOO_MANY_REQUESTS
        }
        GatewayError::NoProvider(_) | GatewayError::AllQuotasExhausted => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Native error envelope: `{error, code?, request_id, duration, errors?}`.
fn error_response(
    state: &GatewayState,
    request_id: &str,
    started: Instant,
    err: &GatewayError,
    rate: Option<&RateDecision>,
) -> Response<BoxBody> {
    let status = status_for(err);

    let mut payload = serde_json::json!({
        "error": err.to_string(),
        "request_id": request_id,
        "duration": started.elapsed().as_millis() as u64,
    });
    if let GatewayError::PromptBlocked(_) = err {
        payload["code"] = serde_json::json!("PROMPT_INJECTION_BLOCKED");
    }
    if let GatewayError::AllProvidersFailed(failures) = err {
        payload["errors"] = serde_json::to_value(failures).unwrap_or_default();
    }

    if status.is_server_error() {
        tracing::error!(request_id = %request_id, error = %err, "pipeline error");
    }
    state.inspector.record(
        request_id,
        TraceStage::Error,
        serde_json::json!({ "error": err.to_string(), "status": status.as_u16() }),
    );

    let mut resp = json_response(status, &payload);
    if let GatewayError::RateLimited { retry_after_secs } = err {
        if let Ok(v) = retry_after_secs.to_string().parse() {
            resp.headers_mut().insert("retry-after", v);
        }
    }
    with_rate_headers(resp, state, rate)
}

/// Attach the standard rate-limit headers to any response that consulted the
/// limiter.
fn with_rate_headers(
    mut resp: Response<BoxBody>,
    state: &GatewayState,
    decision: Option<&RateDecision>,
) -> Response<BoxBody> {
    let Some(d) = decision else {
        return resp;
    };
    let headers = resp.headers_mut();
    let policy = format!("{};w={}", d.limit, state.limiter.window_secs());
    for (name, value) in [
        ("ratelimit-limit", d.limit.to_string()),
        ("ratelimit-remaining", d.remaining.to_string()),
        ("ratelimit-reset", d.reset_at.to_string()),
        ("ratelimit-policy", policy),
    ] {
        if let Ok(v) = value.parse() {
            headers.insert(name, v);
        }
    }
    resp
}
