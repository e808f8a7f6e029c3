use crate::classify::TaskType;
use crate::config::ShadowConfig;
use crate::observe::{Inspector, TraceStage};
use crate::upstream::{CallOptions, Completion, UpstreamHandle, UpstreamSet};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, serde::Serialize)]
pub struct ShadowSide {
    pub provider: String,
    pub response: String,
    pub duration_ms: u64,
}

/// A (prompt, primary, shadow) tuple awaiting judgement.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ShadowComparison {
    pub request_id: String,
    pub prompt: String,
    pub task_type: TaskType,
    pub primary: ShadowSide,
    pub shadow: ShadowSide,
    pub timestamp_unix: u64,
}

/// Samples a fraction of primary successes and mirrors them to alternate
/// upstreams off the request path. Completed pairs land in a bounded queue
/// drained by the judge; overflow drops the oldest pair.
pub struct ShadowRouter {
    config: ShadowConfig,
    upstreams: UpstreamSet,
    queue: Mutex<VecDeque<ShadowComparison>>,
}

impl ShadowRouter {
    pub fn new(config: ShadowConfig, upstreams: UpstreamSet) -> Self {
        Self {
            config,
            upstreams,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Roll the sampling dice for one primary success.
    pub fn should_sample(&self) -> bool {
        self.config.enabled && rand::thread_rng().gen::<f64>() < self.config.rate
    }

    /// Shadow targets for a primary: distinct, available, not excluded,
    /// capped at `max_concurrent`.
    pub fn pick_targets(&self, primary_provider: &str) -> Vec<Arc<UpstreamHandle>> {
        self.upstreams
            .available()
            .into_iter()
            .filter(|h| h.name() != primary_provider)
            .filter(|h| !self.config.exclude.iter().any(|e| e == h.name()))
            .take(self.config.max_concurrent)
            .collect()
    }

    /// Mirror one primary success. Spawns detached tasks; never awaited on
    /// the caller's critical path.
    pub fn dispatch(
        self: &Arc<Self>,
        request_id: String,
        prompt: String,
        task_type: TaskType,
        primary: &Completion,
        inspector: Option<Arc<Inspector>>,
    ) {
        let targets = self.pick_targets(&primary.provider);
        if targets.is_empty() {
            return;
        }

        if let Some(ins) = &inspector {
            ins.record(
                &request_id,
                TraceStage::ShadowDispatched,
                serde_json::json!({
                    "primary": primary.provider,
                    "targets": targets.iter().map(|t| t.name()).collect::<Vec<_>>(),
                }),
            );
        }

        let primary_side = ShadowSide {
            provider: primary.provider.clone(),
            response: primary.text.clone(),
            duration_ms: primary.duration_ms,
        };

        for target in targets {
            let this = Arc::clone(self);
            let request_id = request_id.clone();
            let prompt = prompt.clone();
            let primary_side = primary_side.clone();
            let inspector = inspector.clone();

            tokio::spawn(async move {
                let opts = CallOptions::default();
                match target.call(&prompt, &opts).await {
                    Ok(completion) => {
                        this.enqueue(ShadowComparison {
                            request_id,
                            prompt,
                            task_type,
                            primary: primary_side,
                            shadow: ShadowSide {
                                provider: completion.provider,
                                response: completion.text,
                                duration_ms: completion.duration_ms,
                            },
                            timestamp_unix: now_unix(),
                        });
                        metrics::counter!(
                            "gateway_shadow_calls_total",
                            "provider" => target.name().to_string(),
                            "result" => "success",
                        )
                        .increment(1);
                    }
                    Err(err) => {
                        // Shadow failures are never user-visible.
                        tracing::debug!(
                            "shadow: call failed, provider={}, request_id={}, error={}",
                            target.name(),
                            request_id,
                            err
                        );
                        metrics::counter!(
                            "gateway_shadow_calls_total",
                            "provider" => target.name().to_string(),
                            "result" => "error",
                        )
                        .increment(1);
                        if let Some(ins) = inspector {
                            ins.record(
                                &request_id,
                                TraceStage::Error,
                                serde_json::json!({
                                    "subsystem": "shadow",
                                    "provider": target.name(),
                                    "error": err.to_string(),
                                }),
                            );
                        }
                    }
                }
            });
        }
    }

    pub(crate) fn enqueue(&self, comparison: ShadowComparison) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.config.queue_capacity {
            queue.pop_front();
            metrics::counter!("gateway_shadow_queue_dropped_total").increment(1);
        }
        queue.push_back(comparison);
    }

    /// Hand up to `limit` comparisons to the judge.
    pub fn drain(&self, limit: usize) -> Vec<ShadowComparison> {
        let mut queue = self.queue.lock().unwrap();
        let take = limit.min(queue.len());
        queue.drain(..take).collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
