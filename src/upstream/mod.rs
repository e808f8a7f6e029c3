pub mod breaker;
pub mod health;
pub mod http;
pub mod mock;
pub mod process;
pub mod quota;

pub use breaker::{BreakerCheck, BreakerState, BreakerStats, CircuitBreaker};
pub use quota::{QuotaSnapshot, QuotaState};

use crate::config::{TimeoutConfig, UpstreamConfig, UpstreamKind};
use crate::error::GatewayError;
use self::http::HttpUpstream;
use self::mock::MockUpstream;
use self::process::ProcessUpstream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Per-call options recognized by every adapter.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Caller-supplied wall clock in milliseconds; the effective deadline is
    /// the smaller of this and the adapter's `timeout.total_ms`.
    pub timeout_ms: Option<u64>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    /// Cancelled when the client disconnects.
    pub cancel: CancellationToken,
}

/// A completed (non-streaming) upstream response.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Completion {
    pub model: String,
    pub text: String,
    pub provider: String,
    pub duration_ms: u64,
    pub cached: bool,
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
}

/// Frames an adapter pushes into a [`StreamSink`].
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(String),
    End { duration_ms: u64 },
    Error(GatewayError),
}

/// Push-side of a streaming call. Adapters push chunks; backpressure is
/// delegated to the channel and, transitively, the I/O writer draining it.
///
/// Contract: adapters send `Chunk`/`End` only. On failure they return `Err`
/// without writing an `Error` frame — the executor decides whether to fail
/// over (nothing delivered yet) or terminate the stream (bytes on the wire).
#[derive(Clone)]
pub struct StreamSink {
    tx: mpsc::Sender<StreamEvent>,
    delivered: Arc<AtomicBool>,
    delivered_bytes: Arc<AtomicU64>,
}

impl StreamSink {
    pub fn channel(buffer: usize) -> (StreamSink, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            StreamSink {
                tx,
                delivered: Arc::new(AtomicBool::new(false)),
                delivered_bytes: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Push one content chunk. Returns `false` when the receiver is gone
    /// (client disconnected) so adapters can stop early.
    pub async fn chunk(&self, content: String) -> bool {
        if content.is_empty() {
            return true;
        }
        self.delivered.store(true, Ordering::Release);
        self.delivered_bytes
            .fetch_add(content.len() as u64, Ordering::Relaxed);
        self.tx.send(StreamEvent::Chunk(content)).await.is_ok()
    }

    pub async fn end(&self, duration_ms: u64) {
        let _ = self.tx.send(StreamEvent::End { duration_ms }).await;
    }

    pub async fn error(&self, err: GatewayError) {
        let _ = self.tx.send(StreamEvent::Error(err)).await;
    }

    /// True once any chunk has been pushed. Fallback is only legal before
    /// this flips.
    pub fn delivered(&self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }

    /// Total content bytes pushed so far. Budget accounting charges streamed
    /// responses from this after the stream completes.
    pub fn delivered_bytes(&self) -> u64 {
        self.delivered_bytes.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub ok: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Adapter variants — enum dispatch, no trait objects.
#[derive(Debug)]
pub enum Upstream {
    Http(HttpUpstream),
    Process(ProcessUpstream),
    Mock(MockUpstream),
}

impl Upstream {
    pub async fn complete(
        &self,
        prompt: &str,
        model: &str,
        opts: &CallOptions,
    ) -> Result<Completion, GatewayError> {
        match self {
            Upstream::Http(a) => a.complete(prompt, model, opts).await,
            Upstream::Process(a) => a.complete(prompt, model, opts).await,
            Upstream::Mock(a) => a.complete(prompt, model, opts).await,
        }
    }

    pub async fn complete_stream(
        &self,
        prompt: &str,
        model: &str,
        opts: &CallOptions,
        sink: &StreamSink,
    ) -> Result<(), GatewayError> {
        match self {
            Upstream::Http(a) => a.complete_stream(prompt, model, opts, sink).await,
            Upstream::Process(a) => a.complete_stream(prompt, model, opts, sink).await,
            Upstream::Mock(a) => a.complete_stream(prompt, model, opts, sink).await,
        }
    }

    pub async fn health_check(&self) -> HealthReport {
        match self {
            Upstream::Http(a) => a.health_check().await,
            Upstream::Process(a) => a.health_check().await,
            Upstream::Mock(a) => a.health_check().await,
        }
    }

    pub async fn list_models(&self) -> Vec<String> {
        match self {
            Upstream::Http(a) => a.list_models().await,
            Upstream::Process(a) => a.list_models().await,
            Upstream::Mock(a) => a.list_models().await,
        }
    }
}

/// One configured upstream: the adapter plus its quota state and breaker.
///
/// Shared read-mostly; QuotaState and the breaker guard their own mutation.
#[derive(Debug)]
pub struct UpstreamHandle {
    pub config: UpstreamConfig,
    pub adapter: Upstream,
    pub quota: QuotaState,
    pub breaker: CircuitBreaker,
}

impl UpstreamHandle {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Resolve the client-requested model through the alias map, falling back
    /// to the configured default.
    pub fn resolve_model(&self, requested: Option<&str>) -> String {
        match requested {
            Some(m) => self
                .config
                .model_aliases
                .get(m)
                .cloned()
                .unwrap_or_else(|| m.to_string()),
            None => self.config.default_model.clone(),
        }
    }

    pub fn supports_stream(&self) -> bool {
        self.config.supports_stream
    }

    /// Quota-available and not short-circuited.
    pub fn is_available(&self) -> bool {
        self.quota.is_available() && !self.breaker.is_open()
    }

    /// Effective hard wall for one call.
    pub fn effective_timeout(&self, opts: &CallOptions) -> Duration {
        let total = self.config.timeout.total_ms;
        let ms = match opts.timeout_ms {
            Some(t) => t.min(total),
            None => total,
        };
        Duration::from_millis(ms.max(1))
    }

    /// One dispatch: counts the request, applies the hard timeout, and maps a
    /// timeout onto the retryable-transport kind. Retry/backoff policy lives
    /// in the fallback executor.
    pub async fn call(
        &self,
        prompt: &str,
        opts: &CallOptions,
    ) -> Result<Completion, GatewayError> {
        self.quota.record_dispatch();
        let model = self.resolve_model(opts.model.as_deref());
        let deadline = self.effective_timeout(opts);
        match tokio::time::timeout(deadline, self.adapter.complete(prompt, &model, opts)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::TransportRetryable(format!(
                "timeout after {}ms",
                deadline.as_millis()
            ))),
        }
    }

    /// Streaming dispatch under the same hard wall.
    pub async fn call_stream(
        &self,
        prompt: &str,
        opts: &CallOptions,
        sink: &StreamSink,
    ) -> Result<(), GatewayError> {
        self.quota.record_dispatch();
        let model = self.resolve_model(opts.model.as_deref());
        let deadline = self.effective_timeout(opts);
        match tokio::time::timeout(
            deadline,
            self.adapter.complete_stream(prompt, &model, opts, sink),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::TransportRetryable(format!(
                "timeout after {}ms",
                deadline.as_millis()
            ))),
        }
    }
}

/// Registry of all configured upstreams, priority-sorted at build time.
#[derive(Clone)]
pub struct UpstreamSet {
    handles: Arc<Vec<Arc<UpstreamHandle>>>,
}

impl UpstreamSet {
    pub fn from_config(configs: &[UpstreamConfig]) -> anyhow::Result<Self> {
        let mut handles = Vec::with_capacity(configs.len());
        for cfg in configs {
            let adapter = build_adapter(cfg)?;
            handles.push(Arc::new(UpstreamHandle {
                quota: QuotaState::new(cfg.cooldown_secs, cfg.quota_window_secs),
                breaker: CircuitBreaker::new(cfg.name.clone(), cfg.breaker.clone()),
                adapter,
                config: cfg.clone(),
            }));
        }
        handles.sort_by_key(|h| h.config.priority);
        Ok(Self {
            handles: Arc::new(handles),
        })
    }

    /// Test constructor over pre-built handles.
    pub fn from_handles(mut handles: Vec<Arc<UpstreamHandle>>) -> Self {
        handles.sort_by_key(|h| h.config.priority);
        Self {
            handles: Arc::new(handles),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<UpstreamHandle>> {
        self.handles.iter().find(|h| h.name() == name).cloned()
    }

    pub fn all(&self) -> &[Arc<UpstreamHandle>] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Priority-ordered candidates that are quota-available and not
    /// short-circuited.
    pub fn available(&self) -> Vec<Arc<UpstreamHandle>> {
        self.handles
            .iter()
            .filter(|h| h.is_available())
            .cloned()
            .collect()
    }

    /// Available candidates that can stream.
    pub fn streamable_available(&self) -> Vec<Arc<UpstreamHandle>> {
        self.handles
            .iter()
            .filter(|h| h.is_available() && h.supports_stream())
            .cloned()
            .collect()
    }
}

fn build_adapter(cfg: &UpstreamConfig) -> anyhow::Result<Upstream> {
    match cfg.kind {
        UpstreamKind::Http => {
            let endpoint = cfg
                .endpoint
                .clone()
                .ok_or_else(|| anyhow::anyhow!("http upstream {} has no endpoint", cfg.name))?;
            Ok(Upstream::Http(HttpUpstream::new(
                cfg.name.clone(),
                endpoint,
                cfg.api_key.clone(),
                cfg.timeout.clone(),
            )?))
        }
        UpstreamKind::Process => {
            let command = cfg
                .command
                .clone()
                .ok_or_else(|| anyhow::anyhow!("process upstream {} has no command", cfg.name))?;
            Ok(Upstream::Process(ProcessUpstream::new(
                cfg.name.clone(),
                command,
                cfg.args.clone(),
            )))
        }
    }
}

/// Effective per-call timeouts derived from config (exposed for adapters).
pub(crate) fn connect_timeout(t: &TimeoutConfig) -> Duration {
    Duration::from_millis(t.connect_ms.max(1))
}
