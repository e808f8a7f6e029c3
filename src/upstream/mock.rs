use super::{CallOptions, Completion, HealthReport, StreamSink};
use crate::error::GatewayError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Scriptable in-process upstream for tests and local smoke runs.
///
/// Behaviors queue in FIFO order; once drained, every call answers with the
/// default text. Not wired into `build_adapter` — mock handles are built
/// directly where needed.
#[derive(Debug)]
pub struct MockUpstream {
    name: String,
    default_text: String,
    delay: Duration,
    script: Mutex<VecDeque<MockBehavior>>,
    calls: AtomicU64,
}

#[derive(Debug, Clone)]
pub enum MockBehavior {
    Respond(String),
    Quota(String),
    Transport(String),
    Fail(String),
}

impl MockUpstream {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_text: "mock response".into(),
            delay: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.default_text = text.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue one scripted behavior for the next call.
    pub fn push(&self, behavior: MockBehavior) {
        self.script.lock().unwrap().push_back(behavior);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn next_text(&self) -> Result<String, GatewayError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            None => Ok(self.default_text.clone()),
            Some(MockBehavior::Respond(text)) => Ok(text),
            Some(MockBehavior::Quota(msg)) => Err(GatewayError::Quota(msg)),
            Some(MockBehavior::Transport(msg)) => Err(GatewayError::TransportRetryable(msg)),
            Some(MockBehavior::Fail(msg)) => Err(GatewayError::Upstream(msg)),
        }
    }

    pub async fn complete(
        &self,
        _prompt: &str,
        model: &str,
        _opts: &CallOptions,
    ) -> Result<Completion, GatewayError> {
        let start = Instant::now();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let text = self.next_text()?;
        Ok(Completion {
            model: model.to_string(),
            text,
            provider: self.name.clone(),
            duration_ms: start.elapsed().as_millis() as u64,
            cached: false,
            prompt_tokens: Some(8),
            completion_tokens: Some(16),
        })
    }

    /// Stream the response as word-sized chunks.
    pub async fn complete_stream(
        &self,
        _prompt: &str,
        _model: &str,
        _opts: &CallOptions,
        sink: &StreamSink,
    ) -> Result<(), GatewayError> {
        let start = Instant::now();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let text = self.next_text()?;
        for word in text.split_inclusive(' ') {
            if !sink.chunk(word.to_string()).await {
                return Ok(());
            }
        }
        sink.end(start.elapsed().as_millis() as u64).await;
        Ok(())
    }

    pub async fn health_check(&self) -> HealthReport {
        HealthReport {
            ok: true,
            latency_ms: 0,
            error: None,
        }
    }

    pub async fn list_models(&self) -> Vec<String> {
        vec![format!("{}-model", self.name)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::StreamEvent;

    #[tokio::test]
    async fn test_default_response() {
        let m = MockUpstream::new("m").with_text("hello");
        let c = m.complete("p", "mod", &CallOptions::default()).await.unwrap();
        assert_eq!(c.text, "hello");
        assert_eq!(m.calls(), 1);
    }

    #[tokio::test]
    async fn test_scripted_failure_then_default() {
        let m = MockUpstream::new("m").with_text("ok");
        m.push(MockBehavior::Quota("429".into()));
        let err = m
            .complete("p", "mod", &CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Quota(_)));
        let c = m.complete("p", "mod", &CallOptions::default()).await.unwrap();
        assert_eq!(c.text, "ok");
    }

    #[tokio::test]
    async fn test_stream_concatenation_matches_text() {
        let m = MockUpstream::new("m").with_text("one two three");
        let (sink, mut rx) = StreamSink::channel(16);
        m.complete_stream("p", "mod", &CallOptions::default(), &sink)
            .await
            .unwrap();
        assert_eq!(sink.delivered_bytes() as usize, "one two three".len());
        drop(sink);
        let mut out = String::new();
        while let Some(ev) = rx.recv().await {
            if let StreamEvent::Chunk(c) = ev {
                out.push_str(&c);
            }
        }
        assert_eq!(out, "one two three");
    }
}
