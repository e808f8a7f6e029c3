use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

/// Pipeline stage markers attached to trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceStage {
    RequestReceived,
    Validated,
    Sanitized,
    AuthPassed,
    RateLimit,
    Classified,
    CacheHit,
    CacheMiss,
    PrivacyFilter,
    RouteSelected,
    UpstreamCall,
    UpstreamError,
    Fallback,
    ResponseSent,
    ShadowDispatched,
    JudgeVerdict,
    WeightsUpdated,
    Error,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TraceEvent {
    pub request_id: String,
    pub timestamp_ms: u64,
    pub stage: TraceStage,
    pub data: serde_json::Value,
}

/// In-memory ring of trace events with live fan-out to subscribers.
///
/// The ring keeps the last `capacity` events for the admin surface;
/// the broadcast channel serves live tails. Sends never block and slow
/// subscribers lose events rather than slowing the pipeline.
pub struct Inspector {
    capacity: usize,
    ring: Mutex<VecDeque<TraceEvent>>,
    tx: broadcast::Sender<TraceEvent>,
}

impl Inspector {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            capacity: capacity.max(1),
            ring: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            tx,
        }
    }

    pub fn record(&self, request_id: &str, stage: TraceStage, data: serde_json::Value) {
        let event = TraceEvent {
            request_id: request_id.to_string(),
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            stage,
            data,
        };

        {
            let mut ring = self.ring.lock().unwrap();
            if ring.len() >= self.capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        let _ = self.tx.send(event);
    }

    /// Most recent events, oldest first, capped at `limit`.
    pub fn recent(&self, limit: usize) -> Vec<TraceEvent> {
        let ring = self.ring.lock().unwrap();
        ring.iter()
            .skip(ring.len().saturating_sub(limit))
            .cloned()
            .collect()
    }

    /// Events belonging to one request, oldest first.
    pub fn for_request(&self, request_id: &str) -> Vec<TraceEvent> {
        let ring = self.ring.lock().unwrap();
        ring.iter()
            .filter(|e| e.request_id == request_id)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TraceEvent> {
        self.tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
