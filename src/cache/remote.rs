use super::memory::MemoryCache;
use crate::upstream::Completion;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

/// Remote key-value backend over an HTTP/JSON bridge (Redis REST style:
/// `GET /get/{key}`, `PUT /set/{key}?ex={ttl}`, `DELETE /del/{key}`,
/// `POST /flushall`). Values are serialized as JSON; per-entry TTL is passed
/// in seconds.
///
/// Failures degrade gracefully to an in-process store so a cache outage
/// never takes the pipeline down; the first failure logs a warning, later
/// ones stay quiet.
pub struct RemoteCache {
    base_url: String,
    client: reqwest::Client,
    fallback: MemoryCache,
    degraded_logged: AtomicBool,
}

impl RemoteCache {
    pub fn new(base_url: String, fallback_size: usize) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .no_proxy()
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            fallback: MemoryCache::new(fallback_size),
            degraded_logged: AtomicBool::new(false),
        })
    }

    fn note_degraded(&self, op: &str, err: &dyn std::fmt::Display) {
        if !self.degraded_logged.swap(true, Ordering::Relaxed) {
            warn!(
                "cache: remote backend failing, degrading to in-memory, op={}, error={}",
                op, err
            );
        }
    }

    pub async fn get(&self, key: &str) -> Option<Completion> {
        let url = format!("{}/get/{}", self.base_url, key);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().as_u16() == 404 => None,
            Ok(resp) if resp.status().is_success() => match resp.json::<Completion>().await {
                Ok(v) => Some(v),
                Err(e) => {
                    self.note_degraded("get", &e);
                    self.fallback.get(key)
                }
            },
            Ok(resp) => {
                self.note_degraded("get", &format!("status {}", resp.status()));
                self.fallback.get(key)
            }
            Err(e) => {
                self.note_degraded("get", &e);
                self.fallback.get(key)
            }
        }
    }

    pub async fn set(&self, key: &str, value: &Completion, ttl: Duration) {
        let url = format!("{}/set/{}?ex={}", self.base_url, key, ttl.as_secs().max(1));
        match self.client.put(&url).json(value).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                self.note_degraded("set", &format!("status {}", resp.status()));
                self.fallback.set(key, value.clone(), ttl);
            }
            Err(e) => {
                self.note_degraded("set", &e);
                self.fallback.set(key, value.clone(), ttl);
            }
        }
    }

    pub async fn delete(&self, key: &str) {
        let url = format!("{}/del/{}", self.base_url, key);
        if let Err(e) = self.client.delete(&url).send().await {
            self.note_degraded("del", &e);
        }
        self.fallback.delete(key);
    }

    pub async fn clear(&self) -> usize {
        let url = format!("{}/flushall", self.base_url);
        let remote_cleared = match self.client.post(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("cleared").and_then(|n| n.as_u64()))
                .unwrap_or(0) as usize,
            Ok(resp) => {
                self.note_degraded("clear", &format!("status {}", resp.status()));
                0
            }
            Err(e) => {
                self.note_degraded("clear", &e);
                0
            }
        };
        remote_cleared + self.fallback.clear()
    }

    pub async fn len(&self) -> usize {
        let url = format!("{}/dbsize", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("size").and_then(|n| n.as_u64()))
                .unwrap_or(0) as usize,
            _ => self.fallback.len(),
        }
    }
}
