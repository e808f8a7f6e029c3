pub mod memory;
pub mod remote;

use crate::classify::PrivacyLevel;
use crate::config::{CacheBackendKind, CacheConfig};
use crate::upstream::Completion;
use memory::MemoryCache;
use remote::RemoteCache;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Provider component of a cache key when the caller wants a cross-upstream
/// lookup.
pub const ANY_PROVIDER: &str = "any";

/// Derive the content-addressed cache key:
/// `SHA-256(provider ':' model ':' prompt)`, hex-encoded.
///
/// Non-PUBLIC prompts get their privacy class mixed into the key material so
/// a response produced under secure-only routing is never shared with the
/// general pool.
pub fn cache_key(provider: &str, model: &str, prompt: &str, privacy: PrivacyLevel) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update(b":");
    hasher.update(model.as_bytes());
    hasher.update(b":");
    hasher.update(prompt.as_bytes());
    if privacy != PrivacyLevel::Public {
        hasher.update(b":");
        hasher.update(privacy.as_str().as_bytes());
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

enum Backend {
    Memory(MemoryCache),
    Remote(RemoteCache),
}

/// Cross-upstream response cache: TTL + LRU, hit/miss accounting, pluggable
/// backend.
pub struct ResponseCache {
    backend: Backend,
    default_ttl: Duration,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn from_config(config: &CacheConfig) -> anyhow::Result<Self> {
        let default_ttl = Duration::from_secs(config.ttl_secs);
        let backend = match config.backend {
            CacheBackendKind::Memory => Backend::Memory(MemoryCache::new(config.max_size)),
            CacheBackendKind::Remote => {
                let url = config
                    .remote_url
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("remote cache requires a URL"))?;
                Backend::Remote(RemoteCache::new(url, config.max_size)?)
            }
        };
        Ok(Self {
            backend,
            default_ttl,
            max_size: config.max_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub async fn get(&self, key: &str) -> Option<Completion> {
        let found = match &self.backend {
            Backend::Memory(m) => m.get(key),
            Backend::Remote(r) => r.get(key).await,
        };
        match found {
            Some(mut completion) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                completion.cached = true;
                Some(completion)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &Completion, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        match &self.backend {
            Backend::Memory(m) => m.set(key, value.clone(), ttl),
            Backend::Remote(r) => r.set(key, value, ttl).await,
        }
    }

    pub async fn delete(&self, key: &str) {
        match &self.backend {
            Backend::Memory(m) => m.delete(key),
            Backend::Remote(r) => r.delete(key).await,
        }
    }

    /// Drop every entry, returning how many were cleared.
    pub async fn clear(&self) -> usize {
        match &self.backend {
            Backend::Memory(m) => m.clear(),
            Backend::Remote(r) => r.clear().await,
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let size = match &self.backend {
            Backend::Memory(m) => m.len(),
            Backend::Remote(r) => r.len().await,
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            size,
            max_size: self.max_size,
            ttl_secs: self.default_ttl.as_secs(),
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}
