pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — the provider table must then come entirely from env or the
    /// process fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            // Deserializing the empty document applies every serde default.
            toml::from_str("")?
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            "config: loaded, upstreams={}, cache_backend={:?}",
            config.upstreams.len(),
            config.cache.backend
        );
        Ok(config)
    }

    /// Apply environment variable overrides. The provider table itself is
    /// file-only; env vars tune the subsystems around it.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PORT") {
            if let Ok(n) = v.parse() {
                self.port = n;
            }
        }
        if let Ok(v) = std::env::var("DEFAULT_PROVIDER") {
            self.default_provider = Some(v);
        }
        if let Ok(v) = std::env::var("REQUEST_TIMEOUT") {
            if let Ok(n) = v.parse() {
                self.request_timeout_ms = n;
            }
        }

        // Cache
        if let Ok(v) = std::env::var("CACHE_BACKEND") {
            self.cache.backend = match v.as_str() {
                "remote" => CacheBackendKind::Remote,
                _ => CacheBackendKind::Memory,
            };
        }
        if let Ok(v) = std::env::var("CACHE_TTL") {
            if let Ok(n) = v.parse() {
                self.cache.ttl_secs = n;
            }
        }
        if let Ok(v) = std::env::var("CACHE_MAX_SIZE") {
            if let Ok(n) = v.parse() {
                self.cache.max_size = n;
            }
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            self.cache.remote_url = Some(v);
        }

        // Auth
        if let Ok(v) = std::env::var("API_KEY_REQUIRED") {
            self.auth.api_key_required = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("API_KEY") {
            if !self.auth.api_keys.contains(&v) {
                self.auth.api_keys.push(v);
            }
        }
        if let Ok(v) = std::env::var("ADMIN_KEY") {
            self.auth.admin_key = Some(v);
        }

        // Rate limiter
        if let Ok(v) = std::env::var("RATE_LIMIT_WINDOW_MS") {
            if let Ok(n) = v.parse() {
                self.rate_limit.window_ms = n;
            }
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_MAX_REQUESTS") {
            if let Ok(n) = v.parse() {
                self.rate_limit.max_requests = n;
            }
        }

        // Shadow sampling
        if let Ok(v) = std::env::var("ENABLE_SHADOW") {
            self.shadow.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("SHADOW_RATE") {
            if let Ok(n) = v.parse() {
                self.shadow.rate = n;
            }
        }
        if let Ok(v) = std::env::var("SHADOW_MAX_CONCURRENT") {
            if let Ok(n) = v.parse() {
                self.shadow.max_concurrent = n;
            }
        }
        if let Ok(v) = std::env::var("SHADOW_EXCLUDE") {
            self.shadow.exclude = v.split(',').map(|s| s.trim().to_string()).collect();
        }

        // Judge
        if let Ok(v) = std::env::var("ENABLE_JUDGE") {
            self.judge.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("JUDGE_PROVIDER") {
            self.judge.provider = Some(v);
        }
        if let Ok(v) = std::env::var("JUDGE_MODEL") {
            self.judge.model = Some(v);
        }

        // Weight optimizer
        if let Ok(v) = std::env::var("ENABLE_WEIGHT_OPTIMIZER") {
            self.optimizer.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("WEIGHT_UPDATE_INTERVAL") {
            if let Some(secs) = parse_duration_secs(&v) {
                self.optimizer.update_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("MIN_COMPARISONS_FOR_UPDATE") {
            if let Ok(n) = v.parse() {
                self.optimizer.min_comparisons = n;
            }
        }
        if let Ok(v) = std::env::var("WEIGHT_LEARNING_RATE") {
            if let Ok(n) = v.parse() {
                self.optimizer.learning_rate = n;
            }
        }

        // Plugin-facing context settings
        if let Ok(v) = std::env::var("CONTEXT_INJECTION_ENABLED") {
            self.context.injection_enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("MAX_CONTEXT_CHUNKS") {
            if let Ok(n) = v.parse() {
                self.context.max_chunks = n;
            }
        }
        if let Ok(v) = std::env::var("CONTEXT_RELEVANCE_THRESHOLD") {
            if let Ok(n) = v.parse() {
                self.context.relevance_threshold = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.upstreams.is_empty() {
            anyhow::bail!("no upstreams configured");
        }

        let mut seen = std::collections::HashSet::new();
        for up in &self.upstreams {
            if !seen.insert(up.name.as_str()) {
                anyhow::bail!("duplicate upstream name: {}", up.name);
            }
            match up.kind {
                UpstreamKind::Http => {
                    if up.endpoint.is_none() {
                        anyhow::bail!("http upstream {} has no endpoint", up.name);
                    }
                }
                UpstreamKind::Process => {
                    if up.command.is_none() {
                        anyhow::bail!("process upstream {} has no command", up.name);
                    }
                }
            }
            if up.weight > 100 {
                anyhow::bail!("upstream {} weight {} exceeds 100", up.name, up.weight);
            }
        }

        let weight_sum: u32 = self.upstreams.iter().map(|u| u.weight).sum();
        if weight_sum != 100 {
            anyhow::bail!("upstream weights must sum to 100, got {}", weight_sum);
        }

        if let Some(ref dp) = self.default_provider {
            if !self.upstreams.iter().any(|u| &u.name == dp) {
                anyhow::bail!("default_provider {} is not a configured upstream", dp);
            }
        }

        if self.cache.backend == CacheBackendKind::Remote && self.cache.remote_url.is_none() {
            anyhow::bail!("cache.backend = remote requires REDIS_URL / cache.remote_url");
        }

        if !(0.0..=1.0).contains(&self.shadow.rate) {
            anyhow::bail!("shadow.rate must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.router.ai_routing_rate) {
            anyhow::bail!("router.ai_routing_rate must be within [0, 1]");
        }
        if self.optimizer.min_weight > self.optimizer.max_weight {
            anyhow::bail!("optimizer.min_weight exceeds max_weight");
        }

        Ok(())
    }

    pub fn upstream(&self, name: &str) -> Option<&UpstreamConfig> {
        self.upstreams.iter().find(|u| u.name == name)
    }
}

/// Parse "24h" / "90m" style durations (humantime) or a bare seconds count.
fn parse_duration_secs(v: &str) -> Option<u64> {
    if let Ok(n) = v.parse::<u64>() {
        return Some(n);
    }
    humantime::parse_duration(v).ok().map(|d| d.as_secs())
}
