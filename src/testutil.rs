//! Shared helpers for in-crate unit tests.

use crate::config::{BreakerConfig, TimeoutConfig, UpstreamConfig, UpstreamKind};
use crate::upstream::{mock::MockUpstream, CircuitBreaker, QuotaState, Upstream, UpstreamHandle};
use std::sync::Arc;

pub fn mock_config(name: &str) -> UpstreamConfig {
    UpstreamConfig {
        name: name.into(),
        kind: UpstreamKind::Http,
        endpoint: Some("http://unused".into()),
        command: None,
        args: Vec::new(),
        api_key: None,
        default_model: format!("{}-model", name),
        model_aliases: Default::default(),
        priority: 0,
        weight: 0,
        quota_window_secs: 60,
        cooldown_secs: 600,
        timeout: TimeoutConfig::default(),
        supports_stream: true,
        secure: false,
        strengths: Vec::new(),
        breaker: BreakerConfig::default(),
    }
}

pub fn handle_from(config: UpstreamConfig, mock: MockUpstream) -> Arc<UpstreamHandle> {
    Arc::new(UpstreamHandle {
        quota: QuotaState::new(config.cooldown_secs, config.quota_window_secs),
        breaker: CircuitBreaker::new(config.name.clone(), config.breaker.clone()),
        adapter: Upstream::Mock(mock),
        config,
    })
}

pub fn mock_handle(name: &str) -> Arc<UpstreamHandle> {
    handle_from(mock_config(name), MockUpstream::new(name))
}
