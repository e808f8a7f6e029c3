use super::types::*;
use super::GatewayConfig;

fn upstream(name: &str, weight: u32) -> UpstreamConfig {
    UpstreamConfig {
        name: name.into(),
        kind: UpstreamKind::Http,
        endpoint: Some(format!("http://127.0.0.1:11434/{}", name)),
        command: None,
        args: Vec::new(),
        api_key: None,
        default_model: "test-model".into(),
        model_aliases: Default::default(),
        priority: 1,
        weight,
        quota_window_secs: 60,
        cooldown_secs: 600,
        timeout: TimeoutConfig::default(),
        supports_stream: true,
        secure: false,
        strengths: Vec::new(),
        breaker: BreakerConfig::default(),
    }
}

fn base_config(upstreams: Vec<UpstreamConfig>) -> GatewayConfig {
    GatewayConfig {
        upstreams,
        ..GatewayConfig::default()
    }
}

#[test]
fn test_parse_toml_provider_table() {
    let toml = r#"
        port = 9000
        default_provider = "ollama"

        [[upstreams]]
        name = "ollama"
        kind = "process"
        command = "ollama"
        args = ["run"]
        default_model = "llama3"
        priority = 0
        weight = 60
        cooldown_secs = 0
        secure = true
        strengths = ["local", "fast"]

        [[upstreams]]
        name = "openai"
        kind = "http"
        endpoint = "https://api.openai.com/v1"
        default_model = "gpt-4o-mini"
        priority = 1
        weight = 40
        strengths = ["strong", "code"]

        [cache]
        backend = "memory"
        ttl_secs = 120
        max_size = 50
    "#;
    let cfg: GatewayConfig = toml::from_str(toml).unwrap();
    assert_eq!(cfg.port, 9000);
    assert_eq!(cfg.upstreams.len(), 2);
    assert_eq!(cfg.upstreams[0].kind, UpstreamKind::Process);
    assert_eq!(cfg.upstreams[0].cooldown_secs, 0);
    assert!(cfg.upstreams[0].secure);
    assert_eq!(cfg.cache.ttl_secs, 120);
    cfg.validate().unwrap();
}

#[test]
fn test_validate_weights_must_sum_to_100() {
    let cfg = base_config(vec![upstream("a", 50), upstream("b", 30)]);
    let err = cfg.validate().unwrap_err().to_string();
    assert!(err.contains("sum to 100"), "unexpected error: {}", err);

    let cfg = base_config(vec![upstream("a", 50), upstream("b", 50)]);
    cfg.validate().unwrap();
}

#[test]
fn test_validate_duplicate_names() {
    let cfg = base_config(vec![upstream("a", 50), upstream("a", 50)]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_http_needs_endpoint() {
    let mut bad = upstream("a", 100);
    bad.endpoint = None;
    let cfg = base_config(vec![bad]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_unknown_default_provider() {
    let mut cfg = base_config(vec![upstream("a", 100)]);
    cfg.default_provider = Some("nope".into());
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_remote_cache_needs_url() {
    let mut cfg = base_config(vec![upstream("a", 100)]);
    cfg.cache.backend = CacheBackendKind::Remote;
    assert!(cfg.validate().is_err());
    cfg.cache.remote_url = Some("http://127.0.0.1:7379".into());
    cfg.validate().unwrap();
}

#[test]
fn test_parse_duration_secs() {
    assert_eq!(super::parse_duration_secs("3600"), Some(3600));
    assert_eq!(super::parse_duration_secs("24h"), Some(86_400));
    assert_eq!(super::parse_duration_secs("90m"), Some(5_400));
    assert_eq!(super::parse_duration_secs("bogus"), None);
}
