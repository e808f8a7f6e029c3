use std::fmt;

/// Error taxonomy for the request pipeline.
///
/// Kinds map to HTTP statuses in the controller; `Quota`, `CircuitOpen` and
/// `TransportRetryable` are absorbed by the fallback executor and only become
/// user-visible when every upstream has failed.
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Malformed request payload. Surfaced as 400, never retried.
    Validation(String),
    /// Missing or invalid API key. 401/403, never retried.
    Auth(String),
    /// Local limiter rejected the request. 429 with Retry-After.
    RateLimited { retry_after_secs: u64 },
    /// Per-key token/cost budget would be breached. 429.
    BudgetExceeded(String),
    /// Upstream-reported exhaustion (rate limit / quota class). Triggers the
    /// upstream's cooldown and fallback to the next candidate.
    Quota(String),
    /// Network / timeout / 5xx — retried with backoff inside one attempt.
    TransportRetryable(String),
    /// Deterministic upstream failure (bad request to the model, etc.).
    Upstream(String),
    /// Upstream short-circuited. Treated like Quota for fallback purposes but
    /// without touching QuotaState.
    CircuitOpen(String),
    /// Sanitizer matched a BLOCKED pattern. 400 with PROMPT_INJECTION_BLOCKED.
    PromptBlocked(String),
    /// The router found no eligible candidate (privacy filter, empty pool).
    NoProvider(String),
    /// Every candidate upstream is quota-exhausted or cooling down.
    AllQuotasExhausted,
    /// Every candidate upstream was attempted and failed.
    AllProvidersFailed(Vec<ProviderFailure>),
    /// Anything uncaught. 500, logged with the request ID.
    Internal(String),
}

/// One entry of the per-upstream error list carried by `AllProvidersFailed`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: String,
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Validation(msg) => write!(f, "validation error: {}", msg),
            GatewayError::Auth(msg) => write!(f, "auth error: {}", msg),
            GatewayError::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry after {}s", retry_after_secs)
            }
            GatewayError::BudgetExceeded(msg) => write!(f, "budget exceeded: {}", msg),
            GatewayError::Quota(msg) => write!(f, "upstream quota exhausted: {}", msg),
            GatewayError::TransportRetryable(msg) => write!(f, "transport error: {}", msg),
            GatewayError::Upstream(msg) => write!(f, "upstream error: {}", msg),
            GatewayError::CircuitOpen(provider) => {
                write!(f, "circuit open for provider {}", provider)
            }
            GatewayError::PromptBlocked(pattern) => {
                write!(f, "prompt blocked by pattern: {}", pattern)
            }
            GatewayError::NoProvider(reason) => write!(f, "{}", reason),
            GatewayError::AllQuotasExhausted => write!(f, "all provider quotas exhausted"),
            GatewayError::AllProvidersFailed(errors) => {
                write!(f, "all providers failed ({} attempted)", errors.len())
            }
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Textual markers that classify an upstream error as quota exhaustion.
const QUOTA_MARKERS: &[&str] = &[
    "rate limit",
    "quota",
    "too many requests",
    "429",
    "capacity",
    "exceeded",
];

/// Textual markers that classify an upstream error as retryable transport.
const RETRYABLE_MARKERS: &[&str] = &["timeout", "econnreset", "econnrefused", "network", "5xx"];

/// Classify a raw upstream error string into the pipeline taxonomy.
///
/// Quota markers win over transport markers: "rate limit exceeded after
/// timeout" must cool the upstream down rather than burn retries against it.
pub fn classify_upstream_error(raw: &str) -> GatewayError {
    let lower = raw.to_lowercase();
    if QUOTA_MARKERS.iter().any(|m| lower.contains(m)) {
        return GatewayError::Quota(raw.to_string());
    }
    if RETRYABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        return GatewayError::TransportRetryable(raw.to_string());
    }
    GatewayError::Upstream(raw.to_string())
}

/// Classify an HTTP status from an upstream response body path.
pub fn classify_upstream_status(status: u16, body: &str) -> GatewayError {
    if status == 429 {
        return GatewayError::Quota(format!("429: {}", body));
    }
    if (500..600).contains(&status) {
        return GatewayError::TransportRetryable(format!("5xx ({}): {}", status, body));
    }
    classify_upstream_error(&format!("{}: {}", status, body))
}

impl GatewayError {
    /// True for errors the fallback executor should absorb by advancing to
    /// the next upstream.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            GatewayError::Quota(_)
                | GatewayError::TransportRetryable(_)
                | GatewayError::Upstream(_)
                | GatewayError::CircuitOpen(_)
        )
    }

    /// True for errors retried with backoff inside a single upstream attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::TransportRetryable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_classification() {
        for raw in [
            "Rate limit reached for gpt-4",
            "quota exhausted",
            "Too Many Requests",
            "HTTP 429",
            "at capacity, try later",
            "monthly allowance exceeded",
        ] {
            assert!(
                matches!(classify_upstream_error(raw), GatewayError::Quota(_)),
                "expected quota for: {}",
                raw
            );
        }
    }

    #[test]
    fn test_retryable_classification() {
        for raw in ["connect timeout", "ECONNRESET", "network unreachable"] {
            assert!(
                matches!(
                    classify_upstream_error(raw),
                    GatewayError::TransportRetryable(_)
                ),
                "expected retryable for: {}",
                raw
            );
        }
    }

    #[test]
    fn test_quota_wins_over_transport() {
        let e = classify_upstream_error("rate limit exceeded after timeout");
        assert!(matches!(e, GatewayError::Quota(_)));
    }

    #[test]
    fn test_deterministic_upstream_error() {
        let e = classify_upstream_error("model not found");
        assert!(matches!(e, GatewayError::Upstream(_)));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_upstream_status(429, ""),
            GatewayError::Quota(_)
        ));
        assert!(matches!(
            classify_upstream_status(503, "overloaded"),
            GatewayError::TransportRetryable(_)
        ));
        assert!(matches!(
            classify_upstream_status(400, "bad prompt"),
            GatewayError::Upstream(_)
        ));
    }
}
