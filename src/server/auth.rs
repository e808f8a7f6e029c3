use crate::config::AuthConfig;
use crate::error::GatewayError;

/// Outcome of bearer-key authentication for a generation endpoint.
#[derive(Debug)]
pub struct AuthedKey {
    /// Key used for rate-limit and budget accounting. Anonymous traffic
    /// shares one bucket.
    pub rate_key: String,
}

/// Extract the bearer token from an Authorization header value.
fn bearer(header: Option<&str>) -> Option<&str> {
    header?.strip_prefix("Bearer ").map(str::trim)
}

/// Check a generation request's key against the configured set. Public
/// endpoints never call this.
pub fn authenticate(config: &AuthConfig, authorization: Option<&str>) -> Result<AuthedKey, GatewayError> {
    let token = bearer(authorization);

    if !config.api_key_required {
        return Ok(AuthedKey {
            rate_key: token.unwrap_or("anonymous").to_string(),
        });
    }

    match token {
        Some(t) if config.api_keys.iter().any(|k| k == t) => Ok(AuthedKey {
            rate_key: t.to_string(),
        }),
        Some(_) => Err(GatewayError::Auth("invalid API key".into())),
        None => Err(GatewayError::Auth("missing Authorization bearer key".into())),
    }
}

/// Admin surfaces require the dedicated admin key.
pub fn authenticate_admin(config: &AuthConfig, authorization: Option<&str>) -> Result<(), GatewayError> {
    let Some(ref admin_key) = config.admin_key else {
        return Err(GatewayError::Auth("admin surface disabled".into()));
    };
    match bearer(authorization) {
        Some(t) if t == admin_key => Ok(()),
        _ => Err(GatewayError::Auth("admin key required".into())),
    }
}
