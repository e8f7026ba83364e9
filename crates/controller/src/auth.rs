use axum::http::HeaderMap;

use crate::config::AgentAuthMode;
use crate::error::AppError;

/// Agent identity header trusted in `header` auth mode (development).
pub const AGENT_ID_HEADER: &str = "x-agent-id";
/// Client-certificate common name forwarded by the TLS terminator in
/// `mtls` auth mode.
pub const CLIENT_CERT_CN_HEADER: &str = "x-client-cert-cn";

pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?;
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Requires the configured admin bearer token. An empty configured token
/// locks the admin surface rather than opening it.
pub fn require_admin(headers: &HeaderMap, configured: &str) -> Result<(), AppError> {
    if configured.trim().is_empty() {
        return Err(AppError::unauthorized("admin access is not configured"));
    }
    match extract_bearer(headers) {
        Some(token) if token == configured => Ok(()),
        _ => Err(AppError::unauthorized("invalid admin token")),
    }
}

/// Resolves the calling agent's identity according to the auth mode.
pub fn require_agent_identity(
    headers: &HeaderMap,
    mode: AgentAuthMode,
) -> Result<String, AppError> {
    let header = match mode {
        AgentAuthMode::Header => AGENT_ID_HEADER,
        AgentAuthMode::Mtls => CLIENT_CERT_CN_HEADER,
    };
    let value = headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if value.is_empty() {
        return Err(match mode {
            AgentAuthMode::Header => AppError::unauthorized("missing X-Agent-ID header"),
            AgentAuthMode::Mtls => AppError::unauthorized("client certificate required"),
        });
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn extract_bearer_trims_and_rejects_empty() {
        let headers = headers_with("authorization", "Bearer  token-1 ");
        assert_eq!(extract_bearer(&headers), Some("token-1"));

        let headers = headers_with("authorization", "Bearer   ");
        assert_eq!(extract_bearer(&headers), None);

        let headers = headers_with("authorization", "Basic abc");
        assert_eq!(extract_bearer(&headers), None);
    }

    #[test]
    fn require_admin_rejects_unconfigured_token() {
        let headers = headers_with("authorization", "Bearer anything");
        assert!(require_admin(&headers, "").is_err());
        assert!(require_admin(&headers, "   ").is_err());
    }

    #[test]
    fn require_admin_matches_exact_token() {
        let headers = headers_with("authorization", "Bearer secret");
        assert!(require_admin(&headers, "secret").is_ok());
        assert!(require_admin(&headers, "other").is_err());
    }

    #[test]
    fn agent_identity_from_header_mode() {
        let headers = headers_with(AGENT_ID_HEADER, "agt_123");
        let id = require_agent_identity(&headers, AgentAuthMode::Header).unwrap();
        assert_eq!(id, "agt_123");

        let empty = HeaderMap::new();
        let err = require_agent_identity(&empty, AgentAuthMode::Header).unwrap_err();
        assert!(err.message.contains("X-Agent-ID"));
    }

    #[test]
    fn agent_identity_from_forwarded_cn() {
        let headers = headers_with(CLIENT_CERT_CN_HEADER, "agt_mtls");
        let id = require_agent_identity(&headers, AgentAuthMode::Mtls).unwrap();
        assert_eq!(id, "agt_mtls");

        let empty = HeaderMap::new();
        let err = require_agent_identity(&empty, AgentAuthMode::Mtls).unwrap_err();
        assert!(err.message.contains("certificate"));
    }
}
