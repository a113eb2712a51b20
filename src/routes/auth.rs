//! Caller authentication for the `/v1` surface.
//!
//! Either `Authorization: Bearer sk-…` or `x-api-key: sk-…` is accepted.
//! Resolution goes through the key cache; admission through the per-key
//! sliding window.

use axum::http::{HeaderMap, header};

use crate::AppState;
use crate::auth::ResolvedKey;
use crate::error::GatewayError;

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}

fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key);
    }
    extract_bearer_token(headers)
}

/// Full authentication flow: bearer → resolved key → rate admission.
pub async fn authenticate(
    headers: &HeaderMap,
    state: &AppState,
) -> Result<ResolvedKey, GatewayError> {
    let raw = extract_api_key(headers).ok_or(GatewayError::MissingApiKey)?;
    let key = state.keys.resolve(raw).await?;
    state
        .rate_limiter
        .check(&key.key_id, key.rate_limit_per_minute)?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extracts_either_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer sk-abc"),
        );
        assert_eq!(extract_api_key(&headers), Some("sk-abc"));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-xyz"));
        assert_eq!(extract_api_key(&headers), Some("sk-xyz"));

        // x-api-key wins when both are present
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer sk-abc"),
        );
        assert_eq!(extract_api_key(&headers), Some("sk-xyz"));

        assert_eq!(extract_api_key(&HeaderMap::new()), None);
    }
}
