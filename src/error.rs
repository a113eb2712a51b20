use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Uniform error taxonomy for the request plane.
///
/// Every variant maps to a (status, type, code) triple; see `status`,
/// `error_type` and `code`. Handlers render it in the caller's dialect via
/// `to_openai_response` / `to_anthropic_response`.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    InvalidBody(String),

    #[error("{message}")]
    Validation {
        message: String,
        param: Option<String>,
    },

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{message}")]
    UnsupportedParameter { message: String, param: String },

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("API key is inactive")]
    KeyInactive,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("{message}")]
    Provider { status: u16, message: String },

    #[error("{0}")]
    AllProvidersFailed(String),
}

impl GatewayError {
    pub fn provider(message: impl Into<String>) -> Self {
        GatewayError::Provider {
            status: 502,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidBody(_)
            | GatewayError::Validation { .. }
            | GatewayError::InvalidRequest(_)
            | GatewayError::UnsupportedParameter { .. } => StatusCode::BAD_REQUEST,
            GatewayError::UnknownEndpoint(_) => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized(_)
            | GatewayError::MissingApiKey
            | GatewayError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            GatewayError::KeyInactive => StatusCode::FORBIDDEN,
            GatewayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Provider { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::AllProvidersFailed(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::RateLimitExceeded(_) => "rate_limit_error",
            GatewayError::Provider { .. } | GatewayError::AllProvidersFailed(_) => "server_error",
            _ => "invalid_request_error",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidBody(_) => "invalid_body",
            GatewayError::Validation { .. } => "validation_error",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::UnsupportedParameter { .. } => "unsupported_parameter",
            GatewayError::UnknownEndpoint(_) => "unknown_endpoint",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::MissingApiKey => "missing_api_key",
            GatewayError::InvalidApiKey => "invalid_api_key",
            GatewayError::KeyInactive => "key_inactive",
            GatewayError::ModelNotFound(_) => "model_not_found",
            GatewayError::RateLimitExceeded(_) => "rate_limit_exceeded",
            GatewayError::Provider { .. } => "provider_error",
            GatewayError::AllProvidersFailed(_) => "all_providers_failed",
        }
    }

    pub fn param(&self) -> Option<&str> {
        match self {
            GatewayError::Validation { param, .. } => param.as_deref(),
            GatewayError::UnsupportedParameter { param, .. } => Some(param),
            _ => None,
        }
    }

    /// Render in the OpenAI dialect: `{error:{message,type,code,param?}}`.
    pub fn to_openai_response(&self) -> Response {
        let mut error = json!({
            "message": self.to_string(),
            "type": self.error_type(),
            "code": self.code(),
        });
        if let Some(param) = self.param() {
            error["param"] = json!(param);
        }

        let mut response = (self.status(), Json(json!({ "error": error }))).into_response();
        self.apply_retry_after(&mut response);
        response
    }

    /// Render in the Anthropic dialect: `{type:"error", error:{type,message}}`.
    pub fn to_anthropic_response(&self) -> Response {
        let error_type = match self.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => "authentication_error",
            StatusCode::TOO_MANY_REQUESTS => "rate_limit_error",
            s if s.is_server_error() => "api_error",
            _ => "invalid_request_error",
        };

        let mut response = (
            self.status(),
            Json(json!({
                "type": "error",
                "error": {
                    "type": error_type,
                    "message": self.to_string(),
                }
            })),
        )
            .into_response();
        self.apply_retry_after(&mut response);
        response
    }

    fn apply_retry_after(&self, response: &mut Response) {
        if matches!(self, GatewayError::RateLimitExceeded(_)) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("60"));
        }
    }

    /// Map an upstream HTTP failure into the taxonomy.
    pub fn from_upstream_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => GatewayError::InvalidApiKey,
            429 => GatewayError::RateLimitExceeded(message),
            400 => GatewayError::InvalidRequest(message),
            404 => GatewayError::ModelNotFound(message),
            s if (500..600).contains(&s) => GatewayError::Provider {
                status: 502,
                message,
            },
            s => GatewayError::Provider { status: s, message },
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.to_openai_response()
    }
}

/// Mask credential material before an error message leaves the process.
///
/// Applied to any non-taxonomy error surfaced from an adapter before it is
/// logged or wrapped as a provider error.
pub fn sanitize_secrets(message: &str) -> String {
    use std::sync::OnceLock;

    static PATTERNS: OnceLock<Vec<(regex::Regex, &'static str)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        vec![
            (regex::Regex::new(r"sk-[A-Za-z0-9]{10,}").unwrap(), "sk-***"),
            (
                regex::Regex::new(r"AIza[A-Za-z0-9_-]{30,}").unwrap(),
                "AIza***",
            ),
            (
                regex::Regex::new(r"Bearer\s+\S+").unwrap(),
                "Bearer ***",
            ),
            (
                regex::Regex::new(r"x-api-key:\s*\S+").unwrap(),
                "x-api-key: ***",
            ),
            (
                regex::Regex::new(r"([?&])key=\S+").unwrap(),
                "${1}key=***",
            ),
        ]
    });

    let mut sanitized = message.to_string();
    for (pattern, mask) in patterns {
        sanitized = pattern.replace_all(&sanitized, *mask).into_owned();
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_triples() {
        let err = GatewayError::MissingApiKey;
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.error_type(), "invalid_request_error");
        assert_eq!(err.code(), "missing_api_key");

        let err = GatewayError::RateLimitExceeded("limit".into());
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.error_type(), "rate_limit_error");

        let err = GatewayError::provider("upstream exploded");
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.error_type(), "server_error");
        assert_eq!(err.code(), "provider_error");
    }

    #[test]
    fn test_unsupported_parameter_carries_param() {
        let err = GatewayError::UnsupportedParameter {
            message: "Parameter 'n' > 1 is not supported".into(),
            param: "n".into(),
        };
        assert_eq!(err.param(), Some("n"));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_upstream_status_mapping() {
        assert!(matches!(
            GatewayError::from_upstream_status(401, "no".into()),
            GatewayError::InvalidApiKey
        ));
        assert!(matches!(
            GatewayError::from_upstream_status(429, "slow down".into()),
            GatewayError::RateLimitExceeded(_)
        ));
        assert!(matches!(
            GatewayError::from_upstream_status(404, "gone".into()),
            GatewayError::ModelNotFound(_)
        ));
        let err = GatewayError::from_upstream_status(503, "overloaded".into());
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        let err = GatewayError::from_upstream_status(418, "teapot".into());
        assert_eq!(err.status().as_u16(), 418);
    }

    #[test]
    fn test_sanitize_masks_bearer_and_keys() {
        let raw = "auth failed: Bearer sk-abcdefghijklmnopqr";
        let cleaned = sanitize_secrets(raw);
        assert_eq!(cleaned, "auth failed: Bearer ***");

        let cleaned = sanitize_secrets("bad key sk-abcdefghijklmnopqr in body");
        assert_eq!(cleaned, "bad key sk-*** in body");

        let cleaned = sanitize_secrets("token AIzaSyA1234567890123456789012345678901 rejected");
        assert!(!cleaned.contains("AIzaSyA"));
        assert!(cleaned.contains("AIza***"));

        let cleaned = sanitize_secrets("GET /v1beta/models?key=secret123 failed");
        assert_eq!(cleaned, "GET /v1beta/models?key=*** failed");

        let cleaned = sanitize_secrets("header x-api-key: topsecret was rejected");
        assert!(cleaned.contains("x-api-key: ***"));
        assert!(!cleaned.contains("topsecret"));
    }

    #[test]
    fn test_sanitize_leaves_clean_messages_alone() {
        let msg = "connection reset by peer";
        assert_eq!(sanitize_secrets(msg), msg);
    }
}
