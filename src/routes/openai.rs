//! OpenAI-dialect endpoints: chat completions, legacy completions, models.

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::sync::Arc;

use crate::AppState;
use crate::error::GatewayError;
use crate::openai::ChatRequest;
use crate::proxy::{self, ProxyOutcome};
use crate::providers::SseStream;
use crate::transforms::completions::{self, LegacyCompletionRequest};

use super::auth::authenticate;

/// Streaming response with the headers every SSE surface carries.
pub fn sse_response(stream: SseStream) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, GatewayError> {
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::InvalidBody(format!("Invalid request body: {e}")))
}

fn validate_chat_request(request: &ChatRequest) -> Result<(), GatewayError> {
    if request.model.trim().is_empty() {
        return Err(GatewayError::Validation {
            message: "model is required".into(),
            param: Some("model".into()),
        });
    }
    if request.messages.is_empty() {
        return Err(GatewayError::Validation {
            message: "messages must not be empty".into(),
            param: Some("messages".into()),
        });
    }
    Ok(())
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let key = match authenticate(&headers, &state).await {
        Ok(key) => key,
        Err(e) => return e.to_openai_response(),
    };

    let request: ChatRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(e) => return e.to_openai_response(),
    };
    if let Err(e) = validate_chat_request(&request) {
        return e.to_openai_response();
    }

    match proxy::execute_chat(&state, request, &key, "/v1/chat/completions").await {
        Ok(ProxyOutcome::Response(response)) => Json(*response).into_response(),
        Ok(ProxyOutcome::Stream(stream)) => sse_response(stream),
        Err(e) => e.to_openai_response(),
    }
}

pub async fn legacy_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let key = match authenticate(&headers, &state).await {
        Ok(key) => key,
        Err(e) => return e.to_openai_response(),
    };

    let legacy: LegacyCompletionRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(e) => return e.to_openai_response(),
    };
    let request = match completions::to_canonical(legacy) {
        Ok(r) => r,
        Err(e) => return e.to_openai_response(),
    };
    if let Err(e) = validate_chat_request(&request) {
        return e.to_openai_response();
    }

    match proxy::execute_chat(&state, request, &key, "/v1/completions").await {
        Ok(ProxyOutcome::Response(response)) => {
            Json(completions::response_to_legacy(&response)).into_response()
        }
        Ok(ProxyOutcome::Stream(stream)) => {
            sse_response(Box::pin(completions::translate_sse_stream(stream)))
        }
        Err(e) => e.to_openai_response(),
    }
}

pub async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let key = match authenticate(&headers, &state).await {
        Ok(key) => key,
        Err(e) => return e.to_openai_response(),
    };

    let models = proxy::list_models(&state, &key.user_id).await;
    Json(json!({ "object": "list", "data": models })).into_response()
}

pub async fn get_model(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(model): Path<String>,
) -> Response {
    let key = match authenticate(&headers, &state).await {
        Ok(key) => key,
        Err(e) => return e.to_openai_response(),
    };

    match proxy::get_model(&state, &key.user_id, &model).await {
        Ok(entry) => Json(entry).into_response(),
        Err(e) => e.to_openai_response(),
    }
}

/// Thin provider calls with no gateway semantics of their own.
pub async fn not_implemented() -> Response {
    let body = json!({
        "error": {
            "message": "This endpoint is not implemented by the gateway",
            "type": "invalid_request_error",
            "code": "invalid_request",
        }
    });
    (StatusCode::NOT_IMPLEMENTED, Json(body)).into_response()
}

/// Unknown `/v1/*` routes.
pub async fn unknown_endpoint(uri: axum::http::Uri) -> Response {
    let body = json!({
        "error": {
            "message": format!("Unknown endpoint: {}", uri.path()),
            "type": "invalid_request_error",
            "code": "unknown_endpoint",
        }
    });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}
