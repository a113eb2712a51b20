//! Anthropic Messages dialect endpoint.

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::AppState;
use crate::error::GatewayError;
use crate::proxy::{self, ProxyOutcome};
use crate::transforms::anthropic::{MessagesRequest, from_canonical_response, to_canonical};
use crate::transforms::anthropic_stream::translate_sse_stream;

use super::auth::authenticate;
use super::openai::sse_response;

pub async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let key = match authenticate(&headers, &state).await {
        Ok(key) => key,
        Err(e) => return e.to_anthropic_response(),
    };

    let request: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return GatewayError::InvalidBody(format!("Invalid request body: {e}"))
                .to_anthropic_response();
        }
    };

    let canonical = match to_canonical(request) {
        Ok(c) => c,
        Err(e) => return e.to_anthropic_response(),
    };
    let model = canonical.model.clone();

    match proxy::execute_chat(&state, canonical, &key, "/v1/messages").await {
        Ok(ProxyOutcome::Response(response)) => {
            Json(from_canonical_response(&response)).into_response()
        }
        Ok(ProxyOutcome::Stream(stream)) => {
            sse_response(Box::pin(translate_sse_stream(stream, model)))
        }
        Err(e) => e.to_anthropic_response(),
    }
}
