//! Dashboard endpoints (session-gated).
//!
//! A session is validated by forwarding the caller's cookie and
//! Authorization headers to the external session endpoint; success yields a
//! userId. These handlers only mint keys, seal pasted credentials, and drive
//! the OAuth connect flow; the dashboard UI itself lives elsewhere.

use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::AppState;
use crate::auth::keys::generate_key;
use crate::auth::oauth::{AuthState, challenge_for, generate_state, generate_verifier};
use crate::constants::{
    ANTHROPIC_AUTHORIZE_URL, OAUTH_CLIENT_ID, OAUTH_SCOPES, OAUTH_STATE_TTL_SECS,
};
use crate::store::ProviderType;

const STATE_COOKIE: &str = "mg_oauth_state";

fn dash_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Parse a named cookie from the Cookie header.
fn parse_cookie(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|cookie| {
        let (key, value) = cookie.trim().split_once('=')?;
        (key.trim() == name).then(|| value.trim().to_string())
    })
}

/// Validate the dashboard session by forwarding cookie + Authorization to
/// the external session endpoint. Success returns the userId.
async fn validate_session(state: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    let mut request = state
        .control
        .get(format!("{}/api/auth/session", state.site_url));

    if let Some(cookie) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        request = request.header(header::COOKIE, cookie);
    }
    if let Some(authorization) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        request = request.header(header::AUTHORIZATION, authorization);
    }

    let response = request
        .send()
        .await
        .map_err(|_| dash_error(StatusCode::BAD_GATEWAY, "Session service unreachable"))?;

    if !response.status().is_success() {
        return Err(dash_error(StatusCode::UNAUTHORIZED, "Invalid session"));
    }

    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|_| dash_error(StatusCode::BAD_GATEWAY, "Malformed session response"))?;

    body.get("userId")
        .and_then(|u| u.as_str())
        .map(|u| u.to_string())
        .ok_or_else(|| dash_error(StatusCode::UNAUTHORIZED, "Invalid session"))
}

// ============================================================================
// Proxy keys
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyRequest {
    name: String,
    #[serde(default)]
    rate_limit_per_minute: Option<u32>,
}

pub async fn create_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateKeyRequest>,
) -> Response {
    let user_id = match validate_session(&state, &headers).await {
        Ok(u) => u,
        Err(e) => return e,
    };

    match generate_key(&state.store, &user_id, &body.name, body.rate_limit_per_minute).await {
        Ok(generated) => Json(generated).into_response(),
        Err(e) => dash_error(e.status(), e.to_string()),
    }
}

/// List the caller's keys, without secret material. The raw key is never
/// recoverable; `keyPrefix` is all a dashboard gets to display.
pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let user_id = match validate_session(&state, &headers).await {
        Ok(u) => u,
        Err(e) => return e,
    };

    match state.store.list_keys(&user_id).await {
        Ok(records) => {
            let keys: Vec<serde_json::Value> = records
                .into_iter()
                .map(|r| {
                    json!({
                        "keyId": r.key_id,
                        "keyPrefix": r.key_prefix,
                        "name": r.name,
                        "isActive": r.is_active,
                        "rateLimitPerMinute": r.rate_limit_per_minute,
                        "createdAt": r.created_at,
                        "lastUsedAt": r.last_used_at,
                    })
                })
                .collect();
            Json(json!({ "keys": keys })).into_response()
        }
        Err(e) => dash_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ============================================================================
// Provider credentials
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreCredentialRequest {
    provider_type: String,
    credential: String,
}

pub async fn store_credential(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<StoreCredentialRequest>,
) -> Response {
    let user_id = match validate_session(&state, &headers).await {
        Ok(u) => u,
        Err(e) => return e,
    };

    let Some(provider) = ProviderType::parse(&body.provider_type) else {
        return dash_error(StatusCode::BAD_REQUEST, "Unknown provider type");
    };
    if provider == ProviderType::AnthropicAgent {
        return dash_error(
            StatusCode::BAD_REQUEST,
            "Anthropic is connected via OAuth, not a pasted key",
        );
    }
    if body.credential.trim().is_empty() {
        return dash_error(StatusCode::BAD_REQUEST, "Credential must not be empty");
    }

    let sealed = match state.crypto.encrypt(body.credential.trim()) {
        Ok(s) => s,
        Err(e) => return dash_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    match state
        .store
        .upsert_credential(&user_id, provider, &sealed.blob, &sealed.iv)
        .await
    {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => dash_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ============================================================================
// OAuth connect flow
// ============================================================================

pub async fn oauth_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let user_id = match validate_session(&state, &headers).await {
        Ok(u) => u,
        Err(e) => return e,
    };
    let connected = state.oauth.is_configured(&user_id).await;
    Json(json!({ "connected": connected })).into_response()
}

pub async fn oauth_start(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let user_id = match validate_session(&state, &headers).await {
        Ok(u) => u,
        Err(e) => return e,
    };

    let verifier = generate_verifier();
    let challenge = challenge_for(&verifier);
    let oauth_state = generate_state();
    let redirect_uri = format!("{}/dashboard/oauth/callback", state.site_url);

    let url = format!(
        "{}?code=true&client_id={}&response_type=code&redirect_uri={}&scope={}&code_challenge={}&code_challenge_method=S256&state={}",
        ANTHROPIC_AUTHORIZE_URL,
        OAUTH_CLIENT_ID,
        urlencoding::encode(&redirect_uri),
        urlencoding::encode(OAUTH_SCOPES),
        challenge,
        oauth_state,
    );

    let parked = AuthState::new(verifier, oauth_state, user_id, redirect_uri);
    let cookie = match parked.seal(&state.crypto) {
        Ok(c) => c,
        Err(e) => return dash_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let mut response = Json(json!({ "url": url })).into_response();
    if let Ok(value) = format!(
        "{STATE_COOKIE}={cookie}; Path=/; HttpOnly; SameSite=Lax; Max-Age={OAUTH_STATE_TTL_SECS}"
    )
    .parse()
    {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

/// Open the parked state cookie and check it against the session user.
fn open_parked_state(
    state: &AppState,
    headers: &HeaderMap,
    user_id: &str,
) -> Result<AuthState, Response> {
    let cookie_header = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| dash_error(StatusCode::BAD_REQUEST, "No OAuth flow in progress"))?;
    let cookie = parse_cookie(cookie_header, STATE_COOKIE)
        .ok_or_else(|| dash_error(StatusCode::BAD_REQUEST, "No OAuth flow in progress"))?;

    let parked = AuthState::open(&cookie, &state.crypto)
        .map_err(|e| dash_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    if parked.user_id != user_id {
        return Err(dash_error(StatusCode::FORBIDDEN, "OAuth state user mismatch"));
    }
    Ok(parked)
}

fn clear_state_cookie(response: &mut Response) {
    if let Ok(value) = format!("{STATE_COOKIE}=; Path=/; HttpOnly; Max-Age=0").parse() {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    code: String,
    state: String,
}

pub async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let user_id = match validate_session(&state, &headers).await {
        Ok(u) => u,
        Err(e) => return e,
    };
    let parked = match open_parked_state(&state, &headers, &user_id) {
        Ok(p) => p,
        Err(e) => return e,
    };

    let state_matches: bool = parked
        .state
        .as_bytes()
        .ct_eq(query.state.as_bytes())
        .into();
    if !state_matches {
        return dash_error(StatusCode::BAD_REQUEST, "OAuth state mismatch");
    }

    match state
        .oauth
        .exchange_code(&user_id, &query.code, &parked.verifier, &parked.redirect_uri)
        .await
    {
        Ok(()) => {
            let mut response = Json(json!({ "success": true })).into_response();
            clear_state_cookie(&mut response);
            response
        }
        Err(e) => dash_error(e.status(), e.to_string()),
    }
}

#[derive(Deserialize)]
pub struct ExchangeRequest {
    code: String,
}

/// Manual-paste variant: the user copies the `code#state` string from the
/// authorize page instead of being redirected.
pub async fn oauth_exchange(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ExchangeRequest>,
) -> Response {
    let user_id = match validate_session(&state, &headers).await {
        Ok(u) => u,
        Err(e) => return e,
    };
    let parked = match open_parked_state(&state, &headers, &user_id) {
        Ok(p) => p,
        Err(e) => return e,
    };

    match state
        .oauth
        .exchange_code(&user_id, &body.code, &parked.verifier, &parked.redirect_uri)
        .await
    {
        Ok(()) => {
            let mut response = Json(json!({ "success": true })).into_response();
            clear_state_cookie(&mut response);
            response
        }
        Err(e) => dash_error(e.status(), e.to_string()),
    }
}

pub async fn oauth_disconnect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let user_id = match validate_session(&state, &headers).await {
        Ok(u) => u,
        Err(e) => return e,
    };

    match state.oauth.clear(&user_id).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => dash_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cookie() {
        let header = "a=1; mg_oauth_state=abc.def; b=2";
        assert_eq!(
            parse_cookie(header, STATE_COOKIE).as_deref(),
            Some("abc.def")
        );
        assert_eq!(parse_cookie(header, "missing"), None);
    }
}
