//! Request-plane orchestration.
//!
//! `execute_chat` composes system-prompt injection, model routing, credential
//! resolution, adapter dispatch, and the usage-log side channel. Usage rows
//! are written fire-and-forget and never alter a request's outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::warn;

use crate::AppState;
use crate::auth::{Credential, ResolvedKey};
use crate::constants::MODEL_CACHE_TTL_SECS;
use crate::error::{GatewayError, sanitize_secrets};
use crate::openai::{ChatMessage, ChatRequest, ChatResponse, ModelEntry};
use crate::providers::SseStream;
use crate::providers::router::route_model;
use crate::store::{ProviderType, UsageLogEntry};

pub enum ProxyOutcome {
    Response(Box<ChatResponse>),
    Stream(SseStream),
}

/// Run one chat request through the pipeline.
pub async fn execute_chat(
    state: &AppState,
    mut request: ChatRequest,
    key: &ResolvedKey,
    endpoint: &str,
) -> Result<ProxyOutcome, GatewayError> {
    let requested_model = request.model.clone();

    inject_system_prompt(state, &mut request, &key.user_id).await;

    let route = route_model(&request.model);

    // Latency is measured from the moment credential resolution starts
    let start = Instant::now();

    if route.candidates.is_empty() {
        log_usage(
            state,
            base_entry(key, &requested_model, &request, endpoint)
                .status(400)
                .error("Unknown model provider"),
            start,
        );
        return Err(GatewayError::InvalidRequest(format!(
            "Unknown model provider for model '{requested_model}'"
        )));
    }
    request.model = route.model.clone();

    let mut resolved: Option<(ProviderType, Credential)> = None;
    for candidate in &route.candidates {
        match state.credentials.resolve(&key.user_id, *candidate).await {
            Ok(credential) => {
                resolved = Some((*candidate, credential));
                break;
            }
            Err(e) => {
                tracing::debug!(
                    "Skipping provider {} for user {}: {e}",
                    candidate.as_str(),
                    key.user_id
                );
            }
        }
    }

    let Some((provider, credential)) = resolved else {
        let tried: Vec<&str> = route.candidates.iter().map(|p| p.as_str()).collect();
        let message = format!("No credentials configured for providers: {}", tried.join(", "));
        log_usage(
            state,
            base_entry(key, &requested_model, &request, endpoint)
                .status(502)
                .error("No credentials configured"),
            start,
        );
        return Err(GatewayError::AllProvidersFailed(message));
    };

    let adapter = state.providers.get(provider);

    if request.wants_stream() {
        match adapter.stream(&request, &credential).await {
            Ok(stream) => {
                // Token counts are unknown for the stream branch; the row
                // records the dispatch only.
                log_usage(
                    state,
                    base_entry(key, &requested_model, &request, endpoint)
                        .provider(provider)
                        .status(200),
                    start,
                );
                Ok(ProxyOutcome::Stream(stream))
            }
            Err(e) => Err(log_and_wrap(state, key, &requested_model, &request, endpoint, provider, e, start)),
        }
    } else {
        match adapter.complete(&request, &credential).await {
            Ok(response) => {
                let mut entry = base_entry(key, &requested_model, &request, endpoint)
                    .provider(provider)
                    .status(200);
                if let Some(usage) = &response.usage {
                    entry.input_tokens = Some(usage.prompt_tokens);
                    entry.output_tokens = Some(usage.completion_tokens);
                }
                entry.stop_reason = response
                    .choices
                    .first()
                    .and_then(|c| c.finish_reason.clone());
                log_usage(state, entry, start);
                Ok(ProxyOutcome::Response(Box::new(response)))
            }
            Err(e) => Err(log_and_wrap(state, key, &requested_model, &request, endpoint, provider, e, start)),
        }
    }
}

/// Adapter errors are already taxonomy values; log the row with their status
/// and pass them through, masking any credential material in the message.
#[allow(clippy::too_many_arguments)]
fn log_and_wrap(
    state: &AppState,
    key: &ResolvedKey,
    requested_model: &str,
    request: &ChatRequest,
    endpoint: &str,
    provider: ProviderType,
    error: GatewayError,
    start: Instant,
) -> GatewayError {
    let message = sanitize_secrets(&error.to_string());
    log_usage(
        state,
        base_entry(key, requested_model, request, endpoint)
            .provider(provider)
            .status(error.status().as_u16())
            .error(&message),
        start,
    );
    error
}

/// Prepend the user's preset system prompt unless the request already
/// carries a system message. Selection (exact-model match over global
/// default) happens in the store.
async fn inject_system_prompt(state: &AppState, request: &mut ChatRequest, user_id: &str) {
    if request.messages.iter().any(|m| m.role == "system") {
        return;
    }
    match state
        .store
        .get_system_prompt_for_model(user_id, &request.model)
        .await
    {
        Ok(Some(preset)) => {
            request
                .messages
                .insert(0, ChatMessage::text("system", preset.content));
        }
        Ok(None) => {}
        Err(e) => warn!("System prompt lookup failed for user {user_id}: {e}"),
    }
}

// ============================================================================
// Usage logging
// ============================================================================

fn base_entry(
    key: &ResolvedKey,
    model: &str,
    request: &ChatRequest,
    endpoint: &str,
) -> UsageLogEntry {
    UsageLogEntry {
        user_id: key.user_id.clone(),
        key_id: key.key_id.clone(),
        provider_type: None,
        model: model.to_string(),
        latency_ms: 0,
        status_code: 0,
        endpoint: Some(endpoint.to_string()),
        streamed: Some(request.wants_stream()),
        message_count: Some(request.messages.len()),
        has_tools: Some(request.tools.as_ref().is_some_and(|t| !t.is_empty())),
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        ..Default::default()
    }
}

trait EntryExt {
    fn provider(self, provider: ProviderType) -> Self;
    fn status(self, status: u16) -> Self;
    fn error(self, message: &str) -> Self;
}

impl EntryExt for UsageLogEntry {
    fn provider(mut self, provider: ProviderType) -> Self {
        self.provider_type = Some(provider.as_str().to_string());
        self
    }
    fn status(mut self, status: u16) -> Self {
        self.status_code = status;
        self
    }
    fn error(mut self, message: &str) -> Self {
        self.error_message = Some(message.to_string());
        self
    }
}

fn log_usage(state: &AppState, mut entry: UsageLogEntry, start: Instant) {
    entry.latency_ms = start.elapsed().as_millis() as u64;
    let store = Arc::clone(&state.store);
    tokio::spawn(async move {
        if let Err(e) = store.insert_usage_log(&entry).await {
            warn!("Failed to write usage log: {e}");
        }
    });
}

// ============================================================================
// Model listing
// ============================================================================

pub struct ModelCache {
    entries: RwLock<HashMap<(String, ProviderType), (Vec<ModelEntry>, Instant)>>,
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    async fn get(&self, user_id: &str, provider: ProviderType) -> Option<Vec<ModelEntry>> {
        let entries = self.entries.read().await;
        entries
            .get(&(user_id.to_string(), provider))
            .filter(|(_, cached_at)| cached_at.elapsed().as_secs() < MODEL_CACHE_TTL_SECS)
            .map(|(models, _)| models.clone())
    }

    async fn insert(&self, user_id: &str, provider: ProviderType, models: Vec<ModelEntry>) {
        self.entries
            .write()
            .await
            .insert((user_id.to_string(), provider), (models, Instant::now()));
    }
}

async fn provider_models(
    state: &AppState,
    user_id: &str,
    provider: ProviderType,
) -> Result<Vec<ModelEntry>, GatewayError> {
    if let Some(models) = state.model_cache.get(user_id, provider).await {
        return Ok(models);
    }
    let credential = state.credentials.resolve(user_id, provider).await?;
    let models = state
        .providers
        .get(provider)
        .list_models(&credential)
        .await?;
    state
        .model_cache
        .insert(user_id, provider, models.clone())
        .await;
    Ok(models)
}

/// Union of model entries across every provider the user has configured.
pub async fn list_models(state: &AppState, user_id: &str) -> Vec<ModelEntry> {
    let mut all = Vec::new();
    for provider in state.credentials.configured_providers(user_id).await {
        match provider_models(state, user_id, provider).await {
            Ok(models) => all.extend(models),
            Err(e) => warn!(
                "Model listing failed for {} / user {user_id}: {e}",
                provider.as_str()
            ),
        }
    }
    all
}

/// Single-model lookup across the model's candidate providers.
pub async fn get_model(
    state: &AppState,
    user_id: &str,
    model: &str,
) -> Result<ModelEntry, GatewayError> {
    let route = route_model(model);
    for provider in route.candidates {
        if let Ok(models) = provider_models(state, user_id, provider).await
            && let Some(entry) = models.into_iter().find(|m| m.id == route.model)
        {
            return Ok(entry);
        }
    }
    Err(GatewayError::ModelNotFound(model.to_string()))
}
