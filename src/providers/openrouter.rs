//! OpenRouter adapter.
//!
//! The upstream is already OpenAI-shaped, so the adapter forwards the
//! canonical request and copies the body back. Streaming re-frames each line
//! through a buffered decoder as `trimmed + "\n\n"` without inspecting
//! whether the line already carried a `data:` prefix; downstream clients
//! tolerate the occasional blank line.

use async_stream::stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;

use crate::auth::Credential;
use crate::constants::OPENROUTER_BASE_URL;
use crate::error::{GatewayError, sanitize_secrets};
use crate::openai::{
    ChatChunk, ChatRequest, ChatResponse, Delta, ModelEntry, generate_chat_id, now_unix,
};
use crate::providers::{Provider, SseStream};
use crate::store::ProviderType;

pub struct OpenRouterProvider {
    http: reqwest::Client,
}

impl OpenRouterProvider {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn request_builder(
        &self,
        path: &str,
        credential: &Credential,
    ) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{OPENROUTER_BASE_URL}{path}"))
            .header("Authorization", format!("Bearer {}", credential.api_key()))
            .header("HTTP-Referer", "https://modelgate.dev")
            .header("X-Title", "modelgate")
    }
}

#[async_trait]
impl Provider for OpenRouterProvider {
    fn name(&self) -> ProviderType {
        ProviderType::OpenRouter
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        credential: &Credential,
    ) -> Result<ChatResponse, GatewayError> {
        let mut body = request.clone();
        body.stream = Some(false);

        let response = self
            .request_builder("/chat/completions", credential)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::provider(sanitize_secrets(&e.to_string())))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GatewayError::from_upstream_status(
                status.as_u16(),
                sanitize_secrets(&text),
            ));
        }

        serde_json::from_str(&text)
            .map_err(|e| GatewayError::provider(format!("Failed to parse upstream response: {e}")))
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        credential: &Credential,
    ) -> Result<SseStream, GatewayError> {
        let mut body = request.clone();
        body.stream = Some(true);

        let response = self
            .request_builder("/chat/completions", credential)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::provider(sanitize_secrets(&e.to_string())))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_upstream_status(
                status,
                sanitize_secrets(&text),
            ));
        }

        let upstream = response.bytes_stream();
        let id = generate_chat_id();
        let created = now_unix();
        let model = request.model.clone();
        let sse = stream! {
            let mut upstream = std::pin::pin!(upstream);
            let mut buffer = String::new();
            while let Some(chunk) = upstream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        // Bytes are already on the wire; fail in-band
                        let message = sanitize_secrets(&e.to_string());
                        let tail = ChatChunk::new(
                            &id,
                            created,
                            &model,
                            Delta::content(format!("\n\n[Error: {message}]")),
                            None,
                        );
                        yield Ok(Bytes::from(tail.to_sse()));
                        let finish = ChatChunk::new(
                            &id,
                            created,
                            &model,
                            Delta::default(),
                            Some("stop".to_string()),
                        );
                        yield Ok(Bytes::from(finish.to_sse()));
                        yield Ok(Bytes::from("data: [DONE]\n\n"));
                        return;
                    }
                };
                let Ok(text) = std::str::from_utf8(&chunk) else {
                    continue;
                };
                buffer.push_str(text);

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);
                    if line.is_empty() {
                        continue;
                    }
                    yield Ok(Bytes::from(format!("{line}\n\n")));
                }
            }
            let trailing = buffer.trim();
            if !trailing.is_empty() {
                yield Ok(Bytes::from(format!("{trailing}\n\n")));
            }
        };

        Ok(Box::pin(sse))
    }

    async fn list_models(
        &self,
        credential: &Credential,
    ) -> Result<Vec<ModelEntry>, GatewayError> {
        let response = self
            .http
            .get(format!("{OPENROUTER_BASE_URL}/models"))
            .header("Authorization", format!("Bearer {}", credential.api_key()))
            .send()
            .await
            .map_err(|e| GatewayError::provider(sanitize_secrets(&e.to_string())))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GatewayError::from_upstream_status(
                status.as_u16(),
                sanitize_secrets(&text),
            ));
        }

        let body: Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::provider(format!("Failed to parse model list: {e}")))?;

        let models = body
            .get("data")
            .and_then(|d| d.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|m| m.get("id").and_then(|id| id.as_str()))
                    .map(|id| ModelEntry::new(id, "openrouter"))
                    .collect()
            })
            .unwrap_or_default();

        Ok(models)
    }
}
