//! Provider adapters.
//!
//! Every upstream implements the same contract: translate the canonical
//! request into its own dialect, call the upstream, and hand back either a
//! canonical response or a stream of ready-framed canonical SSE lines.
//! Adapters never mutate the canonical request and surface fatal upstream
//! errors through the uniform taxonomy.

pub mod claude_agent;
pub mod gemini;
pub mod openrouter;
pub mod router;
pub mod vertex;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;

use crate::auth::Credential;
use crate::error::GatewayError;
use crate::openai::{ChatRequest, ChatResponse, ModelEntry};
use crate::store::ProviderType;

/// Ready-framed SSE lines (`data: <json>\n\n`, `: comment\n\n`), terminated
/// by `data: [DONE]\n\n` unless cancelled.
pub type SseStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> ProviderType;

    async fn complete(
        &self,
        request: &ChatRequest,
        credential: &Credential,
    ) -> Result<ChatResponse, GatewayError>;

    async fn stream(
        &self,
        request: &ChatRequest,
        credential: &Credential,
    ) -> Result<SseStream, GatewayError>;

    async fn list_models(&self, credential: &Credential)
    -> Result<Vec<ModelEntry>, GatewayError>;
}

pub struct ProviderRegistry {
    anthropic: claude_agent::ClaudeAgentProvider,
    gemini: gemini::GeminiProvider,
    vertex: vertex::VertexProvider,
    openrouter: openrouter::OpenRouterProvider,
}

impl ProviderRegistry {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            anthropic: claude_agent::ClaudeAgentProvider::new(http.clone()),
            gemini: gemini::GeminiProvider::new(http.clone()),
            vertex: vertex::VertexProvider::new(http.clone()),
            openrouter: openrouter::OpenRouterProvider::new(http),
        }
    }

    pub fn get(&self, provider: ProviderType) -> &dyn Provider {
        match provider {
            ProviderType::AnthropicAgent => &self.anthropic,
            ProviderType::Gemini => &self.gemini,
            ProviderType::VertexAi => &self.vertex,
            ProviderType::OpenRouter => &self.openrouter,
        }
    }
}
