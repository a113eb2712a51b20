//! Anthropic agent adapter.
//!
//! The agent protocol is a single-turn query over an event stream: one
//! system prompt, one user prompt, namespaced tools the model may call but
//! the adapter never executes. Multi-turn canonical conversations are folded
//! into the system prompt (`prompt`), tool calls are captured and forwarded
//! to the caller (`stream`, `tools`), and prompted `<thinking>` output is
//! extracted back out (`thinking`).

pub mod prompt;
pub mod stream;
pub mod thinking;
pub mod tools;
pub mod wire;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde::Deserialize;
use serde_json::Value;

use crate::auth::Credential;
use crate::constants::{AGENT_OWNED_BY, ANTHROPIC_MODELS_URL};
use crate::error::{GatewayError, sanitize_secrets};
use crate::openai::{
    ChatRequest, ChatResponse, Choice, FunctionCall, ModelEntry, ResponseMessage, ToolCall,
    Usage, generate_call_id, generate_chat_id, now_unix,
};
use crate::providers::{Provider, SseStream};
use crate::store::ProviderType;

use prompt::build_query;
use stream::{AgentStreamContext, agent_sse_stream};
use thinking::extract_leading_thinking;
use tools::strip_tool_name;
use wire::{AgentUsage, build_models_request, build_query_request};

pub struct ClaudeAgentProvider {
    http: reqwest::Client,
}

impl ClaudeAgentProvider {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

fn oauth_token(credential: &Credential) -> Result<&str, GatewayError> {
    match credential {
        Credential::OAuth(token) => Ok(token),
        _ => Err(GatewayError::Unauthorized(
            "Anthropic account is not connected".into(),
        )),
    }
}

/// Pull the upstream error message out of an error body, falling back to the
/// raw text.
fn upstream_error_message(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(|m| m.to_string())
        })
        .unwrap_or_else(|| text.to_string())
}

#[derive(Debug, Deserialize)]
struct AgentResponse {
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AgentUsage>,
}

#[async_trait]
impl Provider for ClaudeAgentProvider {
    fn name(&self) -> ProviderType {
        ProviderType::AnthropicAgent
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        credential: &Credential,
    ) -> Result<ChatResponse, GatewayError> {
        let token = oauth_token(credential)?;
        let query = build_query(request, &request.model)?;

        let response = build_query_request(&self.http, token, false)
            .json(&query.body)
            .send()
            .await
            .map_err(|e| GatewayError::provider(sanitize_secrets(&e.to_string())))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GatewayError::from_upstream_status(
                status.as_u16(),
                sanitize_secrets(&upstream_error_message(&text)),
            ));
        }

        let parsed: AgentResponse = serde_json::from_str(&text).map_err(|e| {
            GatewayError::provider(format!("Failed to parse agent response: {e}"))
        })?;

        let mut text_out = String::new();
        let mut reasoning = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();

        for block in &parsed.content {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                        text_out.push_str(t);
                    }
                }
                Some("thinking") => {
                    if let Some(t) = block.get("thinking").and_then(|t| t.as_str()) {
                        reasoning.push_str(t);
                    }
                }
                Some("tool_use") => {
                    let name = block.get("name").and_then(|n| n.as_str()).unwrap_or_default();
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    tool_calls.push(ToolCall {
                        id: generate_call_id(),
                        call_type: "function".to_string(),
                        function: FunctionCall {
                            name: strip_tool_name(name),
                            arguments: if input.is_null() {
                                "{}".to_string()
                            } else {
                                input.to_string()
                            },
                        },
                    });
                }
                Some("image") => {
                    // Inline image output as markdown
                    if let (Some(media_type), Some(data)) = (
                        block.pointer("/source/media_type").and_then(|m| m.as_str()),
                        block.pointer("/source/data").and_then(|d| d.as_str()),
                    ) {
                        text_out
                            .push_str(&format!("![image](data:{media_type};base64,{data})"));
                    }
                }
                _ => {}
            }
        }

        // Prompted thinking comes back inline; strip the leading block when
        // the caller asked for it. Unanchored blocks pass through untouched.
        if query.thinking_requested
            && let Some((extracted, rest)) = extract_leading_thinking(&text_out)
        {
            reasoning.push_str(&extracted);
            text_out = rest;
        }

        let finish_reason = if !tool_calls.is_empty() {
            Some("tool_calls".to_string())
        } else {
            match parsed.stop_reason.as_deref() {
                Some("end_turn") => Some("stop".to_string()),
                Some("max_tokens") => Some("length".to_string()),
                Some("tool_use") => Some("tool_calls".to_string()),
                Some(other) => Some(other.to_string()),
                None => Some("stop".to_string()),
            }
        };

        let usage = parsed
            .usage
            .map(|u| Usage::new(u.input_tokens, u.output_tokens));

        Ok(ChatResponse {
            id: generate_chat_id(),
            object: "chat.completion".to_string(),
            created: now_unix(),
            model: request.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: if text_out.is_empty() {
                        None
                    } else {
                        Some(text_out)
                    },
                    reasoning_content: if reasoning.is_empty() {
                        None
                    } else {
                        Some(reasoning)
                    },
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(tool_calls)
                    },
                },
                finish_reason,
            }],
            usage,
        })
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        credential: &Credential,
    ) -> Result<SseStream, GatewayError> {
        let token = oauth_token(credential)?;
        let query = build_query(request, &request.model)?;

        let response = build_query_request(&self.http, token, true)
            .json(&query.body)
            .send()
            .await
            .map_err(|e| GatewayError::provider(sanitize_secrets(&e.to_string())))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_upstream_status(
                status,
                sanitize_secrets(&upstream_error_message(&text)),
            ));
        }

        let upstream = response.bytes_stream().map_err(std::io::Error::other);
        let ctx = AgentStreamContext {
            id: generate_chat_id(),
            created: now_unix(),
            model: request.model.clone(),
            thinking_requested: query.thinking_requested,
            include_usage: request.include_usage(),
        };

        Ok(agent_sse_stream(upstream, ctx))
    }

    async fn list_models(
        &self,
        credential: &Credential,
    ) -> Result<Vec<ModelEntry>, GatewayError> {
        let token = oauth_token(credential)?;
        let response = build_models_request(&self.http, ANTHROPIC_MODELS_URL, token)
            .send()
            .await
            .map_err(|e| GatewayError::provider(sanitize_secrets(&e.to_string())))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GatewayError::from_upstream_status(
                status.as_u16(),
                sanitize_secrets(&upstream_error_message(&text)),
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
                    .map(|id| ModelEntry::new(id, AGENT_OWNED_BY))
                    .collect()
            })
            .unwrap_or_default();

        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_error_message_extraction() {
        let text = r#"{"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#;
        assert_eq!(upstream_error_message(text), "busy");
        assert_eq!(upstream_error_message("plain failure"), "plain failure");
    }

    #[test]
    fn test_oauth_token_requires_oauth_credential() {
        assert!(oauth_token(&Credential::OAuth("tok".into())).is_ok());
        assert!(oauth_token(&Credential::ApiKey("sk".into())).is_err());
    }
}
