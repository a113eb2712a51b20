//! Anthropic Messages dialect conversion.
//!
//! Inbound `/v1/messages` bodies are validated and translated into the
//! canonical chat-completions shape; canonical responses are translated back
//! before emission. Streaming has its own stateful translator in
//! `anthropic_stream`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::GatewayError;
use crate::openai::{
    ChatMessage, ChatRequest, ChatResponse, ContentPart, FunctionCall, FunctionDef, ImageUrl,
    MessageContent, StopSequences, Tool, ToolCall,
};

// ============================================================================
// Anthropic Messages request types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<AnthropicMessage>,
    pub max_tokens: u32,
    #[serde(default)]
    pub system: Option<SystemPrompt>,
    #[serde(default)]
    pub tools: Option<Vec<AnthropicTool>>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub thinking: Option<Value>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: AnthropicContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AnthropicBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ImageSource },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<Value>,
    },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub input_schema: Value,
}

// ============================================================================
// Request translation: Anthropic → canonical
// ============================================================================

pub fn to_canonical(req: MessagesRequest) -> Result<ChatRequest, GatewayError> {
    if req.messages.is_empty() {
        return Err(GatewayError::Validation {
            message: "messages must not be empty".into(),
            param: Some("messages".into()),
        });
    }

    let mut messages: Vec<ChatMessage> = Vec::new();

    if let Some(system) = req.system {
        let text = match system {
            SystemPrompt::Text(t) => t,
            SystemPrompt::Blocks(blocks) => blocks
                .into_iter()
                .filter(|b| b.block_type == "text")
                .map(|b| b.text)
                .collect::<Vec<_>>()
                .join("\n"),
        };
        messages.push(ChatMessage::text("system", text));
    }

    for msg in req.messages {
        match msg.role.as_str() {
            "user" => convert_user_message(msg.content, &mut messages),
            "assistant" => convert_assistant_message(msg.content, &mut messages),
            other => {
                return Err(GatewayError::Validation {
                    message: format!("Invalid message role: {other}"),
                    param: Some("messages".into()),
                });
            }
        }
    }

    let tools = req.tools.map(|tools| {
        tools
            .into_iter()
            .map(|t| Tool {
                tool_type: "function".to_string(),
                function: FunctionDef {
                    name: t.name,
                    description: t.description,
                    parameters: Some(t.input_schema),
                },
            })
            .collect()
    });

    Ok(ChatRequest {
        model: req.model,
        messages,
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: Some(req.max_tokens),
        stream: req.stream,
        stop: req.stop_sequences.map(StopSequences::Many),
        tools,
        tool_choice: req.tool_choice,
        response_format: None,
        frequency_penalty: None,
        presence_penalty: None,
        n: None,
        stream_options: None,
        thinking: req.thinking,
        reasoning_effort: None,
    })
}

fn convert_user_message(content: AnthropicContent, out: &mut Vec<ChatMessage>) {
    match content {
        AnthropicContent::Text(text) => out.push(ChatMessage::text("user", text)),
        AnthropicContent::Blocks(blocks) => {
            let mut parts: Vec<ContentPart> = Vec::new();
            for block in blocks {
                match block {
                    AnthropicBlock::Text { text } => parts.push(ContentPart::Text { text }),
                    AnthropicBlock::Image { source } => {
                        if let Some(url) = image_source_to_url(&source) {
                            parts.push(ContentPart::ImageUrl {
                                image_url: ImageUrl { url },
                            });
                        }
                    }
                    AnthropicBlock::ToolResult {
                        tool_use_id,
                        content,
                    } => {
                        out.push(ChatMessage {
                            role: "tool".to_string(),
                            content: MessageContent::Text(tool_result_text(content)),
                            name: None,
                            tool_calls: None,
                            tool_call_id: Some(tool_use_id),
                        });
                    }
                    // Not expected inside user content; ignore
                    AnthropicBlock::ToolUse { .. } | AnthropicBlock::Thinking { .. } => {}
                }
            }
            if !parts.is_empty() {
                let content = if parts.len() == 1
                    && let ContentPart::Text { text } = &parts[0]
                {
                    MessageContent::Text(text.clone())
                } else {
                    MessageContent::Parts(parts)
                };
                out.push(ChatMessage {
                    role: "user".to_string(),
                    content,
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
        }
    }
}

fn convert_assistant_message(content: AnthropicContent, out: &mut Vec<ChatMessage>) {
    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    match content {
        AnthropicContent::Text(t) => text = t,
        AnthropicContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    AnthropicBlock::Text { text: t } => text.push_str(&t),
                    AnthropicBlock::ToolUse { id, name, input } => {
                        tool_calls.push(ToolCall {
                            id,
                            call_type: "function".to_string(),
                            function: FunctionCall {
                                name,
                                arguments: serde_json::to_string(&input).unwrap_or_default(),
                            },
                        });
                    }
                    _ => {}
                }
            }
        }
    }

    out.push(ChatMessage {
        role: "assistant".to_string(),
        content: if text.is_empty() {
            MessageContent::Null
        } else {
            MessageContent::Text(text)
        },
        name: None,
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        tool_call_id: None,
    });
}

fn image_source_to_url(source: &ImageSource) -> Option<String> {
    match source.source_type.as_str() {
        "base64" => {
            let media_type = source.media_type.as_deref().unwrap_or("image/png");
            let data = source.data.as_deref()?;
            Some(format!("data:{};base64,{}", media_type, data))
        }
        "url" => source.url.clone(),
        _ => None,
    }
}

fn tool_result_text(content: Option<Value>) -> String {
    match content {
        None => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => serde_json::to_string(&other).unwrap_or_default(),
    }
}

// ============================================================================
// Response translation: canonical → Anthropic
// ============================================================================

#[derive(Debug, Serialize)]
pub struct AnthropicResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub role: String,
    pub content: Vec<Value>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub usage: Value,
}

/// `msg_` id derived from a canonical completion id.
pub fn message_id_from(chat_id: &str) -> String {
    let suffix = chat_id.strip_prefix("chatcmpl-").unwrap_or(chat_id);
    format!("msg_{suffix}")
}

pub fn map_stop_reason(finish_reason: Option<&str>) -> Option<String> {
    match finish_reason {
        Some("stop") => Some("end_turn".to_string()),
        Some("length") => Some("max_tokens".to_string()),
        Some("tool_calls") => Some("tool_use".to_string()),
        _ => None,
    }
}

pub fn from_canonical_response(resp: &ChatResponse) -> AnthropicResponse {
    let mut content: Vec<Value> = Vec::new();

    let choice = resp.choices.first();
    if let Some(choice) = choice {
        if let Some(reasoning) = choice
            .message
            .reasoning_content
            .as_ref()
            .filter(|r| !r.is_empty())
        {
            content.push(json!({"type": "thinking", "thinking": reasoning}));
        }
        if let Some(text) = choice.message.content.as_ref().filter(|t| !t.is_empty()) {
            content.push(json!({"type": "text", "text": text}));
        }
        if let Some(tool_calls) = &choice.message.tool_calls {
            for call in tool_calls {
                let input: Value = serde_json::from_str(if call.function.arguments.is_empty() {
                    "{}"
                } else {
                    &call.function.arguments
                })
                .unwrap_or_else(|_| json!({}));
                content.push(json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.function.name,
                    "input": input,
                }));
            }
        }
    }

    if content.is_empty() {
        content.push(json!({"type": "text", "text": ""}));
    }

    let usage = resp.usage.unwrap_or_default();

    AnthropicResponse {
        id: message_id_from(&resp.id),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: resp.model.clone(),
        stop_reason: map_stop_reason(choice.and_then(|c| c.finish_reason.as_deref())),
        stop_sequence: None,
        usage: json!({
            "input_tokens": usage.prompt_tokens,
            "output_tokens": usage.completion_tokens,
        }),
    }
}
