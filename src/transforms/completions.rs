//! Legacy `/v1/completions` support.
//!
//! The legacy surface folds `prompt` into a single user message, dispatches
//! through the canonical chat path, and re-frames the response (or each
//! stream chunk) as a `text_completion`.

use async_stream::stream;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::GatewayError;
use crate::openai::{
    ChatChunk, ChatMessage, ChatRequest, ChatResponse, StopSequences, StreamOptions,
};

#[derive(Debug, Deserialize)]
pub struct LegacyCompletionRequest {
    pub model: String,
    pub prompt: Value,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub stop: Option<StopSequences>,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub stream_options: Option<StreamOptions>,
}

/// `prompt` is a string or an array of strings joined by newlines.
fn fold_prompt(prompt: &Value) -> Result<String, GatewayError> {
    match prompt {
        Value::String(s) => Ok(s.clone()),
        Value::Array(parts) => {
            let mut lines = Vec::with_capacity(parts.len());
            for part in parts {
                match part {
                    Value::String(s) => lines.push(s.clone()),
                    _ => {
                        return Err(GatewayError::Validation {
                            message: "prompt array must contain only strings".into(),
                            param: Some("prompt".into()),
                        });
                    }
                }
            }
            Ok(lines.join("\n"))
        }
        _ => Err(GatewayError::Validation {
            message: "prompt must be a string or an array of strings".into(),
            param: Some("prompt".into()),
        }),
    }
}

pub fn to_canonical(req: LegacyCompletionRequest) -> Result<ChatRequest, GatewayError> {
    let prompt = fold_prompt(&req.prompt)?;
    Ok(ChatRequest {
        model: req.model,
        messages: vec![ChatMessage::text("user", prompt)],
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: req.max_tokens,
        stream: req.stream,
        stop: req.stop,
        tools: None,
        tool_choice: None,
        response_format: None,
        frequency_penalty: None,
        presence_penalty: None,
        n: req.n,
        stream_options: req.stream_options,
        thinking: None,
        reasoning_effort: None,
    })
}

pub fn response_to_legacy(resp: &ChatResponse) -> Value {
    let choices: Vec<Value> = resp
        .choices
        .iter()
        .map(|c| {
            json!({
                "index": c.index,
                "text": c.message.content.clone().unwrap_or_default(),
                "finish_reason": c.finish_reason,
            })
        })
        .collect();

    let mut out = json!({
        "id": resp.id,
        "object": "text_completion",
        "created": resp.created,
        "model": resp.model,
        "choices": choices,
    });
    if let Some(usage) = &resp.usage {
        out["usage"] = serde_json::to_value(usage).unwrap_or(Value::Null);
    }
    out
}

fn chunk_to_legacy(data: &str) -> Option<String> {
    let chunk: ChatChunk = serde_json::from_str(data).ok()?;
    let choices: Vec<Value> = chunk
        .choices
        .iter()
        .map(|c| {
            json!({
                "index": c.index,
                "text": c.delta.content.clone().unwrap_or_default(),
                "finish_reason": c.finish_reason,
            })
        })
        .collect();

    let mut out = json!({
        "id": chunk.id,
        "object": "text_completion",
        "created": chunk.created,
        "model": chunk.model,
        "choices": choices,
    });
    if let Some(usage) = &chunk.usage {
        out["usage"] = serde_json::to_value(usage).unwrap_or(Value::Null);
    }
    Some(format!("data: {out}\n\n"))
}

/// Re-frame a canonical SSE stream as `text_completion` chunks.
pub fn translate_sse_stream(
    upstream: impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
    stream! {
        let mut buffer = String::new();
        let mut upstream = std::pin::pin!(upstream);

        while let Some(chunk) = upstream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let Ok(text) = std::str::from_utf8(&chunk) else {
                continue;
            };
            buffer.push_str(text);

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim_end_matches('\r').to_string();
                buffer.drain(..=newline);

                if line.starts_with(':') {
                    yield Ok(Bytes::from(format!("{line}\n\n")));
                    continue;
                }
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    yield Ok(Bytes::from("data: [DONE]\n\n"));
                    continue;
                }
                if let Some(reframed) = chunk_to_legacy(data) {
                    yield Ok(Bytes::from(reframed));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::{Choice, Delta, ResponseMessage};

    #[test]
    fn test_fold_prompt_string_and_array() {
        assert_eq!(fold_prompt(&json!("hello")).unwrap(), "hello");
        assert_eq!(fold_prompt(&json!(["a", "b"])).unwrap(), "a\nb");
        assert!(fold_prompt(&json!(42)).is_err());
        assert!(fold_prompt(&json!(["a", 1])).is_err());
    }

    #[test]
    fn test_to_canonical_folds_into_user_message() {
        let req: LegacyCompletionRequest = serde_json::from_value(json!({
            "model": "gemini-1.5-flash",
            "prompt": ["line one", "line two"],
            "max_tokens": 10,
            "stream": true,
        }))
        .unwrap();
        let canonical = to_canonical(req).unwrap();
        assert_eq!(canonical.messages.len(), 1);
        assert_eq!(canonical.messages[0].role, "user");
        assert_eq!(canonical.messages[0].text_content(), "line one\nline two");
        assert_eq!(canonical.stream, Some(true));
    }

    #[test]
    fn test_response_to_legacy_shape() {
        let resp = ChatResponse {
            id: "chatcmpl-abc".into(),
            object: "chat.completion".into(),
            created: 7,
            model: "m".into(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".into(),
                    content: Some("out".into()),
                    reasoning_content: None,
                    tool_calls: None,
                },
                finish_reason: Some("stop".into()),
            }],
            usage: None,
        };
        let legacy = response_to_legacy(&resp);
        assert_eq!(legacy["object"], "text_completion");
        assert_eq!(legacy["choices"][0]["text"], "out");
        assert_eq!(legacy["choices"][0]["finish_reason"], "stop");
        assert!(legacy.get("usage").is_none());
    }

    #[test]
    fn test_chunk_reframing() {
        let chunk = ChatChunk::new("chatcmpl-x", 1, "m", Delta::content("hi"), None);
        let line = chunk_to_legacy(&serde_json::to_string(&chunk).unwrap()).unwrap();
        assert!(line.starts_with("data: "));
        let value: Value = serde_json::from_str(line.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(value["object"], "text_completion");
        assert_eq!(value["choices"][0]["text"], "hi");
    }
}
