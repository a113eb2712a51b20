//! Google Gemini adapter.
//!
//! Canonical messages become `contents[]` with `user`/`model` roles; system
//! messages are joined into one `systemInstruction`. The streaming pipeline
//! is raw bytes → line buffer → `data:` parse → canonical delta chunks.
//! Vertex-AI shares this translation and overrides only URL construction.

use async_stream::stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Map, Value, json};

use crate::auth::Credential;
use crate::constants::GEMINI_BASE_URL;
use crate::error::{GatewayError, sanitize_secrets};
use crate::openai::{
    ChatChunk, ChatRequest, ChatResponse, Choice, ContentPart, Delta, FunctionCall,
    FunctionCallDelta, MessageContent, ModelEntry, ResponseMessage, ToolCall, ToolCallDelta,
    Usage, generate_call_id, generate_chat_id, now_unix,
};
use crate::providers::{Provider, SseStream};
use crate::store::ProviderType;

pub struct GeminiProvider {
    http: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> ProviderType {
        ProviderType::Gemini
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        credential: &Credential,
    ) -> Result<ChatResponse, GatewayError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            GEMINI_BASE_URL,
            request.model,
            credential.api_key()
        );
        complete_gemini(&self.http, &url, request).await
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        credential: &Credential,
    ) -> Result<SseStream, GatewayError> {
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            GEMINI_BASE_URL,
            request.model,
            credential.api_key()
        );
        stream_gemini(&self.http, &url, request).await
    }

    async fn list_models(
        &self,
        credential: &Credential,
    ) -> Result<Vec<ModelEntry>, GatewayError> {
        let url = format!(
            "{}/v1beta/models?key={}",
            GEMINI_BASE_URL,
            credential.api_key()
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| GatewayError::provider(sanitize_secrets(&e.to_string())))?;
        let body = read_upstream_json(response).await?;

        let models = body
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                    .filter(|name| name.contains("gemini"))
                    .map(|name| {
                        ModelEntry::new(name.strip_prefix("models/").unwrap_or(name), "google")
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(models)
    }
}

/// Shared non-streaming call used by both Gemini and Vertex-AI.
pub async fn complete_gemini(
    http: &reqwest::Client,
    url: &str,
    request: &ChatRequest,
) -> Result<ChatResponse, GatewayError> {
    let body = to_gemini_request(request);
    let response = http
        .post(url)
        .json(&body)
        .send()
        .await
        .map_err(|e| GatewayError::provider(sanitize_secrets(&e.to_string())))?;
    let body = read_upstream_json(response).await?;
    Ok(from_gemini_response(&body, &request.model))
}

/// Shared streaming call used by both Gemini and Vertex-AI.
pub async fn stream_gemini(
    http: &reqwest::Client,
    url: &str,
    request: &ChatRequest,
) -> Result<SseStream, GatewayError> {
    let body = to_gemini_request(request);
    let response = http
        .post(url)
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

    let id = generate_chat_id();
    let created = now_unix();
    let model = request.model.clone();
    let include_usage = request.include_usage();
    let upstream = response.bytes_stream();

    let sse = stream! {
        let mut upstream = std::pin::pin!(upstream);
        let mut buffer = String::new();
        let mut role_sent = false;
        let mut finish_sent = false;
        let mut saw_tool_call = false;
        let mut tool_index: u32 = 0;
        let mut last_usage: Option<Usage> = None;

        while let Some(chunk) = upstream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    // Bytes are already on the wire; fail in-band
                    let message = sanitize_secrets(&e.to_string());
                    let tail = ChatChunk::new(&id, created, &model, Delta::content(format!("\n\n[Error: {message}]")), None);
                    yield Ok(Bytes::from(tail.to_sse()));
                    let finish = ChatChunk::new(&id, created, &model, Delta::default(), Some("stop".to_string()));
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
                let line = buffer[..newline].trim_end_matches('\r').to_string();
                buffer.drain(..=newline);

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                let Ok(event) = serde_json::from_str::<Value>(data) else {
                    continue;
                };

                if !role_sent {
                    role_sent = true;
                    let prelude = ChatChunk::new(&id, created, &model, Delta {
                        role: Some("assistant".to_string()),
                        ..Default::default()
                    }, None);
                    yield Ok(Bytes::from(prelude.to_sse()));
                }

                if let Some(usage) = event.get("usageMetadata") {
                    last_usage = Some(usage_from_metadata(usage));
                }

                let candidate = event
                    .get("candidates")
                    .and_then(|c| c.as_array())
                    .and_then(|c| c.first());
                let Some(candidate) = candidate else {
                    continue;
                };

                let parts = candidate
                    .pointer("/content/parts")
                    .and_then(|p| p.as_array())
                    .cloned()
                    .unwrap_or_default();

                for part in &parts {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str())
                        && !text.is_empty()
                    {
                        let delta = ChatChunk::new(&id, created, &model, Delta::content(text), None);
                        yield Ok(Bytes::from(delta.to_sse()));
                    }
                    if let Some(call) = part.get("functionCall") {
                        saw_tool_call = true;
                        let name = call.get("name").and_then(|n| n.as_str()).unwrap_or_default();
                        let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                        let delta = ChatChunk::new(&id, created, &model, Delta {
                            tool_calls: Some(vec![ToolCallDelta {
                                index: tool_index,
                                id: Some(generate_call_id()),
                                call_type: Some("function".to_string()),
                                function: Some(FunctionCallDelta {
                                    name: Some(name.to_string()),
                                    arguments: Some(args.to_string()),
                                }),
                            }]),
                            ..Default::default()
                        }, None);
                        tool_index += 1;
                        yield Ok(Bytes::from(delta.to_sse()));
                    }
                }

                if let Some(reason) = candidate.get("finishReason").and_then(|r| r.as_str())
                    && !finish_sent
                {
                    finish_sent = true;
                    let finish_reason = map_finish_reason(reason, saw_tool_call);
                    let mut finish = ChatChunk::new(&id, created, &model, Delta::default(), Some(finish_reason));
                    if include_usage {
                        finish.usage = last_usage;
                    }
                    yield Ok(Bytes::from(finish.to_sse()));
                }
            }
        }

        if !finish_sent {
            let reason = if saw_tool_call { "tool_calls" } else { "stop" };
            let mut finish = ChatChunk::new(&id, created, &model, Delta::default(), Some(reason.to_string()));
            if include_usage {
                finish.usage = last_usage;
            }
            yield Ok(Bytes::from(finish.to_sse()));
        }
        yield Ok(Bytes::from("data: [DONE]\n\n"));
    };

    Ok(Box::pin(sse))
}

pub async fn read_upstream_json(response: reqwest::Response) -> Result<Value, GatewayError> {
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

// ============================================================================
// Request translation
// ============================================================================

pub fn to_gemini_request(req: &ChatRequest) -> Value {
    let mut contents: Vec<Value> = Vec::new();
    let mut system_parts: Vec<String> = Vec::new();

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" => {
                let text = msg.text_content();
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "user" | "assistant" => {
                let role = if msg.role == "user" { "user" } else { "model" };
                let mut parts = content_to_parts(&msg.content);
                if let Some(calls) = &msg.tool_calls {
                    for call in calls {
                        let args: Value = serde_json::from_str(if call.function.arguments.is_empty() {
                            "{}"
                        } else {
                            &call.function.arguments
                        })
                        .unwrap_or_else(|_| json!({}));
                        parts.push(json!({
                            "functionCall": {"name": call.function.name, "args": args}
                        }));
                    }
                }
                if !parts.is_empty() {
                    contents.push(json!({"role": role, "parts": parts}));
                }
            }
            "tool" => {
                let text = msg.text_content();
                let response: Value = serde_json::from_str(&text)
                    .unwrap_or_else(|_| json!({"result": text}));
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": msg.name.clone().unwrap_or_else(|| "unknown".to_string()),
                            "response": response,
                        }
                    }]
                }));
            }
            _ => {}
        }
    }

    let mut body = Map::new();
    body.insert("contents".to_string(), Value::Array(contents));

    if !system_parts.is_empty() {
        body.insert(
            "systemInstruction".to_string(),
            json!({"parts": [{"text": system_parts.join("\n\n")}]}),
        );
    }

    if let Some(tools) = &req.tools
        && !tools.is_empty()
    {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|t| {
                let mut decl = Map::new();
                decl.insert("name".to_string(), json!(t.function.name));
                if let Some(description) = &t.function.description {
                    decl.insert("description".to_string(), json!(description));
                }
                if let Some(parameters) = &t.function.parameters {
                    decl.insert("parameters".to_string(), parameters.clone());
                }
                Value::Object(decl)
            })
            .collect();
        body.insert(
            "tools".to_string(),
            json!([{"functionDeclarations": declarations}]),
        );
    }

    if let Some(tool_config) = tool_choice_to_config(req.tool_choice.as_ref()) {
        body.insert("toolConfig".to_string(), tool_config);
    }

    let mut generation = Map::new();
    if let Some(t) = req.temperature {
        generation.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = req.top_p {
        generation.insert("topP".to_string(), json!(p));
    }
    if let Some(m) = req.max_tokens {
        generation.insert("maxOutputTokens".to_string(), json!(m));
    }
    if let Some(stop) = &req.stop {
        generation.insert("stopSequences".to_string(), json!(stop.to_vec()));
    }
    if req
        .response_format
        .as_ref()
        .is_some_and(|f| f.format_type == "json_object")
    {
        generation.insert("responseMimeType".to_string(), json!("application/json"));
    }
    if let Some(f) = req.frequency_penalty {
        generation.insert("frequencyPenalty".to_string(), json!(f));
    }
    if let Some(p) = req.presence_penalty {
        generation.insert("presencePenalty".to_string(), json!(p));
    }
    if !generation.is_empty() {
        body.insert("generationConfig".to_string(), Value::Object(generation));
    }

    Value::Object(body)
}

fn content_to_parts(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![json!({"text": text})]
            }
        }
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(json!({"text": text})),
                ContentPart::ImageUrl { image_url } => image_part(&image_url.url),
            })
            .collect(),
        MessageContent::Null => Vec::new(),
    }
}

fn image_part(url: &str) -> Option<Value> {
    if let Some(rest) = url.strip_prefix("data:") {
        let (header, data) = rest.split_once(',')?;
        let mime_type = header.split(';').next().unwrap_or("image/png");
        return Some(json!({"inlineData": {"mimeType": mime_type, "data": data}}));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Some(json!({"fileData": {"mimeType": "image/jpeg", "fileUri": url}}));
    }
    None
}

fn tool_choice_to_config(tool_choice: Option<&Value>) -> Option<Value> {
    let choice = tool_choice?;
    if let Some(mode) = choice.as_str() {
        let mode = match mode {
            "none" => "NONE",
            "auto" => "AUTO",
            "required" => "ANY",
            _ => return None,
        };
        return Some(json!({"functionCallingConfig": {"mode": mode}}));
    }
    let name = choice.pointer("/function/name").and_then(|n| n.as_str())?;
    Some(json!({
        "functionCallingConfig": {"mode": "ANY", "allowedFunctionNames": [name]}
    }))
}

// ============================================================================
// Response translation
// ============================================================================

pub fn map_finish_reason(reason: &str, saw_tool_call: bool) -> String {
    if saw_tool_call {
        return "tool_calls".to_string();
    }
    match reason {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "TOOL_CALLS" => "tool_calls",
        _ => "stop",
    }
    .to_string()
}

fn usage_from_metadata(metadata: &Value) -> Usage {
    let prompt = metadata
        .get("promptTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let candidates = metadata
        .get("candidatesTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total = metadata
        .get("totalTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt + candidates);
    Usage {
        prompt_tokens: prompt,
        completion_tokens: candidates,
        total_tokens: total,
    }
}

pub fn from_gemini_response(body: &Value, model: &str) -> ChatResponse {
    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut finish_reason: Option<String> = None;

    if let Some(candidate) = body
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    {
        if let Some(parts) = candidate.pointer("/content/parts").and_then(|p| p.as_array()) {
            for part in parts {
                if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                    text.push_str(t);
                }
                if let Some(call) = part.get("functionCall") {
                    let name = call.get("name").and_then(|n| n.as_str()).unwrap_or_default();
                    let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                    tool_calls.push(ToolCall {
                        id: generate_call_id(),
                        call_type: "function".to_string(),
                        function: FunctionCall {
                            name: name.to_string(),
                            arguments: args.to_string(),
                        },
                    });
                }
            }
        }
        finish_reason = candidate
            .get("finishReason")
            .and_then(|r| r.as_str())
            .map(|r| map_finish_reason(r, !tool_calls.is_empty()));
    }

    let usage = body.get("usageMetadata").map(usage_from_metadata);

    ChatResponse {
        id: generate_chat_id(),
        object: "chat.completion".to_string(),
        created: now_unix(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: if text.is_empty() { None } else { Some(text) },
                reasoning_content: None,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            },
            finish_reason,
        }],
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::{ChatMessage, FunctionDef, StopSequences, Tool};

    fn request_with(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            model: "gemini-1.5-flash".into(),
            messages,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: None,
            stop: None,
            tools: None,
            tool_choice: None,
            response_format: None,
            frequency_penalty: None,
            presence_penalty: None,
            n: None,
            stream_options: None,
            thinking: None,
            reasoning_effort: None,
        }
    }

    #[test]
    fn test_system_messages_join_into_system_instruction() {
        let req = request_with(vec![
            ChatMessage::text("system", "one"),
            ChatMessage::text("system", "two"),
            ChatMessage::text("user", "hi"),
        ]);
        let body = to_gemini_request(&req);
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            "one\n\ntwo"
        );
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
    }

    #[test]
    fn test_assistant_role_becomes_model() {
        let req = request_with(vec![
            ChatMessage::text("user", "q"),
            ChatMessage::text("assistant", "a"),
        ]);
        let body = to_gemini_request(&req);
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn test_tool_message_becomes_function_response() {
        let mut msg = ChatMessage::text("tool", r#"{"temp": 21}"#);
        msg.name = Some("get_weather".into());
        msg.tool_call_id = Some("call_1".into());
        let req = request_with(vec![msg]);
        let body = to_gemini_request(&req);
        let part = &body["contents"][0]["parts"][0]["functionResponse"];
        assert_eq!(part["name"], "get_weather");
        assert_eq!(part["response"]["temp"], 21);
        assert_eq!(body["contents"][0]["role"], "user");
    }

    #[test]
    fn test_tool_message_with_plain_text_wraps_result() {
        let msg = ChatMessage::text("tool", "sunny");
        let req = request_with(vec![msg]);
        let body = to_gemini_request(&req);
        let part = &body["contents"][0]["parts"][0]["functionResponse"];
        assert_eq!(part["name"], "unknown");
        assert_eq!(part["response"]["result"], "sunny");
    }

    #[test]
    fn test_data_uri_becomes_inline_data() {
        assert_eq!(
            image_part("data:image/png;base64,QUJD").unwrap(),
            json!({"inlineData": {"mimeType": "image/png", "data": "QUJD"}})
        );
        assert_eq!(
            image_part("https://example.com/cat.jpg").unwrap(),
            json!({"fileData": {"mimeType": "image/jpeg", "fileUri": "https://example.com/cat.jpg"}})
        );
        assert!(image_part("ftp://nope").is_none());
    }

    #[test]
    fn test_sampling_knobs_rename() {
        let mut req = request_with(vec![ChatMessage::text("user", "hi")]);
        req.temperature = Some(0.5);
        req.top_p = Some(0.9);
        req.max_tokens = Some(256);
        req.stop = Some(StopSequences::One("END".into()));
        req.frequency_penalty = Some(0.1);
        req.presence_penalty = Some(0.2);
        req.response_format = Some(crate::openai::ResponseFormat {
            format_type: "json_object".into(),
        });
        let body = to_gemini_request(&req);
        let generation = &body["generationConfig"];
        assert_eq!(generation["topP"], 0.9);
        assert_eq!(generation["maxOutputTokens"], 256);
        assert_eq!(generation["stopSequences"][0], "END");
        assert_eq!(generation["responseMimeType"], "application/json");
        assert_eq!(generation["frequencyPenalty"], 0.1);
        assert_eq!(generation["presencePenalty"], 0.2);
    }

    #[test]
    fn test_tool_choice_mapping() {
        assert_eq!(
            tool_choice_to_config(Some(&json!("none"))).unwrap()["functionCallingConfig"]["mode"],
            "NONE"
        );
        assert_eq!(
            tool_choice_to_config(Some(&json!("auto"))).unwrap()["functionCallingConfig"]["mode"],
            "AUTO"
        );
        assert_eq!(
            tool_choice_to_config(Some(&json!("required"))).unwrap()["functionCallingConfig"]
                ["mode"],
            "ANY"
        );
        let pinned = tool_choice_to_config(Some(
            &json!({"type": "function", "function": {"name": "lookup"}}),
        ))
        .unwrap();
        assert_eq!(pinned["functionCallingConfig"]["mode"], "ANY");
        assert_eq!(
            pinned["functionCallingConfig"]["allowedFunctionNames"][0],
            "lookup"
        );
        assert!(tool_choice_to_config(None).is_none());
    }

    #[test]
    fn test_tools_become_function_declarations() {
        let mut req = request_with(vec![ChatMessage::text("user", "hi")]);
        req.tools = Some(vec![Tool {
            tool_type: "function".into(),
            function: FunctionDef {
                name: "get_weather".into(),
                description: Some("weather lookup".into()),
                parameters: Some(json!({"type": "object", "properties": {"city": {"type": "string"}}})),
            },
        }]);
        let body = to_gemini_request(&req);
        let decl = &body["tools"][0]["functionDeclarations"][0];
        assert_eq!(decl["name"], "get_weather");
        assert_eq!(decl["parameters"]["properties"]["city"]["type"], "string");
    }

    #[test]
    fn test_response_translation_with_function_call() {
        let body = json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "Checking."},
                    {"functionCall": {"name": "get_weather", "args": {"city": "Paris"}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 9, "totalTokenCount": 14}
        });
        let resp = from_gemini_response(&body, "gemini-1.5-flash");
        let message = &resp.choices[0].message;
        assert_eq!(message.content.as_deref(), Some("Checking."));
        let calls = message.tool_calls.as_ref().unwrap();
        assert!(calls[0].id.starts_with("call_"));
        assert_eq!(calls[0].function.name, "get_weather");
        // A tool call forces tool_calls regardless of STOP
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        let usage = resp.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 5);
        assert_eq!(usage.completion_tokens, 9);
        assert_eq!(usage.total_tokens, 14);
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason("STOP", false), "stop");
        assert_eq!(map_finish_reason("MAX_TOKENS", false), "length");
        assert_eq!(map_finish_reason("TOOL_CALLS", false), "tool_calls");
        assert_eq!(map_finish_reason("STOP", true), "tool_calls");
    }
}
