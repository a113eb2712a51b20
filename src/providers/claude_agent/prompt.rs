//! Prompt assembly for the single-turn agent query.
//!
//! The agent wire takes one system prompt and one user prompt per query, so
//! multi-turn canonical conversations are folded: everything before the last
//! user message goes into a tagged `<conversation_history>` block inside the
//! system prompt, and the last user message becomes the prompt itself.

use serde_json::{Value, json};

use crate::constants::{
    AGENT_IDENTITY, CONTINUATION_PROMPT, DEFAULT_SYSTEM_PROMPT, IDENTITY_NEUTRALIZER,
};
use crate::error::GatewayError;
use crate::openai::{ChatMessage, ChatRequest, ContentPart, MessageContent};
use crate::providers::claude_agent::tools::build_tools_payload;

/// Output cap for agent queries. The wire requires one; the caller's
/// `max_tokens` is accepted and ignored along with the other sampling knobs.
const AGENT_MAX_OUTPUT: u32 = 16000;

const THINKING_SUFFIX_FORCED: &str = "\n\nBefore answering, reason inside <thinking>…</thinking> tags, then place your answer after the closing tag. Always include the thinking block.";

const THINKING_SUFFIX_ADAPTIVE: &str = "\n\nWhen a question benefits from deliberation, reason inside <thinking>…</thinking> tags and place your answer after the closing tag. Skip the tags for trivial questions.";

const JSON_MODE_SUFFIX: &str =
    "\n\nRespond with a single valid JSON object and nothing else. No prose, no code fences.";

/// Effort maps to a verbal depth instruction, not a token budget.
fn effort_instruction(effort: &str) -> Option<&'static str> {
    match effort {
        "minimal" => Some(" Keep the reasoning to a sentence or two."),
        "low" => Some(" Keep the reasoning brief."),
        "medium" => Some(" Reason step by step at moderate depth."),
        "high" => Some(" Reason thoroughly, considering alternatives before answering."),
        "xhigh" => Some(
            " Reason exhaustively: enumerate approaches, check edge cases, and verify the answer before finishing.",
        ),
        _ => None,
    }
}

/// Whether the caller asked for thinking extraction, and in which flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingMode {
    Off,
    Forced,
    Adaptive,
}

pub fn thinking_mode(req: &ChatRequest) -> ThinkingMode {
    if let Some(thinking_type) = req
        .thinking
        .as_ref()
        .and_then(|t| t.get("type"))
        .and_then(|t| t.as_str())
    {
        match thinking_type {
            "enabled" => return ThinkingMode::Forced,
            "adaptive" => return ThinkingMode::Adaptive,
            _ => {}
        }
    }
    if req
        .reasoning_effort
        .as_deref()
        .is_some_and(|e| matches!(e, "minimal" | "low" | "medium" | "high" | "xhigh"))
    {
        return ThinkingMode::Forced;
    }
    ThinkingMode::Off
}

/// The assembled single-turn query.
#[derive(Debug)]
pub struct AgentQuery {
    pub body: Value,
    pub thinking_requested: bool,
}

pub fn build_query(req: &ChatRequest, model: &str) -> Result<AgentQuery, GatewayError> {
    if req.n.is_some_and(|n| n > 1) {
        return Err(GatewayError::UnsupportedParameter {
            message: "Parameter 'n' > 1 is not supported".into(),
            param: "n".into(),
        });
    }

    let mode = thinking_mode(req);
    let system_prompt = fold_system_prompt(req, mode);
    let prompt_message = build_prompt_message(req);

    let mut body = json!({
        "model": model,
        "max_tokens": AGENT_MAX_OUTPUT,
        "system": [
            {"type": "text", "text": AGENT_IDENTITY},
            {"type": "text", "text": system_prompt},
        ],
        "messages": [prompt_message],
        "stream": req.wants_stream(),
    });

    if let Some(tools) = &req.tools
        && !tools.is_empty()
    {
        body["tools"] = Value::Array(build_tools_payload(tools));
    }

    Ok(AgentQuery {
        body,
        thinking_requested: mode != ThinkingMode::Off,
    })
}

/// Index of the last user message, if the conversation ends on one.
fn closing_user_index(messages: &[ChatMessage]) -> Option<usize> {
    let last_non_system = messages.iter().rposition(|m| m.role != "system")?;
    (messages[last_non_system].role == "user").then_some(last_non_system)
}

fn fold_system_prompt(req: &ChatRequest, mode: ThinkingMode) -> String {
    let caller_system: Vec<String> = req
        .messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.text_content())
        .filter(|t| !t.is_empty())
        .collect();

    let mut prompt = String::from(IDENTITY_NEUTRALIZER);
    prompt.push_str("\n\n");
    if caller_system.is_empty() {
        prompt.push_str(DEFAULT_SYSTEM_PROMPT);
    } else {
        prompt.push_str(&caller_system.join("\n\n"));
    }

    let closing = closing_user_index(&req.messages);
    let history: Vec<&ChatMessage> = req
        .messages
        .iter()
        .enumerate()
        .filter(|(i, m)| m.role != "system" && Some(*i) != closing)
        .map(|(_, m)| m)
        .collect();

    if !history.is_empty() {
        prompt.push_str("\n\n<conversation_history>\n");
        for msg in history {
            fold_history_message(msg, &mut prompt);
        }
        prompt.push_str("</conversation_history>");
    }

    match mode {
        ThinkingMode::Forced => {
            prompt.push_str(THINKING_SUFFIX_FORCED);
            if let Some(extra) = req.reasoning_effort.as_deref().and_then(effort_instruction) {
                prompt.push_str(extra);
            }
        }
        ThinkingMode::Adaptive => prompt.push_str(THINKING_SUFFIX_ADAPTIVE),
        ThinkingMode::Off => {}
    }

    if req
        .response_format
        .as_ref()
        .is_some_and(|f| f.format_type == "json_object")
    {
        prompt.push_str(JSON_MODE_SUFFIX);
    }

    prompt
}

fn fold_history_message(msg: &ChatMessage, out: &mut String) {
    match msg.role.as_str() {
        "user" => {
            out.push_str("User: ");
            out.push_str(&msg.text_content());
            out.push('\n');
        }
        "assistant" => {
            out.push_str("Assistant: ");
            let text = msg.text_content();
            if !text.is_empty() {
                out.push_str(&text);
            }
            if let Some(calls) = &msg.tool_calls {
                for call in calls {
                    out.push_str(&format!(
                        "<tool_call name=\"{}\" id=\"{}\">{}</tool_call>",
                        call.function.name, call.id, call.function.arguments
                    ));
                }
            }
            out.push('\n');
        }
        "tool" => {
            out.push_str(&format!(
                "<tool_result id=\"{}\">{}</tool_result>\n",
                msg.tool_call_id.as_deref().unwrap_or_default(),
                msg.text_content()
            ));
        }
        _ => {}
    }
}

/// The prompt message. Text-only conversations send the closing user
/// message's text; the multimodal fast path sends Anthropic content blocks
/// for it instead, decoding data URIs where possible.
fn build_prompt_message(req: &ChatRequest) -> Value {
    let closing = closing_user_index(&req.messages);

    let Some(index) = closing else {
        return json!({"role": "user", "content": CONTINUATION_PROMPT});
    };
    let message = &req.messages[index];

    if !req.has_images() {
        return json!({"role": "user", "content": message.text_content()});
    }

    let blocks = match &message.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
                ContentPart::ImageUrl { image_url } => image_block(&image_url.url),
            })
            .collect::<Vec<_>>(),
        other => {
            let text = match other {
                MessageContent::Text(t) => t.clone(),
                _ => String::new(),
            };
            vec![json!({"type": "text", "text": text})]
        }
    };

    json!({"role": "user", "content": blocks})
}

fn image_block(url: &str) -> Option<Value> {
    if let Some(rest) = url.strip_prefix("data:") {
        let (header, data) = rest.split_once(',')?;
        let media_type = header.split(';').next().unwrap_or("image/png");
        return Some(json!({
            "type": "image",
            "source": {"type": "base64", "media_type": media_type, "data": data}
        }));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Some(json!({
            "type": "image",
            "source": {"type": "url", "url": url}
        }));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::{FunctionCall, ImageUrl, ToolCall};

    fn base_request(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            model: "claude-3-5-sonnet".into(),
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
    fn test_rejects_n_greater_than_one() {
        let mut req = base_request(vec![ChatMessage::text("user", "hi")]);
        req.n = Some(2);
        let err = build_query(&req, "claude-3-5-sonnet").unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedParameter { .. }));
        assert_eq!(err.param(), Some("n"));
    }

    #[test]
    fn test_single_turn_prompt_and_default_system() {
        let req = base_request(vec![ChatMessage::text("user", "why?")]);
        let query = build_query(&req, "claude-3-5-sonnet").unwrap();
        assert_eq!(query.body["messages"][0]["content"], "why?");
        let system = query.body["system"][1]["text"].as_str().unwrap();
        assert!(system.starts_with(IDENTITY_NEUTRALIZER));
        assert!(system.contains(DEFAULT_SYSTEM_PROMPT));
        assert!(!system.contains("<conversation_history>"));
        assert_eq!(query.body["system"][0]["text"], AGENT_IDENTITY);
    }

    #[test]
    fn test_history_folds_into_system_prompt() {
        let mut assistant = ChatMessage::text("assistant", "Checking.");
        assistant.tool_calls = Some(vec![ToolCall {
            id: "call_1".into(),
            call_type: "function".into(),
            function: FunctionCall {
                name: "get_weather".into(),
                arguments: r#"{"city":"Paris"}"#.into(),
            },
        }]);
        let mut tool = ChatMessage::text("tool", "sunny");
        tool.tool_call_id = Some("call_1".into());

        let req = base_request(vec![
            ChatMessage::text("system", "be terse"),
            ChatMessage::text("user", "weather in paris?"),
            assistant,
            tool,
            ChatMessage::text("user", "and tomorrow?"),
        ]);
        let query = build_query(&req, "claude-3-5-sonnet").unwrap();

        let system = query.body["system"][1]["text"].as_str().unwrap();
        assert!(system.contains("be terse"));
        assert!(system.contains("<conversation_history>"));
        assert!(system.contains("User: weather in paris?"));
        assert!(
            system.contains(r#"<tool_call name="get_weather" id="call_1">{"city":"Paris"}</tool_call>"#)
        );
        assert!(system.contains(r#"<tool_result id="call_1">sunny</tool_result>"#));
        assert!(system.contains("</conversation_history>"));
        // The closing user message is the prompt, not history
        assert!(!system.contains("and tomorrow?"));
        assert_eq!(query.body["messages"][0]["content"], "and tomorrow?");
    }

    #[test]
    fn test_no_closing_user_message_uses_continuation_prompt() {
        let req = base_request(vec![
            ChatMessage::text("user", "do the task"),
            ChatMessage::text("assistant", "started"),
        ]);
        let query = build_query(&req, "claude-3-5-sonnet").unwrap();
        assert_eq!(query.body["messages"][0]["content"], CONTINUATION_PROMPT);
        let system = query.body["system"][1]["text"].as_str().unwrap();
        assert!(system.contains("User: do the task"));
        assert!(system.contains("Assistant: started"));
    }

    #[test]
    fn test_multimodal_fast_path() {
        let image_message = ChatMessage {
            role: "user".into(),
            content: MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "what is this".into(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: "data:image/png;base64,QUJD".into(),
                    },
                },
            ]),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        };
        let req = base_request(vec![
            ChatMessage::text("user", "earlier question"),
            ChatMessage::text("assistant", "earlier answer"),
            image_message,
        ]);
        let query = build_query(&req, "claude-3-5-sonnet").unwrap();

        let content = query.body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "image");
        assert_eq!(content[1]["source"]["media_type"], "image/png");
        assert_eq!(content[1]["source"]["data"], "QUJD");
        // History still folds identically
        let system = query.body["system"][1]["text"].as_str().unwrap();
        assert!(system.contains("User: earlier question"));
    }

    #[test]
    fn test_thinking_suffix_forced_vs_adaptive() {
        let mut req = base_request(vec![ChatMessage::text("user", "why?")]);
        req.reasoning_effort = Some("medium".into());
        let query = build_query(&req, "m").unwrap();
        assert!(query.thinking_requested);
        let system = query.body["system"][1]["text"].as_str().unwrap();
        assert!(system.contains("Always include the thinking block"));
        assert!(system.contains("moderate depth"));

        let mut req = base_request(vec![ChatMessage::text("user", "why?")]);
        req.thinking = Some(json!({"type": "adaptive"}));
        let query = build_query(&req, "m").unwrap();
        let system = query.body["system"][1]["text"].as_str().unwrap();
        assert!(system.contains("Skip the tags for trivial questions"));

        let req = base_request(vec![ChatMessage::text("user", "why?")]);
        let query = build_query(&req, "m").unwrap();
        assert!(!query.thinking_requested);
        assert!(
            !query.body["system"][1]["text"]
                .as_str()
                .unwrap()
                .contains("<thinking>")
        );
    }

    #[test]
    fn test_json_mode_suffix() {
        let mut req = base_request(vec![ChatMessage::text("user", "list them")]);
        req.response_format = Some(crate::openai::ResponseFormat {
            format_type: "json_object".into(),
        });
        let query = build_query(&req, "m").unwrap();
        let system = query.body["system"][1]["text"].as_str().unwrap();
        assert!(system.contains("single valid JSON object"));
    }

    #[test]
    fn test_tools_are_namespaced_in_body() {
        let mut req = base_request(vec![ChatMessage::text("user", "weather?")]);
        req.tools = Some(vec![crate::openai::Tool {
            tool_type: "function".into(),
            function: crate::openai::FunctionDef {
                name: "get_weather".into(),
                description: None,
                parameters: None,
            },
        }]);
        let query = build_query(&req, "m").unwrap();
        assert_eq!(query.body["tools"][0]["name"], "mcp_get_weather");
    }

    #[test]
    fn test_sampling_knobs_are_ignored() {
        let mut req = base_request(vec![ChatMessage::text("user", "hi")]);
        req.temperature = Some(0.1);
        req.top_p = Some(0.5);
        req.max_tokens = Some(5);
        req.stop = Some(crate::openai::StopSequences::One("X".into()));
        let query = build_query(&req, "m").unwrap();
        assert_eq!(query.body["max_tokens"], AGENT_MAX_OUTPUT);
        assert!(query.body.get("temperature").is_none());
        assert!(query.body.get("top_p").is_none());
        assert!(query.body.get("stop_sequences").is_none());
    }
}
