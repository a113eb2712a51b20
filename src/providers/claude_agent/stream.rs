//! Streaming state machine for the agent wire.
//!
//! Translates agent events into canonical SSE chunks. Tool-call init chunks
//! are withheld until the first non-empty argument fragment so that every
//! init precedes its argument deltas and calls that never produce input are
//! backfilled or safety-netted with `"{}"`. A keepalive comment goes out on
//! a fixed interval until the final emission.

use async_stream::stream;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use tokio::time::{Duration, interval};

use crate::constants::KEEPALIVE_INTERVAL_SECS;
use crate::openai::{
    ChatChunk, Delta, FunctionCallDelta, ToolCallDelta, Usage, generate_call_id,
};
use crate::providers::SseStream;
use crate::providers::claude_agent::thinking::ThinkingScanner;
use crate::providers::claude_agent::tools::strip_tool_name;
use crate::providers::claude_agent::wire::AgentEvent;

const KEEPALIVE_COMMENT: &str = ": keepalive\n\n";

pub struct AgentStreamContext {
    pub id: String,
    pub created: u64,
    pub model: String,
    pub thinking_requested: bool,
    pub include_usage: bool,
}

struct ToolRecord {
    raw_id: String,
    id: String,
    name: String,
    out_index: u32,
    emitted: bool,
}

/// Canonical tool-call id derived from the upstream block id.
fn derive_call_id(raw: &str) -> String {
    match raw.strip_prefix("toolu_") {
        Some(suffix) => format!("call_{suffix}"),
        None => generate_call_id(),
    }
}

fn chunk(ctx: &AgentStreamContext, delta: Delta, finish: Option<String>) -> Bytes {
    Bytes::from(ChatChunk::new(&ctx.id, ctx.created, &ctx.model, delta, finish).to_sse())
}

fn tool_init_delta(record: &ToolRecord) -> Delta {
    Delta {
        tool_calls: Some(vec![ToolCallDelta {
            index: record.out_index,
            id: Some(record.id.clone()),
            call_type: Some("function".to_string()),
            function: Some(FunctionCallDelta {
                name: Some(record.name.clone()),
                arguments: Some(String::new()),
            }),
        }]),
        ..Default::default()
    }
}

fn tool_args_delta(out_index: u32, arguments: &str) -> Delta {
    Delta {
        tool_calls: Some(vec![ToolCallDelta {
            index: out_index,
            id: None,
            call_type: None,
            function: Some(FunctionCallDelta {
                name: None,
                arguments: Some(arguments.to_string()),
            }),
        }]),
        ..Default::default()
    }
}

/// Run the state machine over an upstream agent event stream.
pub fn agent_sse_stream(
    upstream: impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
    ctx: AgentStreamContext,
) -> SseStream {
    let sse = stream! {
        let mut upstream = std::pin::pin!(upstream);
        let mut buffer = String::new();
        let mut scanner = ThinkingScanner::new();
        let mut open_tools: HashMap<u32, ToolRecord> = HashMap::new();
        let mut completed_tools: Vec<ToolRecord> = Vec::new();
        let mut next_out_index: u32 = 0;
        let mut any_tool_emitted = false;
        let mut usage = Usage::default();
        let mut failure: Option<String> = None;

        let mut keepalive = interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
        keepalive.reset(); // don't fire immediately

        // Role prelude, exactly once
        yield Ok(chunk(&ctx, Delta { role: Some("assistant".to_string()), ..Default::default() }, None));

        'read: loop {
            tokio::select! {
                biased;

                chunk_opt = upstream.next() => {
                    let Some(chunk_result) = chunk_opt else {
                        break 'read;
                    };
                    let bytes = match chunk_result {
                        Ok(b) => b,
                        Err(e) => {
                            failure = Some(e.to_string());
                            break 'read;
                        }
                    };
                    let Ok(text) = std::str::from_utf8(&bytes) else {
                        continue;
                    };
                    buffer.push_str(text);

                    while let Some(newline) = buffer.find('\n') {
                        let line = buffer[..newline].trim_end_matches('\r').to_string();
                        buffer.drain(..=newline);

                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if data == "[DONE]" {
                            break 'read;
                        }
                        let Ok(event) = serde_json::from_str::<AgentEvent>(data) else {
                            continue;
                        };

                        match event.event_type.as_str() {
                            "message_start" => {
                                if let Some(u) = event.message.as_ref().and_then(|m| m.usage) {
                                    usage.prompt_tokens = u.input_tokens;
                                }
                            }
                            "content_block_start" => {
                                if let Some(block) = &event.content_block
                                    && block.block_type == "tool_use"
                                {
                                    let raw_id = block.id.clone().unwrap_or_default();
                                    let record = ToolRecord {
                                        id: derive_call_id(&raw_id),
                                        raw_id,
                                        name: strip_tool_name(block.name.as_deref().unwrap_or_default()),
                                        out_index: next_out_index,
                                        emitted: false,
                                    };
                                    next_out_index += 1;
                                    open_tools.insert(event.index.unwrap_or(0), record);
                                }
                            }
                            "content_block_delta" => {
                                let Some(delta) = &event.delta else { continue };

                                if let Some(text) = &delta.text {
                                    let scanned = scanner.push(text);
                                    if !scanned.content.is_empty() {
                                        yield Ok(chunk(&ctx, Delta::content(scanned.content), None));
                                    }
                                    if !scanned.reasoning.is_empty() && ctx.thinking_requested {
                                        yield Ok(chunk(&ctx, Delta::reasoning(scanned.reasoning), None));
                                    }
                                }

                                if let Some(thinking) = &delta.thinking
                                    && !thinking.is_empty()
                                    && ctx.thinking_requested
                                {
                                    yield Ok(chunk(&ctx, Delta::reasoning(thinking.clone()), None));
                                }

                                if let Some(fragment) = delta.partial_json.as_deref()
                                    && !fragment.is_empty()
                                    && let Some(record) = open_tools.get_mut(&event.index.unwrap_or(0))
                                {
                                    if !record.emitted {
                                        record.emitted = true;
                                        any_tool_emitted = true;
                                        yield Ok(chunk(&ctx, tool_init_delta(record), None));
                                    }
                                    let out_index = record.out_index;
                                    yield Ok(chunk(&ctx, tool_args_delta(out_index, fragment), None));
                                }
                            }
                            "content_block_stop" => {
                                if let Some(record) = open_tools.remove(&event.index.unwrap_or(0)) {
                                    completed_tools.push(record);
                                }
                            }
                            "assistant" => {
                                // A complete message; backfill any tool call
                                // whose input never streamed
                                let blocks = event
                                    .message
                                    .as_ref()
                                    .and_then(|m| m.content.clone())
                                    .unwrap_or_default();
                                for block in blocks {
                                    if block.get("type").and_then(|t| t.as_str()) != Some("tool_use") {
                                        continue;
                                    }
                                    let raw_id = block.get("id").and_then(|i| i.as_str()).unwrap_or_default();
                                    let arguments = block
                                        .get("input")
                                        .map(|i| i.to_string())
                                        .unwrap_or_else(|| "{}".to_string());

                                    let tracked = open_tools
                                        .values_mut()
                                        .chain(completed_tools.iter_mut())
                                        .find(|r| r.raw_id == raw_id);

                                    let (init_delta, out_index) = match tracked {
                                        Some(record) => {
                                            if record.emitted {
                                                continue;
                                            }
                                            record.emitted = true;
                                            (tool_init_delta(record), record.out_index)
                                        }
                                        None => {
                                            let record = ToolRecord {
                                                id: derive_call_id(raw_id),
                                                raw_id: raw_id.to_string(),
                                                name: strip_tool_name(
                                                    block.get("name").and_then(|n| n.as_str()).unwrap_or_default(),
                                                ),
                                                out_index: next_out_index,
                                                emitted: true,
                                            };
                                            next_out_index += 1;
                                            let init = tool_init_delta(&record);
                                            let out_index = record.out_index;
                                            completed_tools.push(record);
                                            (init, out_index)
                                        }
                                    };
                                    any_tool_emitted = true;
                                    yield Ok(chunk(&ctx, init_delta, None));
                                    yield Ok(chunk(&ctx, tool_args_delta(out_index, &arguments), None));
                                }
                            }
                            "message_delta" => {
                                if let Some(u) = event.usage {
                                    usage.completion_tokens = u.output_tokens;
                                    if u.input_tokens > 0 {
                                        usage.prompt_tokens = u.input_tokens;
                                    }
                                }
                            }
                            "message_stop" => {
                                break 'read;
                            }
                            "error" => {
                                let message = event
                                    .error
                                    .map(|e| e.message)
                                    .unwrap_or_else(|| "upstream error".to_string());
                                failure = Some(message);
                                break 'read;
                            }
                            _ => {}
                        }
                    }
                }

                _ = keepalive.tick() => {
                    yield Ok(Bytes::from(KEEPALIVE_COMMENT));
                }
            }
        }

        if let Some(message) = failure {
            // Streaming already began; deliver the failure in-band
            yield Ok(chunk(&ctx, Delta::content(format!("\n\n[Error: {message}]")), None));
            yield Ok(chunk(&ctx, Delta::default(), Some("stop".to_string())));
            yield Ok(Bytes::from("data: [DONE]\n\n"));
            return;
        }

        // Flush the thinking scanner in whatever state it ended
        let scanned = scanner.finish();
        if !scanned.content.is_empty() {
            yield Ok(chunk(&ctx, Delta::content(scanned.content), None));
        }
        if !scanned.reasoning.is_empty() && ctx.thinking_requested {
            yield Ok(chunk(&ctx, Delta::reasoning(scanned.reasoning), None));
        }

        // Safety net: any tracked call that never produced input goes out
        // with empty arguments
        let mut leftovers: Vec<ToolRecord> = open_tools
            .into_values()
            .chain(completed_tools)
            .filter(|r| !r.emitted)
            .collect();
        leftovers.sort_by_key(|r| r.out_index);
        for record in leftovers {
            any_tool_emitted = true;
            yield Ok(chunk(&ctx, tool_init_delta(&record), None));
            yield Ok(chunk(&ctx, tool_args_delta(record.out_index, "{}"), None));
        }

        let finish_reason = if any_tool_emitted { "tool_calls" } else { "stop" };
        let mut finish = ChatChunk::new(&ctx.id, ctx.created, &ctx.model, Delta::default(), Some(finish_reason.to_string()));
        if ctx.include_usage {
            finish.usage = Some(usage);
        }
        yield Ok(Bytes::from(finish.to_sse()));
        yield Ok(Bytes::from("data: [DONE]\n\n"));
    };

    Box::pin(sse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn ctx(thinking: bool, include_usage: bool) -> AgentStreamContext {
        AgentStreamContext {
            id: "chatcmpl-0123456789abcdef01234567".into(),
            created: 1,
            model: "claude-3-5-sonnet".into(),
            thinking_requested: thinking,
            include_usage,
        }
    }

    fn sse(lines: &[&str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + use<> {
        let frames: Vec<Result<Bytes, std::io::Error>> = lines
            .iter()
            .map(|l| Ok(Bytes::from(format!("data: {l}\n\n"))))
            .collect();
        futures_util::stream::iter(frames)
    }

    async fn collect_chunks(stream: SseStream) -> Vec<Value> {
        let frames: Vec<Bytes> = stream.map(|r| r.unwrap()).collect().await;
        let text: String = frames
            .iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect();
        text.lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .filter(|d| *d != "[DONE]")
            .map(|d| serde_json::from_str(d).unwrap())
            .collect()
    }

    fn deltas(chunks: &[Value]) -> Vec<&Value> {
        chunks.iter().map(|c| &c["choices"][0]["delta"]).collect()
    }

    #[tokio::test]
    async fn test_role_prelude_and_text() {
        let upstream = sse(&[
            r#"{"type":"message_start","message":{"usage":{"input_tokens":5,"output_tokens":0}}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}"#,
            r#"{"type":"message_stop"}"#,
        ]);
        let chunks = collect_chunks(agent_sse_stream(upstream, ctx(false, false))).await;
        let deltas = deltas(&chunks);

        assert_eq!(deltas[0]["role"], "assistant");
        assert!(deltas[0].get("content").is_none());
        assert_eq!(deltas[1]["content"], "Hello");
        let finish = &chunks[chunks.len() - 1];
        assert_eq!(finish["choices"][0]["finish_reason"], "stop");
        // Q3: no usage without stream_options.include_usage
        assert!(chunks.iter().all(|c| c.get("usage").is_none()));
    }

    #[tokio::test]
    async fn test_tool_call_framing_two_fragments() {
        let upstream = sse(&[
            r#"{"type":"message_start","message":{"usage":{"input_tokens":3,"output_tokens":0}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_X","name":"mcp_get_weather"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"locat"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"ion\":\"Paris\"}"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}}"#,
            r#"{"type":"message_stop"}"#,
        ]);
        let chunks = collect_chunks(agent_sse_stream(upstream, ctx(false, false))).await;
        let deltas = deltas(&chunks);

        // [role, init, frag1, frag2, finish]
        assert_eq!(chunks.len(), 5);
        let init = &deltas[1]["tool_calls"][0];
        assert_eq!(init["index"], 0);
        assert_eq!(init["id"], "call_X");
        assert_eq!(init["type"], "function");
        assert_eq!(init["function"]["name"], "get_weather");
        assert_eq!(init["function"]["arguments"], "");

        assert_eq!(deltas[2]["tool_calls"][0]["function"]["arguments"], "{\"locat");
        assert!(deltas[2]["tool_calls"][0].get("id").is_none());
        assert_eq!(
            deltas[3]["tool_calls"][0]["function"]["arguments"],
            "ion\":\"Paris\"}"
        );
        assert_eq!(chunks[4]["choices"][0]["finish_reason"], "tool_calls");
    }

    #[tokio::test]
    async fn test_empty_fragments_are_skipped() {
        let upstream = sse(&[
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_A","name":"mcp_t"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":""}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{}"}}"#,
            r#"{"type":"message_stop"}"#,
        ]);
        let chunks = collect_chunks(agent_sse_stream(upstream, ctx(false, false))).await;
        // role + init + one delta + finish: the empty fragment emitted nothing
        assert_eq!(chunks.len(), 4);
    }

    #[tokio::test]
    async fn test_backfill_from_full_assistant_message() {
        let upstream = sse(&[
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_B","name":"mcp_lookup"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_B","name":"mcp_lookup","input":{"q":"rust"}}]}}"#,
            r#"{"type":"message_stop"}"#,
        ]);
        let chunks = collect_chunks(agent_sse_stream(upstream, ctx(false, false))).await;
        let deltas = deltas(&chunks);

        let init = &deltas[1]["tool_calls"][0];
        assert_eq!(init["id"], "call_B");
        assert_eq!(init["function"]["arguments"], "");
        assert_eq!(
            deltas[2]["tool_calls"][0]["function"]["arguments"],
            r#"{"q":"rust"}"#
        );
        assert_eq!(
            chunks.last().unwrap()["choices"][0]["finish_reason"],
            "tool_calls"
        );
    }

    #[tokio::test]
    async fn test_safety_net_emits_empty_arguments() {
        let upstream = sse(&[
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_C","name":"mcp_noop"}}"#,
            r#"{"type":"message_stop"}"#,
        ]);
        let chunks = collect_chunks(agent_sse_stream(upstream, ctx(false, false))).await;
        let deltas = deltas(&chunks);

        assert_eq!(deltas[1]["tool_calls"][0]["id"], "call_C");
        assert_eq!(deltas[2]["tool_calls"][0]["function"]["arguments"], "{}");
        assert_eq!(
            chunks.last().unwrap()["choices"][0]["finish_reason"],
            "tool_calls"
        );
    }

    #[tokio::test]
    async fn test_thinking_extraction_across_fragments() {
        let upstream = sse(&[
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"A<thin"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"king>B</think"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"ing>C"}}"#,
            r#"{"type":"message_stop"}"#,
        ]);
        let chunks = collect_chunks(agent_sse_stream(upstream, ctx(true, false))).await;

        let mut content = String::new();
        let mut reasoning = String::new();
        for c in &chunks {
            if let Some(t) = c["choices"][0]["delta"]["content"].as_str() {
                content.push_str(t);
            }
            if let Some(t) = c["choices"][0]["delta"]["reasoning_content"].as_str() {
                reasoning.push_str(t);
            }
        }
        assert_eq!(content, "AC");
        assert_eq!(reasoning, "B");
    }

    #[tokio::test]
    async fn test_thinking_discarded_when_not_requested() {
        let upstream = sse(&[
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"A<thinking>secret</thinking>C"}}"#,
            r#"{"type":"message_stop"}"#,
        ]);
        let chunks = collect_chunks(agent_sse_stream(upstream, ctx(false, false))).await;
        let text = serde_json::to_string(&chunks).unwrap();
        assert!(!text.contains("secret"));
        assert!(!text.contains("reasoning_content"));
        assert!(text.contains("\"A\""));
        assert!(text.contains("\"C\""));
    }

    #[tokio::test]
    async fn test_usage_attached_only_when_requested() {
        let lines = [
            r#"{"type":"message_start","message":{"usage":{"input_tokens":11,"output_tokens":0}}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"ok"}}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":4}}"#,
            r#"{"type":"message_stop"}"#,
        ];
        let chunks = collect_chunks(agent_sse_stream(sse(&lines), ctx(false, true))).await;
        let finish = chunks.last().unwrap();
        assert_eq!(finish["usage"]["prompt_tokens"], 11);
        assert_eq!(finish["usage"]["completion_tokens"], 4);

        let chunks = collect_chunks(agent_sse_stream(sse(&lines), ctx(false, false))).await;
        assert!(chunks.iter().all(|c| c.get("usage").is_none()));
    }

    #[tokio::test]
    async fn test_exactly_one_finish_chunk() {
        let upstream = sse(&[
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"x"}}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"}}"#,
            r#"{"type":"message_stop"}"#,
            r#"{"type":"message_stop"}"#,
        ]);
        let chunks = collect_chunks(agent_sse_stream(upstream, ctx(false, false))).await;
        let finish_count = chunks
            .iter()
            .filter(|c| !c["choices"][0]["finish_reason"].is_null())
            .count();
        assert_eq!(finish_count, 1);
    }

    #[tokio::test]
    async fn test_error_event_produces_graceful_tail() {
        let upstream = sse(&[
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"partial"}}"#,
            r#"{"type":"error","error":{"type":"overloaded_error","message":"overloaded"}}"#,
        ]);
        let frames: Vec<Bytes> = agent_sse_stream(upstream, ctx(false, false))
            .map(|r| r.unwrap())
            .collect()
            .await;
        let text: String = frames
            .iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect();
        assert!(text.contains("\\n\\n[Error: overloaded]"));
        assert!(text.contains("\"finish_reason\":\"stop\""));
        assert!(text.trim_end().ends_with("data: [DONE]"));
    }

    #[tokio::test]
    async fn test_upstream_end_without_done_still_finishes() {
        let upstream = sse(&[
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"tail"}}"#,
        ]);
        let chunks = collect_chunks(agent_sse_stream(upstream, ctx(false, false))).await;
        assert_eq!(
            chunks.last().unwrap()["choices"][0]["finish_reason"],
            "stop"
        );
    }
}
