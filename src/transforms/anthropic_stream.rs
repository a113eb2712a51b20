//! Canonical SSE → Anthropic SSE.
//!
//! A stateful transformer that consumes canonical chat-completion chunks and
//! emits Anthropic Messages stream events with correct content-block framing.
//! State is the currently open block (none / text / thinking / tool_use) and
//! its index; switching block kinds closes the open block and opens the next.

use async_stream::stream;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};

use crate::openai::{ChatChunk, Usage};
use crate::transforms::anthropic::{map_stop_reason, message_id_from};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    None,
    Text,
    Thinking,
    ToolUse,
}

pub struct AnthropicStreamTranslator {
    model: String,
    message_start_sent: bool,
    content_block_index: usize,
    current: BlockKind,
    finished: bool,
}

fn frame(event: &str, data: Value) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

impl AnthropicStreamTranslator {
    pub fn new(model: String) -> Self {
        Self {
            model,
            message_start_sent: false,
            content_block_index: 0,
            current: BlockKind::None,
            finished: false,
        }
    }

    /// Transform one canonical SSE line (the payload after `data: `) into
    /// zero or more Anthropic SSE frames.
    pub fn transform_data(&mut self, data: &str) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        if data == "[DONE]" {
            return self.finish_unterminated();
        }

        let Ok(chunk) = serde_json::from_str::<ChatChunk>(data) else {
            return Vec::new();
        };

        let mut out = Vec::new();

        if !self.message_start_sent {
            self.message_start_sent = true;
            out.push(frame(
                "message_start",
                json!({
                    "type": "message_start",
                    "message": {
                        "id": message_id_from(&chunk.id),
                        "type": "message",
                        "role": "assistant",
                        "content": [],
                        "model": self.model,
                        "stop_reason": null,
                        "stop_sequence": null,
                        "usage": {"input_tokens": 0, "output_tokens": 0},
                    }
                }),
            ));
        }

        let Some(choice) = chunk.choices.first() else {
            return out;
        };

        if let Some(reasoning) = choice
            .delta
            .reasoning_content
            .as_ref()
            .filter(|t| !t.is_empty())
        {
            self.ensure_block(BlockKind::Thinking, json!({"type": "thinking", "thinking": ""}), &mut out);
            out.push(frame(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": self.content_block_index,
                    "delta": {"type": "thinking_delta", "thinking": reasoning},
                }),
            ));
        }

        if let Some(text) = choice.delta.content.as_ref().filter(|t| !t.is_empty()) {
            self.ensure_block(BlockKind::Text, json!({"type": "text", "text": ""}), &mut out);
            out.push(frame(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": self.content_block_index,
                    "delta": {"type": "text_delta", "text": text},
                }),
            ));
        }

        if let Some(tool_calls) = &choice.delta.tool_calls {
            for call in tool_calls {
                if let Some(id) = &call.id {
                    let name = call
                        .function
                        .as_ref()
                        .and_then(|f| f.name.as_deref())
                        .unwrap_or_default();
                    self.open_block(
                        BlockKind::ToolUse,
                        json!({"type": "tool_use", "id": id, "name": name, "input": {}}),
                        &mut out,
                    );
                }
                if let Some(arguments) = call
                    .function
                    .as_ref()
                    .and_then(|f| f.arguments.as_deref())
                    .filter(|a| !a.is_empty())
                {
                    out.push(frame(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": self.content_block_index,
                            "delta": {"type": "input_json_delta", "partial_json": arguments},
                        }),
                    ));
                }
            }
        }

        if let Some(finish_reason) = choice.finish_reason.as_deref() {
            self.close_block(&mut out);
            let usage = chunk.usage.unwrap_or_default();
            out.push(self.message_delta(map_stop_reason(Some(finish_reason)), usage));
            out.push(frame("message_stop", json!({"type": "message_stop"})));
            self.finished = true;
        }

        out
    }

    /// Handle the canonical terminator or an upstream end without one.
    pub fn finish_unterminated(&mut self) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.close_block(&mut out);
        out.push(self.message_delta(Some("end_turn".to_string()), Usage::default()));
        out.push(frame("message_stop", json!({"type": "message_stop"})));
        self.finished = true;
        out
    }

    fn message_delta(&self, stop_reason: Option<String>, usage: Usage) -> String {
        frame(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {
                    "input_tokens": usage.prompt_tokens,
                    "output_tokens": usage.completion_tokens,
                },
            }),
        )
    }

    /// Open a block of `kind` if it is not already the current one.
    fn ensure_block(&mut self, kind: BlockKind, start: Value, out: &mut Vec<String>) {
        if self.current == kind {
            return;
        }
        self.open_block(kind, start, out);
    }

    /// Unconditionally close any open block and start a new one.
    fn open_block(&mut self, kind: BlockKind, start: Value, out: &mut Vec<String>) {
        self.close_block(out);
        out.push(frame(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.content_block_index,
                "content_block": start,
            }),
        ));
        self.current = kind;
    }

    fn close_block(&mut self, out: &mut Vec<String>) {
        if self.current == BlockKind::None {
            return;
        }
        out.push(frame(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": self.content_block_index}),
        ));
        self.content_block_index += 1;
        self.current = BlockKind::None;
    }
}

/// Wrap a canonical SSE byte stream into an Anthropic SSE byte stream.
///
/// Comment lines (keepalives) pass through untouched; an upstream end without
/// `[DONE]` still produces a terminal `message_delta`/`message_stop`.
pub fn translate_sse_stream(
    upstream: impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
    model: String,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
    stream! {
        let mut translator = AnthropicStreamTranslator::new(model);
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
                for event in translator.transform_data(data) {
                    yield Ok(Bytes::from(event));
                }
            }
        }

        for event in translator.finish_unterminated() {
            yield Ok(Bytes::from(event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::{ChatChunk, Delta, FunctionCallDelta, ToolCallDelta};

    fn chunk_json(delta: Delta, finish: Option<&str>) -> String {
        let chunk = ChatChunk::new(
            "chatcmpl-0011223344556677889900aa",
            1,
            "claude-3-5-sonnet",
            delta,
            finish.map(|s| s.to_string()),
        );
        serde_json::to_string(&chunk).unwrap()
    }

    fn event_names(frames: &[String]) -> Vec<String> {
        frames
            .iter()
            .map(|f| {
                f.lines()
                    .next()
                    .unwrap()
                    .strip_prefix("event: ")
                    .unwrap()
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn test_text_stream_event_sequence() {
        let mut t = AnthropicStreamTranslator::new("claude-3-5-sonnet".into());
        let mut frames = Vec::new();

        frames.extend(t.transform_data(&chunk_json(
            Delta {
                role: Some("assistant".into()),
                ..Default::default()
            },
            None,
        )));
        frames.extend(t.transform_data(&chunk_json(Delta::content("Hel"), None)));
        frames.extend(t.transform_data(&chunk_json(Delta::content("lo"), None)));
        frames.extend(t.transform_data(&chunk_json(Delta::default(), Some("stop"))));
        frames.extend(t.transform_data("[DONE]"));

        let names = event_names(&frames);
        assert_eq!(
            names.iter().filter(|n| *n == "message_start").count(),
            1
        );
        assert_eq!(
            names.iter().filter(|n| *n == "content_block_start").count(),
            1
        );
        assert_eq!(
            names.iter().filter(|n| *n == "content_block_delta").count(),
            2
        );
        assert_eq!(
            names.iter().filter(|n| *n == "content_block_stop").count(),
            1
        );
        assert_eq!(names.iter().filter(|n| *n == "message_delta").count(), 1);
        assert_eq!(names.iter().filter(|n| *n == "message_stop").count(), 1);

        let delta_frame = frames
            .iter()
            .find(|f| f.contains("message_delta"))
            .unwrap();
        assert!(delta_frame.contains("end_turn"));

        // message_start carries the msg_ id derived from the chunk id
        assert!(frames[0].contains("msg_0011223344556677889900aa"));
    }

    #[test]
    fn test_thinking_then_text_switches_blocks() {
        let mut t = AnthropicStreamTranslator::new("m".into());
        let mut frames = Vec::new();
        frames.extend(t.transform_data(&chunk_json(Delta::reasoning("hmm"), None)));
        frames.extend(t.transform_data(&chunk_json(Delta::content("answer"), None)));
        frames.extend(t.transform_data(&chunk_json(Delta::default(), Some("stop"))));

        let names = event_names(&frames);
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(frames[1].contains("\"thinking\""));
        assert!(frames[2].contains("thinking_delta"));
        assert!(frames[4].contains("\"text\""));
        assert!(frames[5].contains("text_delta"));
        // Second block carries index 1
        assert!(frames[4].contains("\"index\":1"));
    }

    #[test]
    fn test_tool_call_framing() {
        let mut t = AnthropicStreamTranslator::new("m".into());
        let mut frames = Vec::new();

        let init = Delta {
            tool_calls: Some(vec![ToolCallDelta {
                index: 0,
                id: Some("call_1".into()),
                call_type: Some("function".into()),
                function: Some(FunctionCallDelta {
                    name: Some("get_weather".into()),
                    arguments: Some(String::new()),
                }),
            }]),
            ..Default::default()
        };
        let args = Delta {
            tool_calls: Some(vec![ToolCallDelta {
                index: 0,
                id: None,
                call_type: None,
                function: Some(FunctionCallDelta {
                    name: None,
                    arguments: Some(r#"{"city":"Paris"}"#.into()),
                }),
            }]),
            ..Default::default()
        };

        frames.extend(t.transform_data(&chunk_json(init, None)));
        frames.extend(t.transform_data(&chunk_json(args, None)));
        frames.extend(t.transform_data(&chunk_json(Delta::default(), Some("tool_calls"))));

        let names = event_names(&frames);
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(frames[1].contains("tool_use"));
        assert!(frames[1].contains("get_weather"));
        assert!(frames[2].contains("input_json_delta"));
        assert!(frames[4].contains("tool_use"));
    }

    #[test]
    fn test_done_without_finish_closes_gracefully() {
        let mut t = AnthropicStreamTranslator::new("m".into());
        let mut frames = Vec::new();
        frames.extend(t.transform_data(&chunk_json(Delta::content("partial"), None)));
        frames.extend(t.transform_data("[DONE]"));

        let names = event_names(&frames);
        assert!(names.contains(&"content_block_stop".to_string()));
        let delta_frame = frames.iter().find(|f| f.contains("message_delta")).unwrap();
        assert!(delta_frame.contains("end_turn"));
        assert!(delta_frame.contains("\"output_tokens\":0"));
        assert_eq!(names.last().unwrap(), "message_stop");
    }

    #[test]
    fn test_nothing_emitted_after_finish() {
        let mut t = AnthropicStreamTranslator::new("m".into());
        t.transform_data(&chunk_json(Delta::content("x"), None));
        t.transform_data(&chunk_json(Delta::default(), Some("stop")));
        assert!(t.transform_data(&chunk_json(Delta::content("late"), None)).is_empty());
        assert!(t.transform_data("[DONE]").is_empty());
    }

    #[tokio::test]
    async fn test_stream_wrapper_passes_keepalives() {
        let upstream = futures_util::stream::iter(vec![
            Ok(Bytes::from(": keepalive\n\n")),
            Ok(Bytes::from(format!(
                "data: {}\n\n",
                chunk_json(Delta::content("hi"), None)
            ))),
            Ok(Bytes::from("data: [DONE]\n\n")),
        ]);
        let translated: Vec<_> = translate_sse_stream(upstream, "m".into())
            .collect::<Vec<_>>()
            .await;
        let text: String = translated
            .into_iter()
            .map(|b| String::from_utf8(b.unwrap().to_vec()).unwrap())
            .collect();
        assert!(text.starts_with(": keepalive\n\n"));
        assert!(text.contains("message_start"));
        assert!(text.contains("text_delta"));
        assert!(text.contains("message_stop"));
    }
}
