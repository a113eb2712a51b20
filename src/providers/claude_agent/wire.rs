//! Agent wire transport and event protocol.
//!
//! Queries ride the OAuth Messages SSE wire with the CLI identity header
//! set. Per-user isolation is request-scoped: the caller's access token is
//! injected into exactly one query's Authorization header and no ambient
//! credential is ever consulted.

use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;

use crate::constants::{
    AGENT_USER_AGENT, ANTHROPIC_MESSAGES_URL, ANTHROPIC_VERSION, OAUTH_BETA_HEADER,
};

/// One event on the agent stream.
///
/// The wire interleaves incremental `content_block_*`/`message_*` events
/// with occasional complete `assistant` messages; a stream-level `error`
/// event is the non-success result.
#[derive(Debug, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub message: Option<AgentMessage>,
    #[serde(default)]
    pub content_block: Option<AgentContentBlock>,
    #[serde(default)]
    pub delta: Option<AgentDelta>,
    #[serde(default)]
    pub usage: Option<AgentUsage>,
    #[serde(default)]
    pub error: Option<AgentError>,
}

#[derive(Debug, Deserialize)]
pub struct AgentMessage {
    #[serde(default)]
    pub content: Option<Vec<Value>>,
    #[serde(default)]
    pub usage: Option<AgentUsage>,
}

#[derive(Debug, Deserialize)]
pub struct AgentContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AgentDelta {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub partial_json: Option<String>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
pub struct AgentUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Deserialize)]
pub struct AgentError {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub message: String,
}

/// POST builder for one agent query, carrying the caller's access token and
/// the CLI identification headers the wire expects.
pub fn build_query_request(client: &Client, access_token: &str, stream: bool) -> RequestBuilder {
    let accept = if stream {
        "text/event-stream"
    } else {
        "application/json"
    };

    client
        .post(ANTHROPIC_MESSAGES_URL)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .header("anthropic-beta", OAUTH_BETA_HEADER)
        .header("authorization", format!("Bearer {}", access_token))
        .header("content-type", "application/json")
        .header("user-agent", AGENT_USER_AGENT)
        .header("anthropic-dangerous-direct-browser-access", "true")
        .header("x-app", "cli")
        .header("accept", accept)
}

/// GET builder for the models endpoint with the same identity headers.
pub fn build_models_request(client: &Client, url: &str, access_token: &str) -> RequestBuilder {
    client
        .get(url)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .header("anthropic-beta", OAUTH_BETA_HEADER)
        .header("authorization", format!("Bearer {}", access_token))
        .header("user-agent", AGENT_USER_AGENT)
        .header("x-app", "cli")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_parsing_content_block_start() {
        let event: AgentEvent = serde_json::from_str(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_X","name":"mcp_get_weather"}}"#,
        )
        .unwrap();
        assert_eq!(event.event_type, "content_block_start");
        assert_eq!(event.index, Some(1));
        let block = event.content_block.unwrap();
        assert_eq!(block.block_type, "tool_use");
        assert_eq!(block.id.as_deref(), Some("toolu_X"));
        assert_eq!(block.name.as_deref(), Some("mcp_get_weather"));
    }

    #[test]
    fn test_event_parsing_input_json_delta() {
        let event: AgentEvent = serde_json::from_str(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"locat"}}"#,
        )
        .unwrap();
        assert_eq!(
            event.delta.unwrap().partial_json.as_deref(),
            Some("{\"locat")
        );
    }

    #[test]
    fn test_event_parsing_message_delta_usage() {
        let event: AgentEvent = serde_json::from_str(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"input_tokens":7,"output_tokens":42}}"#,
        )
        .unwrap();
        assert_eq!(event.delta.unwrap().stop_reason.as_deref(), Some("end_turn"));
        let usage = event.usage.unwrap();
        assert_eq!(usage.input_tokens, 7);
        assert_eq!(usage.output_tokens, 42);
    }

    #[test]
    fn test_event_parsing_error() {
        let event: AgentEvent = serde_json::from_str(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#,
        )
        .unwrap();
        let error = event.error.unwrap();
        assert_eq!(error.error_type, "overloaded_error");
        assert_eq!(error.message, "busy");
    }
}
