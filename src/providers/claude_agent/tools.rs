//! Tool bridging for the agent wire.
//!
//! Caller tool names are wrapped with the fixed namespace prefix on the way
//! in and stripped on the way out. Parameter schemas are converted to the
//! agent's native shape by recursive descent over the tagged-object variant,
//! preserving nested objects, arrays, enums, required flags, and
//! descriptions.

use serde_json::{Map, Value, json};

use crate::constants::TOOL_NAME_PREFIX;
use crate::openai::Tool;

pub fn namespace_tool_name(name: &str) -> String {
    if name.starts_with(TOOL_NAME_PREFIX) {
        name.to_string()
    } else {
        format!("{TOOL_NAME_PREFIX}{name}")
    }
}

pub fn strip_tool_name(name: &str) -> String {
    name.strip_prefix(TOOL_NAME_PREFIX).unwrap_or(name).to_string()
}

/// Convert a JSON-Schema parameter object into the agent's native shape.
///
/// Scalars map directly; objects and arrays recurse. Keys outside the native
/// vocabulary are dropped.
pub fn convert_schema(schema: &Value) -> Value {
    let Some(obj) = schema.as_object() else {
        // Schemas must be objects; anything else becomes an open object
        return json!({"type": "object"});
    };

    let mut out = Map::new();

    let schema_type = obj.get("type").and_then(|t| t.as_str()).unwrap_or("object");
    out.insert("type".to_string(), json!(schema_type));

    if let Some(description) = obj.get("description").and_then(|d| d.as_str()) {
        out.insert("description".to_string(), json!(description));
    }

    if let Some(enum_values) = obj.get("enum").and_then(|e| e.as_array()) {
        out.insert("enum".to_string(), Value::Array(enum_values.clone()));
    }

    match schema_type {
        "object" => {
            if let Some(properties) = obj.get("properties").and_then(|p| p.as_object()) {
                let converted: Map<String, Value> = properties
                    .iter()
                    .map(|(name, prop)| (name.clone(), convert_schema(prop)))
                    .collect();
                out.insert("properties".to_string(), Value::Object(converted));
            }
            if let Some(required) = obj.get("required").and_then(|r| r.as_array()) {
                out.insert("required".to_string(), Value::Array(required.clone()));
            }
        }
        "array" => {
            if let Some(items) = obj.get("items") {
                out.insert("items".to_string(), convert_schema(items));
            }
        }
        _ => {}
    }

    Value::Object(out)
}

/// Registration payload for caller tools: namespaced names, converted
/// schemas. The agent sees and may call these; the adapter captures the
/// resulting `tool_use` blocks instead of executing anything.
pub fn build_tools_payload(tools: &[Tool]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let mut entry = Map::new();
            entry.insert(
                "name".to_string(),
                json!(namespace_tool_name(&tool.function.name)),
            );
            if let Some(description) = &tool.function.description {
                entry.insert("description".to_string(), json!(description));
            }
            let schema = tool
                .function
                .parameters
                .as_ref()
                .map(convert_schema)
                .unwrap_or_else(|| json!({"type": "object"}));
            entry.insert("input_schema".to_string(), schema);
            Value::Object(entry)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::FunctionDef;

    #[test]
    fn test_name_round_trip() {
        assert_eq!(namespace_tool_name("get_weather"), "mcp_get_weather");
        assert_eq!(namespace_tool_name("mcp_get_weather"), "mcp_get_weather");
        assert_eq!(strip_tool_name("mcp_get_weather"), "get_weather");
        assert_eq!(strip_tool_name("get_weather"), "get_weather");
        assert_eq!(
            strip_tool_name(&namespace_tool_name("lookup")),
            "lookup"
        );
    }

    #[test]
    fn test_convert_schema_preserves_nesting() {
        let schema = json!({
            "type": "object",
            "description": "weather query",
            "properties": {
                "location": {"type": "string", "description": "city name"},
                "units": {"type": "string", "enum": ["c", "f"]},
                "days": {
                    "type": "array",
                    "items": {"type": "number"}
                },
                "options": {
                    "type": "object",
                    "properties": {
                        "verbose": {"type": "boolean"}
                    },
                    "required": ["verbose"]
                }
            },
            "required": ["location"],
            "$schema": "http://json-schema.org/draft-07/schema#",
            "additionalProperties": false
        });

        let converted = convert_schema(&schema);
        assert_eq!(converted["type"], "object");
        assert_eq!(converted["description"], "weather query");
        assert_eq!(converted["properties"]["location"]["type"], "string");
        assert_eq!(converted["properties"]["units"]["enum"][1], "f");
        assert_eq!(converted["properties"]["days"]["items"]["type"], "number");
        assert_eq!(
            converted["properties"]["options"]["properties"]["verbose"]["type"],
            "boolean"
        );
        assert_eq!(converted["properties"]["options"]["required"][0], "verbose");
        assert_eq!(converted["required"][0], "location");
        // Non-native keys are dropped
        assert!(converted.get("$schema").is_none());
        assert!(converted.get("additionalProperties").is_none());
    }

    #[test]
    fn test_convert_schema_defaults_to_object() {
        assert_eq!(convert_schema(&json!(null))["type"], "object");
        assert_eq!(convert_schema(&json!({}))["type"], "object");
    }

    #[test]
    fn test_build_tools_payload() {
        let tools = vec![Tool {
            tool_type: "function".into(),
            function: FunctionDef {
                name: "get_weather".into(),
                description: Some("look up weather".into()),
                parameters: Some(json!({
                    "type": "object",
                    "properties": {"location": {"type": "string"}}
                })),
            },
        }];
        let payload = build_tools_payload(&tools);
        assert_eq!(payload[0]["name"], "mcp_get_weather");
        assert_eq!(payload[0]["description"], "look up weather");
        assert_eq!(
            payload[0]["input_schema"]["properties"]["location"]["type"],
            "string"
        );
    }
}
