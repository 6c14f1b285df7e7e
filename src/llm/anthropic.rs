//! Anthropic Messages API backend.
//!
//! Structured output uses native forced tool invocation: the response
//! schema is presented as the input schema of a single tool and
//! `tool_choice` forces the model to call it, so the reply arrives as an
//! already-parsed JSON object rather than text to be re-parsed.

use serde_json::{json, Value};

use crate::error::BristlenoseError;

use super::usage::TokenCounts;

const API_VERSION: &str = "2023-06-01";
const TOOL_NAME: &str = "record_analysis";

pub fn build_request(model: &str, system: &str, user: &str, schema: &Value, max_tokens: u32) -> Value {
    json!({
        "model": model,
        "max_tokens": max_tokens,
        "system": system,
        "messages": [{ "role": "user", "content": user }],
        "tools": [{
            "name": TOOL_NAME,
            "description": "Record the analysis result in the required structure.",
            "input_schema": schema,
        }],
        "tool_choice": { "type": "tool", "name": TOOL_NAME },
    })
}

/// Extract the forced tool's input object and normalised usage.
pub fn parse_response(body: &Value) -> Result<(Value, TokenCounts), BristlenoseError> {
    if body["stop_reason"].as_str() == Some("max_tokens") {
        return Err(BristlenoseError::Truncated);
    }

    let usage = TokenCounts {
        input: body["usage"]["input_tokens"].as_u64().unwrap_or(0),
        output: body["usage"]["output_tokens"].as_u64().unwrap_or(0),
    };

    let blocks = body["content"].as_array().ok_or_else(|| provider_err("no content blocks"))?;
    let input = blocks
        .iter()
        .find(|b| b["type"].as_str() == Some("tool_use"))
        .map(|b| b["input"].clone())
        .ok_or_else(|| provider_err("model did not invoke the output tool"))?;

    Ok((input, usage))
}

pub async fn analyse(
    http: &reqwest::Client,
    api_key: &str,
    model: &str,
    system: &str,
    user: &str,
    schema: &Value,
    max_tokens: u32,
) -> Result<(Value, TokenCounts), BristlenoseError> {
    let request = build_request(model, system, user, schema, max_tokens);
    let response = http
        .post("https://api.anthropic.com/v1/messages")
        .header("x-api-key", api_key)
        .header("anthropic-version", API_VERSION)
        .json(&request)
        .send()
        .await
        .map_err(|e| provider_err(&e.to_string()))?;

    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| provider_err(&format!("invalid response body: {e}")))?;

    if !status.is_success() {
        let detail = body["error"]["message"].as_str().unwrap_or("unknown error");
        return Err(provider_err(&format!(
            "HTTP {status}: {detail} (see https://console.anthropic.com for account status)"
        )));
    }

    parse_response(&body)
}

fn provider_err(message: &str) -> BristlenoseError {
    BristlenoseError::Provider {
        provider: "anthropic".into(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_forces_tool() {
        let schema = json!({"type": "object", "properties": {"quotes": {"type": "array"}}});
        let req = build_request("claude-sonnet-4-20250514", "sys", "user text", &schema, 4096);
        assert_eq!(req["tool_choice"]["type"], "tool");
        assert_eq!(req["tool_choice"]["name"], TOOL_NAME);
        assert_eq!(req["tools"][0]["input_schema"], schema);
        assert_eq!(req["max_tokens"], 4096);
        assert_eq!(req["system"], "sys");
    }

    #[test]
    fn test_parse_response_tool_use() {
        let body = json!({
            "stop_reason": "tool_use",
            "usage": { "input_tokens": 120, "output_tokens": 45 },
            "content": [
                { "type": "text", "text": "thinking aloud" },
                { "type": "tool_use", "name": TOOL_NAME, "input": { "quotes": [] } }
            ]
        });
        let (value, usage) = parse_response(&body).unwrap();
        assert_eq!(value, json!({ "quotes": [] }));
        assert_eq!(usage, TokenCounts { input: 120, output: 45 });
    }

    #[test]
    fn test_parse_response_truncation_is_explicit_error() {
        let body = json!({
            "stop_reason": "max_tokens",
            "usage": { "input_tokens": 1, "output_tokens": 1 },
            "content": []
        });
        assert!(matches!(
            parse_response(&body),
            Err(BristlenoseError::Truncated)
        ));
    }

    #[test]
    fn test_parse_response_missing_tool_use() {
        let body = json!({
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 1, "output_tokens": 1 },
            "content": [{ "type": "text", "text": "I refuse" }]
        });
        assert!(parse_response(&body).is_err());
    }
}
