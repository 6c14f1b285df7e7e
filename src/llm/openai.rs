//! OpenAI-compatible chat-completions backend.
//!
//! Serves both the hosted OpenAI API and any OpenAI-compatible local
//! endpoint (vLLM, Ollama's compat layer, LM Studio). Structured output
//! uses JSON mode with the response schema injected into the system
//! prompt — the widest-supported mechanism across compatible servers; the
//! caller retries on parse failure for low-reliability local backends.

use serde_json::{json, Value};

use crate::error::BristlenoseError;

use super::usage::TokenCounts;

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";

pub fn build_request(model: &str, system: &str, user: &str, schema: &Value, max_tokens: u32) -> Value {
    let system_with_schema = format!(
        "{system}\n\nRespond with a single JSON object conforming exactly to this JSON schema, with no surrounding prose:\n{schema}"
    );
    json!({
        "model": model,
        "max_tokens": max_tokens,
        "temperature": 0.2,
        "response_format": { "type": "json_object" },
        "messages": [
            { "role": "system", "content": system_with_schema },
            { "role": "user", "content": user },
        ],
    })
}

pub fn parse_response(body: &Value, provider_name: &str) -> Result<(Value, TokenCounts), BristlenoseError> {
    let usage = TokenCounts {
        input: body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
        output: body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
    };

    let choice = &body["choices"][0];
    if choice["finish_reason"].as_str() == Some("length") {
        return Err(BristlenoseError::Truncated);
    }

    let content = choice["message"]["content"]
        .as_str()
        .ok_or_else(|| provider_err(provider_name, "no message content in response"))?;

    let value: Value = serde_json::from_str(content.trim()).map_err(|e| {
        provider_err(provider_name, &format!("response was not valid JSON: {e}"))
    })?;

    Ok((value, usage))
}

pub async fn analyse(
    http: &reqwest::Client,
    endpoint: &str,
    api_key: &str,
    provider_name: &str,
    model: &str,
    system: &str,
    user: &str,
    schema: &Value,
    max_tokens: u32,
) -> Result<(Value, TokenCounts), BristlenoseError> {
    let request = build_request(model, system, user, schema, max_tokens);
    let url = format!("{}/chat/completions", endpoint.trim_end_matches('/'));

    let mut builder = http.post(&url).json(&request);
    if !api_key.is_empty() {
        builder = builder.bearer_auth(api_key);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| provider_err(provider_name, &e.to_string()))?;

    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| provider_err(provider_name, &format!("invalid response body: {e}")))?;

    if !status.is_success() {
        let detail = body["error"]["message"].as_str().unwrap_or("unknown error");
        return Err(provider_err(
            provider_name,
            &format!("HTTP {status}: {detail} (check billing and rate limits for this endpoint)"),
        ));
    }

    parse_response(&body, provider_name)
}

fn provider_err(provider: &str, message: &str) -> BristlenoseError {
    BristlenoseError::Provider {
        provider: provider.into(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_injects_schema_into_system() {
        let schema = json!({"type": "object", "required": ["themes"]});
        let req = build_request("gpt-4o", "You are an analyst.", "text", &schema, 2048);
        let system = req["messages"][0]["content"].as_str().unwrap();
        assert!(system.starts_with("You are an analyst."));
        assert!(system.contains("\"themes\""));
        assert_eq!(req["response_format"]["type"], "json_object");
        assert_eq!(req["messages"][1]["role"], "user");
    }

    #[test]
    fn test_parse_response_json_content() {
        let body = json!({
            "choices": [{
                "finish_reason": "stop",
                "message": { "content": "{\"themes\": []}" }
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 4 }
        });
        let (value, usage) = parse_response(&body, "openai").unwrap();
        assert_eq!(value, json!({ "themes": [] }));
        assert_eq!(usage, TokenCounts { input: 10, output: 4 });
    }

    #[test]
    fn test_parse_response_length_finish_is_truncation() {
        let body = json!({
            "choices": [{
                "finish_reason": "length",
                "message": { "content": "{\"them" }
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        });
        assert!(matches!(
            parse_response(&body, "openai"),
            Err(BristlenoseError::Truncated)
        ));
    }

    #[test]
    fn test_parse_response_non_json_content_errors() {
        let body = json!({
            "choices": [{
                "finish_reason": "stop",
                "message": { "content": "Sure! Here's the JSON you asked for:" }
            }],
            "usage": {}
        });
        assert!(parse_response(&body, "local").is_err());
    }
}
