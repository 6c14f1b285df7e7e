//! Google Gemini backend.
//!
//! Structured output uses the API's native schema binding:
//! `generationConfig.responseSchema` plus a JSON response MIME type, so
//! the model is constrained at decode time rather than by prompt text.

use serde_json::{json, Value};

use crate::error::BristlenoseError;

use super::usage::TokenCounts;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

pub fn build_request(system: &str, user: &str, schema: &Value, max_tokens: u32) -> Value {
    json!({
        "system_instruction": { "parts": [{ "text": system }] },
        "contents": [{ "role": "user", "parts": [{ "text": user }] }],
        "generationConfig": {
            "responseMimeType": "application/json",
            "responseSchema": schema,
            "maxOutputTokens": max_tokens,
            "temperature": 0.2,
        },
    })
}

pub fn parse_response(body: &Value) -> Result<(Value, TokenCounts), BristlenoseError> {
    let usage = TokenCounts {
        input: body["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0),
        output: body["usageMetadata"]["candidatesTokenCount"]
            .as_u64()
            .unwrap_or(0),
    };

    let candidate = &body["candidates"][0];
    if candidate["finishReason"].as_str() == Some("MAX_TOKENS") {
        return Err(BristlenoseError::Truncated);
    }

    let text = candidate["content"]["parts"][0]["text"]
        .as_str()
        .ok_or_else(|| provider_err("no text part in candidate"))?;

    let value: Value = serde_json::from_str(text.trim())
        .map_err(|e| provider_err(&format!("response was not valid JSON: {e}")))?;

    Ok((value, usage))
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
    let request = build_request(system, user, schema, max_tokens);
    let url = format!("{API_BASE}/models/{model}:generateContent");

    let response = http
        .post(&url)
        .header("x-goog-api-key", api_key)
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
            "HTTP {status}: {detail} (see https://aistudio.google.com for quota and billing)"
        )));
    }

    parse_response(&body)
}

fn provider_err(message: &str) -> BristlenoseError {
    BristlenoseError::Provider {
        provider: "gemini".into(),
        message: message.into(),
    }
}
