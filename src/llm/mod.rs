//! LLM client abstraction.
//!
//! # Architecture overview
//!
//! Every analysis stage talks to the model through one call:
//!
//! ```text
//! analyse(system_prompt, user_prompt, response_schema, max_tokens) → Value
//! ```
//!
//! The client dispatches on provider, hands each backend the response
//! schema in the form it constrains best (forced tool invocation,
//! prompt-injected JSON mode, or native schema binding), normalises token
//! usage to `{input, output}`, and records it into the shared tracker.
//! Stages deserialize the returned `Value` into their typed response
//! structs; a mismatch there is the schema violation signal.
//!
//! # Reliability
//!
//! Cloud providers get a single attempt — their structured-output paths
//! are dependable and retries mostly burn money. The local backend retries
//! JSON/schema failures up to 3 times with exponential backoff. Truncation
//! is never retried: a bigger `max_tokens` is the fix, and the error says
//! so.

pub mod anthropic;
pub mod credentials;
pub mod gemini;
pub mod openai;
pub mod usage;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::BristlenoseError;
use crate::hash::hash_strings;

use credentials::{Credential, CredentialSource};
use usage::UsageTracker;

/// Retry budget for the local backend.
const LOCAL_MAX_ATTEMPTS: u32 = 3;
const LOCAL_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAi,
    Gemini,
    /// Any OpenAI-compatible endpoint on this machine or LAN.
    Local,
}

impl Provider {
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
            Provider::Gemini => "gemini",
            Provider::Local => "local",
        }
    }

    pub fn parse(name: &str) -> Result<Provider, BristlenoseError> {
        match name.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Provider::Anthropic),
            "openai" => Ok(Provider::OpenAi),
            "gemini" | "google" => Ok(Provider::Gemini),
            "local" | "ollama" => Ok(Provider::Local),
            other => Err(BristlenoseError::Other(format!(
                "Unknown provider '{other}' (expected anthropic, openai, gemini, or local)"
            ))),
        }
    }
}

/// Default Ollama-style endpoint for the local provider.
const LOCAL_DEFAULT_ENDPOINT: &str = "http://localhost:11434/v1";

pub struct LlmClient {
    provider: Provider,
    model: String,
    endpoint: String,
    credential: Credential,
    http: reqwest::Client,
    tracker: Arc<UsageTracker>,
    /// Hash-keyed response cache directory; `None` disables caching.
    cache_dir: Option<PathBuf>,
}

impl LlmClient {
    pub fn new(
        provider_name: &str,
        model: &str,
        endpoint: Option<&str>,
        timeout: Duration,
        tracker: Arc<UsageTracker>,
        cache_dir: Option<PathBuf>,
    ) -> Result<LlmClient, BristlenoseError> {
        let provider = Provider::parse(provider_name)?;
        let credential = credentials::resolve(provider)?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BristlenoseError::Other(format!("Failed to build HTTP client: {e}")))?;

        let endpoint = endpoint
            .map(str::to_string)
            .unwrap_or_else(|| match provider {
                Provider::OpenAi => openai::DEFAULT_ENDPOINT.to_string(),
                Provider::Local => LOCAL_DEFAULT_ENDPOINT.to_string(),
                _ => String::new(),
            });

        Ok(LlmClient {
            provider,
            model: model.to_string(),
            endpoint,
            credential,
            http,
            tracker,
            cache_dir,
        })
    }

    /// `vendor/model` pair recorded in the manifest; a change invalidates
    /// every cached LLM stage.
    pub fn fingerprint(&self) -> String {
        format!("{}/{}", self.provider.name(), self.model)
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Where the API credential was found, for the diagnostic surface.
    pub fn credential_source(&self) -> CredentialSource {
        self.credential.source
    }

    /// Run one structured analysis call.
    pub async fn analyse(
        &self,
        system: &str,
        user: &str,
        schema: &Value,
        max_tokens: u32,
    ) -> Result<Value, BristlenoseError> {
        let cache_key = hash_strings([
            self.fingerprint().as_str(),
            system,
            user,
            &schema.to_string(),
        ]);
        if let Some(cached) = self.cache_read(&cache_key) {
            tracing::debug!(key = %cache_key, "LLM cache hit");
            return Ok(cached);
        }

        let attempts = if self.provider == Provider::Local {
            LOCAL_MAX_ATTEMPTS
        } else {
            1
        };

        let mut backoff = LOCAL_INITIAL_BACKOFF;
        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                tracing::warn!(
                    attempt,
                    "local LLM response failed validation, retrying in {:?}",
                    backoff
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            match self.dispatch(system, user, schema, max_tokens).await {
                Ok((value, counts)) => {
                    // Tokens were spent even when the shape is wrong.
                    self.tracker.record(self.provider.name(), &self.model, counts);
                    if let Some(problem) = schema_violation(schema, &value) {
                        last_err = Some(BristlenoseError::Provider {
                            provider: self.provider.name().into(),
                            message: format!("response violated the schema: {problem}"),
                        });
                        continue;
                    }
                    self.cache_write(&cache_key, &value);
                    return Ok(value);
                }
                // Truncation is not fixed by retrying; surface it at once.
                Err(BristlenoseError::Truncated) => return Err(BristlenoseError::Truncated),
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| BristlenoseError::Provider {
            provider: self.provider.name().into(),
            message: "exhausted retries".into(),
        }))
    }

    async fn dispatch(
        &self,
        system: &str,
        user: &str,
        schema: &Value,
        max_tokens: u32,
    ) -> Result<(Value, usage::TokenCounts), BristlenoseError> {
        match self.provider {
            Provider::Anthropic => {
                anthropic::analyse(
                    &self.http,
                    &self.credential.key,
                    &self.model,
                    system,
                    user,
                    schema,
                    max_tokens,
                )
                .await
            }
            Provider::OpenAi | Provider::Local => {
                openai::analyse(
                    &self.http,
                    &self.endpoint,
                    &self.credential.key,
                    self.provider.name(),
                    &self.model,
                    system,
                    user,
                    schema,
                    max_tokens,
                )
                .await
            }
            Provider::Gemini => {
                gemini::analyse(
                    &self.http,
                    &self.credential.key,
                    &self.model,
                    system,
                    user,
                    schema,
                    max_tokens,
                )
                .await
            }
        }
    }

    fn cache_read(&self, key: &str) -> Option<Value> {
        let dir = self.cache_dir.as_ref()?;
        let content = std::fs::read_to_string(dir.join(format!("{key}.json"))).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn cache_write(&self, key: &str, value: &Value) {
        let Some(dir) = self.cache_dir.as_ref() else {
            return;
        };
        if std::fs::create_dir_all(dir).is_ok() {
            if let Ok(pretty) = serde_json::to_string_pretty(value) {
                let _ = std::fs::write(dir.join(format!("{key}.json")), pretty);
            }
        }
    }
}

/// Cheap structural check against the response schema: the reply must be
/// an object carrying every top-level `required` property. Full validation
/// happens when the stage deserializes into its typed response; this check
/// exists so the local-backend retry loop fires on shape violations too.
fn schema_violation(schema: &Value, value: &Value) -> Option<String> {
    if schema["type"].as_str() == Some("object") && !value.is_object() {
        return Some("expected a JSON object".into());
    }
    if let Some(required) = schema["required"].as_array() {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if value.get(key).is_none() {
                return Some(format!("missing required property '{key}'"));
            }
        }
    }
    None
}
