//! Configuration loading for bristlenose.
//!
//! # Architecture overview
//!
//! Configuration lives in `~/.config/bristlenose/config.toml` and is purely
//! optional. When absent, every option falls back to a sensible default so
//! that bristlenose works out of the box: point it at a folder of recordings
//! and it runs with the default provider, concurrency, and output layout.
//!
//! CLI flags always override config values; `main.rs` merges them after
//! loading, so this module only exposes the raw data and knows nothing about
//! the CLI.
//!
//! # TRADE-OFFS
//!
//! Paths are stored as `Option<String>` rather than `Option<PathBuf>` so
//! that tilde expansion happens at point-of-use rather than at parse time,
//! keeping serialization round-trips lossless and the file portable between
//! machines.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Default bound for per-session LLM stages (speakers, topics, quotes).
pub const DEFAULT_LLM_CONCURRENCY: usize = 3;

/// Fixed bound for concurrent media decoders.
///
/// Calibrated against the shared media engine on Apple hardware; reasonable
/// elsewhere.
pub const DECODER_CONCURRENCY: usize = 4;

/// Per-request LLM timeout default. Generous enough for long structured
/// responses from slow local backends.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;

/// Per-million-token pricing override from the `[pricing]` table.
///
/// WHY: Enterprise deployments often hide the underlying model behind a
/// deployment name, which defeats the built-in price table. An explicit
/// override keeps the cost read-out meaningful for those users.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PricingConfig {
    /// USD per million input tokens.
    pub input: f64,
    /// USD per million output tokens.
    pub output: f64,
}

/// Top-level config deserialized from `~/.config/bristlenose/config.toml`.
///
/// All fields are optional. Missing fields fall back to built-in defaults,
/// so a config file with a single key is valid and common. `Config::load()`
/// returns `Config::default()` when the file is absent rather than erroring.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// LLM provider: `"anthropic"`, `"openai"`, `"gemini"`, or `"local"`.
    pub provider: Option<String>,
    /// Model identifier passed to the provider.
    pub model: Option<String>,
    /// Endpoint for the `local` (OpenAI-compatible) provider.
    pub endpoint: Option<String>,
    /// Bound for per-session LLM stages; defaults to 3.
    pub concurrency: Option<usize>,
    /// Opt in to PII redaction (Stage 7). Off by default.
    #[serde(default)]
    pub redact_pii: bool,
    /// Keep scratch WAV files after the run instead of deleting them.
    #[serde(default)]
    pub keep_wav: bool,
    /// Cache LLM responses under `.bristlenose/cache/` keyed by prompt hash.
    #[serde(default)]
    pub cache_llm_responses: bool,
    /// Per-request LLM timeout in seconds.
    pub request_timeout_secs: Option<u64>,
    /// Whisper executable; defaults to `"whisper"` on PATH.
    pub whisper_path: Option<String>,
    /// Whisper model size/name; defaults to `"base"`.
    pub whisper_model: Option<String>,
    /// FFmpeg executable; defaults to `"ffmpeg"` on PATH.
    pub ffmpeg_path: Option<String>,
    /// Output directory override; defaults to `<input>/bristlenose-output`.
    pub output: Option<String>,
    pub pricing: Option<PricingConfig>,
}

impl Config {
    /// Load config from `~/.config/bristlenose/config.toml`.
    ///
    /// Returns `Config::default()` silently when the file is absent —
    /// bristlenose is designed to be zero-config. Parse failures also fall
    /// back to default to avoid breaking normal usage when a user has
    /// written an invalid value.
    pub fn load() -> Config {
        let Some(home) = dirs::home_dir() else {
            return Config::default();
        };
        let path = home.join(".config/bristlenose/config.toml");
        let Ok(content) = std::fs::read_to_string(&path) else {
            return Config::default();
        };
        toml::from_str(&content).unwrap_or_default()
    }

    pub fn output_path(&self) -> Option<PathBuf> {
        self.output.as_deref().map(expand_tilde)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or(DEFAULT_LLM_CONCURRENCY).max(1)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn whisper_path(&self) -> String {
        self.whisper_path.clone().unwrap_or_else(|| "whisper".into())
    }

    pub fn whisper_model(&self) -> String {
        self.whisper_model.clone().unwrap_or_else(|| "base".into())
    }

    pub fn ffmpeg_path(&self) -> String {
        self.ffmpeg_path.clone().unwrap_or_else(|| "ffmpeg".into())
    }
}

/// Expand a leading `~` or `~/` prefix to the user's home directory.
///
/// EDGE: A bare `"~"` is expanded to the home directory itself. Paths
/// without a leading `~` are returned unchanged, so absolute and relative
/// paths both work.
pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
