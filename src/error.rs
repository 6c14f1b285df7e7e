use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum BristlenoseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Unparseable transcript: {0}")]
    UnparseableTranscript(PathBuf),

    #[error("No processable files in {0}")]
    NoInput(PathBuf),

    #[error("Decode failed for {session}: {message}")]
    Decode { session: String, message: String },

    #[error("Transcription failed for {session}: {message}")]
    Transcribe { session: String, message: String },

    #[error("Provider error ({provider}): {message}")]
    Provider { provider: String, message: String },

    #[error("Response truncated at the output-token limit; raise max_tokens or use a model with a larger output window")]
    Truncated,

    #[error("Redaction failed: {0}")]
    Redaction(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}
