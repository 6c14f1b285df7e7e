//! API credential resolution.
//!
//! Priority: OS credential store → environment variable → dotfile
//! (`~/.config/bristlenose/credentials`). The winning source is recorded
//! alongside the key so the diagnostic surface can report where a
//! credential came from without ever printing the credential itself.
//!
//! The credential-store lookup is a seam: platform keychain integration
//! lives outside this crate, and `keychain_lookup` returns `None` wherever
//! no helper is wired in.

use std::path::PathBuf;

use crate::error::BristlenoseError;

use super::Provider;

/// Where a resolved credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Keychain,
    Environment,
    Dotfile,
    /// The local provider accepts anonymous endpoints.
    NotRequired,
}

impl std::fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialSource::Keychain => write!(f, "keychain"),
            CredentialSource::Environment => write!(f, "environment"),
            CredentialSource::Dotfile => write!(f, "dotfile"),
            CredentialSource::NotRequired => write!(f, "not required"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credential {
    pub key: String,
    pub source: CredentialSource,
}

/// Environment variable consulted for each provider.
pub fn env_var_name(provider: Provider) -> &'static str {
    match provider {
        Provider::Anthropic => "ANTHROPIC_API_KEY",
        Provider::OpenAi => "OPENAI_API_KEY",
        Provider::Gemini => "GEMINI_API_KEY",
        Provider::Local => "BRISTLENOSE_LOCAL_API_KEY",
    }
}

fn dotfile_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".config/bristlenose/credentials"))
}

/// Seam for OS credential-store integration. Always `None` in this crate.
fn keychain_lookup(_provider: Provider) -> Option<String> {
    None
}

/// Resolve the credential for `provider`.
///
/// The local provider is allowed to run without a key (self-hosted
/// endpoints usually don't check one); every cloud provider errors with
/// the full search order so the user knows where to put the key.
pub fn resolve(provider: Provider) -> Result<Credential, BristlenoseError> {
    resolve_with_dotfile(provider, dotfile_path().as_deref())
}

fn resolve_with_dotfile(
    provider: Provider,
    dotfile: Option<&std::path::Path>,
) -> Result<Credential, BristlenoseError> {
    if let Some(key) = keychain_lookup(provider) {
        return Ok(Credential {
            key,
            source: CredentialSource::Keychain,
        });
    }

    let var = env_var_name(provider);
    if let Ok(key) = std::env::var(var) {
        if !key.trim().is_empty() {
            return Ok(Credential {
                key: key.trim().to_string(),
                source: CredentialSource::Environment,
            });
        }
    }

    if let Some(path) = dotfile {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Some(key) = parse_dotfile(&content, provider.name()) {
                return Ok(Credential {
                    key,
                    source: CredentialSource::Dotfile,
                });
            }
        }
    }

    if provider == Provider::Local {
        return Ok(Credential {
            key: String::new(),
            source: CredentialSource::NotRequired,
        });
    }

    Err(BristlenoseError::Provider {
        provider: provider.name().to_string(),
        message: format!(
            "no API key found; set {var} or add `{} = <key>` to ~/.config/bristlenose/credentials",
            provider.name()
        ),
    })
}

/// Parse `provider = key` (or `provider=key`) lines; `#` starts a comment.
fn parse_dotfile(content: &str, provider_name: &str) -> Option<String> {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((name, key)) = line.split_once('=') {
            if name.trim().eq_ignore_ascii_case(provider_name) {
                let key = key.trim();
                if !key.is_empty() {
                    return Some(key.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dotfile_basic() {
        let content = "# keys\nanthropic = sk-test-123\nopenai=sk-other\n";
        assert_eq!(parse_dotfile(content, "anthropic").as_deref(), Some("sk-test-123"));
        assert_eq!(parse_dotfile(content, "openai").as_deref(), Some("sk-other"));
        assert!(parse_dotfile(content, "gemini").is_none());
    }

    #[test]
    fn test_parse_dotfile_ignores_comments_and_blanks() {
        let content = "\n# anthropic = commented-out\n\nanthropic = real-key\n";
        assert_eq!(parse_dotfile(content, "anthropic").as_deref(), Some("real-key"));
    }

    #[test]
    fn test_resolve_from_dotfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials");
        std::fs::write(&path, "gemini = dot-key\n").unwrap();
        // Only meaningful when the env var is unset in the test environment
        if std::env::var(env_var_name(Provider::Gemini)).is_err() {
            let cred = resolve_with_dotfile(Provider::Gemini, Some(&path)).unwrap();
            assert_eq!(cred.key, "dot-key");
            assert_eq!(cred.source, CredentialSource::Dotfile);
        }
    }

    #[test]
    fn test_local_provider_key_optional() {
        if std::env::var(env_var_name(Provider::Local)).is_err() {
            let cred = resolve_with_dotfile(Provider::Local, None).unwrap();
            assert!(cred.key.is_empty());
            assert_eq!(cred.source, CredentialSource::NotRequired);
        }
    }

    #[test]
    fn test_cloud_provider_missing_key_errors() {
        if std::env::var(env_var_name(Provider::Anthropic)).is_err() {
            let err = resolve_with_dotfile(Provider::Anthropic, None).unwrap_err();
            let message = err.to_string();
            assert!(message.contains("ANTHROPIC_API_KEY"));
        }
    }
}
