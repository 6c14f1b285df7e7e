//! Stage 5: transcription.
//!
//! # Architecture overview
//!
//! The transcriber shells out to a whisper CLI (`whisper` by default,
//! configurable for whisper.cpp wrappers) asking for JSON output with
//! word-level timestamps, then normalises that JSON into segments.
//!
//! Transcription is single-tenant GPU-bound work: the orchestrator calls
//! this sequentially across sessions, because parallel decodes fight over
//! one accelerator and finish slower than a queue.
//!
//! # Caching
//!
//! The cache key is the content hash of every input WAV plus the model
//! identifier. A hit loads the cached segments and skips the subprocess
//! entirely, which is what makes re-runs after a downstream failure cheap.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::cancel::CancelToken;
use crate::error::BristlenoseError;
use crate::hash::{hash_file, hash_strings};
use crate::model::{Segment, Session, WordTiming};

#[derive(Debug, Clone)]
pub struct TranscriberConfig {
    /// Whisper executable name or path.
    pub whisper_path: String,
    /// Model identifier; part of the cache key.
    pub model: String,
}

/// Whisper's JSON output shape (the fields we consume).
#[derive(Debug, Deserialize)]
struct WhisperOutput {
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    start: f64,
    end: f64,
    text: String,
    #[serde(default)]
    speaker: Option<String>,
    #[serde(default)]
    words: Vec<WhisperWord>,
}

#[derive(Debug, Deserialize)]
struct WhisperWord {
    word: String,
    start: f64,
    end: f64,
}

/// Transcribe one session's WAVs, consulting the cache first.
pub async fn transcribe_session(
    session: &Session,
    wav_paths: &[PathBuf],
    cache_dir: &Path,
    config: &TranscriberConfig,
    cancel: &CancelToken,
) -> Result<Vec<Segment>, BristlenoseError> {
    let key = cache_key(wav_paths, &config.model)?;
    let cache_path = cache_dir.join(format!("{key}.json"));

    if let Some(segments) = read_cache(&cache_path, &session.id) {
        tracing::info!(session = %session.id, "transcript cache hit");
        return Ok(segments);
    }

    let mut segments = Vec::new();
    for wav in wav_paths {
        if cancel.is_cancelled() {
            return Err(BristlenoseError::Cancelled);
        }
        let output = run_whisper(&session.id, wav, config, cancel).await?;
        segments.extend(normalise(&session.id, output));
    }
    segments.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));

    write_cache(&cache_path, &segments)?;
    Ok(segments)
}

/// Content hash of the audio plus the model id.
fn cache_key(wav_paths: &[PathBuf], model: &str) -> Result<String, BristlenoseError> {
    let mut parts = vec![model.to_string()];
    for path in wav_paths {
        parts.push(hash_file(path)?);
    }
    Ok(hash_strings(parts))
}

fn read_cache(path: &Path, session_id: &str) -> Option<Vec<Segment>> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut segments: Vec<Segment> = serde_json::from_str(&content).ok()?;
    // The cache is keyed by content, not session id; re-stamp so a renamed
    // input folder still hits.
    for seg in &mut segments {
        seg.session_id = session_id.to_string();
    }
    Some(segments)
}

fn write_cache(path: &Path, segments: &[Segment]) -> Result<(), BristlenoseError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(segments)?)?;
    Ok(())
}

/// Invoke whisper on one WAV and parse the JSON it writes.
async fn run_whisper(
    session_id: &str,
    wav: &Path,
    config: &TranscriberConfig,
    cancel: &CancelToken,
) -> Result<WhisperOutput, BristlenoseError> {
    let output_dir = wav.parent().unwrap_or(Path::new("."));

    let mut child = Command::new(&config.whisper_path)
        .arg(wav)
        .args(["--model", &config.model])
        .args(["--output_format", "json"])
        .args(["--word_timestamps", "True"])
        .arg("--output_dir")
        .arg(output_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BristlenoseError::Transcribe {
            session: session_id.to_string(),
            message: format!("failed to start {}: {e}", config.whisper_path),
        })?;

    let stderr = child.stderr.take();
    let drain = tokio::spawn(async move {
        let mut tail = String::new();
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "whisper", "{line}");
                tail = line;
            }
        }
        tail
    });

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(BristlenoseError::Cancelled);
        }
    };
    let last_line = drain.await.unwrap_or_default();

    if !status.success() {
        return Err(BristlenoseError::Transcribe {
            session: session_id.to_string(),
            message: format!("whisper exited with {status}: {last_line}"),
        });
    }

    let stem = wav.file_stem().and_then(|s| s.to_str()).unwrap_or("out");
    let json_path = output_dir.join(format!("{stem}.json"));
    let content = std::fs::read_to_string(&json_path).map_err(|e| BristlenoseError::Transcribe {
        session: session_id.to_string(),
        message: format!("whisper output {} unreadable: {e}", json_path.display()),
    })?;
    let parsed = serde_json::from_str(&content).map_err(|e| BristlenoseError::Transcribe {
        session: session_id.to_string(),
        message: format!("whisper output did not parse: {e}"),
    })?;
    let _ = std::fs::remove_file(&json_path);
    Ok(parsed)
}

fn normalise(session_id: &str, output: WhisperOutput) -> Vec<Segment> {
    output
        .segments
        .into_iter()
        .filter(|s| s.end > s.start && !s.text.trim().is_empty())
        .map(|s| Segment {
            session_id: session_id.to_string(),
            start: s.start,
            end: s.end,
            text: s.text.trim().to_string(),
            speaker_label: s.speaker.unwrap_or_else(|| "Speaker 1".to_string()),
            speaker_code: None,
            role: None,
            words: s
                .words
                .into_iter()
                .map(|w| WordTiming {
                    text: w.word.trim().to_string(),
                    start: w.start,
                    end: w.end,
                })
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalise_maps_words_and_labels() {
        let output: WhisperOutput = serde_json::from_str(
            r#"{
                "segments": [
                    {"start": 0.0, "end": 2.5, "text": " hello there ", "speaker": "SPEAKER_00",
                     "words": [{"word": " hello", "start": 0.0, "end": 1.0},
                               {"word": " there", "start": 1.1, "end": 2.4}]},
                    {"start": 3.0, "end": 4.0, "text": "no speaker field", "words": []}
                ]
            }"#,
        )
        .unwrap();
        let segs = normalise("s1", output);
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].speaker_label, "SPEAKER_00");
        assert_eq!(segs[0].text, "hello there");
        assert_eq!(segs[0].words.len(), 2);
        assert_eq!(segs[0].words[0].text, "hello");
        assert_eq!(segs[1].speaker_label, "Speaker 1");
    }

    #[test]
    fn test_normalise_drops_degenerate_segments() {
        let output: WhisperOutput = serde_json::from_str(
            r#"{"segments": [
                {"start": 2.0, "end": 2.0, "text": "zero width"},
                {"start": 0.0, "end": 1.0, "text": "   "}
            ]}"#,
        )
        .unwrap();
        assert!(normalise("s1", output).is_empty());
    }

    #[test]
    fn test_cache_key_depends_on_model_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("a.wav");
        std::fs::write(&wav, b"RIFFdata").unwrap();
        let paths = vec![wav.clone()];
        let base = cache_key(&paths, "base").unwrap();
        let large = cache_key(&paths, "large").unwrap();
        assert_ne!(base, large);

        std::fs::write(&wav, b"RIFFother").unwrap();
        assert_ne!(cache_key(&paths, "base").unwrap(), base);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_subprocess() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("a.wav");
        std::fs::write(&wav, b"RIFFdata").unwrap();
        let cache_dir = dir.path().join("cache");

        let config = TranscriberConfig {
            // Bogus path proves a cache hit never spawns whisper
            whisper_path: "/nonexistent/whisper".into(),
            model: "base".into(),
        };
        let session = Session {
            id: "s1".into(),
            title: "t".into(),
            platform: crate::model::Platform::Generic,
            paths: vec![],
            started_at: None,
            duration_seconds: 0.0,
            has_existing_transcript: false,
        };

        let key = cache_key(&[wav.clone()], "base").unwrap();
        let cached = vec![Segment {
            session_id: "old-name".into(),
            start: 0.0,
            end: 1.0,
            text: "cached".into(),
            speaker_label: "Speaker 1".into(),
            speaker_code: None,
            role: None,
            words: vec![],
        }];
        write_cache(&cache_dir.join(format!("{key}.json")), &cached).unwrap();

        let (_handle, token) = crate::cancel::cancel_pair();
        let segs = transcribe_session(&session, &[wav], &cache_dir, &config, &token)
            .await
            .unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].text, "cached");
        // Re-stamped to the current session id
        assert_eq!(segs[0].session_id, "s1");
    }

    #[tokio::test]
    async fn test_missing_whisper_is_transcribe_error() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("a.wav");
        std::fs::write(&wav, b"RIFFdata").unwrap();

        let config = TranscriberConfig {
            whisper_path: "/nonexistent/whisper".into(),
            model: "base".into(),
        };
        let session = Session {
            id: "s1".into(),
            title: "t".into(),
            platform: crate::model::Platform::Generic,
            paths: vec![],
            started_at: None,
            duration_seconds: 0.0,
            has_existing_transcript: false,
        };
        let (_handle, token) = crate::cancel::cancel_pair();
        let err = transcribe_session(&session, &[wav], dir.path(), &config, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, BristlenoseError::Transcribe { .. }));
    }
}
