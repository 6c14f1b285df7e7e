//! Stage 2: audio extraction.
//!
//! # Architecture overview
//!
//! Each session's media files are decoded to 16 kHz mono WAV in the
//! scratch directory — all the transcriber needs, and a fraction of the
//! source size. Decoding shells out to ffmpeg under a fixed bound of four
//! concurrent decoders: the shared hardware media engine on Apple
//! hardware saturates around there, and four is a reasonable ceiling
//! elsewhere too.
//!
//! Sessions with an existing transcript are skipped entirely — no decode
//! is attempted. A failed decode is recorded against its session and the
//! pipeline moves on; one corrupt recording must not sink the batch.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::cancel::CancelToken;
use crate::config::DECODER_CONCURRENCY;
use crate::error::BristlenoseError;
use crate::model::Session;

/// Decode every media file of every transcript-less session.
///
/// Returns one entry per input session, in input order, pairing the
/// session id with the scratch WAVs produced (empty for skipped sessions)
/// or the decode error.
pub async fn extract_sessions(
    sessions: &[Session],
    scratch_dir: &Path,
    ffmpeg_path: &str,
    cancel: &CancelToken,
) -> Vec<(String, Result<Vec<PathBuf>, BristlenoseError>)> {
    let semaphore = Semaphore::new(DECODER_CONCURRENCY);

    let futures = sessions.iter().map(|session| {
        let semaphore = &semaphore;
        async move {
            let media = session.media_paths();
            if session.has_existing_transcript || media.is_empty() {
                return (session.id.clone(), Ok(vec![]));
            }

            // The permit bounds concurrent ffmpeg processes, not sessions:
            // a multi-file session decodes its files one at a time under a
            // single permit.
            let _permit = semaphore.acquire().await.expect("semaphore closed");

            let mut wavs = Vec::new();
            for (i, input) in media.iter().enumerate() {
                if cancel.is_cancelled() {
                    return (session.id.clone(), Err(BristlenoseError::Cancelled));
                }
                let out = scratch_dir.join(format!("{}-{}.wav", session.id, i + 1));
                match decode_to_wav(ffmpeg_path, input, &out, cancel).await {
                    Ok(()) => wavs.push(out),
                    Err(e) => return (session.id.clone(), Err(e)),
                }
            }
            (session.id.clone(), Ok(wavs))
        }
    });

    // join_all preserves input order regardless of completion order.
    join_all(futures).await
}

/// Run one ffmpeg decode, streaming its progress lines to the log.
async fn decode_to_wav(
    ffmpeg_path: &str,
    input: &Path,
    output: &Path,
    cancel: &CancelToken,
) -> Result<(), BristlenoseError> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut cmd = Command::new(ffmpeg_path);
    if cfg!(target_os = "macos") {
        // Hint the shared hardware video decoder; audio-only inputs ignore it.
        cmd.args(["-hwaccel", "videotoolbox"]);
    }
    cmd.arg("-i")
        .arg(input)
        .args(["-vn", "-acodec", "pcm_s16le", "-ar", "16000", "-ac", "1", "-y"])
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| BristlenoseError::Decode {
        session: input.display().to_string(),
        message: format!("failed to start {ffmpeg_path}: {e}"),
    })?;

    // Drain stderr as it arrives; ffmpeg blocks when the pipe fills.
    let stderr = child.stderr.take();
    let drain = tokio::spawn(async move {
        let mut tail = String::new();
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "ffmpeg", "{line}");
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
        return Err(BristlenoseError::Decode {
            session: input.display().to_string(),
            message: format!("ffmpeg exited with {status}: {last_line}"),
        });
    }
    Ok(())
}
