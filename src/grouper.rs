//! Stage 1: grouping input files into sessions.
//!
//! # Architecture overview
//!
//! Grouping is the first step in every pipeline run. It answers two
//! questions:
//! 1. **Which files belong together?** — platform recorders scatter one
//!    interview across several files (`interview.mp4` + `interview.vtt`,
//!    or a whole Zoom folder), each decorated with platform-specific
//!    noise in the name.
//! 2. **Does a session already have a transcript?** — sessions with a
//!    parseable VTT/SRT/DOCX skip both audio extraction and transcription.
//!
//! Two passes over the directory entries:
//! - **Pass 1** — a subdirectory named like `YYYY-MM-DD HH.MM.SS <topic>
//!   <meeting-id>` is a Zoom local-recording folder and becomes one
//!   session regardless of the filenames inside it.
//! - **Pass 2** — every remaining file is reduced to a normalised stem
//!   (lowercased, platform decorations stripped); files sharing a stem
//!   form one session.
//!
//! This module deliberately knows nothing about later stages. It only
//! produces `Session` records; the orchestrator decides what to do with
//! them.
//!
//! # TRADE-OFFS
//!
//! Directory entries are sorted by name before grouping so that session
//! IDs are deterministic across runs and filesystems — `read_dir` order is
//! not. "Input order" therefore means lexicographic name order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use walkdir::WalkDir;

use crate::error::BristlenoseError;
use crate::model::{is_media_ext, is_transcript_ext, Platform, Session};
use crate::parsers;

/// Zoom local-recording folder: `2025-09-12 14.00.05 Weekly research sync 81234567890`.
static ZOOM_FOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4})-(\d{2})-(\d{2}) (\d{2})\.(\d{2})\.(\d{2}) (.+?) (\d{9,11})$").unwrap()
});

/// Teams recording suffix: `_20250912_140001-Meeting Recording`.
static TEAMS_RECORDING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)_(\d{8})_(\d{6})-meeting recording$").unwrap());

static TEAMS_TRANSCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[\s_-]*-\s*meeting transcript$").unwrap());

/// Zoom cloud transcript prefix.
static ZOOM_AUDIO_PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^audio transcript_").unwrap());

/// Zoom cloud trailing `_<meeting-id>_<Month>_<DD>_<YYYY>`, meeting id 9–11 digits.
static ZOOM_CLOUD_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)_\d{9,11}_(january|february|march|april|may|june|july|august|september|october|november|december)_\d{1,2}_\d{4}$",
    )
    .unwrap()
});

/// Google Meet parenthetical: ` (2025-09-12 at 14_00 GMT-7)`.
static MEET_PAREN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*\(\d{4}-\d{2}-\d{2} at [^)]*\)").unwrap());

static MEET_TRANSCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*-\s*transcript$").unwrap());

/// Legacy generic suffixes attached by hand or by older exporters.
static LEGACY_SUFFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)_(transcript|subtitles|captions|sub|srt)$").unwrap());

/// What a single stripping pass learned about a filename.
struct StemInfo {
    cleaned: String,
    platform: Platform,
    started_at: Option<DateTime<Utc>>,
}

/// Strip platform decorations from a file stem, preserving case.
///
/// Rules are applied in a fixed order (Teams, Zoom cloud, Google Meet,
/// legacy), repeating until no rule fires, so normalisation is idempotent
/// even for stems carrying nested decorations.
fn strip_decorations(stem: &str) -> StemInfo {
    let mut cleaned = stem.trim().to_string();
    let mut platform = Platform::Generic;
    let mut started_at = None;

    loop {
        let before = cleaned.clone();

        if let Some(caps) = TEAMS_RECORDING_RE.captures(&cleaned) {
            let stamp = format!("{}_{}", &caps[1], &caps[2]);
            if let Ok(dt) = NaiveDateTime::parse_from_str(&stamp, "%Y%m%d_%H%M%S") {
                started_at.get_or_insert(dt.and_utc());
            }
            cleaned = TEAMS_RECORDING_RE.replace(&cleaned, "").trim().to_string();
            platform = Platform::Teams;
        }
        if TEAMS_TRANSCRIPT_RE.is_match(&cleaned) {
            cleaned = TEAMS_TRANSCRIPT_RE.replace(&cleaned, "").trim().to_string();
            platform = Platform::Teams;
        }
        if ZOOM_AUDIO_PREFIX_RE.is_match(&cleaned) {
            cleaned = ZOOM_AUDIO_PREFIX_RE.replace(&cleaned, "").trim().to_string();
            platform = Platform::ZoomCloud;
        }
        if ZOOM_CLOUD_SUFFIX_RE.is_match(&cleaned) {
            cleaned = ZOOM_CLOUD_SUFFIX_RE.replace(&cleaned, "").trim().to_string();
            platform = Platform::ZoomCloud;
        }
        if MEET_PAREN_RE.is_match(&cleaned) {
            cleaned = MEET_PAREN_RE.replace_all(&cleaned, "").trim().to_string();
            platform = Platform::GoogleMeet;
        }
        if MEET_TRANSCRIPT_RE.is_match(&cleaned) {
            cleaned = MEET_TRANSCRIPT_RE.replace(&cleaned, "").trim().to_string();
            if platform == Platform::Generic {
                platform = Platform::GoogleMeet;
            }
        }
        if LEGACY_SUFFIX_RE.is_match(&cleaned) {
            cleaned = LEGACY_SUFFIX_RE.replace(&cleaned, "").trim().to_string();
        }

        if cleaned == before {
            break;
        }
    }

    StemInfo {
        cleaned,
        platform,
        started_at,
    }
}

/// Normalise a file stem for grouping: strip decorations, lowercase.
///
/// Two files with equal normalised stems always group into one session.
/// Idempotent: `normalise_stem(normalise_stem(x)) == normalise_stem(x)`.
pub fn normalise_stem(stem: &str) -> String {
    strip_decorations(stem).cleaned.to_lowercase()
}

/// Group every processable file under `input_dir` into sessions.
///
/// Sessions receive IDs `s1, s2, …` in the order their first file appears
/// (directory entries sorted by name). Errors only when the directory is
/// unreadable or contains zero processable files; an unparseable platform
/// transcript downgrades its session to "no existing transcript" rather
/// than failing the stage.
pub fn group_sessions(input_dir: &Path) -> Result<Vec<Session>, BristlenoseError> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(input_dir)
        .map_err(|e| {
            BristlenoseError::Other(format!("Cannot read {}: {e}", input_dir.display()))
        })?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();

    let mut sessions: Vec<Session> = Vec::new();
    // Normalised stem → index into `sessions`, for pass-2 grouping.
    let mut by_stem: HashMap<String, usize> = HashMap::new();

    for path in entries {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if name.starts_with('.') {
            continue;
        }

        if path.is_dir() {
            // Pass 1: Zoom local-recording folders. Anything else that is a
            // directory (including our own output) is left alone.
            if let Some(caps) = ZOOM_FOLDER_RE.captures(name) {
                let topic = caps[7].to_string();
                let started_at = zoom_folder_datetime(&caps);
                let mut paths: Vec<PathBuf> = WalkDir::new(&path)
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .map(|e| e.path().to_path_buf())
                    .filter(|p| p.is_file() && (is_media_ext(p) || is_transcript_ext(p)))
                    .collect();
                paths.sort();
                if paths.is_empty() {
                    continue;
                }
                sessions.push(Session {
                    id: String::new(),
                    title: topic,
                    platform: Platform::ZoomLocal,
                    paths,
                    started_at,
                    duration_seconds: 0.0,
                    has_existing_transcript: false,
                });
            }
            continue;
        }

        if !is_media_ext(&path) && !is_transcript_ext(&path) {
            continue;
        }

        // Pass 2: stem normalisation.
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(name)
            .to_string();
        let info = strip_decorations(&stem);
        let key = info.cleaned.to_lowercase();

        match by_stem.get(&key) {
            Some(&idx) => {
                let session = &mut sessions[idx];
                session.paths.push(path);
                if session.platform == Platform::Generic && info.platform != Platform::Generic {
                    session.platform = info.platform;
                }
                if session.started_at.is_none() {
                    session.started_at = info.started_at;
                }
            }
            None => {
                by_stem.insert(key, sessions.len());
                sessions.push(Session {
                    id: String::new(),
                    title: info.cleaned,
                    platform: info.platform,
                    paths: vec![path],
                    started_at: info.started_at,
                    duration_seconds: 0.0,
                    has_existing_transcript: false,
                });
            }
        }
    }

    if sessions.is_empty() {
        return Err(BristlenoseError::NoInput(input_dir.to_path_buf()));
    }

    for (i, session) in sessions.iter_mut().enumerate() {
        session.id = format!("s{}", i + 1);
        session.has_existing_transcript = has_parseable_transcript(session);
    }

    Ok(sessions)
}

/// True when any member transcript file parses to at least one segment.
///
/// Parse failures are deliberately swallowed here — an unreadable platform
/// transcript means the session falls back to transcription, it does not
/// fail grouping.
fn has_parseable_transcript(session: &Session) -> bool {
    session.transcript_paths().into_iter().any(|p| {
        match parsers::parse_transcript_file(p) {
            Ok(segments) => !segments.is_empty(),
            Err(e) => {
                tracing::warn!(path = %p.display(), error = %e, "transcript did not parse; will transcribe instead");
                false
            }
        }
    })
}

fn zoom_folder_datetime(caps: &regex::Captures<'_>) -> Option<DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    )?;
    let time = chrono::NaiveTime::from_hms_opt(
        caps[4].parse().ok()?,
        caps[5].parse().ok()?,
        caps[6].parse().ok()?,
    )?;
    Some(NaiveDateTime::new(date, time).and_utc())
}
