//! Transcript parsers: VTT, SRT, and Teams-export DOCX into segments.
//!
//! # Architecture overview
//!
//! This module sits at the boundary between platform transcript files and
//! the normalised segment model. It defines the `TranscriptParser` trait
//! that the three format parsers implement, plus extension-based detection
//! so callers never need to know which parser fits a given file.
//!
//! All three parsers uphold the same output contract:
//! - segments sorted by `start`, with `start < end`;
//! - both `MM:SS` and `HH:MM:SS` timecodes accepted, even mixed within one
//!   file across the one-hour boundary;
//! - speaker labels preserved exactly as the source wrote them (a later
//!   stage decides whether a label is a real name or a generic
//!   "Speaker 2").
//!
//! # TRADE-OFFS
//!
//! Returning `Box<dyn TranscriptParser>` from `detect_parser` rather than
//! an enum avoids a central match arm for every parser; the allocation cost
//! is negligible against file I/O.

pub mod docx;
pub mod srt;
pub mod vtt;

use std::path::Path;

use crate::error::BristlenoseError;
use crate::model::Segment;

/// Trait implemented by each format parser.
pub trait TranscriptParser {
    /// Parse the file at `path` into segments with an empty `session_id`
    /// (the caller stamps it).
    fn parse(&self, path: &Path) -> Result<Vec<Segment>, BristlenoseError>;
}

/// Select the parser for a path by extension.
pub fn detect_parser(path: &Path) -> Result<Box<dyn TranscriptParser>, BristlenoseError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "vtt" => Ok(Box::new(vtt::VttParser)),
        "srt" => Ok(Box::new(srt::SrtParser)),
        "docx" => Ok(Box::new(docx::DocxParser)),
        _ => Err(BristlenoseError::UnparseableTranscript(path.to_path_buf())),
    }
}

/// Parse any supported transcript file into segments.
pub fn parse_transcript_file(path: &Path) -> Result<Vec<Segment>, BristlenoseError> {
    let parser = detect_parser(path)?;
    let mut segments = parser.parse(path)?;
    finalise(&mut segments);
    if segments.is_empty() {
        return Err(BristlenoseError::UnparseableTranscript(path.to_path_buf()));
    }
    Ok(segments)
}

/// Enforce the segment invariants on freshly parsed output: drop empty or
/// inverted cues, sort by start.
fn finalise(segments: &mut Vec<Segment>) {
    segments.retain(|s| !s.text.trim().is_empty() && s.end > s.start);
    segments.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));
}

/// Split a leading `Name:` speaker prefix off a cue line.
///
/// Subtitle files written without voice tags conventionally prefix the
/// speaker as `SARAH:` or `Speaker 2:`. The prefix must be short and free
/// of sentence punctuation so that `Note: this screen…` is not mistaken
/// for a speaker called "Note" with a very long name.
pub(crate) fn split_speaker_prefix(line: &str) -> (Option<String>, &str) {
    if let Some(idx) = line.find(':') {
        let (head, tail) = line.split_at(idx);
        let head = head.trim();
        let tail = tail[1..].trim_start();
        let looks_like_name = !head.is_empty()
            && head.len() <= 40
            && head.split_whitespace().count() <= 4
            && !tail.is_empty()
            && !head.contains(['.', ',', '?', '!'])
            && head.chars().next().is_some_and(|c| c.is_alphabetic());
        if looks_like_name {
            return (Some(head.to_string()), tail);
        }
    }
    (None, line)
}
