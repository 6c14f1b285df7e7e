//! WebVTT parser.
//!
//! Handles the shapes the four meeting platforms actually write: optional
//! cue identifiers, `<v Speaker>` voice tags (Teams, Meet), bare `Name:`
//! prefixes (Zoom), and cue text spanning multiple lines. Styling tags
//! other than `<v>` are stripped.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::BristlenoseError;
use crate::model::Segment;
use crate::timecode::parse_timecode;

use super::{split_speaker_prefix, TranscriptParser};

pub struct VttParser;

static VOICE_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<v(?:\.[^ >]*)?\s+([^>]+)>").unwrap());
static ANY_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"</?[^>]+>").unwrap());

impl TranscriptParser for VttParser {
    fn parse(&self, path: &Path) -> Result<Vec<Segment>, BristlenoseError> {
        let content = std::fs::read_to_string(path)?;
        parse_str(&content).ok_or_else(|| BristlenoseError::UnparseableTranscript(path.to_path_buf()))
    }
}

/// Parse VTT content. Returns `None` when the WEBVTT signature is missing.
fn parse_str(content: &str) -> Option<Vec<Segment>> {
    let content = content.trim_start_matches('\u{feff}');
    if !content.trim_start().starts_with("WEBVTT") {
        return None;
    }

    let mut segments = Vec::new();
    // Carried across cues: Zoom writes the speaker on the first cue of a
    // turn only.
    let mut last_label = String::from("Unknown");

    let mut lines = content.lines().peekable();
    while let Some(line) = lines.next() {
        let Some((start, end)) = parse_cue_timing(line) else {
            continue;
        };

        let mut text_lines: Vec<String> = Vec::new();
        let mut label: Option<String> = None;
        while let Some(&next) = lines.peek() {
            if next.trim().is_empty() || parse_cue_timing(next).is_some() {
                break;
            }
            let raw = lines.next().unwrap();

            let mut line_text = raw.to_string();
            if let Some(caps) = VOICE_TAG_RE.captures(&line_text) {
                label.get_or_insert(caps[1].trim().to_string());
            }
            line_text = ANY_TAG_RE.replace_all(&line_text, "").to_string();

            if text_lines.is_empty() && label.is_none() {
                let (prefix, rest) = split_speaker_prefix(line_text.trim());
                if let Some(name) = prefix {
                    label = Some(name);
                    line_text = rest.to_string();
                }
            }
            let trimmed = line_text.trim();
            if !trimmed.is_empty() {
                text_lines.push(trimmed.to_string());
            }
        }

        let label = match label {
            Some(l) => {
                last_label = l.clone();
                l
            }
            None => last_label.clone(),
        };

        if !text_lines.is_empty() {
            segments.push(Segment {
                session_id: String::new(),
                start,
                end,
                text: text_lines.join(" "),
                speaker_label: label,
                speaker_code: None,
                role: None,
                words: vec![],
            });
        }
    }

    Some(segments)
}

/// Parse a `start --> end` cue timing line, tolerating trailing settings.
fn parse_cue_timing(line: &str) -> Option<(f64, f64)> {
    let (lhs, rhs) = line.split_once("-->")?;
    let start = parse_timecode(lhs)?;
    // Cue settings (`align:start position:0%`) follow the end timecode.
    let rhs = rhs.trim_start();
    let end_str = rhs.split_whitespace().next()?;
    let end = parse_timecode(end_str)?;
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_cues() {
        let content = "WEBVTT\n\n00:01.000 --> 00:04.000\nSarah: So tell me about it.\n\n00:04.500 --> 00:09.000\nIt was confusing at first.\n";
        let segs = parse_str(content).unwrap();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].speaker_label, "Sarah");
        assert_eq!(segs[0].text, "So tell me about it.");
        assert_eq!(segs[0].start, 1.0);
        // Label carries forward when the next cue names no speaker
        assert_eq!(segs[1].speaker_label, "Sarah");
    }

    #[test]
    fn test_voice_tags() {
        let content =
            "WEBVTT\n\n00:00.000 --> 00:02.000\n<v Sarah Jones>I clicked the big button</v>\n";
        let segs = parse_str(content).unwrap();
        assert_eq!(segs[0].speaker_label, "Sarah Jones");
        assert_eq!(segs[0].text, "I clicked the big button");
    }

    #[test]
    fn test_cue_identifiers_and_settings_ignored() {
        let content = "WEBVTT\n\ncue-7\n00:01.000 --> 00:02.000 align:start position:0%\nhello\n";
        let segs = parse_str(content).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].text, "hello");
        assert_eq!(segs[0].end, 2.0);
    }

    #[test]
    fn test_mixed_timecode_forms_across_hour() {
        let content = "WEBVTT\n\n59:58.000 --> 59:59.500\nalmost there\n\n01:00:01.000 --> 01:00:03.000\npast the hour\n";
        let segs = parse_str(content).unwrap();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].start, 3598.0);
        assert_eq!(segs[1].start, 3601.0);
    }

    #[test]
    fn test_multiline_cue_joined() {
        let content = "WEBVTT\n\n00:00.000 --> 00:05.000\nfirst line\nsecond line\n";
        let segs = parse_str(content).unwrap();
        assert_eq!(segs[0].text, "first line second line");
    }

    #[test]
    fn test_missing_signature_rejected() {
        assert!(parse_str("00:00.000 --> 00:01.000\nhello\n").is_none());
    }

    #[test]
    fn test_bom_tolerated() {
        let content = "\u{feff}WEBVTT\n\n00:00.000 --> 00:01.000\nhi\n";
        assert_eq!(parse_str(content).unwrap().len(), 1);
    }
}
