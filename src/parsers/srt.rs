//! SubRip (SRT) parser.
//!
//! SRT blocks are an index line, a timing line with comma-separated
//! milliseconds, then one or more text lines. Zoom's cloud exports follow
//! this exactly; hand-edited files often drop the index or use dot
//! milliseconds, both of which are tolerated.

use std::path::Path;

use crate::error::BristlenoseError;
use crate::model::Segment;
use crate::timecode::parse_timecode;

use super::{split_speaker_prefix, TranscriptParser};

pub struct SrtParser;

impl TranscriptParser for SrtParser {
    fn parse(&self, path: &Path) -> Result<Vec<Segment>, BristlenoseError> {
        let content = std::fs::read_to_string(path)?;
        let segments = parse_str(&content);
        if segments.is_empty() {
            return Err(BristlenoseError::UnparseableTranscript(path.to_path_buf()));
        }
        Ok(segments)
    }
}

fn parse_str(content: &str) -> Vec<Segment> {
    let content = content.trim_start_matches('\u{feff}');
    let mut segments = Vec::new();
    let mut last_label = String::from("Unknown");

    let mut lines = content.lines().peekable();
    while let Some(line) = lines.next() {
        let Some((start, end)) = parse_timing(line) else {
            continue;
        };

        let mut text_lines: Vec<String> = Vec::new();
        let mut label: Option<String> = None;
        while let Some(&next) = lines.peek() {
            if next.trim().is_empty() || parse_timing(next).is_some() {
                break;
            }
            let raw = lines.next().unwrap().trim().to_string();
            let mut line_text = raw;
            if text_lines.is_empty() && label.is_none() {
                let (prefix, rest) = split_speaker_prefix(&line_text);
                if let Some(name) = prefix {
                    label = Some(name);
                    line_text = rest.to_string();
                }
            }
            if !line_text.trim().is_empty() {
                text_lines.push(line_text.trim().to_string());
            }
        }

        let label = match label {
            Some(l) => {
                last_label = l.clone();
                l
            }
            None => last_label.clone(),
        };

        if !text_lines.is_empty() && end > start {
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

    segments
}

fn parse_timing(line: &str) -> Option<(f64, f64)> {
    let (lhs, rhs) = line.split_once("-->")?;
    Some((parse_timecode(lhs)?, parse_timecode(rhs)?))
}
