//! Teams-export DOCX parser.
//!
//! # Format
//!
//! Teams exports a meeting transcript as a Word document where each turn
//! is a header paragraph carrying the speaker's display name and an inline
//! timecode, followed by one or more paragraphs of utterance text:
//!
//! ```text
//! Sarah Jones   0:16
//! So tell me about your experience with the new flow.
//! Priya Patel   0:24
//! Honestly, the first screen threw me.
//! ```
//!
//! The document stores no end times, so each segment ends where the next
//! one starts (the final segment gets a flat tail).
//!
//! # TRADE-OFFS
//!
//! Only `word/document.xml` is read and only text runs are extracted —
//! styling, tables, and headers are ignored. That loses nothing for the
//! Teams shape, and documents that are not transcripts simply yield zero
//! segments and are reported unparseable by the caller.

use std::io::Read;
use std::path::Path;

use once_cell::sync::Lazy;
use quick_xml::events::Event;
use regex::Regex;

use crate::error::BristlenoseError;
use crate::model::Segment;
use crate::timecode::parse_timecode;

use super::TranscriptParser;

pub struct DocxParser;

/// Header paragraph: a display name followed by a timecode, in either
/// order. Teams puts the name first; some localisations flip it.
static HEADER_NAME_FIRST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<name>\S.*?)\s+(?P<tc>\d{1,2}:\d{2}(?::\d{2})?)$").unwrap());
static HEADER_TC_FIRST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<tc>\d{1,2}:\d{2}(?::\d{2})?)\s+(?P<name>\S.*)$").unwrap());

/// Tail duration granted to the final segment, which has no successor to
/// end it.
const LAST_SEGMENT_TAIL_SECS: f64 = 5.0;

impl TranscriptParser for DocxParser {
    fn parse(&self, path: &Path) -> Result<Vec<Segment>, BristlenoseError> {
        let paragraphs = read_paragraphs(path)?;
        let segments = paragraphs_to_segments(&paragraphs);
        if segments.is_empty() {
            return Err(BristlenoseError::UnparseableTranscript(path.to_path_buf()));
        }
        Ok(segments)
    }
}

/// Extract the visible text of every paragraph in `word/document.xml`.
fn read_paragraphs(path: &Path) -> Result<Vec<String>, BristlenoseError> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|_| BristlenoseError::UnparseableTranscript(path.to_path_buf()))?;
    let mut entry = archive
        .by_name("word/document.xml")
        .map_err(|_| BristlenoseError::UnparseableTranscript(path.to_path_buf()))?;
    let mut xml = String::new();
    entry.read_to_string(&mut xml)?;
    Ok(paragraphs_from_xml(&xml))
}

fn paragraphs_from_xml(xml: &str) -> Vec<String> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text_run = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"w:t" => in_text_run = true,
            Ok(Event::End(e)) if e.name().as_ref() == b"w:t" => in_text_run = false,
            Ok(Event::Text(t)) if in_text_run => {
                if let Ok(text) = t.unescape() {
                    current.push_str(&text);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"w:p" => {
                let text = current.trim().to_string();
                if !text.is_empty() {
                    paragraphs.push(text);
                }
                current.clear();
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }

    paragraphs
}

/// Fold header/text paragraph runs into segments.
fn paragraphs_to_segments(paragraphs: &[String]) -> Vec<Segment> {
    struct Entry {
        name: String,
        start: f64,
        text: Vec<String>,
    }

    let mut entries: Vec<Entry> = Vec::new();
    for para in paragraphs {
        if let Some((name, start)) = parse_header(para) {
            entries.push(Entry {
                name,
                start,
                text: Vec::new(),
            });
        } else if let Some(entry) = entries.last_mut() {
            entry.text.push(para.clone());
        }
        // Text before the first header (titles, boilerplate) is dropped.
    }

    let mut segments = Vec::new();
    for i in 0..entries.len() {
        let entry = &entries[i];
        if entry.text.is_empty() {
            continue;
        }
        let end = entries
            .get(i + 1)
            .map(|next| next.start)
            .filter(|&next| next > entry.start)
            .unwrap_or(entry.start + LAST_SEGMENT_TAIL_SECS);
        segments.push(Segment {
            session_id: String::new(),
            start: entry.start,
            end,
            text: entry.text.join(" "),
            speaker_label: entry.name.clone(),
            speaker_code: None,
            role: None,
            words: vec![],
        });
    }
    segments
}

fn parse_header(para: &str) -> Option<(String, f64)> {
    for re in [&*HEADER_NAME_FIRST_RE, &*HEADER_TC_FIRST_RE] {
        if let Some(caps) = re.captures(para) {
            let name = caps.name("name")?.as_str().trim();
            let tc = caps.name("tc")?.as_str();
            // A header's "name" must not itself look like running prose.
            if name.len() <= 60 && !name.ends_with(['.', '?', '!']) {
                if let Some(start) = parse_timecode(tc) {
                    return Some((name.to_string(), start));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn para_xml(texts: &[&str]) -> String {
        let mut xml = String::from(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>",
        );
        for t in texts {
            xml.push_str(&format!("<w:p><w:r><w:t>{t}</w:t></w:r></w:p>"));
        }
        xml.push_str("</w:body></w:document>");
        xml
    }

    #[test]
    fn test_paragraphs_from_xml() {
        let xml = para_xml(&["Sarah Jones   0:16", "So tell me about it."]);
        let paras = paragraphs_from_xml(&xml);
        assert_eq!(paras, vec!["Sarah Jones   0:16", "So tell me about it."]);
    }

    #[test]
    fn test_header_name_first() {
        let (name, tc) = parse_header("Sarah Jones   0:16").unwrap();
        assert_eq!(name, "Sarah Jones");
        assert_eq!(tc, 16.0);
    }

    #[test]
    fn test_header_timecode_first() {
        let (name, tc) = parse_header("1:02:03 Priya Patel").unwrap();
        assert_eq!(name, "Priya Patel");
        assert_eq!(tc, 3723.0);
    }

    #[test]
    fn test_header_rejects_prose() {
        assert!(parse_header("We started the study at 9:30 sharp.").is_none());
        assert!(parse_header("Just an ordinary paragraph").is_none());
    }

    #[test]
    fn test_segments_end_at_next_start() {
        let paras: Vec<String> = [
            "Transcript",
            "Sarah Jones   0:16",
            "So tell me about your experience.",
            "Priya Patel   0:24",
            "Honestly, the first screen threw me.",
            "And I kept scrolling past it.",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let segs = paragraphs_to_segments(&paras);
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].speaker_label, "Sarah Jones");
        assert_eq!(segs[0].start, 16.0);
        assert_eq!(segs[0].end, 24.0);
        assert_eq!(segs[1].start, 24.0);
        assert_eq!(segs[1].end, 24.0 + LAST_SEGMENT_TAIL_SECS);
        assert_eq!(
            segs[1].text,
            "Honestly, the first screen threw me. And I kept scrolling past it."
        );
    }

    #[test]
    fn test_header_with_hour_timecode() {
        let paras: Vec<String> = ["Sarah Jones   1:00:05", "Past the hour now."]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let segs = paragraphs_to_segments(&paras);
        assert_eq!(segs[0].start, 3605.0);
    }
}
