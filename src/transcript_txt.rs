//! On-disk transcript text format.
//!
//! One block per segment: a timecode in square brackets, a speaker code in
//! square brackets, then the text.
//!
//! ```text
//! [00:16] [p1] So tell me about your experience…
//! [00:24] [m1] What happened when you opened the dashboard?
//! ```
//!
//! Codes, never names, appear on disk — the people registry maps codes
//! back to names for rendering. The parser is deliberately looser than the
//! writer: it lowercases codes, tolerates extra whitespace, and accepts
//! both `MM:SS` and `HH:MM:SS` timecodes, because researchers hand-edit
//! these files.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::BristlenoseError;
use crate::model::{Segment, Session};
use crate::timecode::{format_timecode, parse_timecode};

static LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\[\s*(?P<tc>\d{1,2}:\d{2}(?::\d{2})?)\s*\]\s*\[\s*(?P<code>[MmPpOo]\d+)\s*\]\s*(?P<text>.*\S)\s*$")
        .unwrap()
});

/// Render segments in the block format.
pub fn write_transcript(segments: &[Segment]) -> String {
    let mut out = String::new();
    for seg in segments {
        let code = seg.speaker_code.as_deref().unwrap_or("p0");
        out.push_str(&format!(
            "[{}] [{}] {}\n",
            format_timecode(seg.start),
            code,
            seg.text
        ));
    }
    out
}

/// Render the markdown mirror: the same blocks under a session heading.
pub fn write_markdown(session: &Session, segments: &[Segment]) -> String {
    let mut out = format!("# {}\n\n", session.title);
    if let Some(started) = session.started_at {
        out.push_str(&format!("_{}_\n\n", started.format("%Y-%m-%d %H:%M")));
    }
    for seg in segments {
        let code = seg.speaker_code.as_deref().unwrap_or("p0");
        out.push_str(&format!(
            "`[{}]` **{}** {}\n\n",
            format_timecode(seg.start),
            code,
            seg.text
        ));
    }
    out
}

/// A parsed transcript line: timecode, lowercased code, text.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptLine {
    pub time: f64,
    pub code: String,
    pub text: String,
}

/// Parse transcript text back into lines.
///
/// Lines that do not match the block shape are skipped rather than
/// erroring — hand-edited files accumulate blank lines and notes.
pub fn parse_transcript(content: &str) -> Vec<TranscriptLine> {
    content
        .lines()
        .filter_map(|line| {
            let caps = LINE_RE.captures(line)?;
            let time = parse_timecode(&caps["tc"])?;
            Some(TranscriptLine {
                time,
                code: caps["code"].to_lowercase(),
                text: caps["text"].to_string(),
            })
        })
        .collect()
}

/// Write both the `.txt` and `.md` forms for one session.
pub fn write_session_files(
    dir: &Path,
    session: &Session,
    segments: &[Segment],
) -> Result<(), BristlenoseError> {
    std::fs::create_dir_all(dir)?;
    let stem = session.id.clone();
    std::fs::write(dir.join(format!("{stem}.txt")), write_transcript(segments))?;
    std::fs::write(
        dir.join(format!("{stem}.md")),
        write_markdown(session, segments),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Platform, Role};

    fn seg(start: f64, code: &str, text: &str) -> Segment {
        Segment {
            session_id: "s1".into(),
            start,
            end: start + 2.0,
            text: text.into(),
            speaker_label: "X".into(),
            speaker_code: Some(code.into()),
            role: Some(Role::Participant),
            words: vec![],
        }
    }

    #[test]
    fn test_write_format() {
        let out = write_transcript(&[seg(16.0, "p1", "So tell me about your experience")]);
        assert_eq!(out, "[00:16] [p1] So tell me about your experience\n");
    }

    #[test]
    fn test_write_mixes_timecode_forms_across_hour() {
        let out = write_transcript(&[
            seg(3599.0, "p1", "before"),
            seg(3601.0, "p1", "after"),
        ]);
        assert!(out.contains("[59:59]"));
        assert!(out.contains("[01:00:01]"));
    }

    #[test]
    fn test_parse_roundtrip() {
        let segments = vec![
            seg(16.0, "p1", "So tell me about your experience"),
            seg(24.0, "m1", "What happened next?"),
            seg(3725.0, "p1", "Past the hour"),
        ];
        let text = write_transcript(&segments);
        let lines = parse_transcript(&text);
        assert_eq!(lines.len(), 3);
        for (line, seg) in lines.iter().zip(&segments) {
            assert_eq!(line.time, seg.start.trunc());
            assert_eq!(Some(line.code.as_str()), seg.speaker_code.as_deref());
            assert_eq!(line.text, seg.text);
        }
    }

    #[test]
    fn test_parse_tolerates_case_and_whitespace() {
        let lines = parse_transcript("  [ 00:16 ]  [ P1 ]   spaced out text  \n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].code, "p1");
        assert_eq!(lines[0].text, "spaced out text");
    }

    #[test]
    fn test_parse_skips_non_block_lines() {
        let content = "# my notes\n\n[00:16] [p1] real line\nstray text\n";
        let lines = parse_transcript(content);
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn test_markdown_has_heading() {
        let session = Session {
            id: "s1".into(),
            title: "Weekly research sync".into(),
            platform: Platform::Teams,
            paths: vec![],
            started_at: None,
            duration_seconds: 0.0,
            has_existing_transcript: true,
        };
        let md = write_markdown(&session, &[seg(16.0, "p1", "hello")]);
        assert!(md.starts_with("# Weekly research sync\n"));
        assert!(md.contains("`[00:16]` **p1** hello"));
    }
}
