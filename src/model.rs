//! Core data model for the bristlenose analysis pipeline.
//!
//! # Architecture overview
//!
//! Bristlenose turns a folder of interview artefacts from four meeting
//! platforms (plus generic recordings) into quotes, themes, and transcripts.
//! Every stage communicates through the types in this module — parsers and
//! the transcriber normalise into `Segment`, the LLM stages produce
//! `TopicBoundary`, `Quote`, `ScreenCluster` and `Theme`, and the
//! orchestrator persists all of them as intermediate JSON.
//!
//! ```text
//! Input files → Session grouping → Segments → Quotes → Clusters / Themes
//! ```
//!
//! # Design philosophy
//!
//! Each platform names and lays out its files differently. Rather than
//! letting later stages know about platform quirks, Stage 1 normalises
//! everything into `Session` records and downstream code never re-inspects
//! raw filenames. The same applies to speakers: raw labels from diarisation
//! or documents are resolved once into stable codes, and everything after
//! Stage 5b speaks in codes.
//!
//! # TRADE-OFFS
//!
//! - `Segment` carries its per-word timing inline. Word lists dominate the
//!   working set, so they are pruned after the merge stage rather than
//!   modelled as a separate table; `#[serde(default)]` keeps pruned JSON
//!   readable back in.
//! - Timecodes are `f64` seconds rather than a newtype. The pipeline does
//!   no arithmetic subtle enough to warrant the wrapper, and serde output
//!   stays plainly readable in the intermediate files.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Meeting platform detected during session grouping.
///
/// WHY: The platform decides which filename decorations Stage 1 strips and
/// is reported in status output; nothing downstream branches on it, so an
/// enum with no payload is enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Teams,
    ZoomCloud,
    ZoomLocal,
    GoogleMeet,
    Generic,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Teams => write!(f, "teams"),
            Platform::ZoomCloud => write!(f, "zoom-cloud"),
            Platform::ZoomLocal => write!(f, "zoom-local"),
            Platform::GoogleMeet => write!(f, "google-meet"),
            Platform::Generic => write!(f, "generic"),
        }
    }
}

/// One recorded interview: a coherent group of source files.
///
/// Sessions receive IDs `s1, s2, …` in the order they first appear in the
/// input directory. A file belongs to exactly one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Human-readable title derived from the cleaned stem or folder topic.
    pub title: String,
    pub platform: Platform,
    /// Source files owned by this session (media and/or transcripts).
    pub paths: Vec<PathBuf>,
    /// Recording start, when the platform encodes it in a name.
    pub started_at: Option<DateTime<Utc>>,
    /// Filled in once segments exist; 0.0 until then.
    #[serde(default)]
    pub duration_seconds: f64,
    /// True when a member VTT/SRT/DOCX parses successfully, which skips
    /// both audio extraction and transcription for the session.
    pub has_existing_transcript: bool,
}

impl Session {
    /// Member paths with a media extension (candidates for extraction).
    pub fn media_paths(&self) -> Vec<&PathBuf> {
        self.paths
            .iter()
            .filter(|p| is_media_ext(p))
            .collect()
    }

    /// Member paths with a transcript extension (VTT/SRT/DOCX).
    pub fn transcript_paths(&self) -> Vec<&PathBuf> {
        self.paths
            .iter()
            .filter(|p| is_transcript_ext(p))
            .collect()
    }
}

/// Audio and video extensions accepted from the input directory.
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "wav", "mp3", "m4a", "flac", "ogg", "wma", "aac", "mp4", "mov", "avi", "mkv", "webm",
];

/// Transcript-document extensions accepted from the input directory.
pub const TRANSCRIPT_EXTENSIONS: &[&str] = &["srt", "vtt", "docx"];

pub fn is_media_ext(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| MEDIA_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

pub fn is_transcript_ext(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| TRANSCRIPT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Role a speaker plays in an interview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Researcher,
    Participant,
    Observer,
    Unknown,
}

impl Role {
    /// The code prefix for this role: `m` researcher, `p` participant,
    /// `o` observer. Unknown speakers are coded as participants so their
    /// words are never silently dropped from analysis.
    pub fn code_prefix(&self) -> char {
        match self {
            Role::Researcher => 'm',
            Role::Participant | Role::Unknown => 'p',
            Role::Observer => 'o',
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Researcher => write!(f, "researcher"),
            Role::Participant => write!(f, "participant"),
            Role::Observer => write!(f, "observer"),
            Role::Unknown => write!(f, "unknown"),
        }
    }
}

/// Per-word timing inside a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

/// One contiguous utterance by one labelled speaker.
///
/// Invariants: `start < end`; segments within a session are sorted by
/// `start`. The grouping stage stamps `session_id`; Stage 5b resolves
/// `speaker_code` and `role`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub session_id: String,
    pub start: f64,
    pub end: f64,
    pub text: String,
    /// Raw label from diarisation or the source document.
    pub speaker_label: String,
    /// Stable project code (`m1`/`p3`/`o1`); `None` before Stage 5b.
    #[serde(default)]
    pub speaker_code: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    /// Word timings from the transcriber; pruned after the merge stage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<WordTiming>,
}

impl Segment {
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

/// Kind of transition a topic boundary marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    ScreenChange,
    TopicShift,
    TaskChange,
    GeneralContext,
}

/// A transition marker inside a session.
///
/// Every session's boundary list begins with a boundary at time 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicBoundary {
    pub session_id: String,
    pub time: f64,
    /// Short label, 2–8 words.
    pub label: String,
    pub kind: TransitionKind,
    /// Model confidence in [0, 1].
    pub confidence: f64,
}

/// Sentiment classification for a quote. Purely descriptive quotes carry
/// no sentiment at all (`Option<Sentiment>` is `None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Frustration,
    Confusion,
    Doubt,
    Surprise,
    Satisfaction,
    Delight,
    Confidence,
}

/// Whether a quote is about a specific screen or general context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteScope {
    ScreenSpecific,
    GeneralContext,
}

/// A verbatim participant utterance selected as evidence.
///
/// Produced only from participant segments — the editorial policy never
/// quotes the researcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub session_id: String,
    pub speaker_code: String,
    pub time: f64,
    /// Quoted text after editorial cleanup (filler elided, clarifications
    /// bracketed).
    pub text: String,
    /// Optional researcher-question context preceding the quote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Topic label the quote was emitted under (Stage 8 boundary label).
    pub topic_label: String,
    pub scope: QuoteScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<Sentiment>,
    /// 1 (mild) to 3 (strong); `None` when sentiment is `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Cross-session normalised grouping of screen-specific quotes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenCluster {
    /// Canonical label, 2–4 words.
    pub label: String,
    pub subtitle: String,
    /// Position in the logical product flow (0-based).
    pub position: u32,
    pub quotes: Vec<Quote>,
}

/// Cross-participant pattern over general-context quotes.
///
/// Each general-context quote belongs to exactly one theme.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Theme {
    pub label: String,
    /// Punchy subtitle, under fifteen words.
    pub subtitle: String,
    pub quotes: Vec<Quote>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_platform_display() {
        assert_eq!(Platform::Teams.to_string(), "teams");
        assert_eq!(Platform::ZoomCloud.to_string(), "zoom-cloud");
        assert_eq!(Platform::GoogleMeet.to_string(), "google-meet");
    }

    #[test]
    fn test_role_code_prefix() {
        assert_eq!(Role::Researcher.code_prefix(), 'm');
        assert_eq!(Role::Participant.code_prefix(), 'p');
        assert_eq!(Role::Observer.code_prefix(), 'o');
        assert_eq!(Role::Unknown.code_prefix(), 'p');
    }

    #[test]
    fn test_media_and_transcript_ext() {
        assert!(is_media_ext(Path::new("a/session.MP4")));
        assert!(is_media_ext(Path::new("take.wav")));
        assert!(!is_media_ext(Path::new("notes.docx")));
        assert!(is_transcript_ext(Path::new("notes.docx")));
        assert!(is_transcript_ext(Path::new("caps.VTT")));
        assert!(!is_transcript_ext(Path::new("take.wav")));
        assert!(!is_transcript_ext(Path::new("README")));
    }

    #[test]
    fn test_session_path_partition() {
        let session = Session {
            id: "s1".into(),
            title: "usability round 1".into(),
            platform: Platform::Generic,
            paths: vec![PathBuf::from("p2.mp4"), PathBuf::from("p2.vtt")],
            started_at: None,
            duration_seconds: 0.0,
            has_existing_transcript: true,
        };
        assert_eq!(session.media_paths().len(), 1);
        assert_eq!(session.transcript_paths().len(), 1);
    }

    #[test]
    fn test_segment_word_count_and_duration() {
        let seg = Segment {
            session_id: "s1".into(),
            start: 1.0,
            end: 3.5,
            text: "well I think so".into(),
            speaker_label: "Speaker 1".into(),
            speaker_code: None,
            role: None,
            words: vec![],
        };
        assert_eq!(seg.word_count(), 4);
        assert!((seg.duration() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_segment_serde_skips_empty_words() {
        let seg = Segment {
            session_id: "s1".into(),
            start: 0.0,
            end: 1.0,
            text: "hi".into(),
            speaker_label: "A".into(),
            speaker_code: Some("p1".into()),
            role: Some(Role::Participant),
            words: vec![],
        };
        let json = serde_json::to_string(&seg).unwrap();
        assert!(!json.contains("words"));
        let parsed: Segment = serde_json::from_str(&json).unwrap();
        assert!(parsed.words.is_empty());
        assert_eq!(parsed.speaker_code.as_deref(), Some("p1"));
    }

    #[test]
    fn test_sentiment_serde() {
        let json = serde_json::to_string(&Sentiment::Frustration).unwrap();
        assert_eq!(json, "\"frustration\"");
        let parsed: Sentiment = serde_json::from_str("\"delight\"").unwrap();
        assert_eq!(parsed, Sentiment::Delight);
    }

    #[test]
    fn test_quote_scope_serde() {
        assert_eq!(
            serde_json::to_string(&QuoteScope::ScreenSpecific).unwrap(),
            "\"screen_specific\""
        );
        assert_eq!(
            serde_json::to_string(&QuoteScope::GeneralContext).unwrap(),
            "\"general_context\""
        );
    }
}
