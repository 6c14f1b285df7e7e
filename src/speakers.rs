//! Stage 5b: speaker identification.
//!
//! # Architecture overview
//!
//! Three steps turn raw diarisation labels into stable project codes:
//!
//! 1. **Heuristics** (synchronous, all sessions) — a single-speaker
//!    session is a participant; labels matching the generic patterns
//!    ("Speaker 2", "SPEAKER_00", "Unknown") carry no identity; anything
//!    else is treated as a real name and is never overwritten.
//! 2. **LLM refinement** (per session, bounded concurrency) — the model
//!    sees the first five minutes of transcript plus the label list and
//!    returns a role for each label, with a name and job title when the
//!    speaker introduces themselves or is addressed. A failed call falls
//!    back to the heuristic result; it never aborts the session.
//! 3. **Code assignment** (sequential, session-ID order) — researchers
//!    get `m1, m2, …` and observers `o1, o2, …` within their session;
//!    participants draw from a single project-wide counter so `p` numbers
//!    are globally unique and monotonically increasing. The people
//!    registry seeds that counter, which is what keeps codes stable when
//!    the input folder gains or loses sessions between runs.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::BristlenoseError;
use crate::llm::LlmClient;
use crate::model::{Role, Segment, Session};
use crate::people::SpeakerFacts;
use crate::timecode::format_timecode;

const SPEAKER_PROMPT: &str = include_str!("prompts/speaker_roles.md");

/// How much transcript the LLM sees: enough for introductions, cheap on
/// tokens.
const REFINEMENT_WINDOW_SECS: f64 = 300.0;

static GENERIC_LABEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(speaker[ _]?[0-9]+|speaker [a-z]|speaker_[0-9]+|unknown( speaker)?[0-9]*|guest[0-9]*)$")
        .unwrap()
});

/// True for labels that carry no identity (diariser placeholders).
pub fn is_generic_label(label: &str) -> bool {
    GENERIC_LABEL_RE.is_match(label.trim())
}

/// One resolved speaker within a session.
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
pub struct SpeakerIdentity {
    pub label: String,
    pub role: Role,
    /// Assigned in `assign_codes`; empty until then.
    #[serde(default)]
    pub code: String,
    pub person_name: Option<String>,
    pub job_title: Option<String>,
}

/// All speakers of one session, in order of first appearance.
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
pub struct SessionSpeakers {
    pub session_id: String,
    pub speakers: Vec<SpeakerIdentity>,
}

impl SessionSpeakers {
    pub fn code_for(&self, label: &str) -> Option<&str> {
        self.speakers
            .iter()
            .find(|s| s.label == label)
            .map(|s| s.code.as_str())
    }

    pub fn role_for(&self, label: &str) -> Option<Role> {
        self.speakers.iter().find(|s| s.label == label).map(|s| s.role)
    }
}

/// Heuristic pre-classification over one session's segments.
pub fn heuristic_identities(session_id: &str, segments: &[Segment]) -> SessionSpeakers {
    let mut labels: Vec<String> = Vec::new();
    for seg in segments {
        if !labels.contains(&seg.speaker_label) {
            labels.push(seg.speaker_label.clone());
        }
    }

    let single_speaker = labels.len() == 1;
    let speakers = labels
        .into_iter()
        .map(|label| {
            let generic = is_generic_label(&label);
            let role = if single_speaker {
                Role::Participant
            } else {
                Role::Unknown
            };
            SpeakerIdentity {
                person_name: (!generic).then(|| label.clone()),
                label,
                role,
                code: String::new(),
                job_title: None,
            }
        })
        .collect();

    SessionSpeakers {
        session_id: session_id.to_string(),
        speakers,
    }
}

fn response_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "speakers": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "label": { "type": "string" },
                        "role": {
                            "type": "string",
                            "enum": ["researcher", "participant", "observer", "unknown"]
                        },
                        "person_name": { "type": "string" },
                        "job_title": { "type": "string" }
                    },
                    "required": ["label", "role"]
                }
            }
        },
        "required": ["speakers"]
    })
}

#[derive(Debug, Deserialize)]
struct RoleResponse {
    speakers: Vec<RoleEntry>,
}

#[derive(Debug, Deserialize)]
struct RoleEntry {
    label: String,
    role: String,
    #[serde(default)]
    person_name: Option<String>,
    #[serde(default)]
    job_title: Option<String>,
}

fn parse_role(s: &str) -> Role {
    match s.to_ascii_lowercase().as_str() {
        "researcher" | "moderator" | "interviewer" => Role::Researcher,
        "participant" => Role::Participant,
        "observer" => Role::Observer,
        _ => Role::Unknown,
    }
}

/// Build the transcript excerpt the model classifies from.
fn excerpt(segments: &[Segment]) -> String {
    let mut out = String::new();
    for seg in segments.iter().filter(|s| s.start < REFINEMENT_WINDOW_SECS) {
        out.push_str(&format!(
            "[{}] {}: {}\n",
            format_timecode(seg.start),
            seg.speaker_label,
            seg.text
        ));
    }
    out
}

/// Refine one session's identities through the LLM.
///
/// Returns the heuristic result enriched with roles, names, and titles.
/// Heuristic real names win over model output; model names only fill
/// labels that had none.
pub async fn identify_speakers(
    client: &LlmClient,
    session: &Session,
    segments: &[Segment],
) -> Result<SessionSpeakers, BristlenoseError> {
    let mut identities = heuristic_identities(&session.id, segments);
    if identities.speakers.is_empty() {
        return Ok(identities);
    }

    let labels: Vec<&str> = identities.speakers.iter().map(|s| s.label.as_str()).collect();
    let user = format!(
        "Session: {}\nSpeaker labels: {}\n\nTranscript (first five minutes):\n{}",
        session.title,
        labels.join(", "),
        excerpt(segments)
    );

    let value = client
        .analyse(SPEAKER_PROMPT, &user, &response_schema(), 2048)
        .await?;
    let response: RoleResponse = serde_json::from_value(value)?;

    for entry in response.speakers {
        let Some(identity) = identities
            .speakers
            .iter_mut()
            .find(|s| s.label == entry.label)
        else {
            // The model invented a label; ignore it.
            continue;
        };
        let role = parse_role(&entry.role);
        if role != Role::Unknown {
            identity.role = role;
        }
        if identity.person_name.is_none() {
            identity.person_name = entry
                .person_name
                .filter(|n| !n.trim().is_empty() && !is_generic_label(n));
        }
        if identity.job_title.is_none() {
            identity.job_title = entry.job_title.filter(|t| !t.trim().is_empty());
        }
    }

    // A session where nothing resolved to researcher keeps the heuristic
    // single-speaker rule; everything still Unknown becomes participant at
    // code-assignment time via the prefix rule.
    Ok(identities)
}

fn code_number(code: &str, prefix: char) -> Option<u32> {
    code.strip_prefix(prefix).and_then(|n| n.parse().ok())
}

/// Assign codes across all sessions, in session-ID order.
///
/// `next_participant` is the first free global `p` number (registry max +
/// 1). Speakers that already carry a code — reloaded from a previous
/// run's intermediate state — keep it untouched; codes are immutable for
/// the life of the project, and numbering continues above anything
/// already taken. Returns the next free participant number.
pub fn assign_codes(per_session: &mut [SessionSpeakers], mut next_participant: u32) -> u32 {
    // Numbers already in use anywhere must never be reissued.
    for session in per_session.iter() {
        for speaker in &session.speakers {
            if let Some(n) = code_number(&speaker.code, 'p') {
                next_participant = next_participant.max(n + 1);
            }
        }
    }

    for session in per_session.iter_mut() {
        let mut next_m = 1u32;
        let mut next_o = 1u32;
        for speaker in &session.speakers {
            if let Some(n) = code_number(&speaker.code, 'm') {
                next_m = next_m.max(n + 1);
            }
            if let Some(n) = code_number(&speaker.code, 'o') {
                next_o = next_o.max(n + 1);
            }
        }
        for speaker in &mut session.speakers {
            if !speaker.code.is_empty() {
                continue;
            }
            speaker.code = match speaker.role.code_prefix() {
                'm' => {
                    let code = format!("m{next_m}");
                    next_m += 1;
                    code
                }
                'o' => {
                    let code = format!("o{next_o}");
                    next_o += 1;
                    code
                }
                _ => {
                    let code = format!("p{next_participant}");
                    next_participant += 1;
                    code
                }
            };
        }
    }
    next_participant
}

/// Stamp resolved codes and roles onto a session's segments.
pub fn resolve_segments(segments: &mut [Segment], identities: &SessionSpeakers) {
    for seg in segments.iter_mut() {
        if let Some(speaker) = identities
            .speakers
            .iter()
            .find(|s| s.label == seg.speaker_label)
        {
            seg.speaker_code = Some(speaker.code.clone());
            seg.role = Some(speaker.role);
        }
    }
}

/// Aggregate per-speaker tallies for the people registry.
pub fn speaker_facts(identities: &SessionSpeakers, segments: &[Segment]) -> Vec<SpeakerFacts> {
    identities
        .speakers
        .iter()
        .map(|speaker| {
            let (words, seconds) = segments
                .iter()
                .filter(|s| s.speaker_label == speaker.label)
                .fold((0u64, 0f64), |(w, t), s| {
                    (w + s.word_count() as u64, t + s.duration())
                });
            SpeakerFacts {
                code: speaker.code.clone(),
                session_id: identities.session_id.clone(),
                role: speaker.role,
                words,
                speaking_seconds: seconds,
                person_name: speaker.person_name.clone(),
                job_title: speaker.job_title.clone(),
            }
        })
        .collect()
}
