//! Stage 8: topic segmentation.
//!
//! One LLM call per session, bounded by the orchestrator's per-stage
//! semaphore. The model sees the coded transcript and returns transition
//! markers; this module then enforces the boundary invariants the rest of
//! the pipeline relies on: the list is sorted, every time lies within the
//! session, and there is always a boundary at time 0.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::BristlenoseError;
use crate::llm::LlmClient;
use crate::model::{Segment, Session, TopicBoundary, TransitionKind};
use crate::transcript_txt::write_transcript;

const TOPIC_PROMPT: &str = include_str!("prompts/topic_boundaries.md");

fn response_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "boundaries": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "time": { "type": "number" },
                        "label": { "type": "string" },
                        "kind": {
                            "type": "string",
                            "enum": ["screen_change", "topic_shift", "task_change", "general_context"]
                        },
                        "confidence": { "type": "number" }
                    },
                    "required": ["time", "label", "kind"]
                }
            }
        },
        "required": ["boundaries"]
    })
}

#[derive(Debug, Deserialize)]
struct BoundaryResponse {
    boundaries: Vec<BoundaryEntry>,
}

#[derive(Debug, Deserialize)]
struct BoundaryEntry {
    time: f64,
    label: String,
    kind: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

fn parse_kind(s: &str) -> TransitionKind {
    match s {
        "screen_change" => TransitionKind::ScreenChange,
        "topic_shift" => TransitionKind::TopicShift,
        "task_change" => TransitionKind::TaskChange,
        _ => TransitionKind::GeneralContext,
    }
}

/// The single implicit boundary used when Stage 8 failed for a session:
/// Stage 9 still runs, scoped to the whole session.
pub fn fallback_boundary(session_id: &str) -> TopicBoundary {
    TopicBoundary {
        session_id: session_id.to_string(),
        time: 0.0,
        label: "Session".to_string(),
        kind: TransitionKind::GeneralContext,
        confidence: 0.0,
    }
}

/// Detect topic boundaries for one session.
pub async fn segment_topics(
    client: &LlmClient,
    session: &Session,
    segments: &[Segment],
) -> Result<Vec<TopicBoundary>, BristlenoseError> {
    let user = format!(
        "Session: {} (duration {:.0}s)\n\nTranscript:\n{}",
        session.title,
        session.duration_seconds,
        write_transcript(segments)
    );

    let value = client
        .analyse(TOPIC_PROMPT, &user, &response_schema(), 4096)
        .await?;
    let response: BoundaryResponse = serde_json::from_value(value)?;

    Ok(post_process(
        &session.id,
        session.duration_seconds,
        response.boundaries,
    ))
}

/// Enforce the boundary invariants on raw model output.
fn post_process(session_id: &str, duration: f64, raw: Vec<BoundaryEntry>) -> Vec<TopicBoundary> {
    let mut boundaries: Vec<TopicBoundary> = raw
        .into_iter()
        .filter(|b| b.time.is_finite() && b.time >= 0.0 && (duration <= 0.0 || b.time <= duration))
        .map(|b| TopicBoundary {
            session_id: session_id.to_string(),
            time: b.time,
            label: b.label.trim().to_string(),
            kind: parse_kind(&b.kind),
            confidence: b.confidence.clamp(0.0, 1.0),
        })
        .filter(|b| !b.label.is_empty())
        .collect();

    boundaries.sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap_or(std::cmp::Ordering::Equal));

    if boundaries.first().is_none_or(|b| b.time > 0.0) {
        boundaries.insert(0, fallback_boundary(session_id));
    }

    boundaries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(time: f64, label: &str, kind: &str) -> BoundaryEntry {
        BoundaryEntry {
            time,
            label: label.into(),
            kind: kind.into(),
            confidence: 0.8,
        }
    }

    #[test]
    fn test_post_process_sorts_and_keeps_zero() {
        let out = post_process(
            "s1",
            600.0,
            vec![
                entry(120.0, "Checkout flow", "screen_change"),
                entry(0.0, "Warm-up", "general_context"),
                entry(60.0, "Dashboard", "screen_change"),
            ],
        );
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].time, 0.0);
        assert_eq!(out[1].label, "Dashboard");
        assert_eq!(out[2].label, "Checkout flow");
    }

    #[test]
    fn test_post_process_inserts_missing_zero_boundary() {
        let out = post_process("s1", 600.0, vec![entry(45.0, "First task", "task_change")]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].time, 0.0);
        assert_eq!(out[0].kind, TransitionKind::GeneralContext);
    }

    #[test]
    fn test_post_process_empty_response_yields_zero_boundary() {
        let out = post_process("s1", 600.0, vec![]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].time, 0.0);
    }

    #[test]
    fn test_post_process_clamps_out_of_range() {
        let out = post_process(
            "s1",
            300.0,
            vec![
                entry(0.0, "Intro", "general_context"),
                entry(900.0, "Beyond the end", "topic_shift"),
                entry(-5.0, "Before the start", "topic_shift"),
                entry(f64::NAN, "Not a time", "topic_shift"),
            ],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].label, "Intro");
    }

    #[test]
    fn test_post_process_confidence_clamped() {
        let mut e = entry(0.0, "Intro", "general_context");
        e.confidence = 7.5;
        let out = post_process("s1", 100.0, vec![e]);
        assert_eq!(out[0].confidence, 1.0);
    }

    #[test]
    fn test_unknown_kind_falls_back_to_general_context() {
        let out = post_process("s1", 100.0, vec![entry(0.0, "Intro", "banana")]);
        assert_eq!(out[0].kind, TransitionKind::GeneralContext);
    }

    #[test]
    fn test_fallback_boundary_shape() {
        let b = fallback_boundary("s3");
        assert_eq!(b.session_id, "s3");
        assert_eq!(b.time, 0.0);
    }
}
