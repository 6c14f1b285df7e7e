//! Stage 9: quote extraction.
//!
//! One LLM call per session, under the same concurrency bound as Stage 8.
//! The prompt carries the editorial policy (filler elision, bracketed
//! clarifications, preserved self-corrections); this module validates what
//! comes back. The model is never trusted on the two hard rules: only
//! participant codes may be quoted, and every timecode must fall inside
//! the session. Violations are dropped, not repaired.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::BristlenoseError;
use crate::llm::LlmClient;
use crate::model::{Quote, QuoteScope, Segment, Sentiment, Session, TopicBoundary};
use crate::speakers::SessionSpeakers;
use crate::timecode::format_timecode;
use crate::transcript_txt::write_transcript;

const QUOTE_PROMPT: &str = include_str!("prompts/quote_extraction.md");

fn response_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "quotes": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "time": { "type": "number" },
                        "speaker_code": { "type": "string" },
                        "text": { "type": "string" },
                        "context": { "type": "string" },
                        "topic_label": { "type": "string" },
                        "scope": {
                            "type": "string",
                            "enum": ["screen_specific", "general_context"]
                        },
                        "sentiment": {
                            "type": ["string", "null"],
                            "enum": [
                                "frustration", "confusion", "doubt", "surprise",
                                "satisfaction", "delight", "confidence", null
                            ]
                        },
                        "intensity": { "type": ["integer", "null"] },
                        "tags": { "type": "array", "items": { "type": "string" } }
                    },
                    "required": ["time", "speaker_code", "text", "topic_label", "scope"]
                }
            }
        },
        "required": ["quotes"]
    })
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    quotes: Vec<QuoteEntry>,
}

#[derive(Debug, Deserialize)]
struct QuoteEntry {
    time: f64,
    speaker_code: String,
    text: String,
    #[serde(default)]
    context: Option<String>,
    topic_label: String,
    scope: String,
    #[serde(default)]
    sentiment: Option<String>,
    #[serde(default)]
    intensity: Option<i64>,
    #[serde(default)]
    tags: Vec<String>,
}

fn parse_sentiment(s: &str) -> Option<Sentiment> {
    match s {
        "frustration" => Some(Sentiment::Frustration),
        "confusion" => Some(Sentiment::Confusion),
        "doubt" => Some(Sentiment::Doubt),
        "surprise" => Some(Sentiment::Surprise),
        "satisfaction" => Some(Sentiment::Satisfaction),
        "delight" => Some(Sentiment::Delight),
        "confidence" => Some(Sentiment::Confidence),
        _ => None,
    }
}

/// Extract quotes for one session.
pub async fn extract_quotes(
    client: &LlmClient,
    session: &Session,
    segments: &[Segment],
    boundaries: &[TopicBoundary],
    identities: &SessionSpeakers,
) -> Result<Vec<Quote>, BristlenoseError> {
    let boundary_lines: Vec<String> = boundaries
        .iter()
        .map(|b| format!("[{}] {}", format_timecode(b.time), b.label))
        .collect();

    let user = format!(
        "Session: {} (duration {:.0}s)\n\nTopic boundaries:\n{}\n\nTranscript:\n{}",
        session.title,
        session.duration_seconds,
        boundary_lines.join("\n"),
        write_transcript(segments)
    );

    let value = client
        .analyse(QUOTE_PROMPT, &user, &response_schema(), 8192)
        .await?;
    let response: QuoteResponse = serde_json::from_value(value)?;

    Ok(post_process(session, identities, response.quotes))
}

/// Validate and order raw model output.
fn post_process(
    session: &Session,
    identities: &SessionSpeakers,
    raw: Vec<QuoteEntry>,
) -> Vec<Quote> {
    let participant_codes: Vec<&str> = identities
        .speakers
        .iter()
        .filter(|s| s.code.starts_with('p'))
        .map(|s| s.code.as_str())
        .collect();

    let duration = session.duration_seconds;
    let mut quotes: Vec<Quote> = raw
        .into_iter()
        .filter(|q| {
            let code_ok = participant_codes.contains(&q.speaker_code.as_str());
            if !code_ok {
                tracing::warn!(
                    session = %session.id,
                    code = %q.speaker_code,
                    "dropping quote attributed to a non-participant"
                );
            }
            code_ok
        })
        .filter(|q| q.time.is_finite() && q.time >= 0.0 && (duration <= 0.0 || q.time <= duration))
        .filter(|q| !q.text.trim().is_empty())
        .map(|q| {
            let sentiment = q.sentiment.as_deref().and_then(parse_sentiment);
            Quote {
                session_id: session.id.clone(),
                speaker_code: q.speaker_code,
                time: q.time,
                text: q.text.trim().to_string(),
                context: q.context.filter(|c| !c.trim().is_empty()),
                topic_label: q.topic_label.trim().to_string(),
                scope: if q.scope == "screen_specific" {
                    QuoteScope::ScreenSpecific
                } else {
                    QuoteScope::GeneralContext
                },
                // Intensity is meaningless without a sentiment
                intensity: sentiment
                    .is_some()
                    .then(|| q.intensity.map(|i| i.clamp(1, 3) as u8))
                    .flatten(),
                sentiment,
                tags: q.tags.into_iter().filter(|t| !t.trim().is_empty()).collect(),
            }
        })
        .collect();

    quotes.sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap_or(std::cmp::Ordering::Equal));
    quotes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Platform, Role};
    use crate::speakers::SpeakerIdentity;

    fn session() -> Session {
        Session {
            id: "s1".into(),
            title: "round one".into(),
            platform: Platform::Generic,
            paths: vec![],
            started_at: None,
            duration_seconds: 600.0,
            has_existing_transcript: true,
        }
    }

    fn identities() -> SessionSpeakers {
        SessionSpeakers {
            session_id: "s1".into(),
            speakers: vec![
                SpeakerIdentity {
                    label: "Sarah".into(),
                    role: Role::Researcher,
                    code: "m1".into(),
                    person_name: Some("Sarah".into()),
                    job_title: None,
                },
                SpeakerIdentity {
                    label: "Priya".into(),
                    role: Role::Participant,
                    code: "p1".into(),
                    person_name: Some("Priya".into()),
                    job_title: None,
                },
            ],
        }
    }

    fn entry(time: f64, code: &str, text: &str) -> QuoteEntry {
        QuoteEntry {
            time,
            speaker_code: code.into(),
            text: text.into(),
            context: None,
            topic_label: "Dashboard".into(),
            scope: "screen_specific".into(),
            sentiment: None,
            intensity: None,
            tags: vec![],
        }
    }

    #[test]
    fn test_researcher_quotes_dropped() {
        let out = post_process(
            &session(),
            &identities(),
            vec![
                entry(10.0, "m1", "tell me more about that"),
                entry(20.0, "p1", "the button was … hidden"),
            ],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].speaker_code, "p1");
    }

    #[test]
    fn test_unknown_code_dropped() {
        let out = post_process(&session(), &identities(), vec![entry(10.0, "p9", "hi")]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_out_of_duration_dropped() {
        let out = post_process(
            &session(),
            &identities(),
            vec![entry(599.0, "p1", "fine"), entry(900.0, "p1", "too late")],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].time, 599.0);
    }

    #[test]
    fn test_output_in_transcript_order() {
        let out = post_process(
            &session(),
            &identities(),
            vec![entry(300.0, "p1", "later"), entry(30.0, "p1", "earlier")],
        );
        assert_eq!(out[0].text, "earlier");
        assert_eq!(out[1].text, "later");
    }

    #[test]
    fn test_sentiment_and_intensity() {
        let mut e = entry(10.0, "p1", "this is infuriating");
        e.sentiment = Some("frustration".into());
        e.intensity = Some(7);
        let out = post_process(&session(), &identities(), vec![e]);
        assert_eq!(out[0].sentiment, Some(Sentiment::Frustration));
        // Clamped into 1..=3
        assert_eq!(out[0].intensity, Some(3));
    }

    #[test]
    fn test_intensity_dropped_without_sentiment() {
        let mut e = entry(10.0, "p1", "it has three tabs");
        e.intensity = Some(2);
        let out = post_process(&session(), &identities(), vec![e]);
        assert_eq!(out[0].sentiment, None);
        assert_eq!(out[0].intensity, None);
    }

    #[test]
    fn test_unknown_sentiment_becomes_none() {
        let mut e = entry(10.0, "p1", "hmm");
        e.sentiment = Some("ambivalence".into());
        let out = post_process(&session(), &identities(), vec![e]);
        assert_eq!(out[0].sentiment, None);
    }

    #[test]
    fn test_scope_mapping() {
        let mut e = entry(10.0, "p1", "generally I avoid dashboards");
        e.scope = "general_context".into();
        let out = post_process(&session(), &identities(), vec![e]);
        assert_eq!(out[0].scope, QuoteScope::GeneralContext);
    }
}
