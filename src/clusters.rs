//! Stage 10: cross-session screen clustering.
//!
//! One LLM call over every screen-specific quote in the project. Quotes
//! are serialised compactly — one pipe-delimited line each, no whitespace
//! padding — because this call's input grows with the whole project and
//! input tokens are the cost driver.
//!
//! The model returns clusters referencing quotes by index; this module
//! rebuilds full `ScreenCluster` values and enforces the partition
//! property: every quote lands in exactly one cluster. Duplicates keep
//! their first assignment, and quotes the model skipped are gathered into
//! a trailing "Unsorted" cluster rather than silently vanishing.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::BristlenoseError;
use crate::llm::LlmClient;
use crate::model::{Quote, ScreenCluster};
use crate::timecode::format_timecode;

const CLUSTER_PROMPT: &str = include_str!("prompts/screen_clusters.md");

/// Serialise quotes as `id|session|speaker|timecode|topic|text` lines.
pub(crate) fn compact_quote_lines(quotes: &[Quote]) -> String {
    quotes
        .iter()
        .enumerate()
        .map(|(i, q)| {
            format!(
                "{i}|{}|{}|{}|{}|{}",
                q.session_id,
                q.speaker_code,
                format_timecode(q.time),
                q.topic_label,
                q.text.replace('\n', " ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn response_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "clusters": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "label": { "type": "string" },
                        "subtitle": { "type": "string" },
                        "quote_ids": {
                            "type": "array",
                            "items": { "type": "integer" }
                        }
                    },
                    "required": ["label", "subtitle", "quote_ids"]
                }
            }
        },
        "required": ["clusters"]
    })
}

#[derive(Debug, Deserialize)]
struct ClusterResponse {
    clusters: Vec<ClusterEntry>,
}

#[derive(Debug, Deserialize)]
struct ClusterEntry {
    label: String,
    subtitle: String,
    quote_ids: Vec<usize>,
}

/// Cluster all screen-specific quotes across sessions.
pub async fn cluster_screens(
    client: &LlmClient,
    quotes: &[Quote],
) -> Result<Vec<ScreenCluster>, BristlenoseError> {
    if quotes.is_empty() {
        return Ok(vec![]);
    }

    let user = format!(
        "Each line is one quote: id|session|speaker|timecode|topic|text\n\n{}",
        compact_quote_lines(quotes)
    );
    let value = client
        .analyse(CLUSTER_PROMPT, &user, &response_schema(), 8192)
        .await?;
    let response: ClusterResponse = serde_json::from_value(value)?;

    Ok(build_clusters(quotes, response.clusters))
}

fn build_clusters(quotes: &[Quote], entries: Vec<ClusterEntry>) -> Vec<ScreenCluster> {
    let mut assigned = vec![false; quotes.len()];
    let mut clusters: Vec<ScreenCluster> = Vec::new();

    for entry in entries {
        let mut members = Vec::new();
        for id in entry.quote_ids {
            if let Some(flag) = assigned.get_mut(id) {
                if !*flag {
                    *flag = true;
                    members.push(quotes[id].clone());
                }
            }
        }
        if !members.is_empty() {
            clusters.push(ScreenCluster {
                label: entry.label.trim().to_string(),
                subtitle: entry.subtitle.trim().to_string(),
                position: clusters.len() as u32,
                quotes: members,
            });
        }
    }

    let leftovers: Vec<Quote> = assigned
        .iter()
        .enumerate()
        .filter(|(_, &done)| !done)
        .map(|(i, _)| quotes[i].clone())
        .collect();
    if !leftovers.is_empty() {
        tracing::warn!(count = leftovers.len(), "quotes left unclustered by the model");
        clusters.push(ScreenCluster {
            label: "Unsorted".to_string(),
            subtitle: "Quotes the model did not place".to_string(),
            position: clusters.len() as u32,
            quotes: leftovers,
        });
    }

    clusters
}
