//! Stage 11: thematic grouping.
//!
//! The general-context twin of Stage 10: one LLM call over every
//! general-context quote, producing cross-participant themes. Runs
//! concurrently with screen clustering because the two consume disjoint
//! subsets of Stage 9's output.
//!
//! The same partition rule applies — each quote ends up in exactly one
//! theme, with first-assignment-wins for duplicates and a trailing
//! "Unthemed" group for anything the model skipped.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::clusters::compact_quote_lines;
use crate::error::BristlenoseError;
use crate::llm::LlmClient;
use crate::model::{Quote, Theme};

const THEME_PROMPT: &str = include_str!("prompts/themes.md");

fn response_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "themes": {
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
        "required": ["themes"]
    })
}

#[derive(Debug, Deserialize)]
struct ThemeResponse {
    themes: Vec<ThemeEntry>,
}

#[derive(Debug, Deserialize)]
struct ThemeEntry {
    label: String,
    subtitle: String,
    quote_ids: Vec<usize>,
}

/// Group all general-context quotes into themes.
pub async fn group_themes(
    client: &LlmClient,
    quotes: &[Quote],
) -> Result<Vec<Theme>, BristlenoseError> {
    if quotes.is_empty() {
        return Ok(vec![]);
    }

    let user = format!(
        "Each line is one quote: id|session|speaker|timecode|topic|text\n\n{}",
        compact_quote_lines(quotes)
    );
    let value = client
        .analyse(THEME_PROMPT, &user, &response_schema(), 8192)
        .await?;
    let response: ThemeResponse = serde_json::from_value(value)?;

    Ok(build_themes(quotes, response.themes))
}

fn build_themes(quotes: &[Quote], entries: Vec<ThemeEntry>) -> Vec<Theme> {
    let mut assigned = vec![false; quotes.len()];
    let mut themes: Vec<Theme> = Vec::new();

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
            themes.push(Theme {
                label: entry.label.trim().to_string(),
                subtitle: entry.subtitle.trim().to_string(),
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
        tracing::warn!(count = leftovers.len(), "quotes left unthemed by the model");
        themes.push(Theme {
            label: "Unthemed".to_string(),
            subtitle: "Quotes the model did not place".to_string(),
            quotes: leftovers,
        });
    }

    themes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QuoteScope;

    fn quote(text: &str) -> Quote {
        Quote {
            session_id: "s1".into(),
            speaker_code: "p1".into(),
            time: 10.0,
            text: text.into(),
            context: None,
            topic_label: "General".into(),
            scope: QuoteScope::GeneralContext,
            sentiment: None,
            intensity: None,
            tags: vec![],
        }
    }

    fn entry(label: &str, ids: Vec<usize>) -> ThemeEntry {
        ThemeEntry {
            label: label.into(),
            subtitle: "a punchy subtitle".into(),
            quote_ids: ids,
        }
    }

    #[test]
    fn test_partition() {
        let quotes = vec![quote("a"), quote("b"), quote("c")];
        let themes = build_themes(
            &quotes,
            vec![entry("Trust", vec![0, 1]), entry("Speed", vec![2])],
        );
        let total: usize = themes.iter().map(|t| t.quotes.len()).sum();
        assert_eq!(total, 3);
        assert_eq!(themes.len(), 2);
    }

    #[test]
    fn test_duplicates_and_leftovers() {
        let quotes = vec![quote("a"), quote("b")];
        let themes = build_themes(&quotes, vec![entry("Trust", vec![0, 0])]);
        assert_eq!(themes.len(), 2);
        assert_eq!(themes[0].quotes.len(), 1);
        assert_eq!(themes[1].label, "Unthemed");
    }

    #[test]
    fn test_empty_entries_produce_single_unthemed_group() {
        let quotes = vec![quote("a")];
        let themes = build_themes(&quotes, vec![]);
        assert_eq!(themes.len(), 1);
        assert_eq!(themes[0].label, "Unthemed");
    }
}
