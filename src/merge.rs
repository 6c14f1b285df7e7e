//! Stage 6: transcript merging.
//!
//! # Architecture overview
//!
//! A session can arrive with several transcript sources — whisper output
//! plus a Teams subtitle, or two decoded recordings of the same meeting.
//! This stage folds them into one coherent segment sequence by pairwise
//! overlap resolution: two segments from different sources describe the
//! same utterance when their intervals overlap beyond a small epsilon and
//! their text fuzzy-matches above a threshold.
//!
//! Preference between duplicates:
//! 1. the source with per-word timing (the transcriber) wins on timing;
//! 2. a real speaker label beats a generic one regardless of which source
//!    carried it — document labels are usually display names while
//!    diarisation emits "SPEAKER_00".
//!
//! # Post-conditions
//!
//! The merged list is globally sorted with labels finalised. Word-timing
//! lists may then be pruned to shrink the working set; the intermediate
//! JSON written after this stage omits them.

use crate::model::Segment;
use crate::speakers::is_generic_label;

/// Minimum interval intersection (seconds) before two segments are
/// considered candidates for the same utterance.
const OVERLAP_EPSILON: f64 = 0.5;

/// Minimum token-set similarity for a duplicate verdict.
const SIMILARITY_THRESHOLD: f64 = 0.65;

/// Merge several per-source segment lists for one session.
pub fn merge_sources(sources: Vec<Vec<Segment>>) -> Vec<Segment> {
    let mut iter = sources.into_iter();
    let Some(mut merged) = iter.next() else {
        return vec![];
    };

    for source in iter {
        for incoming in source {
            match merged
                .iter_mut()
                .find(|kept| is_duplicate(kept, &incoming))
            {
                Some(kept) => resolve_pair(kept, incoming),
                None => merged.push(incoming),
            }
        }
    }

    merged.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));
    merged
}

/// Drop word-timing lists once the merge has finalised timing.
pub fn prune_word_timings(segments: &mut [Segment]) {
    for seg in segments {
        seg.words = Vec::new();
        seg.words.shrink_to_fit();
    }
}

fn is_duplicate(a: &Segment, b: &Segment) -> bool {
    overlap(a, b) > OVERLAP_EPSILON && similarity(&a.text, &b.text) >= SIMILARITY_THRESHOLD
}

fn overlap(a: &Segment, b: &Segment) -> f64 {
    (a.end.min(b.end) - a.start.max(b.start)).max(0.0)
}

/// Token-set Dice similarity on lowercased words.
fn similarity(a: &str, b: &str) -> f64 {
    let set_a: std::collections::HashSet<String> =
        a.split_whitespace().map(normalise_token).collect();
    let set_b: std::collections::HashSet<String> =
        b.split_whitespace().map(normalise_token).collect();
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let common = set_a.intersection(&set_b).count();
    2.0 * common as f64 / (set_a.len() + set_b.len()) as f64
}

fn normalise_token(token: &str) -> String {
    token
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// Fold a duplicate pair into `kept`, applying the preference rules.
fn resolve_pair(kept: &mut Segment, incoming: Segment) {
    let kept_has_words = !kept.words.is_empty();
    let incoming_has_words = !incoming.words.is_empty();

    // Timing and text come from the word-timed source when exactly one
    // side has it.
    if incoming_has_words && !kept_has_words {
        let label = pick_label(&incoming.speaker_label, &kept.speaker_label);
        *kept = incoming;
        kept.speaker_label = label;
        return;
    }

    kept.speaker_label = pick_label(&kept.speaker_label, &incoming.speaker_label);
}

/// Prefer a real name over a generic diarisation label.
fn pick_label(primary: &str, secondary: &str) -> String {
    if is_generic_label(primary) && !is_generic_label(secondary) {
        secondary.to_string()
    } else {
        primary.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WordTiming;

    fn seg(start: f64, end: f64, label: &str, text: &str) -> Segment {
        Segment {
            session_id: "s1".into(),
            start,
            end,
            text: text.into(),
            speaker_label: label.into(),
            speaker_code: None,
            role: None,
            words: vec![],
        }
    }

    fn with_words(mut s: Segment) -> Segment {
        s.words = s
            .text
            .split_whitespace()
            .map(|w| WordTiming {
                text: w.into(),
                start: s.start,
                end: s.end,
            })
            .collect();
        s
    }

    #[test]
    fn test_single_source_passthrough() {
        let merged = merge_sources(vec![vec![seg(2.0, 4.0, "A", "b"), seg(0.0, 1.0, "A", "a")]]);
        assert_eq!(merged.len(), 2);
        assert!(merged[0].start < merged[1].start);
    }

    #[test]
    fn test_duplicate_collapses_to_word_timed_source() {
        let whisper = with_words(seg(10.0, 14.0, "SPEAKER_00", "I really liked the new dashboard"));
        let subtitle = seg(10.2, 13.8, "Priya Patel", "I really liked the new dashboard");

        let merged = merge_sources(vec![vec![subtitle], vec![whisper]]);
        assert_eq!(merged.len(), 1);
        // Word-timed source wins timing and text…
        assert!(!merged[0].words.is_empty());
        assert_eq!(merged[0].start, 10.0);
        // …but the real name beats the diarisation placeholder
        assert_eq!(merged[0].speaker_label, "Priya Patel");
    }

    #[test]
    fn test_real_label_kept_when_subtitle_first_source() {
        let subtitle = seg(10.0, 14.0, "Priya Patel", "the export button was hidden");
        let whisper = with_words(seg(10.1, 14.2, "SPEAKER_01", "the export button was hidden"));

        let merged = merge_sources(vec![vec![whisper], vec![subtitle]]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].speaker_label, "Priya Patel");
        assert!(!merged[0].words.is_empty());
    }

    #[test]
    fn test_non_overlapping_segments_both_kept() {
        let a = seg(0.0, 2.0, "A", "first thing");
        let b = seg(5.0, 7.0, "B", "second thing");
        let merged = merge_sources(vec![vec![a], vec![b]]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_overlapping_but_different_text_both_kept() {
        // Crosstalk: same interval, different words
        let a = seg(0.0, 3.0, "A", "I think the colours are wrong");
        let b = seg(1.0, 3.5, "B", "could you scroll down please");
        let merged = merge_sources(vec![vec![a], vec![b]]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_similarity_tolerates_punctuation_and_case() {
        assert!(similarity("I liked it, honestly!", "i liked it honestly") > 0.9);
        assert!(similarity("completely different words", "nothing shared here") < 0.2);
    }

    #[test]
    fn test_prune_word_timings() {
        let mut segments = vec![with_words(seg(0.0, 1.0, "A", "hello there"))];
        prune_word_timings(&mut segments);
        assert!(segments[0].words.is_empty());
    }

    #[test]
    fn test_empty_input() {
        assert!(merge_sources(vec![]).is_empty());
    }
}
