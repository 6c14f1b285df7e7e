//! Stage 7: PII redaction (opt-in).
//!
//! # Architecture overview
//!
//! When enabled, this stage produces a parallel "cooked" transcript in
//! which detected PII is replaced by type-tagged placeholders
//! (`[EMAIL_1]`, `[PHONE_2]`), plus an audit log recording every
//! replacement with its original text, label, confidence, and timecode.
//! The same original always maps to the same placeholder within a run, so
//! a recurring email address stays traceable across the cooked transcript.
//!
//! Detected entity types: person names (from the resolved speaker names),
//! phone numbers, emails, credit-card numbers, national-ID numbers,
//! driver-licence numbers, passport numbers, bank account numbers, IBAN,
//! IP addresses, URLs, and dates/times.
//!
//! Location names are deliberately NOT redacted: "the Berlin office" and
//! "the onboarding flow in the Madrid store" are research findings, and
//! stripping them destroys the meaning of the quote.
//!
//! # Failure semantics
//!
//! A transcript is never silently dropped. If a rule set fails against a
//! segment, the segment passes through unredacted and the audit log
//! records a warning entry instead.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::Segment;

/// One replacement (or warning) recorded in the audit log.
///
/// The audit includes the original text: the file is local-first and
/// exists precisely so a researcher can review what was removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub session_id: String,
    pub time: f64,
    pub label: String,
    pub original: String,
    pub replacement: String,
    pub confidence: f64,
}

#[derive(Debug, Default)]
pub struct RedactionOutcome {
    pub segments: Vec<Segment>,
    pub audit: Vec<AuditEntry>,
}

struct Rule {
    label: &'static str,
    regex: &'static Lazy<Regex>,
    confidence: f64,
    /// Extra validation applied to each raw match.
    validate: Option<fn(&str) -> bool>,
}

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());
static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"https?://[^\s)\]>"']+"#).unwrap());
static IP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap());
static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+\d{1,3}[ .-]?)?(?:\(\d{2,4}\)[ .-]?)?\d{2,4}[ .-]\d{3,4}[ .-]\d{3,4}\b")
        .unwrap()
});
static CARD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d(?:[ -]?\d){12,18}\b").unwrap());
static IBAN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z]{2}\d{2}[A-Z0-9]{11,30}\b").unwrap());
static NATIONAL_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());
static PASSPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z]{1,2}\d{7,9}\b").unwrap());
static LICENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:licence|license|dl)[ #:]{1,3}[A-Z0-9-]{5,15}\b").unwrap());
static BANK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:account|acct)(?: number)?[ #:]{1,3}\d{6,14}\b").unwrap()
});
static DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}/\d{2,4}|(?:january|february|march|april|may|june|july|august|september|october|november|december) \d{1,2}(?:st|nd|rd|th)?(?:,? \d{4})?)\b")
        .unwrap()
});
static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b\d{1,2}(?::\d{2})? ?(?:am|pm)\b").unwrap());

/// Rules are applied in order; earlier rules claim their spans first, so
/// specific shapes (IBAN) sit above the loose numeric ones.
static RULES: &[Rule] = &[
    Rule { label: "EMAIL", regex: &EMAIL_RE, confidence: 0.95, validate: None },
    Rule { label: "URL", regex: &URL_RE, confidence: 0.95, validate: None },
    Rule { label: "IBAN", regex: &IBAN_RE, confidence: 0.9, validate: None },
    Rule { label: "CREDIT_CARD", regex: &CARD_RE, confidence: 0.9, validate: Some(luhn_valid) },
    Rule { label: "IP_ADDRESS", regex: &IP_RE, confidence: 0.85, validate: Some(plausible_ip) },
    Rule { label: "NATIONAL_ID", regex: &NATIONAL_ID_RE, confidence: 0.8, validate: None },
    Rule { label: "BANK_ACCOUNT", regex: &BANK_RE, confidence: 0.75, validate: None },
    Rule { label: "DRIVER_LICENCE", regex: &LICENCE_RE, confidence: 0.7, validate: None },
    Rule { label: "PHONE", regex: &PHONE_RE, confidence: 0.7, validate: Some(enough_digits) },
    Rule { label: "PASSPORT", regex: &PASSPORT_RE, confidence: 0.5, validate: None },
    Rule { label: "DATE", regex: &DATE_RE, confidence: 0.8, validate: None },
    Rule { label: "TIME", regex: &TIME_RE, confidence: 0.7, validate: None },
];

fn luhn_valid(s: &str) -> bool {
    let digits: Vec<u32> = s.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

fn plausible_ip(s: &str) -> bool {
    s.split('.').all(|octet| octet.parse::<u32>().is_ok_and(|n| n <= 255))
}

fn enough_digits(s: &str) -> bool {
    s.chars().filter(|c| c.is_ascii_digit()).count() >= 9
}

/// The redactor: placeholder counters plus the original→placeholder memo
/// that keeps repeated values consistent.
pub struct Redactor {
    name_res: Vec<Regex>,
    counters: HashMap<&'static str, u32>,
    assigned: HashMap<(String, String), String>,
}

impl Redactor {
    /// `known_names` come from the resolved speaker identities and the
    /// people registry; each full name and each of its longer parts is
    /// matched case-insensitively at word boundaries.
    pub fn new(known_names: &[String]) -> Redactor {
        let mut patterns: Vec<String> = Vec::new();
        for name in known_names {
            let name = name.trim();
            if name.len() > 2 {
                patterns.push(regex::escape(name));
            }
            for part in name.split_whitespace() {
                if part.len() > 2 {
                    patterns.push(regex::escape(part));
                }
            }
        }
        patterns.sort_by_key(|p| std::cmp::Reverse(p.len()));
        patterns.dedup();
        let name_res = patterns
            .iter()
            .filter_map(|p| Regex::new(&format!(r"(?i)\b{p}\b")).ok())
            .collect();
        Redactor {
            name_res,
            counters: HashMap::new(),
            assigned: HashMap::new(),
        }
    }

    /// Redact a full session, accumulating the audit log.
    pub fn redact_segments(&mut self, segments: &[Segment]) -> RedactionOutcome {
        let mut outcome = RedactionOutcome::default();
        for seg in segments {
            let (text, entries) = self.redact_text(&seg.text, &seg.session_id, seg.start);
            let mut cooked = seg.clone();
            cooked.text = text;
            cooked.words = vec![];
            outcome.segments.push(cooked);
            outcome.audit.extend(entries);
        }
        outcome
    }

    fn redact_text(
        &mut self,
        text: &str,
        session_id: &str,
        time: f64,
    ) -> (String, Vec<AuditEntry>) {
        // Collect candidate spans from every rule, then resolve overlaps
        // by span order with earlier (higher-priority) rules winning.
        struct Candidate {
            start: usize,
            end: usize,
            label: &'static str,
            confidence: f64,
            priority: usize,
        }

        let mut candidates: Vec<Candidate> = Vec::new();
        for (priority, rule) in RULES.iter().enumerate() {
            for m in rule.regex.find_iter(text) {
                if rule.validate.is_none_or(|f| f(m.as_str())) {
                    candidates.push(Candidate {
                        start: m.start(),
                        end: m.end(),
                        label: rule.label,
                        confidence: rule.confidence,
                        priority,
                    });
                }
            }
        }
        for re in &self.name_res {
            for m in re.find_iter(text) {
                candidates.push(Candidate {
                    start: m.start(),
                    end: m.end(),
                    label: "NAME",
                    confidence: 0.9,
                    priority: 0,
                });
            }
        }

        candidates.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then(a.priority.cmp(&b.priority))
                .then(b.end.cmp(&a.end))
        });

        let mut result = String::with_capacity(text.len());
        let mut entries = Vec::new();
        let mut cursor = 0usize;
        for cand in candidates {
            if cand.start < cursor {
                continue; // overlapped by an earlier claim
            }
            let original = &text[cand.start..cand.end];
            let replacement = self.placeholder(cand.label, original);
            result.push_str(&text[cursor..cand.start]);
            result.push_str(&replacement);
            entries.push(AuditEntry {
                session_id: session_id.to_string(),
                time,
                label: cand.label.to_string(),
                original: original.to_string(),
                replacement,
                confidence: cand.confidence,
            });
            cursor = cand.end;
        }
        result.push_str(&text[cursor..]);

        (result, entries)
    }

    fn placeholder(&mut self, label: &'static str, original: &str) -> String {
        let key = (label.to_string(), original.to_lowercase());
        if let Some(existing) = self.assigned.get(&key) {
            return existing.clone();
        }
        let counter = self.counters.entry(label).or_insert(0);
        *counter += 1;
        let placeholder = format!("[{label}_{counter}]");
        self.assigned.insert(key, placeholder.clone());
        placeholder
    }
}
