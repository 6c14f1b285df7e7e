//! Token usage tracking and cost estimation.
//!
//! The tracker is the only shared mutable state between concurrent LLM
//! workers: totals are atomic counters and the per-model breakdown sits
//! behind a mutex taken once per completed request. Costs come from a
//! built-in per-million-token price table matched by substring against the
//! model name; deployments that hide the underlying model (some hosted
//! enterprise variants) get token totals with no cost figure.
//!
//! Users can override prices via config (`[pricing]` table), which
//! bypasses model matching entirely.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenPrice {
    /// Cost per million input tokens (USD).
    pub input: f64,
    /// Cost per million output tokens (USD).
    pub output: f64,
}

/// Built-in price table. Entries are checked in order; the first substring
/// match wins. More specific patterns come first so "flash-lite" doesn't
/// match "flash" prices.
const PRICE_TABLE: &[(&str, TokenPrice)] = &[
    // Anthropic
    ("opus", TokenPrice { input: 5.0, output: 25.0 }),
    ("sonnet", TokenPrice { input: 3.0, output: 15.0 }),
    ("haiku", TokenPrice { input: 1.0, output: 5.0 }),
    // OpenAI
    ("gpt-4.1-nano", TokenPrice { input: 0.10, output: 0.40 }),
    ("gpt-4.1-mini", TokenPrice { input: 0.40, output: 1.60 }),
    ("gpt-4.1", TokenPrice { input: 2.0, output: 8.0 }),
    ("gpt-4o-mini", TokenPrice { input: 0.15, output: 0.60 }),
    ("gpt-4o", TokenPrice { input: 2.50, output: 10.0 }),
    ("o4-mini", TokenPrice { input: 1.10, output: 4.40 }),
    ("o3", TokenPrice { input: 2.0, output: 8.0 }),
    // Google
    ("gemini-2.5-flash-lite", TokenPrice { input: 0.10, output: 0.40 }),
    ("gemini-2.5-flash", TokenPrice { input: 0.30, output: 2.50 }),
    ("gemini-2.5-pro", TokenPrice { input: 1.25, output: 10.0 }),
];

/// Look up pricing for a model name (case-insensitive substring match).
pub fn lookup(model: &str) -> Option<TokenPrice> {
    let lower = model.to_lowercase();
    PRICE_TABLE
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, price)| *price)
}

/// Format a USD cost for display: "$1.23" or "<$0.01" for tiny amounts.
pub fn format_cost(cost: f64) -> String {
    if cost < 0.005 {
        "<$0.01".to_string()
    } else if cost < 100.0 {
        format!("${cost:.2}")
    } else {
        format!("${cost:.0}")
    }
}

/// Normalised token counts for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
}

/// Process-wide usage tracker shared by every LLM worker.
pub struct UsageTracker {
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    /// (provider, model) → counts, for the cost breakdown.
    by_model: Mutex<BTreeMap<(String, String), TokenCounts>>,
    price_override: Option<TokenPrice>,
}

impl UsageTracker {
    pub fn new(price_override: Option<TokenPrice>) -> UsageTracker {
        UsageTracker {
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            by_model: Mutex::new(BTreeMap::new()),
            price_override,
        }
    }

    /// Record one request's usage.
    pub fn record(&self, provider: &str, model: &str, counts: TokenCounts) {
        self.input_tokens.fetch_add(counts.input, Ordering::Relaxed);
        self.output_tokens.fetch_add(counts.output, Ordering::Relaxed);
        let mut map = self.by_model.lock().expect("usage tracker poisoned");
        let entry = map
            .entry((provider.to_string(), model.to_string()))
            .or_default();
        entry.input += counts.input;
        entry.output += counts.output;
    }

    pub fn totals(&self) -> TokenCounts {
        TokenCounts {
            input: self.input_tokens.load(Ordering::Relaxed),
            output: self.output_tokens.load(Ordering::Relaxed),
        }
    }

    /// Total estimated cost across all models.
    ///
    /// `None` when any model with recorded usage has no known price and no
    /// override is configured — a partial figure would read as a total.
    pub fn total_cost(&self) -> Option<f64> {
        let map = self.by_model.lock().expect("usage tracker poisoned");
        let mut total = 0.0;
        for ((_, model), counts) in map.iter() {
            let price = self.price_override.or_else(|| lookup(model))?;
            total += counts.input as f64 * price.input / 1_000_000.0;
            total += counts.output as f64 * price.output / 1_000_000.0;
        }
        Some(total)
    }

    /// One-line summary for the end of a run.
    pub fn summary_line(&self) -> String {
        let totals = self.totals();
        match self.total_cost() {
            Some(cost) => format!(
                "{} input + {} output tokens, est. {}",
                totals.input,
                totals.output,
                format_cost(cost)
            ),
            None => format!(
                "{} input + {} output tokens (no price known for this model)",
                totals.input, totals.output
            ),
        }
    }
}
