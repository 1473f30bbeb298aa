//! Chitchat classification.
//!
//! Short greetings and acknowledgements take the fast path: one
//! low-latency expert, no synthesis. The same classifier drives the voice
//! driver's immediate-endpoint rule, so both entry points agree on what
//! counts as conversational filler.

use regex::Regex;

/// Lowercase, collapse internal whitespace, strip trailing punctuation.
/// This is the normal form both the chitchat classifier and the cache
/// fingerprint operate on.
pub fn normalize(text: &str) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .trim_end()
        .to_string()
}

/// Matches normalized query text against the configured greeting /
/// acknowledgement patterns.
pub struct ChitchatClassifier {
    patterns: Vec<Regex>,
}

impl ChitchatClassifier {
    /// Compile the configured patterns once. Patterns that fail to
    /// compile are skipped with a warning rather than taking down startup.
    pub fn new(patterns: &[String]) -> Self {
        let compiled = patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "skipping invalid chitchat pattern");
                    None
                }
            })
            .collect();
        Self { patterns: compiled }
    }

    pub fn is_chitchat(&self, text: &str) -> bool {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return false;
        }
        self.patterns.iter().any(|re| re.is_match(&normalized))
    }
}
