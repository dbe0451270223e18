//! Word Tracking
//!
//! Turns the engine's overlapping partial/terminal text into the exact set
//! of not-yet-sent words. Progress is tracked by count, not by word
//! identity, so a legitimately repeated word ("the ... the") is never
//! deduplicated away.

use std::collections::HashMap;

/// Per-session tracker for how much of the current utterance has already
/// been sent.
#[derive(Debug, Default)]
pub struct WordTracker {
    sent_count: usize,
    last_text: String,
}

impl WordTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all tracking state. Called when a new capture session starts.
    pub fn reset(&mut self) {
        self.sent_count = 0;
        self.last_text.clear();
    }

    /// Incremental update: returns the words beyond what was already sent.
    ///
    /// Partials normally grow a shared prefix; when the new text no longer
    /// shares one, the engine has begun a new utterance and the count starts
    /// over for it.
    pub fn on_partial(&mut self, text: &str) -> Vec<String> {
        if !shares_prefix(&self.last_text, text) {
            self.sent_count = 0;
        }
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let fresh: Vec<String> = tokens
            .iter()
            .skip(self.sent_count)
            .map(|w| w.to_string())
            .collect();
        self.sent_count = self.sent_count.max(tokens.len());
        self.last_text = text.to_string();
        fresh
    }

    /// Terminal update: reconcile the final text against the last partial.
    ///
    /// Post-processing may reorder or insert words relative to the partials,
    /// so the diff is a per-token budget: each token occurrence in the last
    /// partial is assumed sent, and only final tokens exceeding that budget
    /// are returned.
    pub fn on_terminal(&mut self, text: &str) -> Vec<String> {
        let mut budget: HashMap<&str, usize> = HashMap::new();
        for token in self.last_text.split_whitespace() {
            *budget.entry(token).or_insert(0) += 1;
        }

        let tokens: Vec<&str> = text.split_whitespace().collect();
        let mut fresh = Vec::new();
        for token in &tokens {
            match budget.get_mut(*token) {
                Some(n) if *n > 0 => *n -= 1,
                _ => fresh.push(token.to_string()),
            }
        }
        self.sent_count = tokens.len();
        self.last_text = text.to_string();
        fresh
    }
}

/// Whether `next` continues `prev`: their common prefix must cover at least
/// half of `prev`.
fn shares_prefix(prev: &str, next: &str) -> bool {
    if prev.is_empty() {
        return true;
    }
    let common = prev
        .chars()
        .zip(next.chars())
        .take_while(|(a, b)| a == b)
        .count();
    common * 2 >= prev.chars().count()
}
