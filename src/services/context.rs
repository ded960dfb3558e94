//! Bounded views over source text and generation history.
//!
//! Budgets are counted in `char`s, never bytes, so a slice never splits a
//! code point.

use serde::{Deserialize, Serialize};

/// First `max_chars` characters of `text`, or all of it when shorter.
pub fn leading_slice(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Last `max_chars` characters of `text`, or all of it when shorter.
pub fn trailing_slice(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Per-stage character budgets.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContextWindow {
    #[serde(default = "default_outline_source_chars")]
    pub outline_source_chars: usize,
    #[serde(default = "default_segment_source_chars")]
    pub segment_source_chars: usize,
    #[serde(default = "default_history_chars")]
    pub history_chars: usize,
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self {
            outline_source_chars: default_outline_source_chars(),
            segment_source_chars: default_segment_source_chars(),
            history_chars: default_history_chars(),
        }
    }
}

fn default_outline_source_chars() -> usize {
    120_000
}
fn default_segment_source_chars() -> usize {
    15_000
}
fn default_history_chars() -> usize {
    12_000
}

impl ContextWindow {
    pub fn outline_source<'a>(&self, text: &'a str) -> &'a str {
        leading_slice(text, self.outline_source_chars)
    }

    pub fn segment_source<'a>(&self, text: &'a str) -> &'a str {
        leading_slice(text, self.segment_source_chars)
    }

    pub fn history<'a>(&self, text: &'a str) -> &'a str {
        trailing_slice(text, self.history_chars)
    }
}
