//! Run history and the identifier cursor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Most runs kept in history.
pub const LEDGER_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    /// Some payment fields were filled out of band (bridge or manual entry).
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub identifier: String,
    pub card_suffix: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
}

impl RunResult {
    pub fn now(identifier: impl Into<String>, card_suffix: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            identifier: identifier.into(),
            card_suffix: card_suffix.into(),
            timestamp: Utc::now(),
            outcome,
        }
    }
}

/// Newest-first run history, never longer than [`LEDGER_CAPACITY`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ledger {
    entries: VecDeque<RunResult>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from stored entries, newest first. Excess entries are dropped.
    pub fn from_entries(entries: impl IntoIterator<Item = RunResult>) -> Self {
        let mut entries: VecDeque<RunResult> = entries.into_iter().collect();
        entries.truncate(LEDGER_CAPACITY);
        Self { entries }
    }

    pub fn record(&mut self, result: RunResult) {
        self.entries.push_front(result);
        self.entries.truncate(LEDGER_CAPACITY);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&RunResult> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunResult> {
        self.entries.iter()
    }
}

/// Identifier the cursor points at, `None` for an empty list.
pub fn next_identifier(list: &[String], cursor: usize) -> Option<&str> {
    if list.is_empty() {
        return None;
    }
    Some(list[cursor % list.len()].as_str())
}

/// Cursor after one run over a list of `len` identifiers.
pub fn advance(cursor: usize, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    (cursor + 1) % len
}
