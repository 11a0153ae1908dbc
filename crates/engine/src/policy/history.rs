//! Bounded operation history consulted by the policy validator.
//!
//! Entries record accepted tool calls only. The log is purged lazily on
//! every validation: anything older than the age ceiling goes, and a hard
//! entry cap bounds growth regardless of clock behavior.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use warden_core::constants::{HISTORY_MAX_AGE_MS, HISTORY_MAX_ENTRIES};

/// One accepted operation.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub operation_name: String,
    pub at: Instant,
    /// Top-level argument keys, recorded for offline analysis; values are
    /// never retained.
    pub arg_keys: Vec<String>,
}

/// Append-only log of accepted operations, in strict call order.
#[derive(Debug, Default)]
pub struct OperationHistory {
    entries: VecDeque<HistoryEntry>,
}

impl OperationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops entries older than the age ceiling, then enforces the entry cap.
    pub fn purge(&mut self, now: Instant) {
        let max_age = Duration::from_millis(HISTORY_MAX_AGE_MS);
        while let Some(front) = self.entries.front() {
            if now.duration_since(front.at) > max_age {
                self.entries.pop_front();
            } else {
                break;
            }
        }
        while self.entries.len() > HISTORY_MAX_ENTRIES {
            self.entries.pop_front();
        }
    }

    /// Appends an accepted operation.
    pub fn push(&mut self, operation_name: String, arg_keys: Vec<String>, now: Instant) {
        self.entries.push_back(HistoryEntry {
            operation_name,
            at: now,
            arg_keys,
        });
    }

    /// Number of entries within the trailing window.
    pub fn count_within(&self, now: Instant, window_ms: u64) -> usize {
        let window = Duration::from_millis(window_ms);
        self.entries
            .iter()
            .rev()
            .take_while(|e| now.duration_since(e.at) <= window)
            .count()
    }

    /// Number of entries within the window whose name matches the predicate.
    pub fn count_matching_within<F>(&self, now: Instant, window_ms: u64, mut pred: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let window = Duration::from_millis(window_ms);
        self.entries
            .iter()
            .rev()
            .take_while(|e| now.duration_since(e.at) <= window)
            .filter(|e| pred(&e.operation_name))
            .count()
    }

    /// Whether any entry within the window matches the predicate.
    pub fn any_within<F>(&self, now: Instant, window_ms: u64, pred: F) -> bool
    where
        F: FnMut(&str) -> bool,
    {
        self.count_matching_within(now, window_ms, pred) > 0
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in call order.
    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }
}
