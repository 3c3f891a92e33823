//! Bounded conversation transcript

use std::collections::VecDeque;
use std::time::SystemTime;

use crate::protocol::Role;

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
    pub timestamp: SystemTime,
}

/// Keeps the most recent `capacity` entries, evicting the oldest first.
///
/// Streaming fragments from the same speaker are appended to the open entry
/// until the turn is sealed by a turn boundary or an interruption.
#[derive(Debug, Clone)]
pub struct Transcript {
    entries: VecDeque<TranscriptEntry>,
    capacity: usize,
    open: bool,
}

impl Transcript {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
            open: false,
        }
    }

    /// Whether a fragment from `role` would extend the last entry.
    pub fn continues(&self, role: Role) -> bool {
        self.open && self.entries.back().is_some_and(|last| last.role == role)
    }

    /// Add a fragment and return the full text of the entry it landed in.
    pub fn push(&mut self, role: Role, text: &str) -> &TranscriptEntry {
        let append = self.continues(role);

        let mut merged = false;
        if append {
            if let Some(last) = self.entries.back_mut() {
                join_fragment(&mut last.text, text);
                merged = true;
            }
        }
        if !merged {
            if self.entries.len() == self.capacity {
                self.entries.pop_front();
            }
            let mut entry = TranscriptEntry {
                role,
                text: String::new(),
                timestamp: SystemTime::now(),
            };
            join_fragment(&mut entry.text, text);
            self.entries.push_back(entry);
        }

        self.open = true;
        &self.entries[self.entries.len() - 1]
    }

    /// Close the current entry so the next fragment starts a new one.
    pub fn seal(&mut self) {
        self.open = false;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.open = false;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TranscriptEntry> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<TranscriptEntry> {
        self.entries.iter().cloned().collect()
    }
}

fn join_fragment(existing: &mut String, fragment: &str) {
    if existing.is_empty() {
        existing.push_str(fragment.trim_start());
        return;
    }
    let needs_space = !existing.ends_with(char::is_whitespace)
        && !fragment.starts_with(char::is_whitespace)
        && !fragment.starts_with(|c: char| matches!(c, '.' | ',' | '!' | '?' | ';' | ':' | '\''));
    if needs_space {
        existing.push(' ');
    }
    existing.push_str(fragment);
}
