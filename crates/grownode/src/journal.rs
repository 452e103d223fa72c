use serde::Serialize;
use std::collections::VecDeque;
use time::OffsetDateTime;

use crate::context::Status;
use crate::leaf::LeafState;
use crate::param::ParamView;

/// Maximum number of entries retained in the ring buffer.
const MAX_ENTRIES: usize = 200;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Clone, Serialize)]
pub struct JournalEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EntryKind,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Free text posted by leaves through `DisplayLog`.
    Log,
    /// Connectivity and lifecycle transitions.
    System,
    Error,
}

/// Bounded history of human-readable node activity, newest last.
pub struct Journal {
    entries: VecDeque<JournalEntry>,
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(MAX_ENTRIES),
        }
    }

    pub fn record(&mut self, kind: EntryKind, message: impl Into<String>) {
        if self.entries.len() >= MAX_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(JournalEntry {
            ts: OffsetDateTime::now_utc(),
            kind,
            message: message.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries newest first.
    pub fn newest_first(&self) -> Vec<JournalEntry> {
        self.entries.iter().rev().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// JSON response (what the status endpoint returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusReport {
    pub uptime_secs: u64,
    pub status: Status,
    pub node: String,
    pub leaves: Vec<LeafReport>,
    pub journal: Vec<JournalEntry>,
}

#[derive(Serialize)]
pub struct LeafReport {
    pub name: String,
    pub kind: String,
    pub state: LeafState,
    pub params: Vec<ParamView>,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_drops_oldest() {
        let mut j = Journal::new();
        for i in 0..(MAX_ENTRIES + 5) {
            j.record(EntryKind::Log, format!("entry {i}"));
        }
        assert_eq!(j.len(), MAX_ENTRIES);
        let newest = j.newest_first();
        assert_eq!(newest[0].message, format!("entry {}", MAX_ENTRIES + 4));
        assert_eq!(newest[MAX_ENTRIES - 1].message, "entry 5");
    }

    #[test]
    fn entries_serialize_with_rfc3339_timestamp() {
        let mut j = Journal::new();
        j.record(EntryKind::System, "server connected");
        let json = serde_json::to_value(j.newest_first()).unwrap();
        assert_eq!(json[0]["kind"], "system");
        assert!(json[0]["ts"].as_str().unwrap().contains('T'));
    }
}
