//! Local history of replicated commits.

use flexsync_protocol::Changeset;
use serde::{Deserialize, Serialize};

/// A committed local changeset awaiting upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Database version produced by the commit.
    pub version: u64,
    /// The instructions of the commit.
    pub changeset: Changeset,
}

/// Replicated changesets in version order.
///
/// Commits made without replication advance the database version but leave
/// no entry, so version gaps are normal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub(crate) fn push(&mut self, entry: HistoryEntry) {
        debug_assert!(self.entries.last().map_or(true, |e| e.version < entry.version));
        self.entries.push(entry);
    }

    /// Entries with `after < version <= up_to`.
    pub(crate) fn range(&self, after: u64, up_to: u64) -> Vec<HistoryEntry> {
        self.entries
            .iter()
            .filter(|e| e.version > after && e.version <= up_to)
            .cloned()
            .collect()
    }

    /// Drops entries with `version <= up_to`.
    pub(crate) fn trim(&mut self, up_to: u64) {
        self.entries.retain(|e| e.version > up_to);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Total encoded size of the entries in `after..=up_to`.
    pub(crate) fn byte_size(&self, after: u64, up_to: u64) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.version > after && e.version <= up_to)
            .map(|e| e.changeset.encoded_size().unwrap_or(0) as u64)
            .sum()
    }
}
