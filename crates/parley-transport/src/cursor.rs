//! Sync cursor shared by the push and poll paths.
//!
//! The cursor remembers the newest `created_at` observed and the last known
//! state of every recently seen row. Poll windows overlap, so the same row is
//! routinely fetched more than once; [`SyncCursor::observe`] classifies each
//! sighting so that a row is announced once and re-announced only when its
//! read receipt or reactions change.

use chrono::{DateTime, Duration, Utc};
use parley_protocol::{Message, Reaction};
use std::collections::HashMap;

use crate::traits::StoredRow;

/// Result of observing a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First sighting.
    New,
    /// Seen before with a different read receipt or reactions.
    Changed,
    /// Seen before, nothing changed.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
struct RowState {
    created_at: DateTime<Utc>,
    read_at: Option<DateTime<Utc>>,
    reactions: Vec<Reaction>,
}

impl RowState {
    fn matches(&self, read_at: Option<DateTime<Utc>>, reactions: &[Reaction]) -> bool {
        self.read_at == read_at
            && self.reactions.len() == reactions.len()
            && reactions.iter().all(|r| self.reactions.contains(r))
    }
}

/// Cursor and bounded dedup state.
#[derive(Debug)]
pub struct SyncCursor {
    last_seen: DateTime<Utc>,
    overlap: Duration,
    capacity: usize,
    seen: HashMap<String, RowState>,
}

impl SyncCursor {
    /// Create a cursor starting at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>, overlap: std::time::Duration, capacity: usize) -> Self {
        Self {
            last_seen: start,
            overlap: Duration::from_std(overlap).unwrap_or_else(|_| Duration::seconds(30)),
            capacity,
            seen: HashMap::new(),
        }
    }

    /// Newest `created_at` observed so far.
    #[must_use]
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    /// Lower bound (exclusive) of the next fetch window.
    #[must_use]
    pub fn fetch_from(&self) -> DateTime<Utc> {
        self.last_seen - self.overlap
    }

    /// Number of rows currently remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    #[must_use]
    pub fn is_seen(&self, id: &str) -> bool {
        self.seen.contains_key(id)
    }

    /// Classify a fetched or pushed row and record its state.
    ///
    /// Advances the cursor to the row's `created_at` if it is newer.
    pub fn observe(&mut self, row: &StoredRow) -> Observation {
        if row.created_at > self.last_seen {
            self.last_seen = row.created_at;
        }

        match self.seen.get_mut(&row.id) {
            Some(state) if state.matches(row.read_at, &row.reactions) => Observation::Unchanged,
            Some(state) => {
                state.read_at = row.read_at;
                state.reactions = row.reactions.clone();
                Observation::Changed
            }
            None => {
                self.seen.insert(
                    row.id.clone(),
                    RowState {
                        created_at: row.created_at,
                        read_at: row.read_at,
                        reactions: row.reactions.clone(),
                    },
                );
                Observation::New
            }
        }
    }

    /// Remember a locally sent message without moving the cursor.
    ///
    /// Returns `false` if the id was already known.
    pub fn record(&mut self, msg: &Message) -> bool {
        if self.seen.contains_key(&msg.id) {
            return false;
        }
        self.seen.insert(
            msg.id.clone(),
            RowState {
                created_at: msg.created_at,
                read_at: msg.read_at,
                reactions: msg.reactions.clone(),
            },
        );
        true
    }

    /// Forget rows that can no longer be fetched once over capacity.
    ///
    /// Fetches are strictly newer than [`fetch_from`](Self::fetch_from), so
    /// only rows at or before that bound are evicted. Returns rows evicted.
    pub fn prune(&mut self) -> usize {
        if self.seen.len() <= self.capacity {
            return 0;
        }
        let bound = self.fetch_from();
        let before = self.seen.len();
        self.seen.retain(|_, state| state.created_at > bound);
        before - self.seen.len()
    }
}
