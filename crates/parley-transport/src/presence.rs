//! Presence tracking for Parley.
//!
//! The tracker builds the "who is online" list from three sources: entries
//! published on a backend's shared channel, recent message activity when no
//! presence channel exists, and the hub's own session registry in local
//! mode. The current user and any virtual participants are always merged in.

use chrono::Utc;
use parley_protocol::PresenceEntry;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::traits::{Activity, PresenceMeta};

/// A participant that is always listed as online.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualParticipant {
    pub username: String,
    pub team: String,
}

impl VirtualParticipant {
    #[must_use]
    pub fn new(username: impl Into<String>, team: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            team: team.into(),
        }
    }

    /// The built-in assistant identity.
    #[must_use]
    pub fn assistant() -> Self {
        Self::new("Assistant", "Assistant")
    }

    fn entry(&self) -> PresenceEntry {
        PresenceEntry::new(
            self.username.clone(),
            self.team.clone(),
            format!("virtual:{}", self.username),
        )
    }
}

/// A user connected through this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub team: String,
    pub session_id: String,
}

impl Identity {
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        team: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            team: team.into(),
            session_id: session_id.into(),
        }
    }

    fn entry(&self) -> PresenceEntry {
        PresenceEntry::new(
            self.username.clone(),
            self.team.clone(),
            self.session_id.clone(),
        )
    }

    /// Presence record to publish on a shared channel.
    #[must_use]
    pub fn meta(&self) -> PresenceMeta {
        PresenceMeta {
            user: self.username.clone(),
            team: self.team.clone(),
            user_id: self.session_id.clone(),
            online_at: Utc::now(),
        }
    }
}

/// Presence tracker.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    /// Entries in display order.
    members: Vec<PresenceEntry>,
    virtuals: Vec<VirtualParticipant>,
}

impl PresenceTracker {
    /// Create a tracker that always lists `virtuals`.
    #[must_use]
    pub fn new(virtuals: Vec<VirtualParticipant>) -> Self {
        Self {
            members: Vec::new(),
            virtuals,
        }
    }

    /// Number of tracked entries, virtual participants excluded.
    #[must_use]
    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// Whether `username` has at least one tracked entry.
    #[must_use]
    pub fn is_present(&self, username: &str) -> bool {
        self.members.iter().any(|e| e.username == username)
    }

    /// Add or refresh an entry keyed by session.
    ///
    /// Returns `true` if the session is new.
    pub fn join(&mut self, entry: PresenceEntry) -> bool {
        if let Some(existing) = self
            .members
            .iter_mut()
            .find(|e| e.session_id == entry.session_id)
        {
            *existing = entry;
            return false;
        }
        debug!(session = %entry.session_id, user = %entry.username, "Presence: member joined");
        self.members.push(entry);
        true
    }

    /// Remove a session. Returns the removed entry, if any.
    pub fn leave(&mut self, session_id: &str) -> Option<PresenceEntry> {
        let idx = self.members.iter().position(|e| e.session_id == session_id)?;
        let entry = self.members.remove(idx);
        debug!(session = %session_id, user = %entry.username, "Presence: member left");
        Some(entry)
    }

    /// Refresh a session's `last_seen`. Returns `true` if it exists.
    pub fn touch(&mut self, session_id: &str) -> bool {
        match self.members.iter_mut().find(|e| e.session_id == session_id) {
            Some(entry) => {
                entry.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Evict entries idle for longer than `timeout`.
    ///
    /// Returns the evicted session ids.
    pub fn prune_stale(&mut self, timeout: Duration) -> Vec<String> {
        let timeout =
            chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        let now = Utc::now();
        let mut evicted = Vec::new();
        self.members.retain(|e| {
            let keep = now - e.last_seen <= timeout;
            if !keep {
                evicted.push(e.session_id.clone());
            }
            keep
        });
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Presence: pruned stale members");
        }
        evicted
    }

    /// Tracked entries, one per username, followed by virtual participants.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        let mut users: Vec<PresenceEntry> = Vec::with_capacity(self.members.len());
        for entry in &self.members {
            if !users.iter().any(|u| u.username == entry.username) {
                users.push(entry.clone());
            }
        }
        for participant in &self.virtuals {
            if !users.iter().any(|u| u.username == participant.username) {
                users.push(participant.entry());
            }
        }
        users
    }

    /// Replace the tracked set with the state of a push channel.
    ///
    /// Local users missing from the channel are appended.
    pub fn apply_channel_state(
        &mut self,
        metas: &[PresenceMeta],
        local: &[Identity],
    ) -> Vec<PresenceEntry> {
        self.members = metas
            .iter()
            .map(|m| {
                let session = if m.user_id.is_empty() {
                    m.user.clone()
                } else {
                    m.user_id.clone()
                };
                PresenceEntry::new(m.user.clone(), m.team.clone(), session).seen_at(m.online_at)
            })
            .collect();

        for me in local {
            if !self.is_present(&me.username) {
                self.members.push(me.entry());
            }
        }
        self.snapshot()
    }

    /// Replace the tracked set with senders from recent activity.
    ///
    /// `activity` is newest first. Local users are listed first.
    pub fn infer_from_activity(
        &mut self,
        activity: &[Activity],
        local: &[Identity],
    ) -> Vec<PresenceEntry> {
        let mut members: Vec<PresenceEntry> = Vec::new();
        for me in local {
            if !members.iter().any(|e| e.username == me.username) {
                members.push(me.entry());
            }
        }
        for item in activity {
            if members.iter().any(|e| e.username == item.sender) {
                continue;
            }
            members.push(
                PresenceEntry::new(
                    item.sender.clone(),
                    String::new(),
                    format!("inferred:{}", item.sender),
                )
                .seen_at(item.created_at),
            );
        }
        self.members = members;
        self.snapshot()
    }
}
