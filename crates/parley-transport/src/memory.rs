//! In-process loopback backend.
//!
//! Keeps rows in memory and fans change notifications out to every open
//! subscription. It speaks the same contract as a remote backend and can be
//! told to misbehave, which makes it the backend of choice for demos and for
//! exercising the adapter's fallback paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_protocol::Reaction;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::adapter::lock;
use crate::traits::{
    Activity, Backend, BackendError, BackendKind, PresenceMeta, PushEvent, PushSubscription,
    StoredRow, VersionInfo,
};

/// How subscriptions behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PushMode {
    /// Subscriptions are acknowledged immediately.
    #[default]
    Acknowledge,
    /// Subscriptions open but are never acknowledged.
    Silent,
    /// Subscribing fails.
    Unavailable,
}

#[derive(Default)]
struct MemoryState {
    rows: Vec<StoredRow>,
    presence: Vec<PresenceMeta>,
    versions: Vec<VersionInfo>,
    subscribers: Vec<mpsc::UnboundedSender<PushEvent>>,
    push: PushMode,
    rejecting: bool,
    unreachable: bool,
}

impl MemoryState {
    fn check(&self) -> Result<(), BackendError> {
        if self.unreachable {
            return Err(BackendError::Unreachable("memory backend offline".into()));
        }
        if self.rejecting {
            return Err(BackendError::Rejected("invalid api key".into()));
        }
        Ok(())
    }

    fn broadcast(&mut self, event: &PushEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn row_mut(&mut self, id: &str) -> Option<&mut StoredRow> {
        self.rows.iter_mut().find(|r| r.id == id)
    }
}

/// In-memory backend.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    /// Create a backend with acknowledged push.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend with the given push behavior.
    #[must_use]
    pub fn with_push(mode: PushMode) -> Self {
        let backend = Self::default();
        lock(&backend.state).push = mode;
        backend
    }

    pub fn set_push_mode(&self, mode: PushMode) {
        lock(&self.state).push = mode;
    }

    /// Refuse credentials on every call.
    pub fn set_rejecting(&self, rejecting: bool) {
        lock(&self.state).rejecting = rejecting;
    }

    /// Fail every call as if the network were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// Report a channel error to every subscription and drop them.
    pub fn fail_push(&self, reason: &str) {
        let mut state = lock(&self.state);
        for tx in state.subscribers.drain(..) {
            let _ = tx.send(PushEvent::ChannelError(reason.to_string()));
        }
    }

    /// Snapshot of stored rows in insertion order.
    #[must_use]
    pub fn rows(&self) -> Vec<StoredRow> {
        lock(&self.state).rows.clone()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut state = lock(&self.state);
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    fn rows_after(&self, after: DateTime<Utc>) -> Result<Vec<StoredRow>, BackendError> {
        let state = lock(&self.state);
        state.check()?;
        Ok(state
            .rows
            .iter()
            .filter(|r| r.created_at > after)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn verify(&self) -> Result<(), BackendError> {
        lock(&self.state).check()
    }

    async fn subscribe(&self) -> Result<PushSubscription, BackendError> {
        let mut state = lock(&self.state);
        state.check()?;
        if state.push == PushMode::Unavailable {
            return Err(BackendError::Unreachable("realtime disabled".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if state.push == PushMode::Acknowledge {
            let _ = tx.send(PushEvent::Subscribed);
        }
        state.subscribers.push(tx);
        debug!(subscribers = state.subscribers.len(), "Memory backend: subscribed");
        Ok(PushSubscription::new(rx))
    }

    async fn track_presence(&self, meta: PresenceMeta) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        state.check()?;
        state.presence.retain(|m| m.user_id != meta.user_id);
        state.presence.push(meta);
        let event = PushEvent::PresenceSync(state.presence.clone());
        state.broadcast(&event);
        Ok(())
    }

    async fn untrack_presence(&self, user_id: &str) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        state.check()?;
        state.presence.retain(|m| m.user_id != user_id);
        let event = PushEvent::PresenceSync(state.presence.clone());
        state.broadcast(&event);
        Ok(())
    }

    async fn insert(&self, row: StoredRow) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        state.check()?;
        if state.rows.iter().any(|r| r.id == row.id) {
            return Err(BackendError::Request(format!("duplicate id {}", row.id)));
        }
        state.rows.push(row.clone());
        state.broadcast(&PushEvent::Inserted(row));
        Ok(())
    }

    async fn fetch_since(&self, after: DateTime<Utc>) -> Result<Vec<StoredRow>, BackendError> {
        let mut rows = self.rows_after(after)?;
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    async fn recent_activity(&self, since: DateTime<Utc>) -> Result<Vec<Activity>, BackendError> {
        let mut rows = self.rows_after(since)?;
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows
            .into_iter()
            .map(|r| Activity {
                sender: r.sender,
                created_at: r.created_at,
            })
            .collect())
    }

    async fn latest(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredRow>, BackendError> {
        let mut rows = self.rows_after(since)?;
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn mark_read(&self, ids: &[String], at: DateTime<Utc>) -> Result<usize, BackendError> {
        let mut state = lock(&self.state);
        state.check()?;
        let mut changed = Vec::new();
        for id in ids {
            if let Some(row) = state.row_mut(id) {
                if row.read_at.is_none() {
                    row.read_at = Some(at);
                    changed.push(row.clone());
                }
            }
        }
        for row in &changed {
            state.broadcast(&PushEvent::Updated(row.clone()));
        }
        Ok(changed.len())
    }

    async fn add_reaction(&self, id: &str, reaction: Reaction) -> Result<bool, BackendError> {
        let mut state = lock(&self.state);
        state.check()?;
        let Some(row) = state.row_mut(id) else {
            return Ok(false);
        };
        if row.reactions.contains(&reaction) {
            return Ok(false);
        }
        row.reactions.push(reaction);
        let updated = row.clone();
        state.broadcast(&PushEvent::Updated(updated));
        Ok(true)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, BackendError> {
        let mut state = lock(&self.state);
        state.check()?;
        let before = state.rows.len();
        state.rows.retain(|r| r.created_at >= cutoff);
        Ok((before - state.rows.len()) as u64)
    }

    async fn latest_version(&self) -> Result<Option<VersionInfo>, BackendError> {
        let state = lock(&self.state);
        state.check()?;
        Ok(state.versions.iter().max_by_key(|v| v.released_at).cloned())
    }

    async fn publish_version(&self, info: VersionInfo) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        state.check()?;
        state.versions.push(info);
        Ok(())
    }
}
