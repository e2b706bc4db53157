//! Session registry.
//!
//! Every connected session channel owns an outbound queue. The registry maps
//! session ids to those queues and routes frames by username.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_protocol::Frame;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// One connected session.
#[derive(Debug)]
pub struct Session {
    pub username: String,
    pub team: String,
    pub joined_at: DateTime<Utc>,
    tx: mpsc::UnboundedSender<Frame>,
}

impl Session {
    fn deliver(&self, frame: Frame) -> bool {
        self.tx.send(frame).is_ok()
    }
}

/// Registry of connected sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and return its outbound queue.
    ///
    /// Re-joining with the same id replaces the previous queue.
    pub fn join(
        &self,
        session_id: &str,
        username: &str,
        team: &str,
    ) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session {
            username: username.to_string(),
            team: team.to_string(),
            joined_at: Utc::now(),
            tx,
        };
        self.sessions.insert(session_id.to_string(), session);
        debug!(session = %session_id, user = %username, sessions = self.sessions.len(), "Session joined");
        rx
    }

    /// Remove a session.
    pub fn leave(&self, session_id: &str) -> Option<Session> {
        let (_, session) = self.sessions.remove(session_id)?;
        debug!(session = %session_id, user = %session.username, "Session left");
        Some(session)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Username of a session.
    #[must_use]
    pub fn username(&self, session_id: &str) -> Option<String> {
        self.sessions.get(session_id).map(|s| s.username.clone())
    }

    /// Username and team of a session.
    #[must_use]
    pub fn identity(&self, session_id: &str) -> Option<(String, String)> {
        self.sessions
            .get(session_id)
            .map(|s| (s.username.clone(), s.team.clone()))
    }

    /// Whether `username` has any open session.
    #[must_use]
    pub fn is_online(&self, username: &str) -> bool {
        self.sessions.iter().any(|s| s.username == username)
    }

    /// Distinct `(username, team)` pairs of connected sessions.
    #[must_use]
    pub fn users(&self) -> Vec<(String, String)> {
        let mut users: Vec<(String, String)> = Vec::new();
        for session in self.sessions.iter() {
            if !users.iter().any(|(name, _)| *name == session.username) {
                users.push((session.username.clone(), session.team.clone()));
            }
        }
        users
    }

    /// Send a frame to one session.
    pub fn send_to(&self, session_id: &str, frame: Frame) -> bool {
        self.sessions
            .get(session_id)
            .map(|s| s.deliver(frame))
            .unwrap_or(false)
    }

    /// Send a frame to every session. Returns sessions reached.
    pub fn broadcast(&self, frame: &Frame) -> usize {
        self.deliver_where(frame, |_, _| true)
    }

    /// Send a frame to every session except `session_id`.
    pub fn broadcast_except(&self, session_id: &str, frame: &Frame) -> usize {
        self.deliver_where(frame, |id, _| id != session_id)
    }

    /// Send a frame to every session of the given users.
    pub fn send_to_users(&self, usernames: &[&str], frame: &Frame) -> usize {
        self.deliver_where(frame, |_, session| {
            usernames.iter().any(|u| *u == session.username)
        })
    }

    fn deliver_where(&self, frame: &Frame, filter: impl Fn(&str, &Session) -> bool) -> usize {
        let mut delivered = 0;
        for entry in self.sessions.iter() {
            if filter(entry.key(), entry.value()) && entry.value().deliver(frame.clone()) {
                delivered += 1;
            }
        }
        trace!(frame = ?frame.frame_type(), recipients = delivered, "Routed frame");
        delivered
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            session_count: self.sessions.len(),
            user_count: self.users().len(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Connected sessions.
    pub session_count: usize,
    /// Distinct users across sessions.
    pub user_count: usize,
}
