//! Backend abstraction for Parley.
//!
//! A backend is a remote (or in-process) store with a narrow message table
//! and, optionally, a change-notification channel. The [`Adapter`] drives a
//! backend through this trait so the hub never sees backend specifics.
//!
//! [`Adapter`]: crate::adapter::Adapter

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_protocol::{envelope, Message, Reaction};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Raw content of keepalive rows written by some backends.
pub const HEARTBEAT_CONTENT: &str = "[HEARTBEAT]";

/// Available backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// No network backend: the hub uses its local store.
    #[default]
    None,
    /// Supabase-style REST table plus realtime websocket.
    Supabase,
    /// In-process loopback backend.
    Memory,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Supabase => "supabase",
            Self::Memory => "memory",
        }
    }

    /// Whether this kind needs credentials to connect.
    #[must_use]
    pub fn requires_credentials(self) -> bool {
        matches!(self, Self::Supabase)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "local" | "" => Ok(Self::None),
            "supabase" => Ok(Self::Supabase),
            "memory" => Ok(Self::Memory),
            other => Err(BackendError::Misconfigured(format!(
                "unknown backend kind '{other}'"
            ))),
        }
    }
}

/// Connection credentials for a remote backend.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Base URL of the backend project.
    pub url: String,
    /// API key sent with every request.
    pub key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.key.chars().take(5).collect();
        f.debug_struct("Credentials")
            .field("url", &self.url)
            .field("key", &format_args!("{prefix}..."))
            .finish()
    }
}

/// Backend errors.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Credentials were refused.
    #[error("Credentials rejected: {0}")]
    Rejected(String),

    /// Backend could not be reached.
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// Backend is reachable but not set up as expected.
    #[error("Backend misconfigured: {0}")]
    Misconfigured(String),

    /// Backend does not implement the operation.
    #[error("Operation not supported by backend: {0}")]
    Unsupported(&'static str),

    /// A request failed after reaching the backend.
    #[error("Request failed: {0}")]
    Request(String),

    /// Backend returned something we could not interpret.
    #[error("Invalid backend response: {0}")]
    Decode(String),

    /// No live connection.
    #[error("Not connected")]
    NotConnected,
}

impl BackendError {
    /// Whether the error means the backend cannot be used at all.
    #[must_use]
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Rejected(_) | Self::Unreachable(_) | Self::Misconfigured(_) | Self::NotConnected
        )
    }
}

/// Insert body. Only the columns every message table is known to have;
/// `read_at` and `reactions` are optional and only read when present.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NewRow<'a> {
    pub id: &'a str,
    pub sender: &'a str,
    pub content: &'a str,
    pub created_at: DateTime<Utc>,
}

/// A message row in the backend's narrow schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub id: String,
    pub sender: String,
    /// Plain text or an encoded envelope.
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub reactions: Vec<Reaction>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Reaction>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<Vec<Reaction>> = Option::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}

impl StoredRow {
    /// Flatten a message into the narrow schema.
    #[must_use]
    pub fn from_message(msg: &Message) -> Self {
        Self {
            id: msg.id.clone(),
            sender: msg.sender.clone(),
            content: envelope::encode(msg),
            created_at: msg.created_at,
            read_at: msg.read_at,
            reactions: msg.reactions.clone(),
        }
    }

    #[must_use]
    pub fn insert_body(&self) -> NewRow<'_> {
        NewRow {
            id: &self.id,
            sender: &self.sender,
            content: &self.content,
            created_at: self.created_at,
        }
    }

    /// Whether the row is a keepalive rather than a message.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.content == HEARTBEAT_CONTENT
    }

    /// Rebuild the rich message.
    #[must_use]
    pub fn into_message(self) -> Message {
        let payload = envelope::decode(&self.content);
        Message {
            id: self.id,
            sender: self.sender,
            recipient: payload.recipient,
            kind: payload.kind,
            content: payload.content,
            metadata: payload.metadata,
            created_at: self.created_at,
            read_at: self.read_at,
            reactions: self.reactions,
        }
    }
}

/// Presence state published on a backend's shared channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub user: String,
    #[serde(default)]
    pub team: String,
    #[serde(default)]
    pub user_id: String,
    pub online_at: DateTime<Utc>,
}

/// A sender seen in recent backend activity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Activity {
    pub sender: String,
    pub created_at: DateTime<Utc>,
}

/// Published application version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub download_url: String,
    pub released_at: DateTime<Utc>,
}

/// Events delivered by a push subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// Backend acknowledged the subscription.
    Subscribed,
    /// A row was inserted.
    Inserted(StoredRow),
    /// A row was updated (read receipt, reactions).
    Updated(StoredRow),
    /// Full presence state of the shared channel.
    PresenceSync(Vec<PresenceMeta>),
    /// The channel reported an error.
    ChannelError(String),
    /// The channel closed.
    Closed,
}

/// A live push subscription.
///
/// Dropping the subscription unsubscribes: the task feeding it is aborted.
#[derive(Debug)]
pub struct PushSubscription {
    events: mpsc::UnboundedReceiver<PushEvent>,
    task: Option<JoinHandle<()>>,
}

impl PushSubscription {
    /// Create a subscription reading from `events`.
    #[must_use]
    pub fn new(events: mpsc::UnboundedReceiver<PushEvent>) -> Self {
        Self { events, task: None }
    }

    /// Attach the task that feeds the subscription.
    #[must_use]
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Receive the next event. `None` once the channel is gone.
    pub async fn next(&mut self) -> Option<PushEvent> {
        self.events.recv().await
    }
}

impl Drop for PushSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A message backend.
///
/// Methods with default bodies are optional capabilities; the default
/// returns [`BackendError::Unsupported`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// The kind of this backend.
    fn kind(&self) -> BackendKind;

    /// One cheap read that fails if credentials or schema are wrong.
    async fn verify(&self) -> Result<(), BackendError>;

    /// Open the change-notification channel.
    async fn subscribe(&self) -> Result<PushSubscription, BackendError>;

    /// Publish this session's presence on the shared channel.
    async fn track_presence(&self, meta: PresenceMeta) -> Result<(), BackendError>;

    /// Withdraw presence published under `user_id`.
    async fn untrack_presence(&self, _user_id: &str) -> Result<(), BackendError> {
        Ok(())
    }

    /// Insert a row.
    async fn insert(&self, row: StoredRow) -> Result<(), BackendError>;

    /// Rows with `created_at > after`, oldest first.
    async fn fetch_since(&self, after: DateTime<Utc>) -> Result<Vec<StoredRow>, BackendError>;

    /// Senders with `created_at > since`, newest first.
    async fn recent_activity(&self, since: DateTime<Utc>) -> Result<Vec<Activity>, BackendError>;

    /// Up to `limit` rows with `created_at > since`, newest first.
    async fn latest(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredRow>, BackendError>;

    /// Set `read_at` on rows that have none. Returns rows changed.
    async fn mark_read(&self, _ids: &[String], _at: DateTime<Utc>) -> Result<usize, BackendError> {
        Err(BackendError::Unsupported("read receipts"))
    }

    /// Add a reaction unless already present. Returns whether it was added.
    async fn add_reaction(&self, _id: &str, _reaction: Reaction) -> Result<bool, BackendError> {
        Err(BackendError::Unsupported("reactions"))
    }

    /// Delete rows created before `cutoff`. Returns rows deleted.
    async fn delete_before(&self, _cutoff: DateTime<Utc>) -> Result<u64, BackendError> {
        Err(BackendError::Unsupported("cleanup"))
    }

    /// Most recently published version.
    async fn latest_version(&self) -> Result<Option<VersionInfo>, BackendError> {
        Err(BackendError::Unsupported("versions"))
    }

    /// Publish a new version record.
    async fn publish_version(&self, _info: VersionInfo) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("versions"))
    }
}
