//! Local persistent store.
//!
//! Used when no backend is active. Each collection is a JSON array in its
//! own file under the data directory, rewritten in full on every change
//! (temp file, then rename) while holding the collection's lock.

use chrono::{DateTime, Utc};
use parley_protocol::{Message, Reaction};
use parley_transport::VersionInfo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem error.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Collection could not be serialized.
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Record lacks a string `id` field.
    #[error("Record has no string id")]
    MissingId,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One JSON-file collection.
#[derive(Debug)]
pub struct Collection<T> {
    path: PathBuf,
    lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned,
{
    fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(format!("{name}.json")),
            lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    /// File backing the collection.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<T>, StoreError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.path)(e)),
        };
        match serde_json::from_slice(&raw) {
            Ok(items) => Ok(items),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Corrupt collection, reading as empty");
                Ok(Vec::new())
            }
        }
    }

    async fn save(&self, items: &[T]) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(items)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await.map_err(io_error(&tmp))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(io_error(&self.path))
    }

    /// Read the whole collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub async fn read(&self) -> Result<Vec<T>, StoreError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    /// Apply `f` to the collection and write it back.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be read or written.
    pub async fn update<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> Result<R, StoreError> {
        let _guard = self.lock.lock().await;
        let mut items = self.load().await?;
        let result = f(&mut items);
        self.save(&items).await?;
        Ok(result)
    }
}

/// A known user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    #[serde(default)]
    pub team: String,
    pub last_seen: DateTime<Utc>,
}

/// Collections holding free-form application records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordCollection {
    AiSessions,
    Dashboards,
}

/// The local store.
#[derive(Debug)]
pub struct LocalStore {
    dir: PathBuf,
    max_messages: usize,
    messages: Collection<Message>,
    users: Collection<UserRecord>,
    ai_sessions: Collection<Value>,
    dashboards: Collection<Value>,
    versions: Collection<VersionInfo>,
}

impl LocalStore {
    /// Open (and create) the store under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(dir: impl AsRef<Path>, max_messages: usize) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(io_error(&dir))?;
        debug!(dir = %dir.display(), "Local store opened");

        Ok(Self {
            messages: Collection::new(&dir, "messages"),
            users: Collection::new(&dir, "users"),
            ai_sessions: Collection::new(&dir, "ai_sessions"),
            dashboards: Collection::new(&dir, "dashboards"),
            versions: Collection::new(&dir, "versions"),
            dir,
            max_messages,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append a message, evicting the oldest above `max_messages`.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be written.
    pub async fn append_message(&self, message: &Message) -> Result<(), StoreError> {
        let max = self.max_messages;
        let evicted = self
            .messages
            .update(|messages| {
                messages.push(message.clone());
                let overflow = messages.len().saturating_sub(max);
                messages.drain(..overflow);
                overflow
            })
            .await?;
        if evicted > 0 {
            debug!(evicted, "Evicted oldest local messages");
        }
        Ok(())
    }

    /// Messages visible to `user`, oldest first, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be read.
    pub async fn history_for(&self, user: &str, limit: usize) -> Result<Vec<Message>, StoreError> {
        let mut visible: Vec<Message> = self
            .messages
            .read()
            .await?
            .into_iter()
            .filter(|m| m.is_visible_to(user))
            .collect();
        visible.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let skip = visible.len().saturating_sub(limit);
        Ok(visible.split_off(skip))
    }

    /// Set `read_at` on unread messages. Returns the messages changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be written.
    pub async fn mark_read(
        &self,
        ids: &[String],
        at: DateTime<Utc>,
    ) -> Result<Vec<Message>, StoreError> {
        self.messages
            .update(|messages| {
                messages
                    .iter_mut()
                    .filter(|m| ids.contains(&m.id))
                    .filter_map(|m| m.mark_read(at).then(|| m.clone()))
                    .collect()
            })
            .await
    }

    /// Add a reaction. Returns the updated message if it was added.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be written.
    pub async fn add_reaction(
        &self,
        id: &str,
        reaction: Reaction,
    ) -> Result<Option<Message>, StoreError> {
        self.messages
            .update(|messages| {
                let message = messages.iter_mut().find(|m| m.id == id)?;
                message.add_reaction(reaction).then(|| message.clone())
            })
            .await
    }

    /// Delete messages created before `cutoff`. Returns messages deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be written.
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.messages
            .update(|messages| {
                let before = messages.len();
                messages.retain(|m| m.created_at >= cutoff);
                (before - messages.len()) as u64
            })
            .await
    }

    /// Record that `username` was seen now.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be written.
    pub async fn touch_user(&self, username: &str, team: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        self.users
            .update(|users| match users.iter_mut().find(|u| u.username == username) {
                Some(user) => {
                    user.last_seen = now;
                    if !team.is_empty() {
                        user.team = team.to_string();
                    }
                }
                None => users.push(UserRecord {
                    username: username.to_string(),
                    team: team.to_string(),
                    last_seen: now,
                }),
            })
            .await
    }

    /// All known users.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be read.
    pub async fn users(&self) -> Result<Vec<UserRecord>, StoreError> {
        self.users.read().await
    }

    /// Most recently released version.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be read.
    pub async fn latest_version(&self) -> Result<Option<VersionInfo>, StoreError> {
        let versions = self.versions.read().await?;
        Ok(versions.into_iter().max_by_key(|v| v.released_at))
    }

    /// Record a version, replacing an entry with the same version string.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be written.
    pub async fn push_version(&self, info: VersionInfo) -> Result<(), StoreError> {
        self.versions
            .update(|versions| {
                versions.retain(|v| v.version != info.version);
                versions.push(info);
            })
            .await
    }

    fn records(&self, collection: RecordCollection) -> &Collection<Value> {
        match collection {
            RecordCollection::AiSessions => &self.ai_sessions,
            RecordCollection::Dashboards => &self.dashboards,
        }
    }

    /// All records of a collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be read.
    pub async fn list_records(&self, collection: RecordCollection) -> Result<Vec<Value>, StoreError> {
        self.records(collection).read().await
    }

    /// Insert or replace a record by its `id` field.
    ///
    /// # Errors
    ///
    /// Returns `MissingId` if the record has no string `id`.
    pub async fn upsert_record(
        &self,
        collection: RecordCollection,
        record: Value,
    ) -> Result<(), StoreError> {
        let id = record["id"].as_str().ok_or(StoreError::MissingId)?.to_string();
        self.records(collection)
            .update(|records| {
                match records.iter_mut().find(|r| r["id"].as_str() == Some(id.as_str())) {
                    Some(existing) => *existing = record,
                    None => records.push(record),
                }
            })
            .await
    }

    /// Delete a record. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be written.
    pub async fn delete_record(
        &self,
        collection: RecordCollection,
        id: &str,
    ) -> Result<bool, StoreError> {
        self.records(collection)
            .update(|records| {
                let before = records.len();
                records.retain(|r| r["id"].as_str() != Some(id));
                records.len() != before
            })
            .await
    }
}
