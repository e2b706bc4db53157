//! The message hub.
//!
//! Owns the active backend adapter, the local store and the session
//! registry. Every message, update and presence change reaches the
//! registered handlers and the connected sessions exactly once, whether it
//! came from the push channel, the poll loop or a local write.

use chrono::Utc;
use parley_protocol::{Frame, Message, MessageType, PresenceEntry, Reaction};
use parley_transport::{
    build_backend, Adapter, AdapterState, Backend, BackendError, BackendKind, Credentials,
    EventSink, PresenceTracker, SyncSettings, VersionInfo,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::{BackendConfig, ConfigError, ConfigStore};
use crate::registry::SessionRegistry;
use crate::store::{LocalStore, StoreError};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The backend could not be activated.
    #[error("Failed to connect to backend: {0}")]
    Connection(#[source] BackendError),

    /// The backend refused a message.
    #[error("Failed to send message: {0}")]
    Send(#[source] BackendError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The backend needs credentials and none are configured.
    #[error("No credentials configured for backend {0}")]
    MissingCredentials(BackendKind),
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Adapter timing and sizing.
    pub sync: SyncSettings,
    /// Messages kept by the local store.
    pub max_messages: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            sync: SyncSettings::default(),
            max_messages: 5000,
        }
    }
}

/// Active backend and adapter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStatus {
    pub backend: BackendKind,
    pub state: AdapterState,
}

pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;
pub type PresenceHandler = Arc<dyn Fn(&[PresenceEntry]) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn snapshot<T: Clone>(handlers: &RwLock<Vec<T>>) -> Vec<T> {
    handlers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

struct HubInner {
    settings: HubSettings,
    store: LocalStore,
    config_store: ConfigStore,
    config: tokio::sync::Mutex<BackendConfig>,
    switch_lock: tokio::sync::Mutex<()>,
    adapter: RwLock<Option<Arc<Adapter>>>,
    sessions: SessionRegistry,
    local_presence: Mutex<PresenceTracker>,
    message_handlers: RwLock<Vec<MessageHandler>>,
    update_handlers: RwLock<Vec<MessageHandler>>,
    presence_handlers: RwLock<Vec<PresenceHandler>>,
}

impl HubInner {
    fn adapter(&self) -> Option<Arc<Adapter>> {
        self.adapter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn status(&self) -> HubStatus {
        match self.adapter() {
            Some(adapter) => HubStatus {
                backend: adapter.kind(),
                state: adapter.state(),
            },
            None => HubStatus {
                backend: BackendKind::None,
                state: AdapterState::Disconnected,
            },
        }
    }

    fn dispatch_message(&self, message: &Message) {
        for handler in snapshot(&self.message_handlers) {
            handler(message);
        }

        let frame = Frame::delivered(message.clone());
        let reached = self.route(message, &frame);
        trace!(message_id = %message.id, sessions = reached, "Dispatched message");

        if message.kind == MessageType::SharedItem {
            let metadata = message.metadata.as_ref();
            let item_type = metadata
                .and_then(|m| m.get("itemType"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let item_data = metadata
                .and_then(|m| m.get("itemData"))
                .cloned()
                .unwrap_or(Value::Null);
            let frame = Frame::SharedItemReceived {
                message_id: message.id.clone(),
                sender: message.sender.clone(),
                recipient: message.recipient.clone(),
                item_type,
                item_data,
            };
            if message.is_broadcast() {
                self.sessions.broadcast(&frame);
            } else {
                self.sessions
                    .send_to_users(&[message.recipient.as_str()], &frame);
            }
        }
    }

    fn dispatch_update(&self, message: &Message) {
        for handler in snapshot(&self.update_handlers) {
            handler(message);
        }
        self.route(message, &Frame::message_update(message.clone()));
    }

    fn dispatch_presence(&self, users: &[PresenceEntry]) {
        for handler in snapshot(&self.presence_handlers) {
            handler(users);
        }
        self.sessions.broadcast(&Frame::users_update(users.to_vec()));
    }

    /// Deliver to every session that may see `message`.
    fn route(&self, message: &Message, frame: &Frame) -> usize {
        if message.is_broadcast() {
            self.sessions.broadcast(frame)
        } else {
            self.sessions.send_to_users(
                &[message.recipient.as_str(), message.sender.as_str()],
                frame,
            )
        }
    }

    fn emit_local_presence(&self) {
        let users = lock(&self.local_presence).snapshot();
        self.dispatch_presence(&users);
    }

    fn broadcast_status(&self, status: HubStatus) {
        self.sessions.broadcast(&Frame::backend_status(
            status.backend.as_str(),
            status.state.as_str(),
        ));
    }
}

/// Routes adapter events into the hub.
struct HubSink {
    inner: Weak<HubInner>,
    kind: BackendKind,
}

impl EventSink for HubSink {
    fn on_message(&self, message: &Message) {
        if let Some(inner) = self.inner.upgrade() {
            inner.dispatch_message(message);
        }
    }

    fn on_message_update(&self, message: &Message) {
        if let Some(inner) = self.inner.upgrade() {
            inner.dispatch_update(message);
        }
    }

    fn on_presence(&self, users: &[PresenceEntry]) {
        if let Some(inner) = self.inner.upgrade() {
            inner.dispatch_presence(users);
        }
    }

    fn on_state_change(&self, state: AdapterState) {
        debug!(backend = %self.kind, state = state.as_str(), "Adapter state changed");
        if let Some(inner) = self.inner.upgrade() {
            inner.broadcast_status(HubStatus {
                backend: self.kind,
                state,
            });
        }
    }
}

/// The message hub.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Open the hub over `data_dir` and activate the configured backend.
    ///
    /// A backend that fails to connect is logged and the hub runs on the
    /// local store.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store cannot be opened.
    pub async fn open(data_dir: impl AsRef<Path>, settings: HubSettings) -> Result<Self, HubError> {
        let data_dir = data_dir.as_ref();
        let store = LocalStore::open(data_dir, settings.max_messages).await?;
        let config_store = ConfigStore::new(data_dir);
        let config = match config_store.load().await {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable backend config");
                BackendConfig::default()
            }
        };

        let local_presence = PresenceTracker::new(settings.sync.virtual_participants.clone());
        let hub = Self {
            inner: Arc::new(HubInner {
                settings,
                store,
                config_store,
                config: tokio::sync::Mutex::new(config.clone()),
                switch_lock: tokio::sync::Mutex::new(()),
                adapter: RwLock::new(None),
                sessions: SessionRegistry::new(),
                local_presence: Mutex::new(local_presence),
                message_handlers: RwLock::new(Vec::new()),
                update_handlers: RwLock::new(Vec::new()),
                presence_handlers: RwLock::new(Vec::new()),
            }),
        };

        let kind = config.active_backend;
        if kind != BackendKind::None {
            if let Err(e) = hub.configure(kind, config.credentials(kind).cloned()).await {
                warn!(backend = %kind, error = %e, "Backend unavailable, using local store");
            }
        }
        Ok(hub)
    }

    /// Activate `kind`, replacing the current adapter.
    ///
    /// # Errors
    ///
    /// Returns `Connection` if the backend cannot be reached; the hub is
    /// then on the local store.
    pub async fn configure(
        &self,
        kind: BackendKind,
        credentials: Option<Credentials>,
    ) -> Result<(), HubError> {
        let _guard = self.inner.switch_lock.lock().await;
        self.teardown();

        if kind.requires_credentials() && credentials.is_none() {
            self.fall_back_to_local().await;
            return Err(HubError::MissingCredentials(kind));
        }

        match build_backend(kind, credentials.as_ref()) {
            Ok(Some(backend)) => self.activate(backend).await,
            Ok(None) => {
                self.fall_back_to_local().await;
                info!("Using local store");
                Ok(())
            }
            Err(e) => {
                self.fall_back_to_local().await;
                Err(HubError::Connection(e))
            }
        }
    }

    /// Activate an already constructed backend.
    ///
    /// # Errors
    ///
    /// Returns `Connection` if the backend cannot be reached.
    pub async fn attach(&self, backend: Arc<dyn Backend>) -> Result<(), HubError> {
        let _guard = self.inner.switch_lock.lock().await;
        self.teardown();
        self.activate(backend).await
    }

    async fn activate(&self, backend: Arc<dyn Backend>) -> Result<(), HubError> {
        let kind = backend.kind();
        let adapter = Arc::new(Adapter::new(backend, self.inner.settings.sync.clone()));
        adapter.set_sink(Arc::new(HubSink {
            inner: Arc::downgrade(&self.inner),
            kind,
        }));
        for (username, team) in self.inner.sessions.users() {
            adapter.track_presence(&username, &team).await;
        }

        match adapter.connect().await {
            Ok(()) => {
                self.inner.config.lock().await.active_backend = kind;
                *self
                    .inner
                    .adapter
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(adapter);
                info!(backend = %kind, "Backend active");
                Ok(())
            }
            Err(e) => {
                adapter.disconnect();
                warn!(backend = %kind, error = %e, "Backend connection failed");
                self.fall_back_to_local().await;
                Err(HubError::Connection(e))
            }
        }
    }

    fn teardown(&self) {
        let previous = self
            .inner
            .adapter
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(adapter) = previous {
            adapter.disconnect();
        }
    }

    async fn fall_back_to_local(&self) {
        self.inner.config.lock().await.active_backend = BackendKind::None;
        self.inner.broadcast_status(self.inner.status());
        self.inner.emit_local_presence();
    }

    /// Persist `kind` as the active backend and activate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the choice cannot be saved or the backend cannot
    /// be activated.
    pub async fn switch_backend(&self, kind: BackendKind) -> Result<(), HubError> {
        let credentials = {
            let mut config = self.inner.config.lock().await;
            config.active_backend = kind;
            self.inner.config_store.save(&config).await?;
            config.credentials(kind).cloned()
        };
        info!(backend = %kind, "Switching backend");
        self.configure(kind, credentials).await
    }

    /// Persist credentials for `kind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be saved.
    pub async fn set_credentials(
        &self,
        kind: BackendKind,
        credentials: Credentials,
    ) -> Result<(), HubError> {
        let mut config = self.inner.config.lock().await;
        config.set_credentials(kind, credentials);
        self.inner.config_store.save(&config).await?;
        Ok(())
    }

    /// Current config record.
    pub async fn config(&self) -> BackendConfig {
        self.inner.config.lock().await.clone()
    }

    /// Tear down the active adapter. No handler runs for it afterwards.
    pub async fn disconnect(&self) {
        let _guard = self.inner.switch_lock.lock().await;
        self.teardown();
        self.inner.config.lock().await.active_backend = BackendKind::None;
        self.inner.broadcast_status(self.inner.status());
    }

    #[must_use]
    pub fn status(&self) -> HubStatus {
        self.inner.status()
    }

    #[must_use]
    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    #[must_use]
    pub fn settings(&self) -> &HubSettings {
        &self.inner.settings
    }

    /// Send a message. An empty recipient means everyone.
    ///
    /// # Errors
    ///
    /// Returns `Send` if the backend refuses the message, or a store error
    /// on the local path.
    pub async fn send(
        &self,
        sender: &str,
        content: &str,
        kind: MessageType,
        metadata: Option<Value>,
        recipient: &str,
    ) -> Result<Message, HubError> {
        let message = Message::new(sender, content, kind)
            .with_metadata(metadata.filter(|m| !m.is_null()))
            .with_recipient(recipient);

        match self.inner.adapter() {
            Some(adapter) => adapter
                .send_message(&message)
                .await
                .map_err(HubError::Send)?,
            None => {
                self.inner.store.append_message(&message).await?;
                self.inner.dispatch_message(&message);
            }
        }
        debug!(message_id = %message.id, sender = %sender, kind = message.kind.as_str(), "Message sent");
        Ok(message)
    }

    /// Share an application object.
    ///
    /// # Errors
    ///
    /// Same as [`Hub::send`].
    pub async fn share_item(
        &self,
        sender: &str,
        recipient: &str,
        item_type: &str,
        item_data: Value,
    ) -> Result<Message, HubError> {
        let metadata = json!({ "itemType": item_type, "itemData": item_data });
        self.send(
            sender,
            &format!("Shared a {item_type}"),
            MessageType::SharedItem,
            Some(metadata),
            recipient,
        )
        .await
    }

    /// Messages visible to `for_user`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns the backend or store error.
    pub async fn history(&self, for_user: &str) -> Result<Vec<Message>, HubError> {
        match self.inner.adapter() {
            Some(adapter) => Ok(adapter.get_history(for_user).await?),
            None => Ok(self
                .inner
                .store
                .history_for(for_user, self.inner.settings.sync.history_limit)
                .await?),
        }
    }

    /// Mark messages read. Returns how many changed.
    ///
    /// # Errors
    ///
    /// Returns the backend or store error.
    pub async fn mark_read(&self, ids: &[String]) -> Result<usize, HubError> {
        if ids.is_empty() {
            return Ok(0);
        }
        match self.inner.adapter() {
            Some(adapter) => match adapter.mark_read(ids).await {
                Ok(changed) => Ok(changed),
                Err(BackendError::Unsupported(op)) => {
                    debug!(backend = %adapter.kind(), op, "Read receipts not supported");
                    Ok(0)
                }
                Err(e) => Err(e.into()),
            },
            None => {
                let changed = self.inner.store.mark_read(ids, Utc::now()).await?;
                for message in &changed {
                    self.inner.dispatch_update(message);
                }
                Ok(changed.len())
            }
        }
    }

    /// Add a reaction. Returns whether it was new.
    ///
    /// In local mode the `reaction` frame goes only to sessions that may see
    /// the message. With a backend, the change arrives as `message_update`
    /// through the sync path.
    ///
    /// # Errors
    ///
    /// Returns the backend or store error.
    pub async fn add_reaction(
        &self,
        message_id: &str,
        emoji: &str,
        username: &str,
    ) -> Result<bool, HubError> {
        let reaction = Reaction::new(emoji, username);
        let added = match self.inner.adapter() {
            Some(adapter) => match adapter.add_reaction(message_id, reaction).await {
                Ok(added) => added,
                Err(BackendError::Unsupported(op)) => {
                    debug!(backend = %adapter.kind(), op, "Reactions not supported");
                    false
                }
                Err(e) => return Err(e.into()),
            },
            None => match self.inner.store.add_reaction(message_id, reaction).await? {
                Some(message) => {
                    self.inner.dispatch_update(&message);
                    self.inner.route(
                        &message,
                        &Frame::Reaction {
                            message_id: message.id.clone(),
                            emoji: emoji.to_string(),
                            username: username.to_string(),
                        },
                    );
                    true
                }
                None => false,
            },
        };
        Ok(added)
    }

    /// Register a handler for new messages.
    pub fn on_inbound_message(&self, handler: impl Fn(&Message) + Send + Sync + 'static) {
        self.inner
            .message_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Register a handler for message updates.
    pub fn on_message_update(&self, handler: impl Fn(&Message) + Send + Sync + 'static) {
        self.inner
            .update_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Register a handler for presence changes.
    pub fn on_presence_change(
        &self,
        handler: impl Fn(&[PresenceEntry]) + Send + Sync + 'static,
    ) {
        self.inner
            .presence_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Register a session and return its outbound queue.
    pub async fn join(
        &self,
        session_id: &str,
        username: &str,
        team: &str,
    ) -> mpsc::UnboundedReceiver<Frame> {
        let rx = self.inner.sessions.join(session_id, username, team);
        let status = self.inner.status();
        self.inner.sessions.send_to(
            session_id,
            Frame::backend_status(status.backend.as_str(), status.state.as_str()),
        );

        if let Err(e) = self.inner.store.touch_user(username, team).await {
            warn!(user = %username, error = %e, "Failed to record user");
        }
        lock(&self.inner.local_presence).join(PresenceEntry::new(username, team, session_id));

        match self.inner.adapter() {
            Some(adapter) => adapter.track_presence(username, team).await,
            None => self.inner.emit_local_presence(),
        }
        rx
    }

    /// Remove a session.
    pub async fn leave(&self, session_id: &str) {
        let Some(session) = self.inner.sessions.leave(session_id) else {
            return;
        };
        lock(&self.inner.local_presence).leave(session_id);

        match self.inner.adapter() {
            Some(adapter) => {
                if !self.inner.sessions.is_online(&session.username) {
                    adapter.untrack_presence(&session.username).await;
                }
            }
            None => self.inner.emit_local_presence(),
        }
    }

    /// Record activity on a session.
    ///
    /// A session dropped by [`prune_idle`](Self::prune_idle) is listed again.
    pub fn touch(&self, session_id: &str) {
        if lock(&self.inner.local_presence).touch(session_id) {
            return;
        }
        let Some((username, team)) = self.inner.sessions.identity(session_id) else {
            return;
        };
        lock(&self.inner.local_presence).join(PresenceEntry::new(username, team, session_id));
        if self.inner.adapter().is_none() {
            self.inner.emit_local_presence();
        }
    }

    /// Drop sessions idle for longer than `timeout` from local presence.
    ///
    /// Their channels stay open. Returns the evicted session ids.
    pub fn prune_idle(&self, timeout: Duration) -> Vec<String> {
        let evicted = lock(&self.inner.local_presence).prune_stale(timeout);
        if !evicted.is_empty() && self.inner.adapter().is_none() {
            self.inner.emit_local_presence();
        }
        evicted
    }

    /// Relay a typing indicator to every other session.
    pub fn relay_typing(&self, session_id: &str, username: &str, active: bool) {
        self.inner.sessions.broadcast_except(
            session_id,
            &Frame::Typing {
                username: username.to_string(),
                active,
            },
        );
    }

    /// Most recently published version.
    ///
    /// # Errors
    ///
    /// Returns the backend or store error.
    pub async fn latest_version(&self) -> Result<Option<VersionInfo>, HubError> {
        if let Some(adapter) = self.inner.adapter() {
            match adapter.latest_version().await {
                Err(BackendError::Unsupported(_)) => {}
                other => return Ok(other?),
            }
        }
        Ok(self.inner.store.latest_version().await?)
    }

    /// Publish version metadata.
    ///
    /// # Errors
    ///
    /// Returns the backend or store error.
    pub async fn publish_version(
        &self,
        version: &str,
        notes: &str,
        download_url: &str,
    ) -> Result<VersionInfo, HubError> {
        let info = VersionInfo {
            version: version.to_string(),
            notes: notes.to_string(),
            download_url: download_url.to_string(),
            released_at: Utc::now(),
        };
        if let Some(adapter) = self.inner.adapter() {
            match adapter.publish_version(info.clone()).await {
                Ok(()) => return Ok(info),
                Err(BackendError::Unsupported(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.inner.store.push_version(info.clone()).await?;
        Ok(info)
    }

    /// Delete messages older than `days`. Returns messages deleted.
    ///
    /// # Errors
    ///
    /// Returns the backend or store error.
    pub async fn cleanup(&self, days: u32) -> Result<u64, HubError> {
        let age = Duration::from_secs(u64::from(days) * 24 * 60 * 60);
        let deleted = match self.inner.adapter() {
            Some(adapter) => match adapter.cleanup(age).await {
                Ok(deleted) => deleted,
                Err(BackendError::Unsupported(op)) => {
                    debug!(backend = %adapter.kind(), op, "Cleanup not supported");
                    0
                }
                Err(e) => return Err(e.into()),
            },
            None => {
                let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
                self.inner.store.prune_before(cutoff).await?
            }
        };
        info!(days, deleted, "Old messages cleaned up");
        Ok(deleted)
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("status", &self.status())
            .field("sessions", &self.inner.sessions.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn local_hub() -> (TempDir, Hub) {
        let dir = TempDir::new().unwrap();
        let hub = Hub::open(dir.path(), HubSettings::default()).await.unwrap();
        (dir, hub)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn delivered_ids(frames: &[Frame]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Message(parley_protocol::frames::MessageFrame::Delivered { message }) => {
                    Some(message.id.clone())
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_private_routing() {
        let (_dir, hub) = local_hub().await;
        let mut alice = hub.join("s-1", "alice", "Data").await;
        let mut bob = hub.join("s-2", "bob", "Ops").await;
        let mut carol = hub.join("s-3", "carol", "Ops").await;
        drain(&mut alice);
        drain(&mut bob);
        drain(&mut carol);

        let m = hub
            .send("alice", "psst", MessageType::Text, None, "bob")
            .await
            .unwrap();

        assert_eq!(delivered_ids(&drain(&mut alice)), vec![m.id.clone()]);
        assert_eq!(delivered_ids(&drain(&mut bob)), vec![m.id.clone()]);
        assert!(delivered_ids(&drain(&mut carol)).is_empty());
    }

    #[tokio::test]
    async fn test_reaction_on_private_message_stays_private() {
        let (_dir, hub) = local_hub().await;
        let mut bob = hub.join("s-2", "bob", "Ops").await;
        let mut carol = hub.join("s-3", "carol", "Ops").await;

        let m = hub
            .send("alice", "psst", MessageType::Text, None, "bob")
            .await
            .unwrap();
        drain(&mut bob);
        drain(&mut carol);

        assert!(hub.add_reaction(&m.id, "👍", "bob").await.unwrap());

        let frames = drain(&mut bob);
        assert!(frames.contains(&Frame::Reaction {
            message_id: m.id.clone(),
            emoji: "👍".to_string(),
            username: "bob".to_string(),
        }));
        assert!(drain(&mut carol).is_empty());
    }

    #[tokio::test]
    async fn test_shared_item_notifies_recipient() {
        let (_dir, hub) = local_hub().await;
        let mut bob = hub.join("s-2", "bob", "Ops").await;
        drain(&mut bob);

        let m = hub
            .share_item("alice", "bob", "dashboard", json!({"id": "d1"}))
            .await
            .unwrap();
        assert_eq!(m.content, "Shared a dashboard");

        let frames = drain(&mut bob);
        assert!(frames.iter().any(|f| matches!(
            f,
            Frame::SharedItemReceived { message_id, item_type, item_data, .. }
                if *message_id == m.id && item_type == "dashboard" && item_data["id"] == "d1"
        )));
    }

    #[tokio::test]
    async fn test_join_announces_status_and_presence() {
        let (_dir, hub) = local_hub().await;
        let mut alice = hub.join("s-1", "alice", "Data").await;

        let frames = drain(&mut alice);
        assert_eq!(frames[0], Frame::backend_status("none", "disconnected"));
        let Some(Frame::UsersUpdate { users }) = frames.last() else {
            panic!("expected users_update, got {frames:?}");
        };
        let names: Vec<_> = users.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["alice", "Assistant"]);
    }

    #[tokio::test]
    async fn test_idle_session_leaves_presence_until_active() {
        let (_dir, hub) = local_hub().await;
        let mut alice = hub.join("s-1", "alice", "Data").await;
        let _bob = hub.join("s-2", "bob", "Ops").await;
        drain(&mut alice);

        std::thread::sleep(Duration::from_millis(20));
        hub.touch("s-2");
        assert_eq!(hub.prune_idle(Duration::from_millis(10)), vec!["s-1".to_string()]);

        let listed = |frames: Vec<Frame>| -> Vec<String> {
            match frames.last() {
                Some(Frame::UsersUpdate { users }) => {
                    users.iter().map(|u| u.username.clone()).collect()
                }
                other => panic!("expected users_update, got {other:?}"),
            }
        };
        assert_eq!(listed(drain(&mut alice)), vec!["bob", "Assistant"]);

        hub.touch("s-1");
        assert_eq!(listed(drain(&mut alice)), vec!["bob", "alice", "Assistant"]);
        assert!(hub.prune_idle(Duration::from_secs(60)).is_empty());
    }

    #[tokio::test]
    async fn test_typing_skips_sender() {
        let (_dir, hub) = local_hub().await;
        let mut alice = hub.join("s-1", "alice", "Data").await;
        let mut bob = hub.join("s-2", "bob", "Ops").await;
        drain(&mut alice);
        drain(&mut bob);

        hub.relay_typing("s-1", "alice", true);
        assert!(drain(&mut alice).is_empty());
        assert_eq!(
            drain(&mut bob),
            vec![Frame::Typing {
                username: "alice".into(),
                active: true
            }]
        );
    }

    #[tokio::test]
    async fn test_null_metadata_dropped() {
        let (_dir, hub) = local_hub().await;
        let m = hub
            .send("alice", "hi", MessageType::Text, Some(Value::Null), "")
            .await
            .unwrap();
        assert!(m.metadata.is_none());
        assert!(m.is_broadcast());
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let (_dir, hub) = local_hub().await;
        let err = hub.configure(BackendKind::Supabase, None).await.unwrap_err();
        assert!(matches!(err, HubError::MissingCredentials(BackendKind::Supabase)));
        assert_eq!(hub.status().backend, BackendKind::None);
    }
}
