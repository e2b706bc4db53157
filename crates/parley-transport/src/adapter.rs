//! Dual-mode backend adapter.
//!
//! An [`Adapter`] owns one backend connection. It prefers the backend's push
//! channel and falls back to polling when the channel cannot be opened,
//! is not acknowledged in time, or fails later on. The fall back is one-way;
//! a new adapter is needed to try push again.
//!
//! Both paths feed the same [`SyncCursor`], so the overlap window of the
//! poll loop never replays what the push channel already delivered.

use chrono::Utc;
use parley_protocol::{Message, PresenceEntry, Reaction};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cursor::{Observation, SyncCursor};
use crate::fallback;
use crate::presence::{Identity, PresenceTracker, VirtualParticipant};
use crate::traits::{
    Backend, BackendError, BackendKind, PresenceMeta, PushEvent, PushSubscription, StoredRow,
    VersionInfo,
};

/// Adapter connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    Disconnected,
    Connecting,
    /// Driven by the backend's change notifications.
    PushActive,
    /// Driven by the poll loop.
    PollActive,
}

impl AdapterState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::PushActive => "push_active",
            Self::PollActive => "poll_active",
        }
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing and sizing knobs for an adapter.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Delay between poll ticks.
    pub poll_interval: Duration,
    /// How far behind the cursor each poll fetch starts.
    pub overlap_window: Duration,
    /// How long to wait for the push channel to acknowledge.
    pub subscribe_timeout: Duration,
    /// Seen-id count above which old ids are pruned.
    pub seen_capacity: usize,
    /// Activity window used for presence inference.
    pub presence_window: Duration,
    /// Oldest message returned by history.
    pub history_retention: Duration,
    /// Maximum messages returned by history.
    pub history_limit: usize,
    /// Initial cursor offset, absorbs clock skew between clients.
    pub initial_lookback: Duration,
    /// Participants always listed as online.
    pub virtual_participants: Vec<VirtualParticipant>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            overlap_window: Duration::from_secs(30),
            subscribe_timeout: Duration::from_secs(10),
            seen_capacity: 1000,
            presence_window: Duration::from_secs(10 * 60),
            history_retention: Duration::from_secs(7 * 24 * 60 * 60),
            history_limit: 1000,
            initial_lookback: Duration::from_secs(60),
            virtual_participants: vec![VirtualParticipant::assistant()],
        }
    }
}

/// Receiver of adapter events.
///
/// Callbacks run on the adapter's tasks and must not block.
pub trait EventSink: Send + Sync {
    /// A message not seen before.
    fn on_message(&self, message: &Message);

    /// A known message whose read receipt or reactions changed.
    fn on_message_update(&self, message: &Message);

    /// Current online users.
    fn on_presence(&self, users: &[PresenceEntry]);

    /// Adapter moved to a new state.
    fn on_state_change(&self, _state: AdapterState) {}
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(5200))
}

pub(crate) fn sort_rows(rows: &mut [StoredRow]) {
    rows.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[derive(Default)]
struct Tasks {
    push: Option<JoinHandle<()>>,
    poll: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        if let Some(task) = self.push.take() {
            task.abort();
        }
        if let Some(task) = self.poll.take() {
            task.abort();
        }
    }
}

/// State shared between the adapter handle and its tasks.
pub(crate) struct AdapterShared {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) settings: SyncSettings,
    session_id: String,
    state: Mutex<AdapterState>,
    pub(crate) cursor: Mutex<SyncCursor>,
    /// Local users, most recent first.
    identities: Mutex<Vec<Identity>>,
    pub(crate) presence: Mutex<PresenceTracker>,
    sink: RwLock<Option<Arc<dyn EventSink>>>,
    tasks: Mutex<Tasks>,
}

impl AdapterShared {
    fn state(&self) -> AdapterState {
        *lock(&self.state)
    }

    /// Invoke the sink, if one is attached.
    pub(crate) fn emit(&self, f: impl FnOnce(&dyn EventSink)) {
        let sink = self.sink.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(sink) = sink.as_ref() {
            f(sink.as_ref());
        }
    }

    pub(crate) fn local_identities(&self) -> Vec<Identity> {
        lock(&self.identities).clone()
    }

    /// Move from one of `from` to `to`, running `on_enter` under the state
    /// lock. Returns `false` if the current state is not in `from`.
    fn transition(
        self: &Arc<Self>,
        from: &[AdapterState],
        to: AdapterState,
        on_enter: impl FnOnce(&Arc<Self>),
    ) -> bool {
        {
            let mut state = lock(&self.state);
            if !from.contains(&*state) {
                return false;
            }
            debug!(
                backend = %self.backend.kind(),
                from = state.as_str(),
                to = to.as_str(),
                "Adapter state change"
            );
            *state = to;
            on_enter(self);
        }
        self.emit(|sink| sink.on_state_change(to));
        true
    }

    /// One-way switch to polling.
    pub(crate) fn fall_back(self: &Arc<Self>, reason: &str) {
        let switched = self.transition(
            &[AdapterState::Connecting, AdapterState::PushActive],
            AdapterState::PollActive,
            |shared| {
                let handle = tokio::spawn(fallback::run_poll_loop(Arc::clone(shared)));
                if let Some(previous) = lock(&shared.tasks).poll.replace(handle) {
                    previous.abort();
                }
            },
        );
        if switched {
            warn!(backend = %self.backend.kind(), reason = %reason, "Push channel unavailable, polling");
        }
    }

    /// First acknowledgment from the push channel.
    fn acknowledge(self: &Arc<Self>) -> bool {
        let switched = self.transition(
            &[AdapterState::Connecting],
            AdapterState::PushActive,
            |shared| {
                if let Some(poll) = lock(&shared.tasks).poll.take() {
                    poll.abort();
                }
            },
        );
        if switched {
            info!(backend = %self.backend.kind(), "Push channel subscribed");
        }
        switched
    }

    /// Classify rows through the cursor and announce new and changed ones.
    pub(crate) fn deliver_rows(&self, mut rows: Vec<StoredRow>) {
        sort_rows(&mut rows);

        let mut inserted = Vec::new();
        let mut updated = Vec::new();
        {
            let mut cursor = lock(&self.cursor);
            for row in rows {
                let observation = cursor.observe(&row);
                if row.is_heartbeat() {
                    continue;
                }
                match observation {
                    Observation::New => inserted.push(row.into_message()),
                    Observation::Changed => updated.push(row.into_message()),
                    Observation::Unchanged => {}
                }
            }
            let evicted = cursor.prune();
            if evicted > 0 {
                debug!(evicted, remaining = cursor.len(), "Pruned seen ids");
            }
        }

        if inserted.is_empty() && updated.is_empty() {
            return;
        }
        self.emit(|sink| {
            for message in &inserted {
                sink.on_message(message);
            }
            for message in &updated {
                sink.on_message_update(message);
            }
        });
    }

    fn apply_channel_presence(&self, metas: &[PresenceMeta]) {
        let local = self.local_identities();
        let users = lock(&self.presence).apply_channel_state(metas, &local);
        self.emit(|sink| sink.on_presence(&users));
    }

    async fn publish_presence(&self, identity: &Identity) {
        if let Err(e) = self.backend.track_presence(identity.meta()).await {
            warn!(user = %identity.username, error = %e, "Failed to publish presence");
        }
    }

    fn stop(&self) {
        let mut state = lock(&self.state);
        *state = AdapterState::Disconnected;
        lock(&self.tasks).abort_all();
    }
}

async fn run_push(shared: Arc<AdapterShared>, mut subscription: PushSubscription) {
    let deadline = tokio::time::sleep(shared.settings.subscribe_timeout);
    tokio::pin!(deadline);
    let mut acknowledged = false;

    loop {
        let event = tokio::select! {
            event = subscription.next() => event,
            _ = &mut deadline, if !acknowledged => {
                shared.fall_back("subscription not acknowledged in time");
                return;
            }
        };

        match event {
            Some(PushEvent::Subscribed) => {
                if acknowledged {
                    continue;
                }
                acknowledged = true;
                if shared.acknowledge() {
                    for identity in shared.local_identities() {
                        shared.publish_presence(&identity).await;
                    }
                }
            }
            Some(PushEvent::Inserted(row)) | Some(PushEvent::Updated(row)) => {
                shared.deliver_rows(vec![row]);
            }
            Some(PushEvent::PresenceSync(metas)) => shared.apply_channel_presence(&metas),
            Some(PushEvent::ChannelError(reason)) => {
                shared.fall_back(&reason);
                return;
            }
            Some(PushEvent::Closed) | None => {
                shared.fall_back("push channel closed");
                return;
            }
        }
    }
}

/// A connection to one backend.
pub struct Adapter {
    shared: Arc<AdapterShared>,
}

impl Adapter {
    /// Create a disconnected adapter.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, settings: SyncSettings) -> Self {
        let start = Utc::now() - to_chrono(settings.initial_lookback);
        let cursor = SyncCursor::new(start, settings.overlap_window, settings.seen_capacity);
        let presence = PresenceTracker::new(settings.virtual_participants.clone());

        Self {
            shared: Arc::new(AdapterShared {
                backend,
                settings,
                session_id: parley_protocol::generate_message_id(),
                state: Mutex::new(AdapterState::Disconnected),
                cursor: Mutex::new(cursor),
                identities: Mutex::new(Vec::new()),
                presence: Mutex::new(presence),
                sink: RwLock::new(None),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    /// Attach the event receiver.
    pub fn set_sink(&self, sink: Arc<dyn EventSink>) {
        *self.shared.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    #[must_use]
    pub fn kind(&self) -> BackendKind {
        self.shared.backend.kind()
    }

    #[must_use]
    pub fn state(&self) -> AdapterState {
        self.shared.state()
    }

    #[must_use]
    pub fn settings(&self) -> &SyncSettings {
        &self.shared.settings
    }

    /// Connect to the backend.
    ///
    /// Verification and subscription run concurrently. A failed
    /// verification is a connection failure; a failed subscription only
    /// selects polling.
    ///
    /// # Errors
    ///
    /// Returns the verification error if the backend cannot be used.
    pub async fn connect(&self) -> Result<(), BackendError> {
        let shared = &self.shared;
        let kind = shared.backend.kind();
        shared.stop();
        shared.transition(
            &[AdapterState::Disconnected],
            AdapterState::Connecting,
            |_| {},
        );
        info!(backend = %kind, "Connecting to backend");

        let (verified, subscription) =
            tokio::join!(shared.backend.verify(), shared.backend.subscribe());

        if let Err(e) = verified {
            warn!(backend = %kind, error = %e, "Backend verification failed");
            drop(subscription);
            shared.stop();
            shared.emit(|sink| sink.on_state_change(AdapterState::Disconnected));
            return Err(e);
        }

        match subscription {
            Ok(subscription) => {
                let state = lock(&shared.state);
                if *state == AdapterState::Connecting {
                    let handle = tokio::spawn(run_push(Arc::clone(shared), subscription));
                    lock(&shared.tasks).push = Some(handle);
                }
            }
            Err(e) => shared.fall_back(&e.to_string()),
        }
        Ok(())
    }

    /// Tear down tasks and stop all callbacks.
    ///
    /// No sink callback runs after this returns.
    pub fn disconnect(&self) {
        let previous = self.state();
        self.shared
            .sink
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shared.stop();
        if previous != AdapterState::Disconnected {
            info!(backend = %self.kind(), "Adapter disconnected");
        }
    }

    /// Store a message.
    ///
    /// When the push channel is not carrying the echo, the message is also
    /// announced to the sink before returning.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the write fails.
    pub async fn send_message(&self, message: &Message) -> Result<(), BackendError> {
        if self.state() == AdapterState::Disconnected {
            return Err(BackendError::NotConnected);
        }

        self.shared
            .backend
            .insert(StoredRow::from_message(message))
            .await?;
        debug!(message_id = %message.id, backend = %self.kind(), "Message stored");

        if matches!(
            self.state(),
            AdapterState::PollActive | AdapterState::Connecting
        ) {
            let fresh = lock(&self.shared.cursor).record(message);
            if fresh {
                self.shared.emit(|sink| sink.on_message(message));
            }
        }
        Ok(())
    }

    /// Register a local user as online.
    ///
    /// Published on the push channel when it is active; the poll path lists
    /// local users on every tick.
    pub async fn track_presence(&self, username: &str, team: &str) {
        let identity = Identity::new(
            username,
            team,
            format!("{}:{}", self.shared.session_id, username),
        );
        {
            let mut identities = lock(&self.shared.identities);
            identities.retain(|i| i.username != username);
            identities.insert(0, identity.clone());
        }
        if self.state() == AdapterState::PushActive {
            self.shared.publish_presence(&identity).await;
        }
    }

    /// Remove a local user.
    pub async fn untrack_presence(&self, username: &str) {
        let removed = {
            let mut identities = lock(&self.shared.identities);
            let idx = identities.iter().position(|i| i.username == username);
            idx.map(|idx| identities.remove(idx))
        };
        let Some(identity) = removed else {
            return;
        };
        if self.state() == AdapterState::PushActive {
            if let Err(e) = self
                .shared
                .backend
                .untrack_presence(&identity.session_id)
                .await
            {
                warn!(user = %username, error = %e, "Failed to withdraw presence");
            }
            // Some backends key presence per connection, not per user.
            for identity in self.shared.local_identities() {
                self.shared.publish_presence(&identity).await;
            }
        }
    }

    /// Recent messages visible to `for_user`, oldest first.
    ///
    /// The sync cursor is left untouched, so rows not yet delivered live are
    /// still announced to every session.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the read fails.
    pub async fn get_history(&self, for_user: &str) -> Result<Vec<Message>, BackendError> {
        let settings = &self.shared.settings;
        let since = Utc::now() - to_chrono(settings.history_retention);
        let mut rows = self
            .shared
            .backend
            .latest(since, settings.history_limit)
            .await?;
        sort_rows(&mut rows);

        Ok(rows
            .into_iter()
            .filter(|row| !row.is_heartbeat())
            .map(StoredRow::into_message)
            .filter(|m| m.is_visible_to(for_user))
            .collect())
    }

    /// Set the read receipt on messages that have none.
    ///
    /// # Errors
    ///
    /// Returns the backend error, including `Unsupported`.
    pub async fn mark_read(&self, ids: &[String]) -> Result<usize, BackendError> {
        self.shared.backend.mark_read(ids, Utc::now()).await
    }

    /// Add a reaction unless the user already left the same emoji.
    ///
    /// # Errors
    ///
    /// Returns the backend error, including `Unsupported`.
    pub async fn add_reaction(
        &self,
        message_id: &str,
        reaction: Reaction,
    ) -> Result<bool, BackendError> {
        self.shared.backend.add_reaction(message_id, reaction).await
    }

    /// Delete messages older than `age`.
    ///
    /// # Errors
    ///
    /// Returns the backend error, including `Unsupported`.
    pub async fn cleanup(&self, age: Duration) -> Result<u64, BackendError> {
        let cutoff = Utc::now() - to_chrono(age);
        self.shared.backend.delete_before(cutoff).await
    }

    /// # Errors
    ///
    /// Returns the backend error, including `Unsupported`.
    pub async fn latest_version(&self) -> Result<Option<VersionInfo>, BackendError> {
        self.shared.backend.latest_version().await
    }

    /// # Errors
    ///
    /// Returns the backend error, including `Unsupported`.
    pub async fn publish_version(&self, info: VersionInfo) -> Result<(), BackendError> {
        self.shared.backend.publish_version(info).await
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("backend", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::{MemoryBackend, PushMode};
    use crate::traits::HEARTBEAT_CONTENT;
    use parley_protocol::MessageType;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub messages: Mutex<Vec<Message>>,
        pub updates: Mutex<Vec<Message>>,
        pub presence: Mutex<Vec<Vec<PresenceEntry>>>,
        pub states: Mutex<Vec<AdapterState>>,
    }

    impl RecordingSink {
        pub fn message_ids(&self) -> Vec<String> {
            lock(&self.messages).iter().map(|m| m.id.clone()).collect()
        }

        pub fn last_presence_names(&self) -> Vec<String> {
            lock(&self.presence)
                .last()
                .map(|users| users.iter().map(|u| u.username.clone()).collect())
                .unwrap_or_default()
        }
    }

    impl EventSink for RecordingSink {
        fn on_message(&self, message: &Message) {
            lock(&self.messages).push(message.clone());
        }

        fn on_message_update(&self, message: &Message) {
            lock(&self.updates).push(message.clone());
        }

        fn on_presence(&self, users: &[PresenceEntry]) {
            lock(&self.presence).push(users.to_vec());
        }

        fn on_state_change(&self, state: AdapterState) {
            lock(&self.states).push(state);
        }
    }

    pub(crate) fn adapter_with(
        backend: &Arc<MemoryBackend>,
    ) -> (Adapter, Arc<RecordingSink>) {
        let adapter = Adapter::new(
            Arc::clone(backend) as Arc<dyn Backend>,
            SyncSettings::default(),
        );
        let sink = Arc::new(RecordingSink::default());
        adapter.set_sink(Arc::clone(&sink) as Arc<dyn EventSink>);
        (adapter, sink)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn foreign(sender: &str, content: &str) -> StoredRow {
        StoredRow::from_message(&Message::new(sender, content, MessageType::Text))
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_happy_path() {
        let backend = Arc::new(MemoryBackend::new());
        let (adapter, sink) = adapter_with(&backend);

        adapter.connect().await.unwrap();
        settle().await;
        assert_eq!(adapter.state(), AdapterState::PushActive);

        let row = foreign("bob", "hello");
        backend.insert(row.clone()).await.unwrap();
        settle().await;

        assert_eq!(sink.message_ids(), vec![row.id]);
        assert_eq!(
            *lock(&sink.states),
            vec![AdapterState::Connecting, AdapterState::PushActive]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_credentials_fail_connect() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_rejecting(true);
        let (adapter, _sink) = adapter_with(&backend);

        let err = adapter.connect().await.unwrap_err();
        assert!(err.is_connection_failure());
        assert_eq!(adapter.state(), AdapterState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_starts_polling() {
        let backend = Arc::new(MemoryBackend::with_push(PushMode::Unavailable));
        let (adapter, _sink) = adapter_with(&backend);

        adapter.connect().await.unwrap();
        assert_eq!(adapter.state(), AdapterState::PollActive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_subscription_times_out() {
        let backend = Arc::new(MemoryBackend::with_push(PushMode::Silent));
        let (adapter, _sink) = adapter_with(&backend);

        adapter.connect().await.unwrap();
        settle().await;
        assert_eq!(adapter.state(), AdapterState::Connecting);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(adapter.state(), AdapterState::PollActive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degrade_keeps_dedup_state() {
        let backend = Arc::new(MemoryBackend::new());
        let (adapter, sink) = adapter_with(&backend);
        adapter.connect().await.unwrap();
        settle().await;

        let before = foreign("bob", "before");
        backend.insert(before.clone()).await.unwrap();
        settle().await;

        backend.fail_push("socket reset");
        settle().await;
        assert_eq!(adapter.state(), AdapterState::PollActive);

        let after = foreign("bob", "after");
        backend.insert(after.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(7)).await;

        // `before` is inside the overlap window but was already pushed.
        assert_eq!(sink.message_ids(), vec![before.id, after.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_self_echo_before_return() {
        let backend = Arc::new(MemoryBackend::with_push(PushMode::Unavailable));
        let (adapter, sink) = adapter_with(&backend);
        adapter.connect().await.unwrap();

        let msg = Message::new("alice", "mine", MessageType::Text);
        adapter.send_message(&msg).await.unwrap();
        assert_eq!(sink.message_ids(), vec![msg.id.clone()]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.message_ids(), vec![msg.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_mode_has_no_synthetic_echo() {
        let backend = Arc::new(MemoryBackend::new());
        let (adapter, sink) = adapter_with(&backend);
        adapter.connect().await.unwrap();
        settle().await;

        let msg = Message::new("alice", "mine", MessageType::Code)
            .with_metadata(Some(serde_json::json!({"language": "rust"})));
        adapter.send_message(&msg).await.unwrap();
        settle().await;

        let delivered = lock(&sink.messages).clone();
        assert_eq!(delivered, vec![msg]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_propagates() {
        let backend = Arc::new(MemoryBackend::with_push(PushMode::Unavailable));
        let (adapter, sink) = adapter_with(&backend);
        adapter.connect().await.unwrap();

        backend.set_unreachable(true);
        let msg = Message::new("alice", "lost", MessageType::Text);
        assert!(adapter.send_message(&msg).await.is_err());
        assert!(sink.message_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_callbacks() {
        let backend = Arc::new(MemoryBackend::with_push(PushMode::Unavailable));
        let (adapter, sink) = adapter_with(&backend);
        adapter.connect().await.unwrap();
        settle().await;

        adapter.disconnect();
        assert_eq!(adapter.state(), AdapterState::Disconnected);

        backend.insert(foreign("bob", "late")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(sink.message_ids().is_empty());

        let msg = Message::new("alice", "x", MessageType::Text);
        assert!(matches!(
            adapter.send_message(&msg).await,
            Err(BackendError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_presence_includes_local_users() {
        let backend = Arc::new(MemoryBackend::new());
        let (adapter, sink) = adapter_with(&backend);
        adapter.connect().await.unwrap();
        settle().await;

        adapter.track_presence("alice", "Data").await;
        settle().await;

        let names = sink.last_presence_names();
        assert_eq!(names, vec!["alice", "Assistant"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_untrack_keeps_other_local_users() {
        let backend = Arc::new(MemoryBackend::new());
        let (adapter, sink) = adapter_with(&backend);
        adapter.connect().await.unwrap();
        settle().await;

        adapter.track_presence("alice", "Data").await;
        adapter.track_presence("bob", "Ops").await;
        adapter.untrack_presence("alice").await;
        settle().await;

        assert_eq!(sink.last_presence_names(), vec!["bob", "Assistant"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_filters_by_visibility() {
        let backend = Arc::new(MemoryBackend::with_push(PushMode::Unavailable));
        let public = foreign("bob", "hi all");
        let private = StoredRow::from_message(
            &Message::new("bob", "for carol", MessageType::Text).with_recipient("carol"),
        );
        let mut heartbeat = foreign("bob", "");
        heartbeat.content = HEARTBEAT_CONTENT.to_string();
        for row in [&public, &private, &heartbeat] {
            backend.insert(row.clone()).await.unwrap();
        }

        let (adapter, _sink) = adapter_with(&backend);
        let history = adapter.get_history("alice").await.unwrap();
        assert_eq!(
            history.iter().map(|m| m.id.clone()).collect::<Vec<_>>(),
            vec![public.id.clone()]
        );
        assert_eq!(adapter.get_history("carol").await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_read_does_not_swallow_live_rows() {
        let backend = Arc::new(MemoryBackend::with_push(PushMode::Unavailable));
        let (adapter, sink) = adapter_with(&backend);
        adapter.connect().await.unwrap();
        settle().await;

        let private = StoredRow::from_message(
            &Message::new("carol", "psst", MessageType::Text).with_recipient("bob"),
        );
        backend.insert(private.clone()).await.unwrap();

        assert!(adapter.get_history("alice").await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(sink.message_ids(), vec![private.id]);
    }
}
