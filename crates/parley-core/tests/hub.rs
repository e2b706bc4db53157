//! End-to-end hub behavior over the local store and the in-memory backend.

use parley_core::{BackendConfig, Hub, HubError, HubSettings};
use parley_protocol::{Frame, Message, MessageType, PresenceEntry};
use parley_transport::{
    AdapterState, Backend, BackendKind, MemoryBackend, PushMode, StoredRow,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<Message>>,
    updates: Mutex<Vec<Message>>,
    presence: Mutex<Vec<Vec<PresenceEntry>>>,
}

impl Recorder {
    fn attach(hub: &Hub) -> Arc<Self> {
        let recorder = Arc::new(Self::default());
        let r = Arc::clone(&recorder);
        hub.on_inbound_message(move |m| r.messages.lock().unwrap().push(m.clone()));
        let r = Arc::clone(&recorder);
        hub.on_message_update(move |m| r.updates.lock().unwrap().push(m.clone()));
        let r = Arc::clone(&recorder);
        hub.on_presence_change(move |users| r.presence.lock().unwrap().push(users.to_vec()));
        recorder
    }

    fn message_ids(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.id.clone())
            .collect()
    }

    fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    fn last_presence(&self) -> Vec<String> {
        self.presence
            .lock()
            .unwrap()
            .last()
            .map(|users| users.iter().map(|u| u.username.clone()).collect())
            .unwrap_or_default()
    }
}

async fn open_hub() -> (TempDir, Hub, Arc<Recorder>) {
    let dir = TempDir::new().unwrap();
    let hub = Hub::open(dir.path(), HubSettings::default()).await.unwrap();
    let recorder = Recorder::attach(&hub);
    (dir, hub, recorder)
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

fn foreign(sender: &str, content: &str) -> StoredRow {
    StoredRow::from_message(&Message::new(sender, content, MessageType::Text))
}

#[tokio::test]
async fn test_local_send_then_history() {
    let (_dir, hub, recorder) = open_hub().await;

    let m = hub
        .send("alice", "for bob", MessageType::Text, None, "bob")
        .await
        .unwrap();

    let history = hub.history("bob").await.unwrap();
    assert_eq!(history, vec![m.clone()]);
    assert!(hub.history("carol").await.unwrap().is_empty());
    assert_eq!(recorder.message_ids(), vec![m.id]);
}

#[tokio::test]
async fn test_local_mark_read_once() {
    let (_dir, hub, recorder) = open_hub().await;
    let m = hub
        .send("alice", "hi", MessageType::Text, None, "")
        .await
        .unwrap();

    assert_eq!(hub.mark_read(&[m.id.clone()]).await.unwrap(), 1);
    let first = hub.history("bob").await.unwrap()[0].read_at;
    assert!(first.is_some());

    assert_eq!(hub.mark_read(&[m.id.clone()]).await.unwrap(), 0);
    assert_eq!(hub.history("bob").await.unwrap()[0].read_at, first);
    assert_eq!(recorder.update_count(), 1);
}

#[tokio::test]
async fn test_local_end_to_end() {
    let (_dir, hub, recorder) = open_hub().await;
    let mut bob = hub.join("s-bob", "bob", "Ops").await;
    drain(&mut bob);

    let m = hub
        .send("alice", "hi", MessageType::Text, None, "ALL")
        .await
        .unwrap();
    assert!(hub.history("bob").await.unwrap().iter().any(|h| h.id == m.id));

    assert!(hub.add_reaction(&m.id, "👍", "bob").await.unwrap());
    assert!(!hub.add_reaction(&m.id, "👍", "bob").await.unwrap());

    let stored = hub.history("bob").await.unwrap();
    assert_eq!(stored[0].reactions.len(), 1);
    assert_eq!(recorder.update_count(), 1);

    let frames = drain(&mut bob);
    let reactions = frames
        .iter()
        .filter(|f| matches!(f, Frame::Reaction { .. }))
        .count();
    assert_eq!(reactions, 1);
}

#[tokio::test]
async fn test_unknown_ids_are_noops() {
    let (_dir, hub, recorder) = open_hub().await;
    assert_eq!(hub.mark_read(&["missing".to_string()]).await.unwrap(), 0);
    assert!(!hub.add_reaction("missing", "🎉", "bob").await.unwrap());
    assert_eq!(recorder.update_count(), 0);
}

#[tokio::test]
async fn test_every_handler_called_once() {
    let (_dir, hub, first) = open_hub().await;
    let second = Recorder::attach(&hub);

    let m = hub
        .send("alice", "once", MessageType::Code, None, "")
        .await
        .unwrap();

    assert_eq!(first.message_ids(), vec![m.id.clone()]);
    assert_eq!(second.message_ids(), vec![m.id]);
}

#[tokio::test]
async fn test_local_presence_follows_sessions() {
    let (_dir, hub, recorder) = open_hub().await;

    let _a = hub.join("s-1", "alice", "Data").await;
    let _b = hub.join("s-2", "bob", "Ops").await;
    assert_eq!(recorder.last_presence(), vec!["alice", "bob", "Assistant"]);

    hub.leave("s-1").await;
    assert_eq!(recorder.last_presence(), vec!["bob", "Assistant"]);

    let users = hub.store().users().await.unwrap();
    assert_eq!(users.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_push_mode_delivers_once() {
    let (_dir, hub, recorder) = open_hub().await;
    let backend = Arc::new(MemoryBackend::new());
    hub.attach(Arc::clone(&backend) as Arc<dyn Backend>)
        .await
        .unwrap();
    settle().await;
    assert_eq!(hub.status().state, AdapterState::PushActive);

    let mine = hub
        .send("alice", "pushed", MessageType::Text, None, "")
        .await
        .unwrap();
    let theirs = foreign("bob", "from elsewhere");
    backend.insert(theirs.clone()).await.unwrap();
    settle().await;

    assert_eq!(recorder.message_ids(), vec![mine.id.clone(), theirs.id]);
    assert!(hub.store().history_for("alice", 10).await.unwrap().is_empty());
    assert_eq!(backend.rows().len(), 2);

    assert_eq!(hub.mark_read(&[mine.id]).await.unwrap(), 1);
    settle().await;
    assert_eq!(recorder.update_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_push_presence_includes_self() {
    let (_dir, hub, recorder) = open_hub().await;
    let backend = Arc::new(MemoryBackend::new());
    hub.attach(Arc::clone(&backend) as Arc<dyn Backend>)
        .await
        .unwrap();
    settle().await;

    let _rx = hub.join("s-1", "alice", "Data").await;
    settle().await;

    let names = recorder.last_presence();
    assert!(names.contains(&"alice".to_string()), "{names:?}");
    assert!(names.contains(&"Assistant".to_string()), "{names:?}");
}

#[tokio::test(start_paused = true)]
async fn test_poll_mode_self_echo_and_foreign_rows() {
    let (_dir, hub, recorder) = open_hub().await;
    let backend = Arc::new(MemoryBackend::with_push(PushMode::Unavailable));
    hub.attach(Arc::clone(&backend) as Arc<dyn Backend>)
        .await
        .unwrap();
    assert_eq!(hub.status().state, AdapterState::PollActive);
    let _rx = hub.join("s-1", "alice", "Data").await;

    let mine = hub
        .send("alice", "echo", MessageType::Text, None, "")
        .await
        .unwrap();
    assert_eq!(recorder.message_ids(), vec![mine.id.clone()]);

    let theirs = foreign("bob", "polled");
    backend.insert(theirs.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;
    tokio::time::sleep(Duration::from_secs(4)).await;

    assert_eq!(recorder.message_ids(), vec![mine.id, theirs.id]);
    let names = recorder.last_presence();
    assert_eq!(names.first().map(String::as_str), Some("alice"));
    assert!(names.contains(&"bob".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_degrade_announces_status() {
    let (_dir, hub, recorder) = open_hub().await;
    let backend = Arc::new(MemoryBackend::new());
    hub.attach(Arc::clone(&backend) as Arc<dyn Backend>)
        .await
        .unwrap();
    settle().await;
    let mut alice = hub.join("s-1", "alice", "Data").await;
    settle().await;
    drain(&mut alice);

    backend.fail_push("socket reset");
    settle().await;
    assert_eq!(hub.status().state, AdapterState::PollActive);
    assert!(drain(&mut alice).contains(&Frame::backend_status("memory", "poll_active")));

    let after = foreign("bob", "after degrade");
    backend.insert(after.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(recorder.message_ids(), vec![after.id]);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_delivery() {
    let (_dir, hub, recorder) = open_hub().await;
    let backend = Arc::new(MemoryBackend::with_push(PushMode::Unavailable));
    hub.attach(Arc::clone(&backend) as Arc<dyn Backend>)
        .await
        .unwrap();

    hub.disconnect().await;
    assert_eq!(hub.status().backend, BackendKind::None);

    backend.insert(foreign("bob", "too late")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(recorder.message_ids().is_empty());

    let local = hub
        .send("alice", "local again", MessageType::Text, None, "")
        .await
        .unwrap();
    assert_eq!(hub.history("alice").await.unwrap(), vec![local]);
}

#[tokio::test]
async fn test_failed_attach_stays_local() {
    let (_dir, hub, _recorder) = open_hub().await;
    let backend = Arc::new(MemoryBackend::new());
    backend.set_unreachable(true);

    let err = hub
        .attach(Arc::clone(&backend) as Arc<dyn Backend>)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Connection(_)));
    assert_eq!(hub.status().backend, BackendKind::None);

    hub.send("alice", "still works", MessageType::Text, None, "")
        .await
        .unwrap();
    assert_eq!(hub.store().history_for("alice", 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_switch_backend_persists_choice() {
    let dir = TempDir::new().unwrap();
    {
        let hub = Hub::open(dir.path(), HubSettings::default()).await.unwrap();
        hub.switch_backend(BackendKind::Memory).await.unwrap();
        assert_eq!(hub.status().backend, BackendKind::Memory);

        let err = hub.switch_backend(BackendKind::Supabase).await.unwrap_err();
        assert!(matches!(err, HubError::MissingCredentials(BackendKind::Supabase)));
        assert_eq!(hub.status().backend, BackendKind::None);

        hub.switch_backend(BackendKind::Memory).await.unwrap();
    }

    let hub = Hub::open(dir.path(), HubSettings::default()).await.unwrap();
    assert_eq!(hub.status().backend, BackendKind::Memory);
    assert_eq!(
        hub.config().await,
        BackendConfig {
            active_backend: BackendKind::Memory,
            supabase: None,
        }
    );
}

#[tokio::test]
async fn test_versions_local_and_backend() {
    let (_dir, hub, _recorder) = open_hub().await;
    assert!(hub.latest_version().await.unwrap().is_none());
    hub.publish_version("1.0.0", "first", "https://example.com/1.0.0")
        .await
        .unwrap();
    assert_eq!(hub.latest_version().await.unwrap().unwrap().version, "1.0.0");

    let backend = Arc::new(MemoryBackend::new());
    hub.attach(Arc::clone(&backend) as Arc<dyn Backend>)
        .await
        .unwrap();
    assert!(hub.latest_version().await.unwrap().is_none());
    hub.publish_version("2.0.0", "second", "").await.unwrap();
    assert_eq!(backend.latest_version().await.unwrap().unwrap().version, "2.0.0");
}

#[tokio::test]
async fn test_cleanup_local() {
    let (_dir, hub, _recorder) = open_hub().await;
    let mut old = Message::new("alice", "ancient", MessageType::Text);
    old.created_at = chrono::Utc::now() - chrono::Duration::days(30);
    hub.store().append_message(&old).await.unwrap();
    hub.send("alice", "fresh", MessageType::Text, None, "")
        .await
        .unwrap();

    assert_eq!(hub.cleanup(7).await.unwrap(), 1);
    assert_eq!(hub.history("alice").await.unwrap().len(), 1);
}
