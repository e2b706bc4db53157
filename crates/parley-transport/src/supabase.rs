//! Supabase-style backend.
//!
//! Rows live in a PostgREST table reached with `reqwest`. Change
//! notifications and presence come from the realtime websocket, which speaks
//! the Phoenix channel protocol over `tokio-tungstenite`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::{Sink, SinkExt, StreamExt};
use parley_protocol::Reaction;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::adapter::lock;
use crate::traits::{
    Activity, Backend, BackendError, BackendKind, Credentials, PresenceMeta, PushEvent,
    PushSubscription, StoredRow, VersionInfo,
};

const MESSAGES_TABLE: &str = "messages";
const VERSIONS_TABLE: &str = "app_versions";
const CHANNEL_TOPIC: &str = "realtime:room_global";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn request_error(err: reqwest::Error) -> BackendError {
    if err.is_connect() || err.is_timeout() {
        BackendError::Unreachable(err.to_string())
    } else {
        BackendError::Request(err.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Rejected(body),
        StatusCode::NOT_FOUND => BackendError::Misconfigured(body),
        _ => BackendError::Request(format!("{status}: {body}")),
    })
}

async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, BackendError> {
    response
        .json()
        .await
        .map_err(|e| BackendError::Decode(e.to_string()))
}

/// Realtime endpoint for a project URL.
fn realtime_url(base: &str, key: &str) -> Result<String, BackendError> {
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(BackendError::Misconfigured(format!(
            "url must start with http:// or https://, got '{base}'"
        )));
    };
    Ok(format!(
        "{ws_base}/realtime/v1/websocket?apikey={key}&vsn=1.0.0"
    ))
}

#[derive(Debug, Deserialize)]
struct ReactionsRow {
    #[serde(default)]
    reactions: Option<Vec<Reaction>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VersionRow {
    version: String,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    download_url: Option<String>,
    release_date: DateTime<Utc>,
}

impl From<VersionRow> for VersionInfo {
    fn from(row: VersionRow) -> Self {
        Self {
            version: row.version,
            notes: row.notes.unwrap_or_default(),
            download_url: row.download_url.unwrap_or_default(),
            released_at: row.release_date,
        }
    }
}

#[derive(Debug)]
enum PresenceCommand {
    Track(PresenceMeta),
    Untrack,
}

/// Supabase REST + realtime backend.
pub struct SupabaseBackend {
    http: reqwest::Client,
    rest_url: String,
    realtime_url: String,
    key: String,
    commands: Mutex<Option<mpsc::UnboundedSender<PresenceCommand>>>,
}

impl SupabaseBackend {
    /// Create a backend for the given project.
    ///
    /// # Errors
    ///
    /// Returns `Misconfigured` for a missing key or a malformed URL.
    pub fn new(credentials: &Credentials) -> Result<Self, BackendError> {
        let base = credentials.url.trim().trim_end_matches('/');
        if base.is_empty() || credentials.key.is_empty() {
            return Err(BackendError::Misconfigured(
                "url and key are required".into(),
            ));
        }
        let realtime_url = realtime_url(base, &credentials.key)?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Misconfigured(e.to_string()))?;

        Ok(Self {
            http,
            rest_url: format!("{base}/rest/v1"),
            realtime_url,
            key: credentials.key.clone(),
            commands: Mutex::new(None),
        })
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.rest_url, table))
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        let response = request.send().await.map_err(request_error)?;
        check_status(response).await
    }

    async fn select_rows(&self, query: &[(&str, String)]) -> Result<Vec<StoredRow>, BackendError> {
        let request = self.request(Method::GET, MESSAGES_TABLE).query(query);
        read_json(self.send(request).await?).await
    }

    fn command(&self, command: PresenceCommand) -> Result<(), BackendError> {
        let commands = lock(&self.commands);
        let tx = commands.as_ref().ok_or(BackendError::NotConnected)?;
        tx.send(command).map_err(|_| BackendError::NotConnected)
    }
}

#[async_trait]
impl Backend for SupabaseBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Supabase
    }

    async fn verify(&self) -> Result<(), BackendError> {
        let request = self
            .request(Method::GET, MESSAGES_TABLE)
            .query(&[("select", "id"), ("limit", "1")]);
        self.send(request).await?;
        debug!(url = %self.rest_url, "Supabase table reachable");
        Ok(())
    }

    async fn subscribe(&self) -> Result<PushSubscription, BackendError> {
        let (socket, _) = tokio_tungstenite::connect_async(self.realtime_url.as_str())
            .await
            .map_err(|e| BackendError::Unreachable(format!("realtime: {e}")))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        *lock(&self.commands) = Some(commands_tx);

        let channel = ChannelState::new(CHANNEL_TOPIC, "1");
        let join = channel.join_message(&self.key);
        let task = tokio::spawn(async move {
            let (write, read) = socket.split();
            run_channel(write, read, channel, join, events_tx, commands_rx).await;
        });
        info!(topic = CHANNEL_TOPIC, "Realtime channel opening");
        Ok(PushSubscription::new(events_rx).with_task(task))
    }

    async fn track_presence(&self, meta: PresenceMeta) -> Result<(), BackendError> {
        self.command(PresenceCommand::Track(meta))
    }

    async fn untrack_presence(&self, _user_id: &str) -> Result<(), BackendError> {
        self.command(PresenceCommand::Untrack)
    }

    async fn insert(&self, row: StoredRow) -> Result<(), BackendError> {
        let request = self
            .request(Method::POST, MESSAGES_TABLE)
            .header("Prefer", "return=minimal")
            .json(&row.insert_body());
        self.send(request).await?;
        Ok(())
    }

    async fn fetch_since(&self, after: DateTime<Utc>) -> Result<Vec<StoredRow>, BackendError> {
        self.select_rows(&[
            ("select", "*".to_string()),
            ("created_at", format!("gt.{}", timestamp(after))),
            ("order", "created_at.asc".to_string()),
        ])
        .await
    }

    async fn recent_activity(&self, since: DateTime<Utc>) -> Result<Vec<Activity>, BackendError> {
        let request = self.request(Method::GET, MESSAGES_TABLE).query(&[
            ("select", "sender,created_at".to_string()),
            ("created_at", format!("gt.{}", timestamp(since))),
            ("order", "created_at.desc".to_string()),
        ]);
        read_json(self.send(request).await?).await
    }

    async fn latest(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredRow>, BackendError> {
        self.select_rows(&[
            ("select", "*".to_string()),
            ("created_at", format!("gt.{}", timestamp(since))),
            ("order", "created_at.desc".to_string()),
            ("limit", limit.to_string()),
        ])
        .await
    }

    async fn mark_read(&self, ids: &[String], at: DateTime<Utc>) -> Result<usize, BackendError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let request = self
            .request(Method::PATCH, MESSAGES_TABLE)
            .query(&[
                ("id", id_list(ids)),
                ("read_at", "is.null".to_string()),
                ("select", "id".to_string()),
            ])
            .header("Prefer", "return=representation")
            .json(&json!({ "read_at": timestamp(at) }));
        let changed: Vec<Value> = read_json(self.send(request).await?).await?;
        Ok(changed.len())
    }

    async fn add_reaction(&self, id: &str, reaction: Reaction) -> Result<bool, BackendError> {
        let filter = format!("eq.{id}");
        let request = self
            .request(Method::GET, MESSAGES_TABLE)
            .query(&[("select", "reactions"), ("id", filter.as_str())]);
        let rows: Vec<ReactionsRow> = read_json(self.send(request).await?).await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(false);
        };

        let mut reactions = row.reactions.unwrap_or_default();
        if reactions.contains(&reaction) {
            return Ok(false);
        }
        reactions.push(reaction);

        let request = self
            .request(Method::PATCH, MESSAGES_TABLE)
            .query(&[("id", filter.as_str())])
            .json(&json!({ "reactions": reactions }));
        self.send(request).await?;
        Ok(true)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, BackendError> {
        let request = self
            .request(Method::DELETE, MESSAGES_TABLE)
            .query(&[
                ("created_at", format!("lt.{}", timestamp(cutoff))),
                ("select", "id".to_string()),
            ])
            .header("Prefer", "return=representation");
        let deleted: Vec<Value> = read_json(self.send(request).await?).await?;
        Ok(deleted.len() as u64)
    }

    async fn latest_version(&self) -> Result<Option<VersionInfo>, BackendError> {
        let request = self.request(Method::GET, VERSIONS_TABLE).query(&[
            ("select", "*"),
            ("order", "release_date.desc"),
            ("limit", "1"),
        ]);
        let rows: Vec<VersionRow> = read_json(self.send(request).await?).await?;
        Ok(rows.into_iter().next().map(VersionInfo::from))
    }

    async fn publish_version(&self, info: VersionInfo) -> Result<(), BackendError> {
        let row = VersionRow {
            version: info.version,
            notes: Some(info.notes),
            download_url: Some(info.download_url),
            release_date: info.released_at,
        };
        let request = self
            .request(Method::POST, VERSIONS_TABLE)
            .header("Prefer", "return=minimal")
            .json(&row);
        let response = request.send().await.map_err(request_error)?;
        // Unique violation: the version is already published.
        if response.status() == StatusCode::CONFLICT {
            debug!(version = %row.version, "Version already published");
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }
}

fn id_list(ids: &[String]) -> String {
    let quoted: Vec<String> = ids
        .iter()
        .map(|id| format!("\"{}\"", id.replace('"', "")))
        .collect();
    format!("in.({})", quoted.join(","))
}

/// A Phoenix channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_ref: Option<String>,
}

/// Client side of one realtime channel.
#[derive(Debug)]
struct ChannelState {
    topic: String,
    join_ref: String,
    next_ref: u64,
    /// Presence key -> metas.
    presence: BTreeMap<String, Vec<PresenceMeta>>,
}

impl ChannelState {
    fn new(topic: &str, join_ref: &str) -> Self {
        Self {
            topic: topic.to_string(),
            join_ref: join_ref.to_string(),
            next_ref: 1,
            presence: BTreeMap::new(),
        }
    }

    fn reference(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    fn join_message(&self, access_token: &str) -> PhoenixMessage {
        PhoenixMessage {
            topic: self.topic.clone(),
            event: "phx_join".to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [
                        { "event": "*", "schema": "public", "table": MESSAGES_TABLE }
                    ]
                },
                "access_token": access_token
            }),
            reference: Some(self.join_ref.clone()),
            join_ref: Some(self.join_ref.clone()),
        }
    }

    fn heartbeat_message(&mut self) -> PhoenixMessage {
        PhoenixMessage {
            topic: "phoenix".to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            reference: Some(self.reference()),
            join_ref: None,
        }
    }

    fn presence_message(&mut self, command: PresenceCommand) -> PhoenixMessage {
        let payload = match command {
            PresenceCommand::Track(meta) => {
                json!({ "type": "presence", "event": "track", "payload": meta })
            }
            PresenceCommand::Untrack => json!({ "type": "presence", "event": "untrack" }),
        };
        PhoenixMessage {
            topic: self.topic.clone(),
            event: "presence".to_string(),
            payload,
            reference: Some(self.reference()),
            join_ref: Some(self.join_ref.clone()),
        }
    }

    fn presence_snapshot(&self) -> PushEvent {
        PushEvent::PresenceSync(self.presence.values().flatten().cloned().collect())
    }

    /// Translate an incoming message into a push event.
    fn handle(&mut self, msg: PhoenixMessage) -> Option<PushEvent> {
        if msg.topic != self.topic {
            return None;
        }
        match msg.event.as_str() {
            "phx_reply" if msg.reference.as_deref() == Some(self.join_ref.as_str()) => {
                if msg.payload["status"] == "ok" {
                    Some(PushEvent::Subscribed)
                } else {
                    Some(PushEvent::ChannelError(format!(
                        "join refused: {}",
                        msg.payload["response"]
                    )))
                }
            }
            "postgres_changes" => {
                let data = &msg.payload["data"];
                let row: StoredRow = match serde_json::from_value(data["record"].clone()) {
                    Ok(row) => row,
                    Err(e) => {
                        debug!(error = %e, "Ignoring undecodable change record");
                        return None;
                    }
                };
                match data["type"].as_str() {
                    Some("INSERT") => Some(PushEvent::Inserted(row)),
                    Some("UPDATE") => Some(PushEvent::Updated(row)),
                    _ => None,
                }
            }
            "presence_state" => {
                self.presence = msg
                    .payload
                    .as_object()
                    .map(|state| {
                        state
                            .iter()
                            .map(|(key, entry)| (key.clone(), parse_metas(entry)))
                            .collect()
                    })
                    .unwrap_or_default();
                Some(self.presence_snapshot())
            }
            "presence_diff" => {
                if let Some(leaves) = msg.payload["leaves"].as_object() {
                    for key in leaves.keys() {
                        self.presence.remove(key);
                    }
                }
                if let Some(joins) = msg.payload["joins"].as_object() {
                    for (key, entry) in joins {
                        self.presence.insert(key.clone(), parse_metas(entry));
                    }
                }
                Some(self.presence_snapshot())
            }
            "system" if msg.payload["status"] == "error" => Some(PushEvent::ChannelError(
                msg.payload["message"]
                    .as_str()
                    .unwrap_or("realtime system error")
                    .to_string(),
            )),
            "phx_error" => Some(PushEvent::ChannelError("channel error".to_string())),
            "phx_close" => Some(PushEvent::Closed),
            _ => None,
        }
    }
}

fn parse_metas(entry: &Value) -> Vec<PresenceMeta> {
    entry["metas"]
        .as_array()
        .map(|metas| {
            metas
                .iter()
                .filter_map(|m| serde_json::from_value(m.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

async fn send_frame<S>(write: &mut S, msg: &PhoenixMessage) -> Result<(), String>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    let text = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    write
        .send(WsMessage::Text(text))
        .await
        .map_err(|e| e.to_string())
}

async fn run_channel<W, R>(
    mut write: W,
    mut read: R,
    mut channel: ChannelState,
    join: PhoenixMessage,
    events: mpsc::UnboundedSender<PushEvent>,
    mut commands: mpsc::UnboundedReceiver<PresenceCommand>,
) where
    W: Sink<WsMessage> + Unpin,
    W::Error: Display,
    R: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    if let Err(e) = send_frame(&mut write, &join).await {
        let _ = events.send(PushEvent::ChannelError(e));
        return;
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let msg = channel.heartbeat_message();
                if let Err(e) = send_frame(&mut write, &msg).await {
                    let _ = events.send(PushEvent::ChannelError(e));
                    return;
                }
            }
            Some(command) = commands.recv() => {
                let msg = channel.presence_message(command);
                if let Err(e) = send_frame(&mut write, &msg).await {
                    warn!(error = %e, "Failed to send presence update");
                }
            }
            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<PhoenixMessage>(&text) {
                        Ok(msg) => {
                            if let Some(event) = channel.handle(msg) {
                                let terminal = matches!(event, PushEvent::ChannelError(_) | PushEvent::Closed);
                                if events.send(event).is_err() || terminal {
                                    return;
                                }
                            }
                        }
                        Err(e) => debug!(error = %e, "Ignoring malformed realtime frame"),
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    let _ = events.send(PushEvent::Closed);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(PushEvent::ChannelError(e.to_string()));
                    return;
                }
            }
        }
    }
}
