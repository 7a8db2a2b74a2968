//! Matrix gateway and room adapter over the Client-Server v3 API.
//!
//! The bridge talks to the homeserver directly with reqwest: password login,
//! explicit room joins, then a long-polled `/sync` loop whose server-side
//! filter already excludes the bridge's own events in the configured rooms.
//! The sync position is persisted in the configured store directory so a
//! restart resumes instead of replaying; as a second guard, events stamped
//! more than 20 seconds before process start are dropped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::cache::EntityCache;
use crate::chat::{self, ChatAdapter, Subscriptions};
use crate::config::MatrixConfig;
use crate::error::Result;
use crate::model::{
    ChannelInfo, ChatMessage, InboundMessage, MatrixMessage, MessageType, Source, User,
};

/// How far behind process start an event may be stamped before it is treated
/// as replayed backlog.
const REPLAY_CUTOFF_MS: i64 = 20_000;

/// Homeserver connection plus caches shared by every Matrix room adapter.
pub struct MatrixGateway {
    http: reqwest::Client,
    host: String,
    access_token: String,
    self_id: String,
    room_ids: Vec<String>,
    store_dir: Option<PathBuf>,
    cache: EntityCache,
    subs: Subscriptions,
    started_at_ms: i64,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    event_id: String,
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: SyncRooms,
}

#[derive(Debug, Default, Deserialize)]
struct SyncRooms {
    #[serde(default)]
    join: HashMap<String, JoinedRoom>,
}

#[derive(Debug, Deserialize)]
struct JoinedRoom {
    #[serde(default)]
    timeline: Timeline,
}

#[derive(Debug, Default, Deserialize)]
struct Timeline {
    #[serde(default)]
    events: Vec<RoomEvent>,
}

#[derive(Debug, Deserialize)]
struct RoomEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    event_id: String,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    origin_server_ts: i64,
    #[serde(default)]
    content: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct MessageContent {
    #[serde(default)]
    msgtype: String,
    #[serde(default)]
    body: String,
    #[serde(rename = "m.new_content")]
    new_content: Option<Box<MessageContent>>,
    #[serde(rename = "m.relates_to")]
    relates_to: Option<RelatesTo>,
}

#[derive(Debug, Default, Deserialize)]
struct RelatesTo {
    #[serde(default)]
    rel_type: String,
    #[serde(default)]
    event_id: String,
    #[serde(default)]
    key: String,
    #[serde(rename = "m.in_reply_to")]
    in_reply_to: Option<InReplyTo>,
}

#[derive(Debug, Deserialize)]
struct InReplyTo {
    event_id: String,
}

#[derive(Debug, Deserialize)]
struct RoomNameState {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct JoinedMembersResponse {
    #[serde(default)]
    joined: HashMap<String, MemberProfile>,
}

#[derive(Debug, Default, Deserialize)]
struct MemberProfile {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
}

impl MatrixGateway {
    /// Password-login, join the configured rooms, prefill the caches and
    /// start the sync loop.
    pub async fn connect(
        config: &MatrixConfig,
        room_ids: &[String],
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let http = reqwest::Client::new();
        let host = config.host.trim_end_matches('/').to_string();

        let login: LoginResponse = http
            .post(format!("{host}/_matrix/client/v3/login"))
            .json(&json!({
                "type": "m.login.password",
                "identifier": { "type": "m.id.user", "user": config.user },
                "password": config.password,
            }))
            .send()
            .await
            .context("matrix login request failed")?
            .error_for_status()
            .context("matrix login rejected")?
            .json()
            .await
            .context("matrix login response malformed")?;

        let self_id = if config.username.is_empty() {
            login.user_id.clone()
        } else {
            config.username.clone()
        };
        tracing::info!(user_id = %self_id, "matrix connected");

        let store_dir = if config.store_path.is_empty() {
            None
        } else {
            let dir = PathBuf::from(&config.store_path);
            std::fs::create_dir_all(&dir).context("failed to create matrix store directory")?;
            Some(dir)
        };

        let gateway = Arc::new(Self {
            http,
            host,
            access_token: login.access_token,
            self_id,
            room_ids: room_ids.to_vec(),
            store_dir,
            cache: EntityCache::new(),
            subs: Subscriptions::new(),
            started_at_ms: chrono::Utc::now().timestamp_millis(),
        });

        for room_id in room_ids {
            gateway.join_room(room_id).await;
            gateway.update_room(room_id).await;
        }

        let sync = gateway.clone();
        tokio::spawn(async move {
            sync.sync_loop(cancel).await;
        });

        Ok(gateway)
    }

    /// Register a per-room inbound sender and return the adapter handle for
    /// one Matrix room.
    pub async fn attach(
        self: &Arc<Self>,
        room_id: &str,
        tx: tokio::sync::mpsc::Sender<InboundMessage>,
    ) -> MatrixChat {
        self.subs.register(room_id, tx).await;
        MatrixChat {
            gateway: self.clone(),
            room: room_id.to_string(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/_matrix/client/v3{}", self.host, path)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let mut request = self
            .http
            .request(method, self.api_url(path))
            .bearer_auth(&self.access_token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.context("matrix request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("matrix request returned {status}: {text}").into());
        }
        Ok(response
            .json()
            .await
            .context("matrix response malformed")?)
    }

    async fn join_room(&self, room_id: &str) {
        let path = format!("/join/{}", urlencoding::encode(room_id));
        match self
            .call::<serde_json::Value>(Method::POST, &path, Some(json!({})))
            .await
        {
            Ok(_) => tracing::info!(room_id = %room_id, "joined matrix room"),
            Err(error) => tracing::warn!(room_id = %room_id, %error, "failed to join matrix room"),
        }
    }

    /// Refresh the room name and member list into the caches.
    async fn update_room(&self, room_id: &str) {
        let encoded = urlencoding::encode(room_id).into_owned();

        let name = match self
            .call::<RoomNameState>(Method::GET, &format!("/rooms/{encoded}/state/m.room.name"), None)
            .await
        {
            Ok(state) if !state.name.is_empty() => state.name,
            _ => localpart(room_id),
        };

        let mut members = Vec::new();
        let mut users = Vec::new();
        match self
            .call::<JoinedMembersResponse>(
                Method::GET,
                &format!("/rooms/{encoded}/joined_members"),
                None,
            )
            .await
        {
            Ok(response) => {
                for (user_id, profile) in response.joined {
                    members.push(user_id.clone());
                    users.push(User {
                        id: user_id.clone(),
                        name: localpart(&user_id),
                        display_name: profile
                            .display_name
                            .filter(|n| !n.is_empty())
                            .unwrap_or_else(|| localpart(&user_id)),
                        avatar: profile.avatar_url.unwrap_or_default(),
                        ..User::default()
                    });
                }
            }
            Err(error) => {
                tracing::warn!(room_id = %room_id, %error, "failed to list matrix room members");
            }
        }

        self.cache.merge_users(users);
        self.cache.merge_channels(vec![ChannelInfo {
            id: room_id.to_string(),
            name,
            members,
        }]);
    }

    async fn channel_info(&self, room_id: &str) -> ChannelInfo {
        if let Some(info) = self.cache.channel(room_id).await {
            return info;
        }
        self.update_room(room_id).await;
        self.cache.channel(room_id).await.unwrap_or_else(|| ChannelInfo {
            id: room_id.to_string(),
            name: localpart(room_id),
            members: Vec::new(),
        })
    }

    async fn user_info(&self, room_id: &str, user_id: &str) -> User {
        if let Some(user) = self.cache.user(user_id).await {
            return user;
        }
        self.update_room(room_id).await;
        self.cache.user(user_id).await.unwrap_or_else(|| User {
            id: user_id.to_string(),
            name: localpart(user_id),
            display_name: localpart(user_id),
            ..User::default()
        })
    }

    fn sync_filter(&self) -> String {
        json!({
            "room": {
                "rooms": self.room_ids,
                "state": { "not_senders": [self.self_id], "rooms": self.room_ids },
                "timeline": { "not_senders": [self.self_id], "rooms": self.room_ids },
            }
        })
        .to_string()
    }

    fn sync_token_path(&self) -> Option<PathBuf> {
        self.store_dir.as_ref().map(|dir| dir.join("sync_token"))
    }

    fn load_sync_token(&self) -> Option<String> {
        let path = self.sync_token_path()?;
        std::fs::read_to_string(path)
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    }

    fn store_sync_token(&self, token: &str) {
        let Some(path) = self.sync_token_path() else {
            return;
        };
        if let Err(error) = std::fs::write(&path, token) {
            tracing::warn!(path = %path.display(), %error, "failed to persist matrix sync token");
        }
    }

    async fn sync_loop(self: Arc<Self>, cancel: CancellationToken) {
        let filter = urlencoding::encode(&self.sync_filter()).into_owned();
        let mut since = self.load_sync_token();
        loop {
            let mut path = format!("/sync?timeout=30000&filter={filter}");
            if let Some(token) = &since {
                path.push_str(&format!("&since={}", urlencoding::encode(token)));
            }
            let sync = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("matrix sync stopped");
                    return;
                }
                result = self.call::<SyncResponse>(Method::GET, &path, None) => result,
            };
            match sync {
                Ok(response) => {
                    since = Some(response.next_batch.clone());
                    self.store_sync_token(&response.next_batch);
                    for (room_id, room) in response.rooms.join {
                        for event in room.timeline.events {
                            self.on_event(&room_id, event).await;
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "matrix sync failed, backing off");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn on_event(&self, room_id: &str, event: RoomEvent) {
        if is_replayed(event.origin_server_ts, self.started_at_ms) {
            tracing::debug!(
                room_id = %room_id,
                sender = %event.sender,
                kind = %event.kind,
                "dropping replayed matrix event"
            );
            return;
        }
        // The sync filter already excludes the bridge's own events; this is a
        // second guard for homeservers that ignore not_senders.
        if event.sender == self.self_id {
            return;
        }

        match event.kind.as_str() {
            "m.room.message" => {
                let Ok(content) = serde_json::from_value::<MessageContent>(event.content) else {
                    return;
                };
                let normalized = normalize_message(&event.event_id, &content);
                let msg = MatrixMessage {
                    id: normalized.id,
                    kind: Some(normalized.kind),
                    channel: self.channel_info(room_id).await,
                    user: self.user_info(room_id, &event.sender).await,
                    text: normalized.body,
                    send_time: event.origin_server_ts * 1_000_000,
                    parent_id: normalized.parent,
                    ..MatrixMessage::default()
                };
                self.subs.publish(room_id, Arc::new(msg)).await;
            }
            "m.reaction" => {
                let Ok(content) = serde_json::from_value::<MessageContent>(event.content) else {
                    return;
                };
                let Some(relates) = content.relates_to else {
                    return;
                };
                if relates.rel_type != "m.annotation" {
                    return;
                }
                let msg = MatrixMessage {
                    id: relates.event_id,
                    kind: Some(MessageType::ActionAdd),
                    channel: self.channel_info(room_id).await,
                    user: self.user_info(room_id, &event.sender).await,
                    reaction: relates.key,
                    send_time: event.origin_server_ts * 1_000_000,
                    ..MatrixMessage::default()
                };
                self.subs.publish(room_id, Arc::new(msg)).await;
            }
            _ => {}
        }
    }
}

struct Normalized {
    kind: MessageType,
    id: String,
    parent: Option<String>,
    body: String,
}

/// Map an `m.room.message` event onto the bridge's event kinds: `m.replace`
/// relations are edits of the replaced event, `m.in_reply_to` relations are
/// replies, everything else is a plain create.
fn normalize_message(event_id: &str, content: &MessageContent) -> Normalized {
    if let Some(relates) = &content.relates_to {
        if relates.rel_type == "m.replace" && !relates.event_id.is_empty() {
            let body = content
                .new_content
                .as_ref()
                .map(|inner| format_body(&inner.msgtype, &inner.body))
                .unwrap_or_else(|| format_body(&content.msgtype, &content.body));
            return Normalized {
                kind: MessageType::TextUpdate,
                id: relates.event_id.clone(),
                parent: None,
                body,
            };
        }
        if let Some(reply) = &relates.in_reply_to {
            return Normalized {
                kind: MessageType::TextReply,
                id: event_id.to_string(),
                parent: Some(reply.event_id.clone()),
                body: format_body(&content.msgtype, &content.body),
            };
        }
    }
    Normalized {
        kind: MessageType::TextCreate,
        id: event_id.to_string(),
        parent: None,
        body: format_body(&content.msgtype, &content.body),
    }
}

/// Textual msgtypes pass through; media and other bodies get a bracketed
/// kind prefix (`[image] cat.png`).
fn format_body(msgtype: &str, body: &str) -> String {
    match msgtype {
        "" | "m.text" | "m.notice" | "m.emote" => body.to_string(),
        other => format!("[{}] {}", other.trim_start_matches("m."), body),
    }
}

/// Whether an event is stamped far enough before process start to count as
/// replayed backlog. The window stays anchored to process start; events
/// exactly at the cutoff are still delivered.
fn is_replayed(origin_server_ts: i64, started_at_ms: i64) -> bool {
    origin_server_ts < started_at_ms - REPLAY_CUTOFF_MS
}

/// The readable local part of a Matrix identifier (`@alice:example.org` →
/// `alice`).
fn localpart(id: &str) -> String {
    id.trim_start_matches(['@', '!', '#'])
        .split(':')
        .next()
        .unwrap_or_default()
        .to_string()
}

fn txn_id() -> String {
    format!("bridge_{}", uuid::Uuid::new_v4())
}

// ---------------------------------------------------------------------------
// Room adapter
// ---------------------------------------------------------------------------

/// One bridged Matrix room.
pub struct MatrixChat {
    gateway: Arc<MatrixGateway>,
    room: String,
}

impl MatrixChat {
    async fn render(&self, msg: &dyn ChatMessage) -> String {
        if msg.source() == Source::Matrix {
            chat::format_text(
                &msg.channel().name,
                &msg.user().display_name,
                msg.raw_text(),
                msg.attachments(),
            )
        } else {
            let body = chat::rewrite_mentions(&self.gateway.cache, msg.text(), |u| {
                format!("<@{}>", u.id)
            })
            .await;
            chat::format_text(
                &msg.source().to_string(),
                &msg.user().display_name,
                &body,
                msg.attachments(),
            )
        }
    }

    async fn send_event(&self, event_type: &str, body: serde_json::Value) -> Result<String> {
        let path = format!(
            "/rooms/{}/send/{}/{}",
            urlencoding::encode(&self.room),
            event_type,
            txn_id()
        );
        let response: SendResponse = self
            .gateway
            .call(Method::PUT, &path, Some(body))
            .await
            .context("failed to send matrix event")?;
        Ok(response.event_id)
    }

    async fn send_text(&self, text: String) -> Result<String> {
        self.send_event(
            "m.room.message",
            json!({ "msgtype": "m.text", "body": text }),
        )
        .await
    }
}

#[async_trait]
impl ChatAdapter for MatrixChat {
    fn channel_id(&self) -> &str {
        &self.room
    }

    fn source(&self) -> Source {
        Source::Matrix
    }

    async fn send_message(&self, msg: &dyn ChatMessage) -> Result<String> {
        self.send_text(self.render(msg).await).await
    }

    async fn send_reply(&self, parent_id: Option<&str>, msg: &dyn ChatMessage) -> Result<String> {
        match parent_id {
            Some(parent) => {
                self.send_event(
                    "m.room.message",
                    json!({
                        "msgtype": "m.text",
                        "body": self.render(msg).await,
                        "m.relates_to": { "rel_type": "m.thread", "event_id": parent },
                    }),
                )
                .await
            }
            None => {
                let text =
                    chat::with_fallback_suffix(&self.render(msg).await, chat::REPLY_FALLBACK);
                self.send_text(text).await
            }
        }
    }

    async fn update_message(&self, message_id: Option<&str>, msg: &dyn ChatMessage) -> Result<()> {
        let Some(message_id) = message_id else {
            let text = chat::with_fallback_suffix(&self.render(msg).await, chat::EDIT_FALLBACK);
            self.send_text(text).await?;
            return Ok(());
        };
        let text = self.render(msg).await;
        self.send_event(
            "m.room.message",
            json!({
                "msgtype": "m.text",
                "body": format!("* {text}"),
                "m.new_content": { "msgtype": "m.text", "body": text },
                "m.relates_to": { "rel_type": "m.replace", "event_id": message_id },
            }),
        )
        .await?;
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        let path = format!(
            "/rooms/{}/redact/{}/{}",
            urlencoding::encode(&self.room),
            urlencoding::encode(message_id),
            txn_id()
        );
        self.gateway
            .call::<SendResponse>(
                Method::PUT,
                &path,
                Some(json!({ "reason": "source message deleted" })),
            )
            .await
            .context("failed to redact matrix event")?;
        Ok(())
    }

    async fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<()> {
        self.send_event(
            "m.reaction",
            json!({
                "m.relates_to": {
                    "rel_type": "m.annotation",
                    "event_id": message_id,
                    "key": emoji,
                }
            }),
        )
        .await?;
        Ok(())
    }

    /// Removing a reaction requires the reaction event's own id, which the
    /// bridge does not track; accepted and ignored.
    async fn remove_reaction(&self, _message_id: &str, _emoji: &str) -> Result<()> {
        Ok(())
    }

    async fn remove_all_reactions(&self, _message_id: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(raw: &str) -> MessageContent {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn plain_messages_normalize_to_create() {
        let normalized = normalize_message(
            "$evt1",
            &content(r#"{"msgtype": "m.text", "body": "hello"}"#),
        );
        assert_eq!(normalized.kind, MessageType::TextCreate);
        assert_eq!(normalized.id, "$evt1");
        assert_eq!(normalized.body, "hello");
        assert_eq!(normalized.parent, None);
    }

    #[test]
    fn replace_relations_normalize_to_update_of_the_replaced_event() {
        let normalized = normalize_message(
            "$edit",
            &content(
                r#"{
                    "msgtype": "m.text",
                    "body": "* hello!",
                    "m.new_content": {"msgtype": "m.text", "body": "hello!"},
                    "m.relates_to": {"rel_type": "m.replace", "event_id": "$orig"}
                }"#,
            ),
        );
        assert_eq!(normalized.kind, MessageType::TextUpdate);
        assert_eq!(normalized.id, "$orig");
        assert_eq!(normalized.body, "hello!");
    }

    #[test]
    fn replace_without_new_content_falls_back_to_the_outer_body() {
        let normalized = normalize_message(
            "$edit",
            &content(
                r#"{
                    "msgtype": "m.text",
                    "body": "* hello!",
                    "m.relates_to": {"rel_type": "m.replace", "event_id": "$orig"}
                }"#,
            ),
        );
        assert_eq!(normalized.body, "* hello!");
    }

    #[test]
    fn reply_relations_normalize_to_reply() {
        let normalized = normalize_message(
            "$evt2",
            &content(
                r#"{
                    "msgtype": "m.text",
                    "body": "hi",
                    "m.relates_to": {"m.in_reply_to": {"event_id": "$parent"}}
                }"#,
            ),
        );
        assert_eq!(normalized.kind, MessageType::TextReply);
        assert_eq!(normalized.id, "$evt2");
        assert_eq!(normalized.parent, Some("$parent".to_string()));
    }

    #[test]
    fn non_text_bodies_are_prefixed_with_their_kind() {
        assert_eq!(format_body("m.image", "cat.png"), "[image] cat.png");
        assert_eq!(format_body("m.text", "hello"), "hello");
        assert_eq!(format_body("m.notice", "fyi"), "fyi");
        assert_eq!(format_body("", "hello"), "hello");
    }

    #[test]
    fn replay_cutoff_drops_only_events_older_than_the_window() {
        let started_at_ms = 1_700_000_000_000;
        let cutoff = started_at_ms - REPLAY_CUTOFF_MS;

        assert!(is_replayed(cutoff - 1, started_at_ms));
        assert!(!is_replayed(cutoff, started_at_ms));
        assert!(!is_replayed(cutoff + 1, started_at_ms));
        assert!(!is_replayed(started_at_ms, started_at_ms));
        // Events from after startup are always delivered.
        assert!(!is_replayed(started_at_ms + 5_000, started_at_ms));
    }

    #[test]
    fn localparts_strip_sigils_and_servers() {
        assert_eq!(localpart("@alice:example.org"), "alice");
        assert_eq!(localpart("!room:example.org"), "room");
        assert_eq!(localpart("plain"), "plain");
    }

    #[test]
    fn reaction_content_parses_annotation_key() {
        let parsed = content(
            r#"{"m.relates_to": {"rel_type": "m.annotation", "event_id": "$t", "key": "👍"}}"#,
        );
        let relates = parsed.relates_to.unwrap();
        assert_eq!(relates.rel_type, "m.annotation");
        assert_eq!(relates.event_id, "$t");
        assert_eq!(relates.key, "👍");
    }
}
