//! Room dispatcher and room assembly.
//!
//! A room is a set of platform channels mirroring each other. Each room has
//! exactly one dispatcher task: it consumes the room's inbound channel
//! serially, is the only writer of the room's history, and the only caller of
//! outbound adapter operations for that room, so the whole state machine runs
//! without locks.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::chat::{self, ChatAdapter};
use crate::config::Config;
use crate::emoji::EmojiTable;
use crate::error::{ConfigError, Result};
use crate::history::{History, MessageRecord, MessageTuple};
use crate::model::{ChatMessage, InboundMessage, MessageType, Source};

/// Inbound channel capacity per attached chat; sized so that publishing from
/// ingest tasks rarely blocks.
pub const INBOUND_CAPACITY_PER_CHAT: usize = 100;

/// Constructed platform gateways, one per platform the configuration uses.
#[derive(Default)]
pub struct Gateways {
    pub slack: Option<Arc<chat::slack::SlackGateway>>,
    pub discord: Option<Arc<chat::discord::DiscordGateway>>,
    pub telegram: Option<Arc<chat::telegram::TelegramGateway>>,
    pub matrix: Option<Arc<chat::matrix::MatrixGateway>>,
}

/// One bridged room: the adapters attached to it, its inbound channel and
/// the bounded identity history.
pub struct ChatRoom {
    name: String,
    adapters: Vec<Arc<dyn ChatAdapter>>,
    receive: mpsc::Receiver<InboundMessage>,
    history: History,
    emoji: Arc<EmojiTable>,
}

impl ChatRoom {
    pub fn new(
        name: impl Into<String>,
        adapters: Vec<Arc<dyn ChatAdapter>>,
        receive: mpsc::Receiver<InboundMessage>,
        emoji: Arc<EmojiTable>,
    ) -> Self {
        Self {
            name: name.into(),
            adapters,
            receive,
            history: History::default(),
            emoji,
        }
    }

    /// Dispatcher loop. Terminates when the token is cancelled or every
    /// sender for the inbound channel has gone away.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(room = %self.name, adapters = self.adapters.len(), "dispatcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(room = %self.name, "dispatcher stopped");
                    return;
                }
                msg = self.receive.recv() => {
                    match msg {
                        Some(msg) => self.dispatch(msg).await,
                        None => {
                            tracing::warn!(room = %self.name, "inbound channel closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Every adapter except the one the message originated on.
    fn peers(&self, msg: &dyn ChatMessage) -> Vec<Arc<dyn ChatAdapter>> {
        self.adapters
            .iter()
            .filter(|a| a.source() != msg.source() || a.channel_id() != msg.channel().id)
            .cloned()
            .collect()
    }

    async fn dispatch(&mut self, msg: InboundMessage) {
        match msg.message_type() {
            MessageType::TextCreate => self.on_create(&*msg).await,
            MessageType::TextUpdate => self.on_update(&*msg).await,
            MessageType::TextDelete => self.on_delete(&*msg).await,
            MessageType::TextReply => self.on_reply(&*msg).await,
            kind @ (MessageType::ActionAdd
            | MessageType::ActionRemove
            | MessageType::ActionRemoveAll) => self.on_reaction(&*msg, kind).await,
        }
        tracing::debug!(room = %self.name, history = %self.history, "history after dispatch");
    }

    async fn on_create(&mut self, msg: &dyn ChatMessage) {
        let mut tuple = MessageTuple::new(
            msg.message_type(),
            MessageRecord::new(msg.message_id(), &msg.channel().id, msg.source()),
        );
        for peer in self.peers(msg) {
            tracing::info!(
                room = %self.name,
                to = %peer.channel_id(),
                from = %msg.channel().name,
                user = %msg.user().display_name,
                "mirroring message"
            );
            let id = match peer.send_message(msg).await {
                Ok(id) => id,
                Err(error) => {
                    tracing::warn!(
                        room = %self.name,
                        to = %peer.channel_id(),
                        %error,
                        "failed to mirror message"
                    );
                    String::new()
                }
            };
            tuple.push_record(MessageRecord::new(id, peer.channel_id(), peer.source()));
        }
        self.history.push(tuple);
    }

    async fn on_update(&mut self, msg: &dyn ChatMessage) {
        let origin = self
            .history
            .search_back(|t| t.has_record(msg.source(), &msg.channel().id, msg.message_id()))
            .map(|t| t.id());
        if origin.is_none() {
            tracing::warn!(
                room = %self.name,
                source = %msg.source(),
                channel_id = %msg.channel().id,
                message_id = %msg.message_id(),
                "edited message not in history, peers will fall back to plain send"
            );
        }
        for peer in self.peers(msg) {
            let peer_id = origin
                .and_then(|id| self.history.peer_message_id(id, peer.source(), peer.channel_id()));
            if let Err(error) = peer.update_message(peer_id.as_deref(), msg).await {
                tracing::warn!(
                    room = %self.name,
                    to = %peer.channel_id(),
                    target = ?peer_id,
                    %error,
                    "failed to update mirrored message"
                );
            }
        }
    }

    async fn on_delete(&mut self, msg: &dyn ChatMessage) {
        let Some(origin) = self
            .history
            .delete_back(|t| t.has_record(msg.source(), &msg.channel().id, msg.message_id()))
        else {
            tracing::warn!(
                room = %self.name,
                source = %msg.source(),
                channel_id = %msg.channel().id,
                message_id = %msg.message_id(),
                "deleted message not in history, dropping"
            );
            return;
        };
        for peer in self.peers(msg) {
            let Some(peer_id) =
                self.history
                    .peer_message_id_of(&origin, peer.source(), peer.channel_id())
            else {
                tracing::warn!(
                    room = %self.name,
                    to = %peer.channel_id(),
                    "no mirrored copy to delete"
                );
                continue;
            };
            if let Err(error) = peer.delete_message(&peer_id).await {
                tracing::warn!(
                    room = %self.name,
                    to = %peer.channel_id(),
                    target = %peer_id,
                    %error,
                    "failed to delete mirrored message"
                );
            }
        }
    }

    async fn on_reply(&mut self, msg: &dyn ChatMessage) {
        let parent_id = msg.parent_message_id().unwrap_or_default();
        let origin = self
            .history
            .search_back(|t| t.has_record(msg.source(), &msg.channel().id, parent_id))
            .map(|t| t.id());
        if origin.is_none() {
            tracing::warn!(
                room = %self.name,
                source = %msg.source(),
                channel_id = %msg.channel().id,
                parent_id,
                "reply parent not in history, peers will fall back to plain send"
            );
        }
        let mut tuple = MessageTuple::new(
            msg.message_type(),
            MessageRecord::new(msg.message_id(), &msg.channel().id, msg.source()),
        );
        for peer in self.peers(msg) {
            let peer_id = origin
                .and_then(|id| self.history.peer_message_id(id, peer.source(), peer.channel_id()));
            tracing::info!(
                room = %self.name,
                to = %peer.channel_id(),
                from = %msg.channel().name,
                user = %msg.user().display_name,
                "mirroring reply"
            );
            let id = match peer.send_reply(peer_id.as_deref(), msg).await {
                Ok(id) => id,
                Err(error) => {
                    tracing::warn!(
                        room = %self.name,
                        to = %peer.channel_id(),
                        %error,
                        "failed to mirror reply"
                    );
                    String::new()
                }
            };
            tuple.push_record(MessageRecord::new(id, peer.channel_id(), peer.source()));
        }
        let child = self.history.push(tuple);
        if let Some(parent) = origin {
            self.history.link_reply(parent, child);
        }
    }

    async fn on_reaction(&mut self, msg: &dyn ChatMessage, kind: MessageType) {
        let Some(origin) = self
            .history
            .search_back(|t| t.has_record(msg.source(), &msg.channel().id, msg.message_id()))
            .map(|t| t.id())
        else {
            tracing::warn!(
                room = %self.name,
                source = %msg.source(),
                channel_id = %msg.channel().id,
                message_id = %msg.message_id(),
                "reaction target not in history, dropping"
            );
            return;
        };
        for peer in self.peers(msg) {
            let Some(peer_id) =
                self.history
                    .peer_message_id(origin, peer.source(), peer.channel_id())
            else {
                tracing::warn!(
                    room = %self.name,
                    to = %peer.channel_id(),
                    "no mirrored copy to react to"
                );
                continue;
            };
            let result = match kind {
                MessageType::ActionAdd | MessageType::ActionRemove => {
                    let emoji = self.emoji.convert(msg.source(), peer.source(), msg.emoji());
                    if emoji.is_empty() {
                        tracing::warn!(
                            room = %self.name,
                            to = %peer.channel_id(),
                            code = %msg.emoji(),
                            "emoji has no rendering on this platform, skipping"
                        );
                        continue;
                    }
                    if kind == MessageType::ActionAdd {
                        peer.add_reaction(&peer_id, &emoji).await
                    } else {
                        peer.remove_reaction(&peer_id, &emoji).await
                    }
                }
                _ => peer.remove_all_reactions(&peer_id).await,
            };
            if let Err(error) = result {
                tracing::warn!(
                    room = %self.name,
                    to = %peer.channel_id(),
                    target = %peer_id,
                    %error,
                    "failed to mirror reaction"
                );
            }
        }
    }
}

/// Build every configured room, attaching each platform channel to its
/// gateway. Adapter order within a room follows declaration order.
pub async fn build_rooms(
    config: &Config,
    gateways: &Gateways,
    emoji: &Arc<EmojiTable>,
) -> Result<Vec<ChatRoom>> {
    let mut rooms = Vec::new();
    for room_cfg in &config.room {
        let total_chats: usize = room_cfg.chat.iter().map(|c| c.chat_ids.len()).sum();
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY_PER_CHAT * total_chats.max(1));

        let mut adapters: Vec<Arc<dyn ChatAdapter>> = Vec::new();
        for room_chat in &room_cfg.chat {
            for channel_id in &room_chat.chat_ids {
                let adapter: Arc<dyn ChatAdapter> = match room_chat.kind {
                    Source::Slack => {
                        let gateway = gateways.slack.as_ref().ok_or_else(|| {
                            ConfigError::Invalid("room uses slack but no slack gateway".into())
                        })?;
                        Arc::new(gateway.attach(channel_id, tx.clone()).await)
                    }
                    Source::Discord => {
                        let gateway = gateways.discord.as_ref().ok_or_else(|| {
                            ConfigError::Invalid("room uses discord but no discord gateway".into())
                        })?;
                        Arc::new(gateway.attach(channel_id, tx.clone()).await)
                    }
                    Source::Telegram => {
                        let gateway = gateways.telegram.as_ref().ok_or_else(|| {
                            ConfigError::Invalid("room uses telegram but no telegram gateway".into())
                        })?;
                        Arc::new(gateway.attach(channel_id, tx.clone()).await)
                    }
                    Source::Matrix => {
                        let gateway = gateways.matrix.as_ref().ok_or_else(|| {
                            ConfigError::Invalid("room uses matrix but no matrix gateway".into())
                        })?;
                        Arc::new(gateway.attach(channel_id, tx.clone()).await)
                    }
                };
                adapters.push(adapter);
            }
        }
        rooms.push(ChatRoom::new(
            room_cfg.name.clone(),
            adapters,
            rx,
            emoji.clone(),
        ));
    }
    Ok(rooms)
}

/// Run one dispatcher task per room and wait for all of them to finish.
pub async fn run_rooms(rooms: Vec<ChatRoom>, cancel: CancellationToken) {
    let mut set = JoinSet::new();
    for room in rooms {
        set.spawn(room.run(cancel.clone()));
    }
    tracing::info!("chat bridge running...");
    while set.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{EDIT_FALLBACK, REPLY_FALLBACK, format_text, with_fallback_suffix};
    use crate::model::{ChannelInfo, DiscordMessage, SlackMessage, User};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Send { body: String },
        Reply { parent: Option<String>, body: String },
        Update { id: Option<String>, body: String },
        Delete { id: String },
        React { id: String, emoji: String },
        Unreact { id: String, emoji: String },
        UnreactAll { id: String },
    }

    /// Adapter double that renders outbound text the way real adapters do and
    /// records every operation it is asked to perform.
    struct MockAdapter {
        source: Source,
        channel: String,
        ids: Mutex<Vec<String>>,
        calls: Mutex<Vec<Call>>,
        fail_sends: bool,
    }

    impl MockAdapter {
        fn new(source: Source, channel: &str, ids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                source,
                channel: channel.to_string(),
                ids: Mutex::new(ids.iter().rev().map(|s| s.to_string()).collect()),
                calls: Mutex::new(Vec::new()),
                fail_sends: false,
            })
        }

        fn failing(source: Source, channel: &str) -> Arc<Self> {
            Arc::new(Self {
                source,
                channel: channel.to_string(),
                ids: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                fail_sends: true,
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn next_id(&self) -> String {
            self.ids.lock().unwrap().pop().unwrap_or_else(|| "id".into())
        }

        fn render(&self, msg: &dyn ChatMessage) -> String {
            if msg.source() == self.source {
                format_text(
                    &msg.channel().name,
                    &msg.user().display_name,
                    msg.raw_text(),
                    msg.attachments(),
                )
            } else {
                format_text(
                    &msg.source().to_string(),
                    &msg.user().display_name,
                    msg.text(),
                    msg.attachments(),
                )
            }
        }
    }

    #[async_trait]
    impl ChatAdapter for MockAdapter {
        fn channel_id(&self) -> &str {
            &self.channel
        }

        fn source(&self) -> Source {
            self.source
        }

        async fn send_message(&self, msg: &dyn ChatMessage) -> Result<String> {
            if self.fail_sends {
                return Err(anyhow::anyhow!("send rejected").into());
            }
            self.calls.lock().unwrap().push(Call::Send {
                body: self.render(msg),
            });
            Ok(self.next_id())
        }

        async fn send_reply(
            &self,
            parent_id: Option<&str>,
            msg: &dyn ChatMessage,
        ) -> Result<String> {
            let body = match parent_id {
                Some(_) => self.render(msg),
                None => with_fallback_suffix(&self.render(msg), REPLY_FALLBACK),
            };
            self.calls.lock().unwrap().push(Call::Reply {
                parent: parent_id.map(Into::into),
                body,
            });
            Ok(self.next_id())
        }

        async fn update_message(
            &self,
            message_id: Option<&str>,
            msg: &dyn ChatMessage,
        ) -> Result<()> {
            let body = match message_id {
                Some(_) => self.render(msg),
                None => with_fallback_suffix(&self.render(msg), EDIT_FALLBACK),
            };
            self.calls.lock().unwrap().push(Call::Update {
                id: message_id.map(Into::into),
                body,
            });
            Ok(())
        }

        async fn delete_message(&self, message_id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Delete {
                id: message_id.into(),
            });
            Ok(())
        }

        async fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<()> {
            self.calls.lock().unwrap().push(Call::React {
                id: message_id.into(),
                emoji: emoji.into(),
            });
            Ok(())
        }

        async fn remove_reaction(&self, message_id: &str, emoji: &str) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Unreact {
                id: message_id.into(),
                emoji: emoji.into(),
            });
            Ok(())
        }

        async fn remove_all_reactions(&self, message_id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(Call::UnreactAll {
                id: message_id.into(),
            });
            Ok(())
        }
    }

    const SLACK_TS: &str = "1700000000.000100";

    fn slack_channel() -> ChannelInfo {
        ChannelInfo {
            id: "C_S".into(),
            name: "general".into(),
            members: Vec::new(),
        }
    }

    fn discord_channel() -> ChannelInfo {
        ChannelInfo {
            id: "C_D".into(),
            name: "lounge".into(),
            members: Vec::new(),
        }
    }

    fn alice() -> User {
        User {
            id: "U1".into(),
            name: "alice".into(),
            display_name: "alice".into(),
            ..User::default()
        }
    }

    fn slack_msg(kind: MessageType, id: &str, text: &str) -> InboundMessage {
        Arc::new(SlackMessage {
            id: id.into(),
            kind: Some(kind),
            channel: slack_channel(),
            user: alice(),
            text: text.into(),
            raw_text: text.into(),
            ..SlackMessage::default()
        })
    }

    fn slack_reaction(kind: MessageType, target: &str, code: &str) -> InboundMessage {
        Arc::new(SlackMessage {
            id: target.into(),
            kind: Some(kind),
            channel: slack_channel(),
            user: alice(),
            reaction: code.into(),
            ..SlackMessage::default()
        })
    }

    fn discord_msg(kind: MessageType, id: &str, text: &str) -> InboundMessage {
        Arc::new(DiscordMessage {
            id: id.into(),
            kind: Some(kind),
            channel: discord_channel(),
            user: alice(),
            text: text.into(),
            raw_text: text.into(),
            ..DiscordMessage::default()
        })
    }

    fn discord_reply(id: &str, parent: &str, text: &str) -> InboundMessage {
        Arc::new(DiscordMessage {
            id: id.into(),
            kind: Some(MessageType::TextReply),
            channel: discord_channel(),
            user: alice(),
            text: text.into(),
            raw_text: text.into(),
            parent_id: Some(parent.into()),
            ..DiscordMessage::default()
        })
    }

    fn discord_reaction(kind: MessageType, target: &str, code: &str) -> InboundMessage {
        Arc::new(DiscordMessage {
            id: target.into(),
            kind: Some(kind),
            channel: discord_channel(),
            user: alice(),
            emoji_name: code.into(),
            ..DiscordMessage::default()
        })
    }

    fn test_room(adapters: Vec<Arc<dyn ChatAdapter>>) -> ChatRoom {
        let (_tx, rx) = mpsc::channel(16);
        ChatRoom::new(
            "test",
            adapters,
            rx,
            Arc::new(EmojiTable::from_pairs(["smile,:)", "ghost,"])),
        )
    }

    /// Standard fixture: one Slack channel and one Discord channel bridged.
    fn slack_discord_pair() -> (Arc<MockAdapter>, Arc<MockAdapter>, ChatRoom) {
        let slack = MockAdapter::new(Source::Slack, "C_S", &["s1", "s2"]);
        let discord = MockAdapter::new(Source::Discord, "C_D", &["d1", "d2"]);
        let room = test_room(vec![slack.clone(), discord.clone()]);
        (slack, discord, room)
    }

    #[tokio::test]
    async fn create_mirrors_to_peers_only() {
        let (slack, discord, mut room) = slack_discord_pair();

        room.dispatch(slack_msg(MessageType::TextCreate, SLACK_TS, "hello"))
            .await;

        assert_eq!(
            discord.calls(),
            vec![Call::Send {
                body: "From: [Slack] User: [alice] Send:\nhello".into()
            }]
        );
        assert!(slack.calls().is_empty());

        let tuple = room
            .history
            .search_back(|t| t.has_record(Source::Slack, "C_S", SLACK_TS))
            .unwrap();
        assert!(tuple.has_record(Source::Discord, "C_D", "d1"));
        assert!(tuple.records.len() <= 2);
    }

    #[tokio::test]
    async fn reply_propagates_and_links_child() {
        let (slack, _discord, mut room) = slack_discord_pair();

        room.dispatch(slack_msg(MessageType::TextCreate, SLACK_TS, "hello"))
            .await;
        room.dispatch(discord_reply("D1", "d1", "hi")).await;

        assert_eq!(
            slack.calls(),
            vec![Call::Reply {
                parent: Some(SLACK_TS.into()),
                body: "From: [Discord] User: [alice] Send:\nhi".into()
            }]
        );

        let parent = room
            .history
            .search_back(|t| t.has_record(Source::Slack, "C_S", SLACK_TS))
            .unwrap();
        let child = room
            .history
            .search_back(|t| t.has_record(Source::Discord, "C_D", "D1"))
            .unwrap();
        assert_eq!(parent.child(), Some(child.id()));
        assert_eq!(child.parent(), Some(parent.id()));
    }

    #[tokio::test]
    async fn nested_reply_resolves_slack_thread_root() {
        let (slack, _discord, mut room) = slack_discord_pair();

        room.dispatch(slack_msg(MessageType::TextCreate, SLACK_TS, "hello"))
            .await;
        // First reply consumes slack id "s1"; its reply tuple becomes the
        // parent of the next one.
        room.dispatch(discord_reply("D1", "d1", "hi")).await;
        room.dispatch(discord_reply("D2", "D1", "again")).await;

        // The second reply's Slack parent must be the thread root, not the
        // intermediate reply.
        let calls = slack.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1],
            Call::Reply {
                parent: Some(SLACK_TS.into()),
                body: "From: [Discord] User: [alice] Send:\nagain".into()
            }
        );
    }

    #[tokio::test]
    async fn edit_reaches_the_mirrored_copy() {
        let (_slack, discord, mut room) = slack_discord_pair();

        room.dispatch(slack_msg(MessageType::TextCreate, SLACK_TS, "hello"))
            .await;
        let before = room.history.len();
        room.dispatch(slack_msg(MessageType::TextUpdate, SLACK_TS, "hello!"))
            .await;

        assert_eq!(room.history.len(), before);
        assert_eq!(
            discord.calls()[1],
            Call::Update {
                id: Some("d1".into()),
                body: "From: [Slack] User: [alice] Send:\nhello!".into()
            }
        );
    }

    #[tokio::test]
    async fn delete_removes_tuple_and_mirrored_copy() {
        let (_slack, discord, mut room) = slack_discord_pair();

        room.dispatch(slack_msg(MessageType::TextCreate, SLACK_TS, "hello"))
            .await;
        room.dispatch(slack_msg(MessageType::TextDelete, SLACK_TS, ""))
            .await;

        assert_eq!(discord.calls()[1], Call::Delete { id: "d1".into() });
        assert!(room.history.is_empty());

        // A later edit of the same id now falls through to the plain send
        // carrying the not-found marker.
        room.dispatch(slack_msg(MessageType::TextUpdate, SLACK_TS, "ghost edit"))
            .await;
        match &discord.calls()[2] {
            Call::Update { id, body } => {
                assert_eq!(*id, None);
                assert!(body.ends_with("[Edit Message, Original message not found]"));
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_edit_falls_back_to_plain_send() {
        let (slack, _discord, mut room) = slack_discord_pair();

        room.dispatch(discord_msg(MessageType::TextUpdate, "unknown", "oops"))
            .await;

        match &slack.calls()[0] {
            Call::Update { id, body } => {
                assert_eq!(*id, None);
                assert!(body.ends_with("[Edit Message, Original message not found]"));
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_reply_falls_back_to_plain_send() {
        let (slack, _discord, mut room) = slack_discord_pair();

        room.dispatch(discord_reply("D1", "missing", "hi")).await;

        match &slack.calls()[0] {
            Call::Reply { parent, body } => {
                assert_eq!(*parent, None);
                assert!(body.ends_with("[Reply Message, Parent message not found]"));
            }
            other => panic!("unexpected call {other:?}"),
        }
        // The reply tuple is still recorded for later edits.
        assert!(room
            .history
            .search_back(|t| t.has_record(Source::Discord, "C_D", "D1"))
            .is_some());
    }

    #[tokio::test]
    async fn reactions_translate_emoji_in_both_directions() {
        let (slack, discord, mut room) = slack_discord_pair();

        room.dispatch(slack_msg(MessageType::TextCreate, SLACK_TS, "hello"))
            .await;

        room.dispatch(slack_reaction(MessageType::ActionAdd, SLACK_TS, "smile"))
            .await;
        assert_eq!(
            discord.calls()[1],
            Call::React {
                id: "d1".into(),
                emoji: ":)".into()
            }
        );

        room.dispatch(discord_reaction(MessageType::ActionAdd, "d1", ":)"))
            .await;
        assert_eq!(
            slack.calls(),
            vec![Call::React {
                id: SLACK_TS.into(),
                emoji: "smile".into()
            }]
        );
    }

    #[tokio::test]
    async fn unknown_emoji_codes_forward_unchanged() {
        let (_slack, discord, mut room) = slack_discord_pair();

        room.dispatch(slack_msg(MessageType::TextCreate, SLACK_TS, "hello"))
            .await;
        room.dispatch(slack_reaction(MessageType::ActionRemove, SLACK_TS, "mystery"))
            .await;

        assert_eq!(
            discord.calls()[1],
            Call::Unreact {
                id: "d1".into(),
                emoji: "mystery".into()
            }
        );
    }

    #[tokio::test]
    async fn empty_emoji_rendering_skips_the_peer() {
        let (_slack, discord, mut room) = slack_discord_pair();

        room.dispatch(slack_msg(MessageType::TextCreate, SLACK_TS, "hello"))
            .await;
        // "ghost" maps to an empty rendering in the test table.
        room.dispatch(slack_reaction(MessageType::ActionAdd, SLACK_TS, "ghost"))
            .await;

        assert_eq!(discord.calls().len(), 1);
    }

    #[tokio::test]
    async fn remove_all_reactions_needs_no_emoji() {
        let (_slack, discord, mut room) = slack_discord_pair();

        room.dispatch(slack_msg(MessageType::TextCreate, SLACK_TS, "hello"))
            .await;
        room.dispatch(slack_reaction(MessageType::ActionRemoveAll, SLACK_TS, ""))
            .await;

        assert_eq!(discord.calls()[1], Call::UnreactAll { id: "d1".into() });
    }

    #[tokio::test]
    async fn reactions_against_unknown_targets_are_dropped() {
        let (slack, discord, mut room) = slack_discord_pair();

        room.dispatch(slack_reaction(MessageType::ActionAdd, "nope", "smile"))
            .await;

        assert!(slack.calls().is_empty());
        assert!(discord.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_sends_record_empty_ids_and_continue() {
        let slack = MockAdapter::new(Source::Slack, "C_S", &["s1"]);
        let discord = MockAdapter::failing(Source::Discord, "C_D");
        let matrix = MockAdapter::new(Source::Matrix, "!r1", &["m1"]);
        let mut room = test_room(vec![slack.clone(), discord.clone(), matrix.clone()]);

        room.dispatch(slack_msg(MessageType::TextCreate, SLACK_TS, "hello"))
            .await;

        // The failing peer did not abort fan-out to the rest of the room.
        assert_eq!(matrix.calls().len(), 1);

        let tuple = room
            .history
            .search_back(|t| t.has_record(Source::Slack, "C_S", SLACK_TS))
            .unwrap();
        assert!(tuple.has_record(Source::Discord, "C_D", ""));
        assert_eq!(tuple.records.len(), 3);

        // The failed mirror has no resolvable id, so an edit falls back.
        room.dispatch(slack_msg(MessageType::TextUpdate, SLACK_TS, "hello!"))
            .await;
        match discord.calls().first() {
            Some(Call::Update { id: None, .. }) => {}
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[tokio::test]
    async fn same_platform_different_channel_is_a_peer() {
        let origin = MockAdapter::new(Source::Slack, "C_S", &[]);
        let sibling = MockAdapter::new(Source::Slack, "C_S2", &["s2"]);
        let mut room = test_room(vec![origin.clone(), sibling.clone()]);

        room.dispatch(slack_msg(MessageType::TextCreate, SLACK_TS, "hello"))
            .await;

        assert!(origin.calls().is_empty());
        // Same-platform mirrors render the origin channel name, not the
        // platform name.
        assert_eq!(
            sibling.calls(),
            vec![Call::Send {
                body: "From: [general] User: [alice] Send:\nhello".into()
            }]
        );
    }
}
