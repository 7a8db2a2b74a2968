//! Slack gateway and room adapter, speaking Socket Mode via slack-morphism.
//!
//! One [`SlackGateway`] exists per process; every bridged Slack channel gets
//! a lightweight [`SlackChat`] handle bound to it. The gateway owns the
//! Socket Mode listener, the REST client, and the entity cache shared by all
//! rooms that bridge Slack.

use std::sync::{Arc, LazyLock};

use anyhow::Context as _;
use regex::Regex;
use slack_morphism::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::cache::EntityCache;
use crate::chat::{self, ChatAdapter, Subscriptions};
use crate::config::SlackConfig;
use crate::emoji::EmojiTable;
use crate::error::Result;
use crate::model::{
    Attachment, ChannelInfo, ChatMessage, InboundMessage, MessageType, SlackMessage, Source, User,
};

/// Connection plus caches shared by every Slack channel adapter.
pub struct SlackGateway {
    client: Arc<SlackHyperClient>,
    token: SlackApiToken,
    self_id: String,
    cache: EntityCache,
    subs: Subscriptions,
    emoji: Arc<EmojiTable>,
}

impl SlackGateway {
    /// Authenticate, prefill the entity cache for the configured channels and
    /// start the Socket Mode listener.
    pub async fn connect(
        config: &SlackConfig,
        channel_ids: &[String],
        emoji: Arc<EmojiTable>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new().context("failed to create slack HTTP connector")?,
        ));
        let token = SlackApiToken::new(SlackApiTokenValue(config.token.clone()));

        let auth = client
            .open_session(&token)
            .auth_test()
            .await
            .context("slack auth.test failed")?;
        let self_id = auth.user_id.0.clone();
        tracing::info!(self_id = %self_id, "slack connected");

        let gateway = Arc::new(Self {
            client,
            token,
            self_id,
            cache: EntityCache::new(),
            subs: Subscriptions::new(),
            emoji,
        });

        gateway.prefill(channel_ids).await;
        start_socket_mode(gateway.clone(), &config.app_level_token, cancel)?;
        Ok(gateway)
    }

    /// Register a per-room inbound sender and return the adapter handle for
    /// one channel.
    pub async fn attach(
        self: &Arc<Self>,
        channel_id: &str,
        tx: tokio::sync::mpsc::Sender<InboundMessage>,
    ) -> SlackChat {
        self.subs.register(channel_id, tx).await;
        SlackChat {
            gateway: self.clone(),
            channel: channel_id.to_string(),
        }
    }

    /// Open a session against the cached client using the cached bot token.
    fn session(&self) -> SlackClientSession<'_, SlackClientHyperHttpsConnector> {
        self.client.open_session(&self.token)
    }

    /// Warm the cache: configured channels first, then every member of them.
    async fn prefill(&self, channel_ids: &[String]) {
        let mut user_ids = Vec::new();
        for (_, info) in self.channels_info(channel_ids).await {
            tracing::debug!(channel = %info.id, name = %info.name, "synced slack channel");
            user_ids.extend(info.members);
        }
        user_ids.sort();
        user_ids.dedup();
        tracing::debug!(count = user_ids.len(), "syncing slack users");
        self.users_info(&user_ids).await;
    }

    async fn channel_info(&self, channel_id: &str) -> ChannelInfo {
        let ids = [channel_id.to_string()];
        self.channels_info(&ids)
            .await
            .remove(channel_id)
            .unwrap_or_else(|| ChannelInfo::unknown(channel_id))
    }

    /// Cached subset plus synchronous resolution of the missing channels.
    async fn channels_info(
        &self,
        ids: &[String],
    ) -> std::collections::HashMap<String, ChannelInfo> {
        let (mut found, missing) = self.cache.split_channels(ids).await;
        if missing.is_empty() {
            return found;
        }
        let mut fetched = Vec::new();
        for id in &missing {
            match self.fetch_channel(id).await {
                Ok(info) => fetched.push(info),
                Err(error) => {
                    tracing::warn!(channel_id = %id, %error, "failed to get slack channel info");
                }
            }
        }
        for info in &fetched {
            found.insert(info.id.clone(), info.clone());
        }
        self.cache.merge_channels(fetched);
        found
    }

    async fn fetch_channel(&self, channel_id: &str) -> Result<ChannelInfo> {
        let response = self
            .session()
            .conversations_info(&SlackApiConversationsInfoRequest::new(SlackChannelId(
                channel_id.to_string(),
            )))
            .await
            .context("conversations.info failed")?;
        let members = self.channel_members(channel_id).await.unwrap_or_default();
        Ok(ChannelInfo {
            id: channel_id.to_string(),
            name: response.channel.name.unwrap_or_default(),
            members,
        })
    }

    async fn channel_members(&self, channel_id: &str) -> Result<Vec<String>> {
        let mut members = Vec::new();
        let mut cursor = None;
        loop {
            let mut request = SlackApiConversationsMembersRequest::new()
                .with_channel(SlackChannelId(channel_id.to_string()))
                .with_limit(100);
            if let Some(c) = cursor {
                request = request.with_cursor(c);
            }
            let response = self
                .session()
                .conversations_members(&request)
                .await
                .context("conversations.members failed")?;
            members.extend(response.members.into_iter().map(|m| m.0));
            match response
                .response_metadata
                .and_then(|meta| meta.next_cursor)
                .filter(|c| !c.0.is_empty())
            {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(members)
    }

    async fn user_info(&self, user_id: &str) -> User {
        if user_id.is_empty() {
            return User::unknown(user_id);
        }
        let ids = [user_id.to_string()];
        self.users_info(&ids)
            .await
            .remove(user_id)
            .unwrap_or_else(|| User::unknown(user_id))
    }

    /// Cached subset plus synchronous resolution of the missing users.
    async fn users_info(&self, ids: &[String]) -> std::collections::HashMap<String, User> {
        let (mut found, missing) = self.cache.split_users(ids).await;
        if missing.is_empty() {
            return found;
        }
        let mut fetched = Vec::new();
        for id in &missing {
            match self.fetch_user(id).await {
                Ok(user) => fetched.push(user),
                Err(error) => {
                    tracing::warn!(user_id = %id, %error, "failed to get slack user info");
                }
            }
        }
        for user in &fetched {
            found.insert(user.id.clone(), user.clone());
        }
        self.cache.merge_users(fetched);
        found
    }

    async fn fetch_user(&self, user_id: &str) -> Result<User> {
        let response = self
            .session()
            .users_info(&SlackApiUsersInfoRequest::new(SlackUserId(
                user_id.to_string(),
            )))
            .await
            .context("users.info failed")?;
        let user = response.user;
        let name = user.name.clone().unwrap_or_default();
        let display_name = user
            .profile
            .as_ref()
            .and_then(|p| p.display_name.clone().or_else(|| p.real_name.clone()))
            .filter(|n| !n.trim().is_empty())
            .or_else(|| Some(name.clone()).filter(|n| !n.is_empty()))
            .unwrap_or_else(|| user_id.to_string());
        Ok(User {
            id: user.id.0.clone(),
            name,
            display_name,
            ..User::default()
        })
    }

    /// Rewrite `<@U…>` references into `@DisplayName`.
    async fn replace_mentions(&self, text: &str) -> String {
        static MENTION: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"<@([A-Z0-9]+)>").expect("slack mention pattern"));

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in MENTION.captures_iter(text) {
            let whole = caps.get(0).expect("match");
            let user = self.user_info(&caps[1]).await;
            out.push_str(&text[last..whole.start()]);
            out.push('@');
            out.push_str(&user.display_name);
            last = whole.end();
        }
        out.push_str(&text[last..]);
        out
    }

    /// Substitute `:shortcode:` occurrences with their non-Slack rendering.
    /// Shortcodes without a translation are left alone.
    fn replace_shortcodes(&self, text: &str) -> String {
        static SHORTCODE: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r":([a-z0-9_+'\-]+):").expect("shortcode pattern"));

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in SHORTCODE.captures_iter(text) {
            let whole = caps.get(0).expect("match");
            let replacement = self.emoji.slack_convert(&caps[1]);
            if replacement.is_empty() {
                continue;
            }
            out.push_str(&text[last..whole.start()]);
            out.push_str(&replacement);
            last = whole.end();
        }
        out.push_str(&text[last..]);
        out
    }

    async fn publish(&self, channel_id: &str, msg: SlackMessage) {
        self.subs.publish(channel_id, Arc::new(msg)).await;
    }

    // -----------------------------------------------------------------------
    // Inbound event normalisation
    // -----------------------------------------------------------------------

    async fn on_message_event(&self, event: SlackMessageEvent) {
        let Some(channel_id) = event.origin.channel.as_ref().map(|c| c.0.clone()) else {
            return;
        };
        // Public and private channels only; DM traffic is not bridged.
        if channel_id.starts_with('D') {
            return;
        }
        let channel = self.channel_info(&channel_id).await;

        match event.subtype {
            Some(SlackMessageEventType::MessageChanged) => {
                let Some(edited) = event.message else {
                    tracing::warn!("message_changed event without embedded message");
                    return;
                };
                let user_id = edited.sender.user.as_ref().map(|u| u.0.clone());
                if user_id.as_deref() == Some(self.self_id.as_str()) {
                    return;
                }
                let raw_text = edited
                    .content
                    .as_ref()
                    .and_then(|c| c.text.clone())
                    .unwrap_or_default();
                let text = self.replace_shortcodes(&self.replace_mentions(&raw_text).await);
                let msg = SlackMessage {
                    id: edited.ts.0.clone(),
                    kind: Some(MessageType::TextUpdate),
                    channel,
                    user: self.user_info(user_id.as_deref().unwrap_or_default()).await,
                    text,
                    raw_text,
                    attachments: file_attachments(&edited.content),
                    ..SlackMessage::default()
                };
                self.publish(&channel_id, msg).await;
            }
            Some(SlackMessageEventType::MessageDeleted) => {
                let Some(previous) = event.previous_message else {
                    tracing::warn!("message_deleted event without previous message");
                    return;
                };
                if previous.sender.user.as_ref().map(|u| u.0.as_str())
                    == Some(self.self_id.as_str())
                {
                    return;
                }
                let msg = SlackMessage {
                    id: previous.ts.0.clone(),
                    kind: Some(MessageType::TextDelete),
                    channel,
                    ..SlackMessage::default()
                };
                self.publish(&channel_id, msg).await;
            }
            _ => {
                let user_id = event.sender.user.as_ref().map(|u| u.0.clone());
                if user_id.as_deref() == Some(self.self_id.as_str()) {
                    return;
                }
                let ts = event.origin.ts.0.clone();
                let raw_text = event
                    .content
                    .as_ref()
                    .and_then(|c| c.text.clone())
                    .unwrap_or_default();
                let text = self.replace_shortcodes(&self.replace_mentions(&raw_text).await);
                let mut msg = SlackMessage {
                    id: ts.clone(),
                    kind: Some(MessageType::TextCreate),
                    channel,
                    user: self.user_info(user_id.as_deref().unwrap_or_default()).await,
                    text,
                    raw_text,
                    send_time: parse_slack_timestamp(&ts),
                    attachments: file_attachments(&event.content),
                    ..SlackMessage::default()
                };
                if let Some(thread_ts) = event.origin.thread_ts {
                    msg.kind = Some(MessageType::TextReply);
                    msg.parent_id = Some(thread_ts.0);
                }
                self.publish(&channel_id, msg).await;
            }
        }
    }

    async fn on_reaction(&self, kind: MessageType, user: SlackUserId, reaction: SlackReactionName, item: SlackReactionsItem) {
        if user.0 == self.self_id {
            return;
        }
        let Some((channel_id, ts)) = reaction_item_address(&item) else {
            return;
        };
        let msg = SlackMessage {
            id: ts,
            kind: Some(kind),
            channel: self.channel_info(&channel_id).await,
            user: self.user_info(&user.0).await,
            reaction: reaction.0,
            ..SlackMessage::default()
        };
        self.publish(&channel_id, msg).await;
    }
}

/// The channel and timestamp a reaction event points at, when it targets a
/// message.
fn reaction_item_address(item: &SlackReactionsItem) -> Option<(String, String)> {
    match item {
        SlackReactionsItem::Message(message) => Some((
            message.origin.channel.as_ref()?.0.clone(),
            message.origin.ts.0.clone(),
        )),
        _ => None,
    }
}

fn file_attachments(content: &Option<SlackMessageContent>) -> Vec<Attachment> {
    let Some(files) = content.as_ref().and_then(|c| c.files.as_ref()) else {
        return Vec::new();
    };
    files
        .iter()
        .filter_map(|f| {
            let url = f.url_private.as_ref()?;
            Some(Attachment {
                name: f.name.clone().unwrap_or_default(),
                media_type: f.mimetype.as_ref().map(|m| m.0.clone()).unwrap_or_default(),
                url: url.to_string(),
            })
        })
        .collect()
}

/// Parse a Slack `sec.nsec` timestamp into nanoseconds since epoch.
/// Unparseable input maps to zero.
fn parse_slack_timestamp(ts: &str) -> i64 {
    let mut parts = ts.splitn(2, '.');
    let sec: i64 = match parts.next().and_then(|s| s.parse().ok()) {
        Some(sec) => sec,
        None => return 0,
    };
    let nsec = match parts.next() {
        Some(frac) if !frac.is_empty() => {
            let padded = format!("{frac:0<9}");
            match padded[..9].parse::<i64>() {
                Ok(nsec) => nsec,
                Err(_) => return 0,
            }
        }
        _ => 0,
    };
    sec * 1_000_000_000 + nsec
}

// ---------------------------------------------------------------------------
// Socket mode wiring (fn pointers — slack-morphism requirement)
// ---------------------------------------------------------------------------

async fn handle_push_event(
    event: SlackPushEventCallback,
    _client: Arc<SlackHyperClient>,
    states: SlackClientEventsUserState,
) -> UserCallbackResult<()> {
    let gateway = {
        let guard = states.read().await;
        guard.get_user_state::<Arc<SlackGateway>>().cloned()
    };
    let Some(gateway) = gateway else {
        return Ok(());
    };
    match event.event {
        SlackEventCallbackBody::Message(message) => {
            gateway.on_message_event(message).await;
        }
        SlackEventCallbackBody::ReactionAdded(added) => {
            gateway
                .on_reaction(MessageType::ActionAdd, added.user, added.reaction, added.item)
                .await;
        }
        SlackEventCallbackBody::ReactionRemoved(removed) => {
            gateway
                .on_reaction(
                    MessageType::ActionRemove,
                    removed.user,
                    removed.reaction,
                    removed.item,
                )
                .await;
        }
        _ => {}
    }
    Ok(())
}

fn socket_mode_error_handler(
    err: Box<dyn std::error::Error + Send + Sync>,
    _client: Arc<SlackHyperClient>,
    _states: SlackClientEventsUserState,
) -> HttpStatusCode {
    tracing::warn!(error = %err, "slack socket mode error");
    HttpStatusCode::OK
}

fn start_socket_mode(
    gateway: Arc<SlackGateway>,
    app_token: &str,
    cancel: CancellationToken,
) -> Result<()> {
    // The socket mode listener needs its own client — it owns a persistent
    // WebSocket connection. The shared REST client stays on the gateway.
    let listener_client = Arc::new(SlackClient::new(
        SlackClientHyperConnector::new()
            .context("failed to create slack socket mode connector")?,
    ));
    let environment = Arc::new(
        SlackClientEventsListenerEnvironment::new(listener_client)
            .with_error_handler(socket_mode_error_handler)
            .with_user_state(gateway),
    );

    let callbacks = SlackSocketModeListenerCallbacks::new().with_push_events(handle_push_event);
    let listener = SlackClientSocketModeListener::new(
        &SlackClientSocketModeConfig::new(),
        environment,
        callbacks,
    );
    let app_token = SlackApiToken::new(SlackApiTokenValue(app_token.to_string()));

    tokio::spawn(async move {
        if let Err(error) = listener.listen_for(&app_token).await {
            tracing::error!(%error, "failed to start slack socket mode listener");
            return;
        }
        tracing::info!("slack socket mode connected");
        tokio::select! {
            _ = listener.serve() => {
                tracing::info!("slack socket mode listener stopped");
            }
            _ = cancel.cancelled() => {
                tracing::info!("slack socket mode shutting down");
                listener.shutdown().await;
            }
        }
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Room adapter
// ---------------------------------------------------------------------------

/// One bridged Slack channel.
pub struct SlackChat {
    gateway: Arc<SlackGateway>,
    channel: String,
}

impl SlackChat {
    fn target(&self) -> SlackChannelId {
        SlackChannelId(self.channel.clone())
    }

    async fn render(&self, msg: &dyn ChatMessage) -> String {
        if msg.source() == Source::Slack {
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

    async fn post(&self, text: String, thread_ts: Option<SlackTs>) -> Result<String> {
        let request = SlackApiChatPostMessageRequest::new(
            self.target(),
            SlackMessageContent::new().with_text(text),
        )
        .opt_thread_ts(thread_ts);
        let response = self
            .gateway
            .session()
            .chat_post_message(&request)
            .await
            .context("failed to send slack message")?;
        Ok(response.ts.0)
    }
}

#[async_trait::async_trait]
impl ChatAdapter for SlackChat {
    fn channel_id(&self) -> &str {
        &self.channel
    }

    fn source(&self) -> Source {
        Source::Slack
    }

    async fn send_message(&self, msg: &dyn ChatMessage) -> Result<String> {
        self.post(self.render(msg).await, None).await
    }

    async fn send_reply(&self, parent_id: Option<&str>, msg: &dyn ChatMessage) -> Result<String> {
        match parent_id {
            Some(parent) => {
                self.post(
                    self.render(msg).await,
                    Some(SlackTs(parent.to_string())),
                )
                .await
            }
            None => {
                let text =
                    chat::with_fallback_suffix(&self.render(msg).await, chat::REPLY_FALLBACK);
                self.post(text, None).await
            }
        }
    }

    async fn update_message(&self, message_id: Option<&str>, msg: &dyn ChatMessage) -> Result<()> {
        let Some(message_id) = message_id else {
            let text = chat::with_fallback_suffix(&self.render(msg).await, chat::EDIT_FALLBACK);
            self.post(text, None).await?;
            return Ok(());
        };
        let request = SlackApiChatUpdateRequest::new(
            self.target(),
            SlackMessageContent::new().with_text(self.render(msg).await),
            SlackTs(message_id.to_string()),
        );
        self.gateway
            .session()
            .chat_update(&request)
            .await
            .context("failed to update slack message")?;
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        let request = SlackApiChatDeleteRequest::new(self.target(), SlackTs(message_id.to_string()));
        self.gateway
            .session()
            .chat_delete(&request)
            .await
            .context("failed to delete slack message")?;
        Ok(())
    }

    async fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<()> {
        let request = SlackApiReactionsAddRequest::new(
            self.target(),
            SlackReactionName(emoji.to_string()),
            SlackTs(message_id.to_string()),
        );
        self.gateway
            .session()
            .reactions_add(&request)
            .await
            .context("failed to add slack reaction")?;
        Ok(())
    }

    async fn remove_reaction(&self, message_id: &str, emoji: &str) -> Result<()> {
        let request = SlackApiReactionsRemoveRequest::new(SlackReactionName(emoji.to_string()))
            .with_channel(self.target())
            .with_timestamp(SlackTs(message_id.to_string()));
        self.gateway
            .session()
            .reactions_remove(&request)
            .await
            .context("failed to remove slack reaction")?;
        Ok(())
    }

    async fn remove_all_reactions(&self, message_id: &str) -> Result<()> {
        let request = SlackApiReactionsGetRequest::new()
            .with_channel(self.target())
            .with_timestamp(SlackTs(message_id.to_string()));
        let response = self
            .gateway
            .session()
            .reactions_get(&request)
            .await
            .context("failed to list slack reactions")?;
        let SlackApiReactionsGetResponse::Message(message_response) = response else {
            return Ok(());
        };
        let Some(reactions) = message_response.message.content.reactions else {
            return Ok(());
        };
        for reaction in reactions {
            let request = SlackApiReactionsRemoveRequest::new(reaction.name)
                .with_channel(self.target())
                .with_timestamp(SlackTs(message_id.to_string()));
            self.gateway
                .session()
                .reactions_remove(&request)
                .await
                .context("failed to remove slack reaction")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slack_timestamps_parse_to_nanoseconds() {
        assert_eq!(parse_slack_timestamp("1700000000.000100"), 1_700_000_000_000_100_000);
        assert_eq!(parse_slack_timestamp("1700000000"), 1_700_000_000_000_000_000);
        assert_eq!(parse_slack_timestamp(""), 0);
        assert_eq!(parse_slack_timestamp("not-a-ts"), 0);
    }

    #[test]
    fn shortcode_pattern_matches_slack_names() {
        let re = Regex::new(r":([a-z0-9_+'\-]+):").unwrap();
        let caps = re.captures("nice work :thumbsup: !").unwrap();
        assert_eq!(&caps[1], "thumbsup");
        assert!(re.captures("plain text").is_none());
        assert!(re.captures("::").is_none());
    }
}
