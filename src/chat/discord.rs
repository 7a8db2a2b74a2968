//! Discord gateway and room adapter using serenity.

use std::sync::{Arc, LazyLock};

use anyhow::Context as _;
use async_trait::async_trait;
use regex::Regex;
use serenity::all::{
    Channel, ChannelId, Context, CreateMessage, EditMessage, EventHandler, GatewayIntents, Http,
    Message, MessageId, MessageReference, MessageType as DiscordEventKind, MessageUpdateEvent,
    Reaction, ReactionType, Ready, UserId,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::cache::EntityCache;
use crate::chat::{self, ChatAdapter, Subscriptions};
use crate::config::DiscordConfig;
use crate::error::Result;
use crate::model::{
    Attachment, ChannelInfo, ChatMessage, DiscordMessage, InboundMessage, MessageType, Source,
    User,
};

/// Gateway connection plus caches shared by every Discord channel adapter.
pub struct DiscordGateway {
    /// Filled once the serenity client is built.
    http: RwLock<Option<Arc<Http>>>,
    /// Filled by the `ready` event.
    self_id: RwLock<Option<UserId>>,
    cache: EntityCache,
    subs: Subscriptions,
}

impl DiscordGateway {
    /// Build the serenity client, prefill the channel cache and start the
    /// gateway task.
    pub async fn connect(
        config: &DiscordConfig,
        channel_ids: &[String],
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let gateway = Arc::new(Self {
            http: RwLock::new(None),
            self_id: RwLock::new(None),
            cache: EntityCache::new(),
            subs: Subscriptions::new(),
        });

        let handler = Handler {
            gateway: gateway.clone(),
        };
        let intents = GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::GUILD_MESSAGE_REACTIONS
            | GatewayIntents::MESSAGE_CONTENT;

        let mut client = serenity::Client::builder(&config.token, intents)
            .event_handler(handler)
            .await
            .context("failed to build discord client")?;

        *gateway.http.write().await = Some(client.http.clone());

        for (_, info) in gateway.channels_info(channel_ids).await {
            tracing::debug!(channel = %info.id, name = %info.name, "synced discord channel");
        }

        let shard_manager = client.shard_manager.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = client.start() => {
                    if let Err(error) = result {
                        tracing::error!(%error, "discord gateway error");
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("discord gateway shutting down");
                    shard_manager.shutdown_all().await;
                }
            }
        });

        Ok(gateway)
    }

    /// Register a per-room inbound sender and return the adapter handle for
    /// one channel.
    pub async fn attach(
        self: &Arc<Self>,
        channel_id: &str,
        tx: tokio::sync::mpsc::Sender<InboundMessage>,
    ) -> DiscordChat {
        self.subs.register(channel_id, tx).await;
        DiscordChat {
            gateway: self.clone(),
            channel: channel_id.to_string(),
        }
    }

    async fn http(&self) -> Result<Arc<Http>> {
        Ok(self
            .http
            .read()
            .await
            .clone()
            .context("discord not connected")?)
    }

    async fn is_self(&self, user_id: UserId) -> bool {
        *self.self_id.read().await == Some(user_id)
    }

    async fn channel_info(&self, channel_id: &str) -> ChannelInfo {
        let ids = [channel_id.to_string()];
        self.channels_info(&ids)
            .await
            .remove(channel_id)
            .unwrap_or_else(|| ChannelInfo::unknown(channel_id))
    }

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
                    tracing::warn!(channel_id = %id, %error, "failed to get discord channel info");
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
        let http = self.http().await?;
        let id: u64 = channel_id
            .parse()
            .context("invalid discord channel id")?;
        let channel = http
            .get_channel(ChannelId::new(id))
            .await
            .context("failed to fetch discord channel")?;
        let name = match channel {
            Channel::Guild(guild_channel) => guild_channel.name,
            _ => String::new(),
        };
        Ok(ChannelInfo {
            id: channel_id.to_string(),
            name,
            members: Vec::new(),
        })
    }

    async fn user_info(&self, user_id: &str) -> User {
        if user_id.is_empty() {
            return User::unknown(user_id);
        }
        if let Some(user) = self.cache.user(user_id).await {
            return user;
        }
        match self.fetch_user(user_id).await {
            Ok(user) => {
                self.cache.merge_users(vec![user.clone()]);
                user
            }
            Err(error) => {
                tracing::warn!(user_id = %user_id, %error, "failed to get discord user info");
                User::unknown(user_id)
            }
        }
    }

    async fn fetch_user(&self, user_id: &str) -> Result<User> {
        let http = self.http().await?;
        let id: u64 = user_id.parse().context("invalid discord user id")?;
        let user = http
            .get_user(UserId::new(id))
            .await
            .context("failed to fetch discord user")?;
        let display_name = user
            .global_name
            .clone()
            .unwrap_or_else(|| user.name.clone());
        Ok(User {
            id: user.id.to_string(),
            name: user.name.clone(),
            display_name,
            avatar: user.avatar_url().unwrap_or_default(),
            bot_id: if user.bot { user.id.to_string() } else { String::new() },
        })
    }

    async fn publish(&self, channel_id: &str, msg: DiscordMessage) {
        self.subs.publish(channel_id, Arc::new(msg)).await;
    }

    // -----------------------------------------------------------------------
    // Inbound event normalisation
    // -----------------------------------------------------------------------

    async fn on_message_create(&self, msg: Message) {
        if self.is_self(msg.author.id).await {
            return;
        }
        let author = cache_author(&self.cache, &msg.author);
        let channel = self.channel_info(&msg.channel_id.to_string()).await;

        let mentions: Vec<(String, String)> = msg
            .mentions
            .iter()
            .map(|u| (u.id.to_string(), display_of(u)))
            .collect();
        let text = replace_user_mentions(&msg.content, &mentions);

        let mut out = DiscordMessage {
            id: msg.id.to_string(),
            kind: Some(MessageType::TextCreate),
            channel,
            user: author,
            text,
            raw_text: msg.content.clone(),
            send_time: msg.timestamp.unix_timestamp() * 1_000_000_000,
            attachments: msg.attachments.iter().map(map_attachment).collect(),
            ..DiscordMessage::default()
        };
        if msg.kind == DiscordEventKind::InlineReply {
            if let Some(parent) = msg
                .message_reference
                .as_ref()
                .and_then(|r| r.message_id)
            {
                out.kind = Some(MessageType::TextReply);
                out.parent_id = Some(parent.to_string());
            }
        }
        self.publish(&msg.channel_id.to_string(), out).await;
    }

    async fn on_message_update(&self, new: Option<Message>, event: MessageUpdateEvent) {
        // The gateway may deliver a full message or only the changed fields.
        let (id, channel_id, author, content, mentions, attachments) = match new {
            Some(msg) => (
                msg.id,
                msg.channel_id,
                Some(msg.author.clone()),
                msg.content.clone(),
                msg.mentions.clone(),
                msg.attachments.clone(),
            ),
            None => (
                event.id,
                event.channel_id,
                event.author,
                event.content.unwrap_or_default(),
                event.mentions.unwrap_or_default(),
                event.attachments.unwrap_or_default(),
            ),
        };
        let Some(author) = author else {
            return;
        };
        if self.is_self(author.id).await {
            return;
        }
        let user = cache_author(&self.cache, &author);
        let channel = self.channel_info(&channel_id.to_string()).await;

        let mentions: Vec<(String, String)> = mentions
            .iter()
            .map(|u| (u.id.to_string(), display_of(u)))
            .collect();
        let text = replace_user_mentions(&content, &mentions);

        let out = DiscordMessage {
            id: id.to_string(),
            kind: Some(MessageType::TextUpdate),
            channel,
            user,
            text,
            raw_text: content,
            attachments: attachments.iter().map(map_attachment).collect(),
            ..DiscordMessage::default()
        };
        self.publish(&channel_id.to_string(), out).await;
    }

    async fn on_message_delete(&self, channel_id: ChannelId, message_id: MessageId) {
        let out = DiscordMessage {
            id: message_id.to_string(),
            kind: Some(MessageType::TextDelete),
            channel: self.channel_info(&channel_id.to_string()).await,
            ..DiscordMessage::default()
        };
        self.publish(&channel_id.to_string(), out).await;
    }

    async fn on_reaction(&self, kind: MessageType, reaction: Reaction) {
        if let Some(user_id) = reaction.user_id {
            if self.is_self(user_id).await {
                return;
            }
        }
        let user = match reaction.user_id {
            Some(user_id) => self.user_info(&user_id.to_string()).await,
            None => User::unknown(""),
        };
        let out = DiscordMessage {
            id: reaction.message_id.to_string(),
            kind: Some(kind),
            channel: self.channel_info(&reaction.channel_id.to_string()).await,
            user,
            emoji_name: reaction_name(&reaction.emoji),
            ..DiscordMessage::default()
        };
        self.publish(&reaction.channel_id.to_string(), out).await;
    }

    async fn on_reaction_remove_all(&self, channel_id: ChannelId, message_id: MessageId) {
        let out = DiscordMessage {
            id: message_id.to_string(),
            kind: Some(MessageType::ActionRemoveAll),
            channel: self.channel_info(&channel_id.to_string()).await,
            ..DiscordMessage::default()
        };
        self.publish(&channel_id.to_string(), out).await;
    }
}

/// Message authors arrive with every event, so they are written straight into
/// the cache instead of being looked up.
fn cache_author(cache: &EntityCache, author: &serenity::all::User) -> User {
    let user = User {
        id: author.id.to_string(),
        name: author.name.clone(),
        display_name: display_of(author),
        avatar: author.avatar_url().unwrap_or_default(),
        bot_id: if author.bot {
            author.id.to_string()
        } else {
            String::new()
        },
    };
    cache.merge_users(vec![user.clone()]);
    user
}

fn display_of(user: &serenity::all::User) -> String {
    user.global_name.clone().unwrap_or_else(|| user.name.clone())
}

fn map_attachment(attachment: &serenity::all::Attachment) -> Attachment {
    Attachment {
        name: attachment.filename.clone(),
        media_type: attachment.content_type.clone().unwrap_or_default(),
        url: attachment.url.clone(),
    }
}

fn reaction_name(reaction: &ReactionType) -> String {
    match reaction {
        ReactionType::Unicode(code) => code.clone(),
        ReactionType::Custom { name, .. } => name.clone().unwrap_or_default(),
        _ => String::new(),
    }
}

/// Rewrite `<@id>` / `<@!id>` references using the users the event itself
/// names as mentioned.
fn replace_user_mentions(content: &str, mentions: &[(String, String)]) -> String {
    static MENTION: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"<@!?(\d+)>").expect("discord mention pattern"));

    let mut out = String::with_capacity(content.len());
    let mut last = 0;
    for caps in MENTION.captures_iter(content) {
        let whole = caps.get(0).expect("match");
        let id = &caps[1];
        if let Some((_, display)) = mentions.iter().find(|(uid, _)| uid == id) {
            out.push_str(&content[last..whole.start()]);
            out.push('@');
            out.push_str(display);
            last = whole.end();
        }
    }
    out.push_str(&content[last..]);
    out
}

struct Handler {
    gateway: Arc<DiscordGateway>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        *self.gateway.self_id.write().await = Some(ready.user.id);
        tracing::info!(user = %ready.user.name, "discord gateway ready");
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        self.gateway.on_message_create(msg).await;
    }

    async fn message_update(
        &self,
        _ctx: Context,
        _old_if_available: Option<Message>,
        new: Option<Message>,
        event: MessageUpdateEvent,
    ) {
        self.gateway.on_message_update(new, event).await;
    }

    async fn message_delete(
        &self,
        _ctx: Context,
        channel_id: ChannelId,
        deleted_message_id: MessageId,
        _guild_id: Option<serenity::all::GuildId>,
    ) {
        self.gateway
            .on_message_delete(channel_id, deleted_message_id)
            .await;
    }

    async fn reaction_add(&self, _ctx: Context, add_reaction: Reaction) {
        self.gateway
            .on_reaction(MessageType::ActionAdd, add_reaction)
            .await;
    }

    async fn reaction_remove(&self, _ctx: Context, removed_reaction: Reaction) {
        self.gateway
            .on_reaction(MessageType::ActionRemove, removed_reaction)
            .await;
    }

    async fn reaction_remove_all(
        &self,
        _ctx: Context,
        channel_id: ChannelId,
        removed_from_message_id: MessageId,
    ) {
        self.gateway
            .on_reaction_remove_all(channel_id, removed_from_message_id)
            .await;
    }
}

// ---------------------------------------------------------------------------
// Room adapter
// ---------------------------------------------------------------------------

/// One bridged Discord channel.
pub struct DiscordChat {
    gateway: Arc<DiscordGateway>,
    channel: String,
}

impl DiscordChat {
    fn target(&self) -> Result<ChannelId> {
        let id: u64 = self
            .channel
            .parse()
            .context("invalid discord channel id")?;
        Ok(ChannelId::new(id))
    }

    fn message_target(&self, message_id: &str) -> Result<MessageId> {
        let id: u64 = message_id
            .parse()
            .context("invalid discord message id")?;
        Ok(MessageId::new(id))
    }

    async fn render(&self, msg: &dyn ChatMessage) -> String {
        if msg.source() == Source::Discord {
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
}

#[async_trait]
impl ChatAdapter for DiscordChat {
    fn channel_id(&self) -> &str {
        &self.channel
    }

    fn source(&self) -> Source {
        Source::Discord
    }

    async fn send_message(&self, msg: &dyn ChatMessage) -> Result<String> {
        let http = self.gateway.http().await?;
        let sent = self
            .target()?
            .say(&*http, self.render(msg).await)
            .await
            .context("failed to send discord message")?;
        Ok(sent.id.to_string())
    }

    async fn send_reply(&self, parent_id: Option<&str>, msg: &dyn ChatMessage) -> Result<String> {
        let http = self.gateway.http().await?;
        let channel = self.target()?;
        let sent = match parent_id {
            Some(parent) => {
                let reference =
                    MessageReference::from((channel, self.message_target(parent)?));
                channel
                    .send_message(
                        &*http,
                        CreateMessage::new()
                            .content(self.render(msg).await)
                            .reference_message(reference),
                    )
                    .await
                    .context("failed to send discord reply")?
            }
            None => {
                let text =
                    chat::with_fallback_suffix(&self.render(msg).await, chat::REPLY_FALLBACK);
                channel
                    .say(&*http, text)
                    .await
                    .context("failed to send discord reply fallback")?
            }
        };
        Ok(sent.id.to_string())
    }

    async fn update_message(&self, message_id: Option<&str>, msg: &dyn ChatMessage) -> Result<()> {
        let http = self.gateway.http().await?;
        let channel = self.target()?;
        match message_id {
            Some(id) => {
                channel
                    .edit_message(
                        &*http,
                        self.message_target(id)?,
                        EditMessage::new().content(self.render(msg).await),
                    )
                    .await
                    .context("failed to edit discord message")?;
            }
            None => {
                let text =
                    chat::with_fallback_suffix(&self.render(msg).await, chat::EDIT_FALLBACK);
                channel
                    .say(&*http, text)
                    .await
                    .context("failed to send discord edit fallback")?;
            }
        }
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        let http = self.gateway.http().await?;
        self.target()?
            .delete_message(&*http, self.message_target(message_id)?)
            .await
            .context("failed to delete discord message")?;
        Ok(())
    }

    async fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<()> {
        let http = self.gateway.http().await?;
        self.target()?
            .create_reaction(
                &*http,
                self.message_target(message_id)?,
                ReactionType::Unicode(emoji.to_string()),
            )
            .await
            .context("failed to add discord reaction")?;
        Ok(())
    }

    async fn remove_reaction(&self, message_id: &str, emoji: &str) -> Result<()> {
        let http = self.gateway.http().await?;
        http.delete_message_reaction_emoji(
            self.target()?,
            self.message_target(message_id)?,
            &ReactionType::Unicode(emoji.to_string()),
        )
        .await
        .context("failed to remove discord reaction")?;
        Ok(())
    }

    async fn remove_all_reactions(&self, message_id: &str) -> Result<()> {
        let http = self.gateway.http().await?;
        http.delete_message_reactions(self.target()?, self.message_target(message_id)?)
            .await
            .context("failed to remove discord reactions")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mentions_rewrite_from_event_mentions() {
        let mentions = vec![("123".to_string(), "alice".to_string())];
        assert_eq!(
            replace_user_mentions("hey <@123> and <@!123>", &mentions),
            "hey @alice and @alice"
        );
        assert_eq!(
            replace_user_mentions("hey <@999>", &mentions),
            "hey <@999>"
        );
    }

    #[test]
    fn reaction_names_cover_custom_emoji() {
        assert_eq!(reaction_name(&ReactionType::Unicode("👍".into())), "👍");
        assert_eq!(
            reaction_name(&ReactionType::Custom {
                animated: false,
                id: serenity::all::EmojiId::new(7),
                name: Some("blob".into()),
            }),
            "blob"
        );
    }
}
