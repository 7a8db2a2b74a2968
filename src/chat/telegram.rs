//! Telegram gateway and room adapter using teloxide long polling.
//!
//! Telegram has no reaction API surface worth bridging, so the reaction
//! operations are accepted and ignored.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use futures::StreamExt as _;
use teloxide::payloads::SendMessageSetters as _;
use teloxide::prelude::*;
use teloxide::types::{Message as TgMessage, MessageId, ReplyParameters, UpdateKind};
use teloxide::update_listeners::{AsUpdateStream, polling_default};
use tokio_util::sync::CancellationToken;

use crate::cache::EntityCache;
use crate::chat::{self, ChatAdapter, Subscriptions};
use crate::config::TelegramConfig;
use crate::error::Result;
use crate::model::{
    Attachment, ChannelInfo, ChatMessage, InboundMessage, MessageType, Source, TelegramMessage,
    User,
};

/// Bot handle plus caches shared by every Telegram chat adapter.
pub struct TelegramGateway {
    bot: Bot,
    self_id: UserId,
    cache: EntityCache,
    subs: Subscriptions,
}

impl TelegramGateway {
    /// Authorize the bot, prefill chat titles and start the polling task.
    pub async fn connect(
        config: &TelegramConfig,
        chat_ids: &[String],
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let bot = Bot::new(&config.token);
        let me = bot.get_me().await.context("telegram getMe failed")?;
        tracing::info!(bot = %me.user.full_name(), "telegram connected");

        let gateway = Arc::new(Self {
            bot,
            self_id: me.user.id,
            cache: EntityCache::new(),
            subs: Subscriptions::new(),
        });

        gateway.prefill(chat_ids).await;

        let ingest = gateway.clone();
        tokio::spawn(async move {
            ingest.poll_updates(cancel).await;
        });

        Ok(gateway)
    }

    /// Register a per-room inbound sender and return the adapter handle for
    /// one chat.
    pub async fn attach(
        self: &Arc<Self>,
        chat_id: &str,
        tx: tokio::sync::mpsc::Sender<InboundMessage>,
    ) -> TelegramChat {
        self.subs.register(chat_id, tx).await;
        TelegramChat {
            gateway: self.clone(),
            channel: chat_id.to_string(),
        }
    }

    async fn prefill(&self, chat_ids: &[String]) {
        let mut channels = Vec::new();
        for id in chat_ids {
            let Ok(numeric) = id.parse::<i64>() else {
                tracing::warn!(chat_id = %id, "telegram chat id is not numeric");
                continue;
            };
            match self.bot.get_chat(ChatId(numeric)).await {
                Ok(chat) => {
                    let info = ChannelInfo {
                        id: id.clone(),
                        name: chat.title().unwrap_or_default().to_string(),
                        members: Vec::new(),
                    };
                    tracing::debug!(chat_id = %id, name = %info.name, "synced telegram chat");
                    channels.push(info);
                }
                Err(error) => {
                    tracing::warn!(chat_id = %id, %error, "failed to get telegram chat info");
                }
            }
        }
        self.cache.merge_channels(channels);
    }

    async fn poll_updates(&self, cancel: CancellationToken) {
        let mut listener = polling_default(self.bot.clone()).await;
        let stream = listener.as_stream();
        tokio::pin!(stream);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("telegram polling stopped");
                    return;
                }
                update = stream.next() => match update {
                    Some(Ok(update)) => match update.kind {
                        UpdateKind::Message(msg) => self.on_message(msg, false).await,
                        UpdateKind::EditedMessage(msg) => self.on_message(msg, true).await,
                        _ => {}
                    },
                    Some(Err(error)) => {
                        tracing::warn!(%error, "telegram polling error");
                    }
                    None => {
                        tracing::warn!("telegram update stream ended");
                        return;
                    }
                }
            }
        }
    }

    async fn on_message(&self, msg: TgMessage, edited: bool) {
        let Some(from) = msg.from() else {
            // Channel posts and service messages carry no author.
            return;
        };
        if from.id == self.self_id {
            return;
        }

        let channel = ChannelInfo {
            id: msg.chat.id.to_string(),
            name: msg.chat.title().unwrap_or_default().to_string(),
            members: Vec::new(),
        };
        let user = User {
            id: from.id.to_string(),
            name: from.full_name(),
            display_name: from.full_name(),
            bot_id: if from.is_bot {
                from.id.to_string()
            } else {
                String::new()
            },
            ..User::default()
        };
        // Updates carry the full author and chat, so the cache is written
        // rather than queried on this path.
        self.cache.merge_channels(vec![channel.clone()]);
        self.cache.merge_users(vec![user.clone()]);

        let mut text = msg.text().unwrap_or_default().to_string();
        let mut out = TelegramMessage {
            id: msg.id.0.to_string(),
            kind: Some(if edited {
                MessageType::TextUpdate
            } else {
                MessageType::TextCreate
            }),
            channel: channel.clone(),
            user,
            send_time: msg.date.timestamp() * 1_000_000_000,
            ..TelegramMessage::default()
        };
        if !edited {
            if let Some(reply) = msg.reply_to_message() {
                out.kind = Some(MessageType::TextReply);
                out.parent_id = Some(reply.id.0.to_string());
            }
            out.attachments = collect_attachments(&msg);
            if text.is_empty() {
                text = msg.caption().unwrap_or_default().to_string();
            }
        }
        out.text = text.clone();
        out.raw_text = text;
        self.subs.publish(&channel.id, Arc::new(out)).await;
    }
}

/// Photo sizes as Telegram reports them: one entry per resolution, largest
/// area first after sorting.
struct PhotoRef {
    file_id: String,
    unique_id: String,
    width: u64,
    height: u64,
}

fn collect_attachments(msg: &TgMessage) -> Vec<Attachment> {
    let photos = msg
        .photo()
        .map(|sizes| {
            sizes
                .iter()
                .map(|p| PhotoRef {
                    file_id: p.file.id.to_string(),
                    unique_id: p.file.unique_id.to_string(),
                    width: u64::from(p.width),
                    height: u64::from(p.height),
                })
                .collect()
        })
        .unwrap_or_default();
    let mut result = photo_attachments(photos);
    if let Some(doc) = msg.document() {
        result.push(Attachment {
            name: doc.file_name.clone().unwrap_or_default(),
            media_type: doc
                .mime_type
                .as_ref()
                .map(|m| m.to_string())
                .unwrap_or_else(|| "Doc".to_string()),
            url: String::new(),
        });
    }
    result
}

/// Largest rendition first, one attachment per distinct file id.
fn photo_attachments(mut photos: Vec<PhotoRef>) -> Vec<Attachment> {
    photos.sort_by(|a, b| (b.width * b.height).cmp(&(a.width * a.height)));
    let mut seen = HashSet::new();
    photos
        .into_iter()
        .filter(|p| seen.insert(p.file_id.clone()))
        .map(|p| Attachment {
            name: p.unique_id,
            media_type: "Photo".to_string(),
            url: String::new(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Room adapter
// ---------------------------------------------------------------------------

/// One bridged Telegram chat.
pub struct TelegramChat {
    gateway: Arc<TelegramGateway>,
    channel: String,
}

impl TelegramChat {
    fn chat_target(&self) -> Result<ChatId> {
        let id: i64 = self.channel.parse().context("invalid telegram chat id")?;
        Ok(ChatId(id))
    }

    fn message_target(&self, message_id: &str) -> Result<MessageId> {
        let id: i32 = message_id
            .parse()
            .context("invalid telegram message id")?;
        Ok(MessageId(id))
    }

    /// Telegram has no inline mention syntax to rewrite into, so the rendered
    /// body is used as-is.
    fn render(&self, msg: &dyn ChatMessage) -> String {
        if msg.source() == Source::Telegram {
            chat::format_text(
                &msg.channel().name,
                &msg.user().display_name,
                msg.raw_text(),
                msg.attachments(),
            )
        } else {
            chat::format_text(
                &msg.source().to_string(),
                &msg.user().display_name,
                msg.text(),
                msg.attachments(),
            )
        }
    }
}

#[async_trait]
impl ChatAdapter for TelegramChat {
    fn channel_id(&self) -> &str {
        &self.channel
    }

    fn source(&self) -> Source {
        Source::Telegram
    }

    async fn send_message(&self, msg: &dyn ChatMessage) -> Result<String> {
        let sent = self
            .gateway
            .bot
            .send_message(self.chat_target()?, self.render(msg))
            .await
            .context("failed to send telegram message")?;
        Ok(sent.id.0.to_string())
    }

    async fn send_reply(&self, parent_id: Option<&str>, msg: &dyn ChatMessage) -> Result<String> {
        let sent = match parent_id {
            Some(parent) => self
                .gateway
                .bot
                .send_message(self.chat_target()?, self.render(msg))
                .reply_parameters(ReplyParameters::new(self.message_target(parent)?))
                .await
                .context("failed to send telegram reply")?,
            None => {
                let text = chat::with_fallback_suffix(&self.render(msg), chat::REPLY_FALLBACK);
                self.gateway
                    .bot
                    .send_message(self.chat_target()?, text)
                    .await
                    .context("failed to send telegram reply fallback")?
            }
        };
        Ok(sent.id.0.to_string())
    }

    async fn update_message(&self, message_id: Option<&str>, msg: &dyn ChatMessage) -> Result<()> {
        match message_id {
            Some(id) => {
                self.gateway
                    .bot
                    .edit_message_text(self.chat_target()?, self.message_target(id)?, self.render(msg))
                    .await
                    .context("failed to edit telegram message")?;
            }
            None => {
                let text = chat::with_fallback_suffix(&self.render(msg), chat::EDIT_FALLBACK);
                self.gateway
                    .bot
                    .send_message(self.chat_target()?, text)
                    .await
                    .context("failed to send telegram edit fallback")?;
            }
        }
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        self.gateway
            .bot
            .delete_message(self.chat_target()?, self.message_target(message_id)?)
            .await
            .context("failed to delete telegram message")?;
        Ok(())
    }

    async fn add_reaction(&self, _message_id: &str, _emoji: &str) -> Result<()> {
        Ok(())
    }

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

    fn photo(file_id: &str, unique_id: &str, width: u64, height: u64) -> PhotoRef {
        PhotoRef {
            file_id: file_id.into(),
            unique_id: unique_id.into(),
            width,
            height,
        }
    }

    #[test]
    fn photos_sort_by_area_and_deduplicate() {
        let attachments = photo_attachments(vec![
            photo("f1", "u1", 90, 90),
            photo("f2", "u2", 1280, 720),
            photo("f1", "u1", 320, 240),
        ]);
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].name, "u2");
        assert_eq!(attachments[1].name, "u1");
        assert!(attachments.iter().all(|a| a.media_type == "Photo"));
    }

    #[test]
    fn no_photos_no_attachments() {
        assert!(photo_attachments(Vec::new()).is_empty());
    }
}
