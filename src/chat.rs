//! Adapter contract and plumbing shared by the platform gateways.

pub mod discord;
pub mod matrix;
pub mod slack;
pub mod telegram;

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::{RwLock, mpsc};

use crate::cache::EntityCache;
use crate::error::Result;
use crate::model::{Attachment, AttachmentList, ChatMessage, InboundMessage, Source, User};

/// The operations a room dispatcher drives on one attached platform channel.
///
/// `send_reply` and `update_message` accept a missing target id and fall back
/// to a plain send carrying a not-found marker suffix; `delete_message` and
/// the reaction operations require a resolved id.
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    fn channel_id(&self) -> &str;

    fn source(&self) -> Source;

    /// Mirror a message, returning the platform-assigned id of the copy.
    async fn send_message(&self, msg: &dyn ChatMessage) -> Result<String>;

    /// Mirror a reply to `parent_id` (the id of the mirrored parent on this
    /// platform).
    async fn send_reply(&self, parent_id: Option<&str>, msg: &dyn ChatMessage) -> Result<String>;

    /// Apply an edit to the mirrored copy `message_id`.
    async fn update_message(&self, message_id: Option<&str>, msg: &dyn ChatMessage) -> Result<()>;

    async fn delete_message(&self, message_id: &str) -> Result<()>;

    async fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<()>;

    async fn remove_reaction(&self, message_id: &str, emoji: &str) -> Result<()>;

    async fn remove_all_reactions(&self, message_id: &str) -> Result<()>;
}

/// Registry of per-room inbound senders, keyed by platform channel id.
///
/// Registration happens once at assembly time; publishes happen on every
/// inbound event, so the sender list is cloned out under a read lock before
/// the (potentially blocking) sends are awaited.
#[derive(Default)]
pub struct Subscriptions {
    inner: RwLock<HashMap<String, Vec<mpsc::Sender<InboundMessage>>>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, channel_id: &str, tx: mpsc::Sender<InboundMessage>) {
        self.inner
            .write()
            .await
            .entry(channel_id.to_string())
            .or_default()
            .push(tx);
    }

    /// Deliver `msg` to every room subscribed to `channel_id`. Sends block
    /// when an inbound channel is full; backpressure deliberately propagates
    /// into the platform ingest task.
    pub async fn publish(&self, channel_id: &str, msg: InboundMessage) {
        let targets: Vec<_> = {
            let inner = self.inner.read().await;
            match inner.get(channel_id) {
                Some(senders) => senders.clone(),
                None => return,
            }
        };
        for tx in targets {
            if tx.send(msg.clone()).await.is_err() {
                tracing::warn!(channel_id, "inbound subscriber dropped, skipping delivery");
            }
        }
    }
}

/// Assemble the outbound body every adapter sends:
///
/// ```text
/// From: [<from>] User: [<user>] Send:
/// <body>
/// ```
///
/// followed by the attachment appendix when there is one.
pub(crate) fn format_text(
    from: &str,
    user_display: &str,
    body: &str,
    attachments: &[Attachment],
) -> String {
    let mut text = format!("From: [{from}] User: [{user_display}] Send:\n{body}");
    if !attachments.is_empty() {
        text.push_str(&AttachmentList(attachments).to_string());
    }
    text
}

/// Rewrite `@displayName` tokens into platform-native mention syntax using
/// the gateway's user cache. Names that resolve to no cached user are left
/// alone. Display names containing whitespace are not matched; that
/// limitation is inherent to the `@name` token form.
pub(crate) async fn rewrite_mentions(
    cache: &EntityCache,
    text: &str,
    native: impl Fn(&User) -> String,
) -> String {
    static MENTION: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"@([^@\s]+)").expect("mention pattern"));

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in MENTION.captures_iter(text) {
        let whole = caps.get(0).expect("match");
        let name = &caps[1];
        if let Some(user) = cache.search_user_name(name).await {
            out.push_str(&text[last..whole.start()]);
            out.push_str(&native(&user));
            last = whole.end();
        }
    }
    out.push_str(&text[last..]);
    out
}

/// The `[... not found]` fallback suffix glued onto plain sends that stand in
/// for an operation whose target message is unknown.
pub(crate) fn with_fallback_suffix(text: &str, marker: &str) -> String {
    format!("{text}\n[{marker}]")
}

pub(crate) const REPLY_FALLBACK: &str = "Reply Message, Parent message not found";
pub(crate) const EDIT_FALLBACK: &str = "Edit Message, Original message not found";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_text_matches_wire_shape() {
        let out = format_text("Slack", "alice", "hello", &[]);
        assert_eq!(out, "From: [Slack] User: [alice] Send:\nhello");
    }

    #[test]
    fn format_text_appends_attachments() {
        let atts = vec![Attachment {
            name: "a.txt".into(),
            media_type: "text/plain".into(),
            url: "http://x/a.txt".into(),
        }];
        let out = format_text("general", "bob", "see file", &atts);
        assert!(out.starts_with("From: [general] User: [bob] Send:\nsee file"));
        assert!(out.contains("\nAttachment:\nName: [a.txt] http://x/a.txt Type: [text/plain]"));
    }

    #[tokio::test]
    async fn mentions_rewrite_through_the_cache() {
        let cache = EntityCache::new();
        cache.merge_users(vec![User {
            id: "U42".into(),
            name: "alice".into(),
            display_name: "alice".into(),
            ..User::default()
        }]);

        let out = rewrite_mentions(&cache, "ping @alice and @nobody", |u| {
            format!("<@{}>", u.id)
        })
        .await;
        assert_eq!(out, "ping <@U42> and @nobody");
    }

    #[test]
    fn fallback_suffix_shape() {
        assert_eq!(
            with_fallback_suffix("body", REPLY_FALLBACK),
            "body\n[Reply Message, Parent message not found]"
        );
        assert_eq!(
            with_fallback_suffix("body", EDIT_FALLBACK),
            "body\n[Edit Message, Original message not found]"
        );
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let subs = Subscriptions::new();
        let msg: InboundMessage = std::sync::Arc::new(crate::model::SlackMessage::default());
        subs.publish("C-unknown", msg).await;
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let subs = Subscriptions::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        subs.register("C1", tx1).await;
        subs.register("C1", tx2).await;

        let msg: InboundMessage = std::sync::Arc::new(crate::model::SlackMessage {
            id: "1".into(),
            ..Default::default()
        });
        subs.publish("C1", msg).await;

        assert_eq!(rx1.recv().await.unwrap().message_id(), "1");
        assert_eq!(rx2.recv().await.unwrap().message_id(), "1");
    }
}
