//! Canonical message model shared by every platform adapter.
//!
//! Each adapter produces its own concrete message struct; the dispatcher only
//! ever sees the [`ChatMessage`] capability set behind a trait object.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The platforms the bridge can join.
///
/// Ordering is meaningful only to the emoji table: Slack is one shortcode
/// dialect, everything after it shares the Unicode-ish dialect.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Slack,
    Discord,
    Telegram,
    Matrix,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Source::Slack => "Slack",
            Source::Discord => "Discord",
            Source::Telegram => "Telegram",
            Source::Matrix => "Matrix",
        };
        write!(f, "{name}")
    }
}

/// The kinds of events the dispatcher reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    TextCreate,
    TextUpdate,
    TextDelete,
    TextReply,
    ActionAdd,
    ActionRemove,
    ActionRemoveAll,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::TextCreate => "create",
            MessageType::TextUpdate => "update",
            MessageType::TextDelete => "delete",
            MessageType::TextReply => "reply",
            MessageType::ActionAdd => "reaction-add",
            MessageType::ActionRemove => "reaction-remove",
            MessageType::ActionRemoveAll => "reaction-remove-all",
        };
        write!(f, "{name}")
    }
}

/// A chat account as the bridge knows it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub avatar: String,
    /// Empty unless the account is a bot.
    pub bot_id: String,
}

impl User {
    /// Stub for accounts the platform lookup could not resolve, so that
    /// downstream formatting always has a display name.
    pub fn unknown(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: "Unknown".into(),
            display_name: "Unknown".into(),
            ..Self::default()
        }
    }
}

/// A channel (room, chat, conversation) on one platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
    pub members: Vec<String>,
}

impl ChannelInfo {
    /// Stub for channels the platform lookup could not resolve.
    pub fn unknown(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: "Unknown".into(),
            members: Vec::new(),
        }
    }
}

/// A file or media item carried by a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub media_type: String,
    pub url: String,
}

/// Renders a slice of attachments as the multi-line text appendix that gets
/// glued onto outbound message bodies.
pub struct AttachmentList<'a>(pub &'a [Attachment]);

impl fmt::Display for AttachmentList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\nAttachment:")?;
        for att in self.0 {
            f.write_str("\n")?;
            if !att.name.is_empty() {
                write!(f, "Name: [{}] ", att.name)?;
            }
            if !att.url.is_empty() {
                write!(f, "{} ", att.url)?;
            }
            if !att.media_type.is_empty() {
                write!(f, "Type: [{}]", att.media_type)?;
            }
        }
        Ok(())
    }
}

/// Capability set every platform message exposes to the dispatcher.
pub trait ChatMessage: Send + Sync {
    fn message_id(&self) -> &str;
    /// The message this one replies to, when the event is a reply.
    fn parent_message_id(&self) -> Option<&str>;
    fn message_type(&self) -> MessageType;
    fn source(&self) -> Source;
    fn channel(&self) -> &ChannelInfo;
    fn user(&self) -> &User;
    /// Body with platform post-processing applied (mentions resolved,
    /// shortcodes substituted).
    fn text(&self) -> &str;
    /// The original, un-rendered body.
    fn raw_text(&self) -> &str;
    fn attachments(&self) -> &[Attachment];
    /// Reaction shortcode/key for `ActionAdd`/`ActionRemove` events.
    fn emoji(&self) -> &str;
}

/// What travels over a room's inbound channel. One event may be delivered to
/// several rooms, hence the shared handle.
pub type InboundMessage = Arc<dyn ChatMessage>;

/// A message observed on Slack (Socket Mode event).
#[derive(Debug, Default)]
pub struct SlackMessage {
    pub id: String,
    pub kind: Option<MessageType>,
    pub channel: ChannelInfo,
    pub user: User,
    pub text: String,
    pub raw_text: String,
    /// Nanoseconds since epoch, parsed from the `sec.nsec` event timestamp.
    pub send_time: i64,
    pub attachments: Vec<Attachment>,
    pub parent_id: Option<String>,
    pub reaction: String,
}

impl ChatMessage for SlackMessage {
    fn message_id(&self) -> &str {
        &self.id
    }

    fn parent_message_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    fn message_type(&self) -> MessageType {
        self.kind.unwrap_or(MessageType::TextCreate)
    }

    fn source(&self) -> Source {
        Source::Slack
    }

    fn channel(&self) -> &ChannelInfo {
        &self.channel
    }

    fn user(&self) -> &User {
        &self.user
    }

    fn text(&self) -> &str {
        &self.text
    }

    fn raw_text(&self) -> &str {
        &self.raw_text
    }

    fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    fn emoji(&self) -> &str {
        &self.reaction
    }
}

/// A message observed on the Discord gateway.
#[derive(Debug, Default)]
pub struct DiscordMessage {
    pub id: String,
    pub kind: Option<MessageType>,
    pub channel: ChannelInfo,
    pub user: User,
    pub text: String,
    pub raw_text: String,
    pub send_time: i64,
    pub attachments: Vec<Attachment>,
    pub parent_id: Option<String>,
    /// Unicode emoji or custom-emoji name of a reaction event.
    pub emoji_name: String,
}

impl ChatMessage for DiscordMessage {
    fn message_id(&self) -> &str {
        &self.id
    }

    fn parent_message_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    fn message_type(&self) -> MessageType {
        self.kind.unwrap_or(MessageType::TextCreate)
    }

    fn source(&self) -> Source {
        Source::Discord
    }

    fn channel(&self) -> &ChannelInfo {
        &self.channel
    }

    fn user(&self) -> &User {
        &self.user
    }

    fn text(&self) -> &str {
        &self.text
    }

    fn raw_text(&self) -> &str {
        &self.raw_text
    }

    fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    fn emoji(&self) -> &str {
        &self.emoji_name
    }
}

/// A message observed through Telegram long polling.
///
/// Telegram message ids are numeric; they are stringified at construction so
/// the rest of the bridge can stay id-type agnostic. Telegram carries no
/// reaction events, so `emoji()` is always empty.
#[derive(Debug, Default)]
pub struct TelegramMessage {
    pub id: String,
    pub kind: Option<MessageType>,
    pub channel: ChannelInfo,
    pub user: User,
    pub text: String,
    pub raw_text: String,
    pub send_time: i64,
    pub attachments: Vec<Attachment>,
    pub parent_id: Option<String>,
}

impl ChatMessage for TelegramMessage {
    fn message_id(&self) -> &str {
        &self.id
    }

    fn parent_message_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    fn message_type(&self) -> MessageType {
        self.kind.unwrap_or(MessageType::TextCreate)
    }

    fn source(&self) -> Source {
        Source::Telegram
    }

    fn channel(&self) -> &ChannelInfo {
        &self.channel
    }

    fn user(&self) -> &User {
        &self.user
    }

    fn text(&self) -> &str {
        &self.text
    }

    fn raw_text(&self) -> &str {
        &self.raw_text
    }

    fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    fn emoji(&self) -> &str {
        ""
    }
}

/// A message observed in a Matrix room. Matrix bodies arrive already plain,
/// so the raw and rendered texts are the same value.
#[derive(Debug, Default)]
pub struct MatrixMessage {
    pub id: String,
    pub kind: Option<MessageType>,
    pub channel: ChannelInfo,
    pub user: User,
    pub text: String,
    pub send_time: i64,
    pub attachments: Vec<Attachment>,
    pub parent_id: Option<String>,
    /// Annotation key of an `m.reaction` event.
    pub reaction: String,
}

impl ChatMessage for MatrixMessage {
    fn message_id(&self) -> &str {
        &self.id
    }

    fn parent_message_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    fn message_type(&self) -> MessageType {
        self.kind.unwrap_or(MessageType::TextCreate)
    }

    fn source(&self) -> Source {
        Source::Matrix
    }

    fn channel(&self) -> &ChannelInfo {
        &self.channel
    }

    fn user(&self) -> &User {
        &self.user
    }

    fn text(&self) -> &str {
        &self.text
    }

    fn raw_text(&self) -> &str {
        &self.text
    }

    fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    fn emoji(&self) -> &str {
        &self.reaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_ordering_puts_slack_first() {
        assert!(Source::Slack < Source::Discord);
        assert!(Source::Discord < Source::Telegram);
        assert!(Source::Telegram < Source::Matrix);
    }

    #[test]
    fn attachment_list_renders_appendix() {
        let atts = vec![
            Attachment {
                name: "photo.png".into(),
                media_type: "image/png".into(),
                url: "https://example.com/photo.png".into(),
            },
            Attachment {
                name: String::new(),
                media_type: "Doc".into(),
                url: String::new(),
            },
        ];
        let rendered = AttachmentList(&atts).to_string();
        assert_eq!(
            rendered,
            "\nAttachment:\nName: [photo.png] https://example.com/photo.png Type: [image/png]\nType: [Doc]"
        );
    }

    #[test]
    fn unknown_stubs_have_display_names() {
        assert_eq!(User::unknown("U1").display_name, "Unknown");
        assert_eq!(ChannelInfo::unknown("C1").name, "Unknown");
    }
}
