use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use murmur_core::types::{ChannelId, GuildId, MessageId, UserId};

/// A chat message as the core sees it, already normalized by the adapter:
/// user-id mentions rewritten to `<@username>`, replies prefixed with
/// `<reply:@username> `, and bot authors carrying their platform username.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub guild_id: Option<GuildId>,
    pub author: Author,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Platform-generated message (member join, pin notice, …).
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    pub referenced_message_id: Option<MessageId>,
}

impl ChatMessage {
    /// Content with any `<reply:@name> ` prefix removed.
    pub fn content_after_reply_prefix(&self) -> &str {
        strip_reply_prefix(&self.content)
    }

    /// Tool-output webhooks and other operator noise start with a dot.
    pub fn is_dot_message(&self) -> bool {
        self.content_after_reply_prefix().starts_with('.')
    }

    /// Whether any reaction carries the given emote.
    pub fn has_reaction(&self, emote: &str) -> bool {
        self.reactions.iter().any(|r| r.emote == emote)
    }
}

/// Remove a leading `<reply:@name> ` marker, returning the rest.
pub fn strip_reply_prefix(content: &str) -> &str {
    if let Some(rest) = content.strip_prefix("<reply:@") {
        if let Some(end) = rest.find("> ") {
            return &rest[end + 2..];
        }
    }
    content
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Author {
    pub id: UserId,
    pub username: String,
    pub display_name: String,
    pub bot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: Option<String>,
    pub url: String,
    pub size_bytes: u64,
    /// Pre-extracted text for text files and PDFs, when the adapter has it.
    pub text: Option<String>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("image/"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub emote: String,
    pub count: u32,
}

/// Parameters for a context fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub channel_id: ChannelId,
    /// Baseline number of messages to fetch.
    pub depth: usize,
    /// Extend the fetch backward until this message is included (bounded).
    pub first_message_id: Option<MessageId>,
    /// Ensure this message is present even if outside `depth`.
    pub target_message_id: Option<MessageId>,
    pub ignore_history: bool,
}

/// Result of a context fetch — messages in chronological order.
#[derive(Debug, Clone, Default)]
pub struct FetchedContext {
    pub messages: Vec<ChatMessage>,
    /// Downloaded image payloads keyed by source message, base64-encoded.
    pub images: Vec<FetchedImage>,
    pub pinned_configs: Vec<String>,
    pub guild_id: Option<GuildId>,
    /// Where a `.history` command redirected the range, if it did.
    pub inheritance: Option<InheritanceInfo>,
}

#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub message_id: MessageId,
    pub data: String,
    pub mime_type: String,
}

/// Origin of history rewritten by a `.history` command.
#[derive(Debug, Clone)]
pub struct InheritanceInfo {
    pub source_channel_id: ChannelId,
    pub first_message_id: Option<MessageId>,
    pub last_message_id: Option<MessageId>,
}
