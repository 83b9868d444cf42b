use async_trait::async_trait;

use murmur_core::types::{ChannelId, MessageId, UserId};

use crate::error::Result;
use crate::message::{ChatMessage, FetchRequest, FetchedContext};

/// Operations the core requires from a chat-platform adapter.
///
/// Semantics the core assumes:
/// - `fetch_context` returns chronologically ordered messages. When
///   `first_message_id` is set the adapter extends the fetch backward until
///   that message is found or a bounded lookback is exhausted; it never trims
///   past the anchor. `.history` commands embedded in channel content rewrite
///   the returned range; threads implicitly prepend parent-channel context up
///   to the thread's starting message.
/// - `send_message` chunks content at the transport's limit and applies the
///   reply reference to the first chunk only.
/// - Returned messages have bot-author names normalized, user-id mentions
///   rewritten to `<@username>`, and replies prefixed `<reply:@username> `.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch_context(&self, req: FetchRequest) -> Result<FetchedContext>;

    async fn fetch_pinned_configs(&self, channel_id: ChannelId) -> Result<Vec<String>>;

    /// Send `content`, chunked; returns the ids of all sent messages.
    async fn send_message(
        &self,
        channel_id: ChannelId,
        content: &str,
        reply_to: Option<MessageId>,
    ) -> Result<Vec<MessageId>>;

    /// Send under a webhook identity (used for dotted tool output).
    async fn send_webhook(
        &self,
        channel_id: ChannelId,
        username: &str,
        content: &str,
    ) -> Result<Vec<MessageId>>;

    async fn send_image_attachment(
        &self,
        channel_id: ChannelId,
        filename: &str,
        data: &[u8],
    ) -> Result<MessageId>;

    async fn send_file_attachment(
        &self,
        channel_id: ChannelId,
        filename: &str,
        content: &str,
    ) -> Result<MessageId>;

    async fn send_message_with_attachment(
        &self,
        channel_id: ChannelId,
        content: &str,
        filename: &str,
        attachment: &str,
    ) -> Result<Vec<MessageId>>;

    async fn pin_message(&self, channel_id: ChannelId, message_id: MessageId) -> Result<()>;

    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> Result<()>;

    async fn add_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emote: &str,
    ) -> Result<()>;

    /// One typing-indicator pulse. The refresher in [`crate::typing`] calls
    /// this on a cadence; adapters should not loop internally.
    async fn start_typing(&self, channel_id: ChannelId) -> Result<()>;

    async fn stop_typing(&self, channel_id: ChannelId) -> Result<()>;

    async fn parent_channel_id(&self, channel_id: ChannelId) -> Result<Option<ChannelId>>;

    async fn channel_name(&self, channel_id: ChannelId) -> Result<String>;

    /// The transport account this bot runs as.
    fn bot_user_id(&self) -> UserId;

    /// The transport username (before participant-name normalization).
    fn bot_username(&self) -> &str;

    /// Distinct consecutive bot identities along `message`'s reply chain.
    /// Adapters must walk with a visited set — reply references can be
    /// malformed into cycles.
    async fn bot_reply_chain_depth(
        &self,
        channel_id: ChannelId,
        message: &ChatMessage,
    ) -> Result<u32>;
}
