use chrono::{DateTime, Utc};

use murmur_core::types::MessageId;
use murmur_llm::{CacheControl, ContentBlock, ParticipantMessage};

/// Pipeline-internal message representation: a [`ParticipantMessage`] plus
/// the bookkeeping the build steps need and the provider never sees.
#[derive(Debug, Clone)]
pub struct WorkingMessage {
    pub participant: String,
    pub content: Vec<ContentBlock>,
    pub message_id: Option<MessageId>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Authored by this bot persona.
    pub is_bot_self: bool,
    /// Authored by any bot account.
    pub is_bot_author: bool,
    /// Set on messages injected from (or rewritten by) an activation record,
    /// so step 7 can merge within one activation without crossing others.
    pub activation_id: Option<i64>,
    pub cache_control: Option<CacheControl>,
}

impl WorkingMessage {
    pub fn text(participant: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            participant: participant.into(),
            content: vec![ContentBlock::text(text)],
            message_id: None,
            timestamp: None,
            is_bot_self: false,
            is_bot_author: false,
            activation_id: None,
            cache_control: None,
        }
    }

    /// Concatenated text of all text blocks.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    /// Character count of text and serialized tool content (images excluded).
    pub fn char_count(&self) -> usize {
        self.content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.chars().count(),
                ContentBlock::ToolUse { input, .. } => input.to_string().chars().count(),
                ContentBlock::ToolResult { content, .. } => content.chars().count(),
                ContentBlock::Image { .. } => 0,
            })
            .sum()
    }

    /// Append text to the last text block, or push a new one.
    pub fn append_text(&mut self, text: &str) {
        if let Some(ContentBlock::Text { text: last }) = self.content.last_mut() {
            last.push_str(text);
        } else {
            self.content.push(ContentBlock::text(text));
        }
    }

    pub fn into_participant(self) -> ParticipantMessage {
        ParticipantMessage {
            participant: self.participant,
            content: self.content,
            timestamp: self.timestamp,
            message_id: self.message_id,
            cache_control: self.cache_control,
        }
    }
}
