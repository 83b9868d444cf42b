use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use murmur_core::config::{CompletionMode, LlmConfig};
use murmur_core::types::MessageId;

/// One block of message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, ContentBlock::Image { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    pub media_type: String,
    /// Base64-encoded payload.
    pub data: String,
}

/// Prompt-cache breakpoint marker. Only `ephemeral` exists today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheControl {
    Ephemeral,
}

/// A message attributed to a named conversation participant.
///
/// Providers map participants onto their own role scheme; the core only
/// guarantees that the bot's own participant name marks assistant turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantMessage {
    pub participant: String,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl ParticipantMessage {
    pub fn new(participant: impl Into<String>, content: Vec<ContentBlock>) -> Self {
        Self {
            participant: participant.into(),
            content,
            timestamp: None,
            message_id: None,
            cache_control: None,
        }
    }

    pub fn text(participant: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(participant, vec![ContentBlock::text(text)])
    }

    /// Concatenated text of all text blocks.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    /// Total characters of text and serialized tool content. Images are
    /// excluded — they are budgeted in bytes, separately.
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
}

/// Completion-call parameters carried on each request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    pub model: String,
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub max_tokens: u32,
    pub mode: CompletionMode,
    pub prefill_thinking: bool,
    pub turn_end_token: Option<String>,
    pub message_delimiter: Option<String>,
    pub prompt_caching: bool,
}

impl From<&LlmConfig> for RequestConfig {
    fn from(c: &LlmConfig) -> Self {
        Self {
            model: c.model.clone(),
            temperature: c.temperature,
            top_p: c.top_p,
            max_tokens: c.max_tokens,
            mode: c.mode,
            prefill_thinking: c.prefill_thinking,
            turn_end_token: c.turn_end_token.clone(),
            message_delimiter: c.message_delimiter.clone(),
            prompt_caching: c.prompt_caching,
        }
    }
}

/// Tool definition sent to the LLM API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A fully built request, transient per call.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub messages: Vec<ParticipantMessage>,
    pub system_prompt: String,
    pub config: RequestConfig,
    pub tools: Vec<ToolDefinition>,
    pub stop_sequences: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    Refusal,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_creation_tokens: Option<u32>,
    #[serde(default)]
    pub cache_read_tokens: Option<u32>,
}

/// Response from a provider.
#[derive(Debug, Clone)]
pub struct LlmCompletion {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    /// The matched stop sequence, when `stop_reason` is `StopSequence`.
    pub stop_sequence: Option<String>,
    pub usage: Usage,
    pub model: String,
}

impl LlmCompletion {
    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("")
    }
}
