use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use murmur_core::types::MessageId;
use murmur_tools::ToolImage;

/// Per-(bot, channel) mutable record. Process lifetime only; the durable
/// record is the tool cache and activation store.
#[derive(Debug, Clone, Default)]
pub struct ChannelState {
    /// Message carrying the prompt-cache breakpoint in the last request.
    pub last_cache_marker: Option<MessageId>,
    /// Oldest message the fetch window must keep reaching back to.
    pub cache_oldest_message_id: Option<MessageId>,
    /// Messages accumulated since the last roll.
    pub messages_since_roll: u32,
}

/// One executed tool call, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCacheEntry {
    pub call_id: String,
    pub name: String,
    pub input: serde_json::Value,
    /// Result text or JSON, as shown to the model.
    pub output: String,
    #[serde(default)]
    pub images: Vec<ToolImage>,
    /// Whether the executing tool was MCP-hosted (its images count against
    /// the MCP image cap at context-build time).
    #[serde(default)]
    pub mcp: bool,
    /// The user message whose activation ran this tool; interleave position.
    pub triggering_message_id: MessageId,
    /// Messages the bot sent while this call's activation ran.
    pub bot_message_ids: Vec<MessageId>,
    /// The full assistant text of the turn, tool XML included.
    pub original_assistant_text: String,
    pub created_at: String,
}

/// What started an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub kind: TriggerKind,
    pub anchor_message_id: MessageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Mention,
    Reply,
    MCommand,
    Random,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Mention => "mention",
            TriggerKind::Reply => "reply",
            TriggerKind::MCommand => "m_command",
            TriggerKind::Random => "random",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mention" => Some(TriggerKind::Mention),
            "reply" => Some(TriggerKind::Reply),
            "m_command" => Some(TriggerKind::MCommand),
            "random" => Some(TriggerKind::Random),
            _ => None,
        }
    }

    /// Whether this trigger kind is charged against the credit system.
    pub fn chargeable(&self) -> bool {
        !matches!(self, TriggerKind::Random)
    }
}

/// Invisible content recorded around one sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InvisibleContext {
    pub prefix: String,
    pub suffix: Option<String>,
}

/// One completion within an activation. Empty `sent_message_ids` marks a
/// phantom completion — all of its text was invisible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub sent_message_ids: Vec<MessageId>,
}

/// A persisted activation: trigger, completions, and the per-message
/// invisible-content map that reconstructs the original assistant text.
#[derive(Debug, Clone)]
pub struct Activation {
    pub id: i64,
    pub trigger: Trigger,
    pub completions: Vec<Completion>,
    pub message_contexts: BTreeMap<MessageId, InvisibleContext>,
    pub completed: bool,
    pub stop_reason: Option<String>,
}

impl Activation {
    /// All message ids this activation sent, in completion order.
    pub fn sent_message_ids(&self) -> impl Iterator<Item = MessageId> + '_ {
        self.completions
            .iter()
            .flat_map(|c| c.sent_message_ids.iter().copied())
    }
}
