use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// Hard limits shared across the workspace.

/// Messages between the cache marker and the tail of the context.
pub const CACHE_MARKER_BUFFER: usize = 20;
/// Per-image base64 ceiling; larger images are resampled before inclusion.
pub const MAX_IMAGE_BASE64_BYTES: usize = 5 * 1024 * 1024;
/// Total base64 payload ceiling across all images in one request.
pub const MAX_REQUEST_IMAGE_BASE64_BYTES: usize = 15 * 1024 * 1024;
/// Upper bound on visible characters per sent chat message.
pub const SEND_CHUNK_CHARS: usize = 1800;
/// Typing indicator refresh cadence in seconds.
pub const TYPING_REFRESH_SECS: u64 = 8;
/// Continuation passes allowed while recovering an unclosed XML block.
pub const CONTINUATION_BUDGET: usize = 3;
/// Suffix appended when the tool loop exhausts its depth budget.
pub const MAX_TOOL_DEPTH_SUFFIX: &str = "\n[Max tool depth reached]";

/// Per-bot configuration (murmur.toml + MURMUR_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// The participant name the model sees for this bot.
    pub name: String,
    /// When set, the bot never self-activates from channel traffic.
    #[serde(default)]
    pub api_only: bool,
    /// Activate at random with probability 1/N per event batch.
    #[serde(default)]
    pub reply_on_random: Option<u32>,
    /// Maximum distinct consecutive bot identities in a reply chain.
    #[serde(default = "default_chain_depth")]
    pub reply_chain_depth_limit: u32,
    /// Reaction added when the reply-chain limit suppresses activation.
    #[serde(default = "default_chain_emote")]
    pub chain_limit_emote: String,
    /// Reaction added when the credit system reports the bot unconfigured.
    #[serde(default = "default_config_emote")]
    pub config_needed_emote: String,
    /// Reaction added when the model refuses.
    #[serde(default = "default_stop_emote")]
    pub stop_emote: String,
    #[serde(default)]
    pub context: ContextConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub credit: CreditConfig,
}

impl BotConfig {
    /// Load from an explicit path, falling back to `murmur.toml`, with
    /// `MURMUR_*` environment overrides applied on top.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = path.unwrap_or("murmur.toml");
        let config: BotConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("MURMUR_").split("__"))
            .extract()?;
        Ok(config)
    }
}

/// Context-window shaping knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Normal character ceiling for text content in a built request.
    #[serde(default = "default_recency_chars")]
    pub recency_window_characters: usize,
    /// Absolute character ceiling; exceeding it forces a roll.
    #[serde(default = "default_hard_max_chars")]
    pub hard_max_characters: usize,
    /// Maximum messages in a built request.
    #[serde(default = "default_recency_messages")]
    pub recency_window_messages: usize,
    /// Messages that must accumulate before a truncation is allowed to roll.
    #[serde(default = "default_rolling_threshold")]
    pub rolling_threshold: u32,
    /// Include images from the cached prefix (stable across activations).
    #[serde(default)]
    pub cache_images: bool,
    /// Cap on cached-prefix images.
    #[serde(default = "default_max_images")]
    pub max_images: usize,
    /// Cap on images from the ephemeral tail.
    #[serde(default = "default_max_ephemeral_images")]
    pub max_ephemeral_images: usize,
    /// Cap on MCP tool-result images after interleave.
    #[serde(default = "default_max_mcp_images")]
    pub max_mcp_images: usize,
    /// Text-file attachments above this size are dropped from the context.
    #[serde(default = "default_max_attachment_chars")]
    pub max_attachment_chars: usize,
    /// Reconstruct prior assistant turns (thinking + tool XML) from the
    /// activation store instead of interleaving the tool cache.
    #[serde(default)]
    pub preserve_thinking_context: bool,
    /// Most recent tool-cache entries eligible for interleave.
    #[serde(default = "default_tool_history_window")]
    pub tool_history_window: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            recency_window_characters: default_recency_chars(),
            hard_max_characters: default_hard_max_chars(),
            recency_window_messages: default_recency_messages(),
            rolling_threshold: default_rolling_threshold(),
            cache_images: false,
            max_images: default_max_images(),
            max_ephemeral_images: default_max_ephemeral_images(),
            max_mcp_images: default_max_mcp_images(),
            max_attachment_chars: default_max_attachment_chars(),
            preserve_thinking_context: false,
            tool_history_window: default_tool_history_window(),
        }
    }
}

/// Completion-call parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub mode: CompletionMode,
    /// Seed the continuation with an open `<thinking>` tag.
    #[serde(default)]
    pub prefill_thinking: bool,
    #[serde(default)]
    pub turn_end_token: Option<String>,
    #[serde(default)]
    pub message_delimiter: Option<String>,
    #[serde(default = "bool_true")]
    pub prompt_caching: bool,
    /// Extra stop sequences appended after the generated participant stops.
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    /// Continuation seeded by a trailing assistant message.
    #[default]
    Prefill,
    /// Plain alternating chat turns.
    Chat,
}

/// Tool-loop knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Maximum tool executions per activation.
    #[serde(default = "default_max_tool_depth")]
    pub max_tool_depth: usize,
    /// Post a dotted webhook message showing each tool's input and output.
    #[serde(default)]
    pub tool_output_visible: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_tool_depth: default_max_tool_depth(),
            tool_output_visible: false,
        }
    }
}

/// External credit-system gate. Disabled by default; when enabled, mention,
/// reply, and `m`-command activations are charged (random ones are not).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreditConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_chain_depth() -> u32 {
    4
}
fn default_chain_emote() -> String {
    "\u{1f501}".to_string() // 🔁
}
fn default_config_emote() -> String {
    "\u{2699}\u{fe0f}".to_string() // ⚙️
}
fn default_stop_emote() -> String {
    "\u{1f6d1}".to_string() // 🛑
}
fn default_recency_chars() -> usize {
    60_000
}
fn default_hard_max_chars() -> usize {
    120_000
}
fn default_recency_messages() -> usize {
    200
}
fn default_rolling_threshold() -> u32 {
    40
}
fn default_max_images() -> usize {
    6
}
fn default_max_ephemeral_images() -> usize {
    4
}
fn default_max_mcp_images() -> usize {
    4
}
fn default_max_attachment_chars() -> usize {
    20_000
}
fn default_tool_history_window() -> usize {
    20
}
fn default_temperature() -> f32 {
    1.0
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_max_tool_depth() -> usize {
    5
}
fn bool_true() -> bool {
    true
}
