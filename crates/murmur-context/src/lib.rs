//! The context builder: raw transport state plus stored history in, a single
//! [`LlmRequest`] out.
//!
//! Everything here is pure computation — no I/O, no awaiting — so a context
//! build can never expose intermediate state to another task. The pipeline
//! is ordered to keep the prompt prefix byte-identical across activations
//! until a roll moves the window (prompt-cache hits are the point).

pub mod format;
pub mod images;
pub mod injection;
pub mod interleave;
pub mod limits;
pub mod marker;
pub mod stops;
pub mod working;

use tracing::debug;

use murmur_core::config::BotConfig;
use murmur_core::types::{BotId, MessageId};
use murmur_llm::{LlmRequest, RequestConfig, ToolDefinition};
use murmur_store::{Activation, ChannelState, ToolCacheEntry};
use murmur_transport::message::{ChatMessage, FetchedImage};

pub use injection::ContextInjection;
pub use working::WorkingMessage;

/// Everything a context build consumes.
pub struct ContextInput<'a> {
    pub bot: &'a BotId,
    /// The configured participant name.
    pub bot_name: &'a str,
    /// The transport username, rewritten to `bot_name` wherever it appears.
    pub bot_username: &'a str,
    /// Fetched messages, chronological.
    pub messages: Vec<ChatMessage>,
    /// Downloaded image payloads, keyed by source message.
    pub images: Vec<FetchedImage>,
    /// Tool-cache slice, already filtered to the fetch window (and to
    /// still-existing bot messages when that filter is on).
    pub tool_cache: Vec<ToolCacheEntry>,
    /// Activation records; consulted only under `preserve_thinking_context`.
    pub activations: Vec<Activation>,
    pub injections: Vec<ContextInjection>,
    pub state: ChannelState,
    pub system_prompt: String,
    pub config: &'a BotConfig,
    pub tools: Vec<ToolDefinition>,
}

/// What a context build produces.
pub struct BuiltContext {
    pub request: LlmRequest,
    pub did_roll: bool,
    /// The message carrying the cache breakpoint, when one was usable.
    pub cache_marker: Option<MessageId>,
    /// Oldest real message kept in the request; becomes the new
    /// `cache_oldest_message_id` on roll and the prune boundary.
    pub oldest_message_id: Option<MessageId>,
    /// Participant names seen in the fetched messages (bot excluded) — the
    /// hallucination/truncation vocabulary for the inline loop.
    pub participants: Vec<String>,
}

/// Build one request. Pure: equal inputs produce byte-equal requests (P2/P7).
pub fn build_context(input: ContextInput<'_>) -> BuiltContext {
    let config = input.config;
    let preserve = config.context.preserve_thinking_context;

    // Participant vocabulary comes from the raw fetch, before any merging
    // or filtering drops messages.
    let participants = format::collect_participants(&input.messages, input.bot_username);

    // Steps 1–2: merge consecutive bot messages, then drop dot-messages and
    // hidden messages.
    let merged = format::merge_consecutive_bot_messages(input.messages, input.bot_username, preserve);
    let filtered = format::filter_hidden(merged);

    // Step 3: pin the image-selection anchor before anything shifts indices.
    let anchor = images::select_anchor(&filtered, input.state.last_cache_marker);

    // Step 4: one participant message per surviving chat message.
    let mut working = format::format_messages(&filtered, input.bot_name, input.bot_username, config);

    // Step 5: two-tier image selection under the byte budgets.
    images::attach_images(&mut working, &input.images, anchor, config);

    // Step 6 or 7: tool history interleave, or activation injection.
    if preserve {
        interleave::inject_activations(&mut working, &input.activations, input.bot_name);
    } else {
        interleave::interleave_tool_history(&mut working, &input.tool_cache, input.bot_name, config);
    }

    // Step 8: plugin injections with depth aging.
    injection::apply_injections(&mut working, input.injections);

    // Step 9: final same-participant merge.
    working = format::merge_same_participant(working);

    // Step 10: size limits; may force a roll.
    let limit_outcome = limits::apply_limits(&mut working, &input.state, &config.context);

    // Step 11: cache marker.
    let marker = marker::place_marker(
        &mut working,
        input.state.last_cache_marker,
        limit_outcome.did_roll,
        config.llm.prompt_caching,
    );

    // Step 12: stop sequences, then the continuation placeholder.
    let stop_sequences = stops::build_stop_sequences(&working, input.bot_name, &config.llm);

    let oldest_message_id = working.iter().find_map(|m| m.message_id);

    let mut messages: Vec<_> = working.into_iter().map(WorkingMessage::into_participant).collect();
    messages.push(murmur_llm::ParticipantMessage::new(
        input.bot_name,
        Vec::new(),
    ));

    debug!(
        bot = %input.bot,
        messages = messages.len(),
        did_roll = limit_outcome.did_roll,
        marker = ?marker,
        "context built"
    );

    BuiltContext {
        request: LlmRequest {
            messages,
            system_prompt: input.system_prompt,
            config: RequestConfig::from(&config.llm),
            tools: input.tools,
            stop_sequences,
        },
        did_roll: limit_outcome.did_roll,
        cache_marker: marker,
        oldest_message_id,
        participants,
    }
}
