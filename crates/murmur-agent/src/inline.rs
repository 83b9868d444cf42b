//! The inline tool-execution loop.
//!
//! One activation produces one assistant turn, but that turn may embed tool
//! invocations. Each completion runs with `</function_calls>` as a stop
//! sequence; when the model closes a tool block, the tools run locally, the
//! results are appended as a `<function_results>` block, and the model is
//! re-prefilled with everything it has said so far. Visible text is sent to
//! the channel progressively, with the surrounding invisible content
//! recorded per message so the turn can be reconstructed later.

use std::collections::{BTreeMap, HashMap};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use tracing::{debug, info, warn};

use murmur_core::config::{
    BotConfig, CONTINUATION_BUDGET, MAX_TOOL_DEPTH_SUFFIX,
};
use murmur_core::types::{BotId, ChannelId, MessageId, UserId};
use murmur_llm::{
    complete_with_retry, ContentBlock, ImageSource, LlmProvider, LlmRequest, ParticipantMessage,
    StopReason,
};
use murmur_store::{InvisibleContext, NewToolCacheEntry, ToolCache};
use murmur_tools::{
    self as tools, ToolExecutor, ToolImage, FUNCTION_CALLS_CLOSE, THINKING_CLOSE, THINKING_OPEN,
};
use murmur_transport::{retry, Transport, TransportError};

use crate::error::Result;
use crate::segment::{split_segments, Segmented};
use crate::truncate;

#[derive(Clone, Copy)]
pub struct InlineParams<'a> {
    pub bot: &'a BotId,
    pub bot_name: &'a str,
    pub channel_id: ChannelId,
    pub trigger_message_id: MessageId,
    /// Participant names the model might hallucinate as.
    pub participants: &'a [String],
    /// username → transport user id, for rewriting mentions on send.
    pub mention_ids: &'a HashMap<String, UserId>,
    pub config: &'a BotConfig,
}

pub struct InlineOutcome {
    /// The full assembled assistant text (thinking and tool XML included).
    pub accumulated_text: String,
    pub sent_message_ids: Vec<MessageId>,
    pub message_contexts: BTreeMap<MessageId, InvisibleContext>,
    pub stop_reason: String,
    /// Tool-cache call ids persisted during this activation.
    pub executed_call_ids: Vec<String>,
    pub refusal: bool,
}

struct LoopState {
    accumulated: String,
    /// Bytes of `accumulated` already delivered (or deliberately skipped).
    sent_upto: usize,
    /// Bytes already scanned for tool calls.
    parsed_upto: usize,
    sent_ids: Vec<MessageId>,
    contexts: BTreeMap<MessageId, InvisibleContext>,
    pending_entries: Vec<NewToolCacheEntry>,
    pending_images: Vec<(String, Vec<ToolImage>)>,
}

enum SendOutcome {
    Sent,
    StartHallucination(String),
    /// Absolute byte offset in `accumulated` where a participant line began.
    MidCut(usize),
}

pub async fn run_inline_loop(
    transport: &dyn Transport,
    provider: &dyn LlmProvider,
    executor: &ToolExecutor,
    tool_cache: &ToolCache,
    mut base: LlmRequest,
    params: InlineParams<'_>,
) -> Result<InlineOutcome> {
    if !base.stop_sequences.iter().any(|s| s == FUNCTION_CALLS_CLOSE) {
        base.stop_sequences.push(FUNCTION_CALLS_CLOSE.to_string());
    }

    let mut st = LoopState {
        accumulated: String::new(),
        sent_upto: 0,
        parsed_upto: 0,
        sent_ids: Vec::new(),
        contexts: BTreeMap::new(),
        pending_entries: Vec::new(),
        pending_images: Vec::new(),
    };

    let max_depth = params.config.tools.max_tool_depth;
    let mut executed = 0usize;
    let mut refusal = false;
    let mut stop_reason = "end_turn".to_string();
    let mut depth_exhausted = false;

    loop {
        if executed >= max_depth {
            depth_exhausted = true;
            stop_reason = "max_tool_depth".to_string();
            break;
        }

        let req = continuation_request(&mut base, &st, params.config);
        drain_pending_images(&mut st);
        let completion = complete_with_retry(provider, &req).await?;

        let mut chunk = completion.text();
        if params.config.llm.prefill_thinking && st.accumulated.is_empty() {
            // The prefill seeded the open tag; restore it in our copy.
            chunk = format!("{THINKING_OPEN}{chunk}");
        }
        st.accumulated.push_str(&chunk);

        if completion.stop_reason == StopReason::Refusal {
            refusal = true;
            stop_reason = "refusal".to_string();
            break;
        }

        if completion.stop_reason == StopReason::StopSequence {
            let stop = completion.stop_sequence.clone().unwrap_or_default();
            if stop == FUNCTION_CALLS_CLOSE {
                // The provider consumed the stop sequence; restore it.
                st.accumulated.push_str(FUNCTION_CALLS_CLOSE);
                let parsed_upto = st.parsed_upto;
                let prefill_thinking = params.config.llm.prefill_thinking;
                continue_completion(provider, &mut base, &mut st, |text| {
                    !needs_block_recovery(text, parsed_upto, prefill_thinking)
                })
                .await?;
            } else if is_configured_terminal(&stop, params.config) {
                stop_reason = "stop_sequence".to_string();
                break;
            } else if tools::has_incomplete_tool_call(&st.accumulated[st.parsed_upto..]) {
                // The stop fired inside a tool parameter (a username, say);
                // the bytes belong to the parameter. Restore and resume.
                st.accumulated.push_str(&stop);
                let parsed_upto = st.parsed_upto;
                continue_completion(provider, &mut base, &mut st, move |text| {
                    !tools::has_incomplete_tool_call(&text[parsed_upto..])
                })
                .await?;
            } else {
                // About to speak as another participant; the turn is over.
                stop_reason = "participant_stop".to_string();
                break;
            }
        } else if completion.stop_reason == StopReason::MaxTokens {
            stop_reason = "max_tokens".to_string();
        }

        let Some(parsed) = tools::parse_tool_calls(&st.accumulated[st.parsed_upto..]) else {
            if completion.stop_reason == StopReason::EndTurn {
                stop_reason = "end_turn".to_string();
            }
            break;
        };

        // Send everything before the tool block. The block itself stays
        // unsent — it becomes the invisible prefix of whatever the model
        // says after its results arrive.
        let block_start = st.parsed_upto + parsed.before_text.len();
        let block_end = block_start + parsed.full_match.len();
        match send_progressive(transport, &mut st, block_start, params).await? {
            SendOutcome::Sent => {}
            SendOutcome::StartHallucination(participant) => {
                info!(participant = %participant, "response-start hallucination, discarding completion");
                return Ok(InlineOutcome {
                    accumulated_text: String::new(),
                    sent_message_ids: Vec::new(),
                    message_contexts: BTreeMap::new(),
                    stop_reason: "hallucination".to_string(),
                    executed_call_ids: Vec::new(),
                    refusal: false,
                });
            }
            SendOutcome::MidCut(at) => {
                st.accumulated.truncate(at);
                stop_reason = "participant_truncation".to_string();
                break;
            }
        }

        // Execute the calls and splice the results in.
        let mut results: Vec<(String, String)> = Vec::new();
        for call in &parsed.calls {
            if executed >= max_depth {
                warn!(tool = %call.name, "tool call dropped, depth budget exhausted");
                break;
            }
            executed += 1;
            debug!(tool = %call.name, executed, "executing inline tool call");
            let outcome = executor.execute(call).await;
            let result_text = outcome.result_text();

            if params.config.tools.tool_output_visible {
                post_tool_output(transport, params, call, &outcome).await;
            }

            st.pending_entries.push(NewToolCacheEntry {
                call: call.clone(),
                output: result_text.clone(),
                images: outcome.images.clone(),
                mcp: executor.is_mcp(&call.name),
                triggering_message_id: params.trigger_message_id,
                bot_message_ids: Vec::new(),
                original_assistant_text: String::new(),
            });
            if !outcome.images.is_empty() {
                st.pending_images
                    .push((call.name.clone(), outcome.images.clone()));
            }
            results.push((call.name.clone(), result_text));
        }

        // beforeText + toolXml + formattedResults.
        st.accumulated.truncate(block_end);
        let block = tools::format_tool_results(&results);
        st.accumulated = tools::format_tool_result_for_injection(&st.accumulated, &block);
        st.parsed_upto = st.accumulated.len();
    }

    finalize(
        transport, tool_cache, &mut st, params, stop_reason, refusal, depth_exhausted,
    )
    .await
}

/// Build the next completion request: accumulated text (right-trimmed) as
/// the assistant prefill, with any pending tool-result images inserted as
/// `System<[tool]>` turns just before the continuation.
fn continuation_request(base: &mut LlmRequest, st: &LoopState, config: &BotConfig) -> LlmRequest {
    // Pending images become a durable part of the conversation tail,
    // inserted in arrival order just before the continuation placeholder.
    for (tool_name, images) in &st.pending_images {
        let content = images
            .iter()
            .map(|img| ContentBlock::Image {
                source: ImageSource {
                    media_type: img.mime_type.clone(),
                    data: img.data.clone(),
                },
            })
            .collect();
        let placeholder_at = base.messages.len().saturating_sub(1);
        base.messages.insert(
            placeholder_at,
            ParticipantMessage::new(format!("System<[{tool_name}]>"), content),
        );
    }

    let mut req = base.clone();
    if let Some(placeholder) = req.messages.last_mut() {
        let prefill = st.accumulated.trim_end();
        if !prefill.is_empty() {
            placeholder.content = vec![ContentBlock::text(prefill)];
        } else if config.llm.prefill_thinking {
            placeholder.content = vec![ContentBlock::text(THINKING_OPEN)];
        }
    }
    req
}

fn drain_pending_images(st: &mut LoopState) {
    st.pending_images.clear();
}

/// Whether the accumulated text still has an unterminated invisible block
/// that another prefill pass should close.
fn needs_block_recovery(text: &str, parsed_upto: usize, prefill_thinking: bool) -> bool {
    tools::has_unclosed_thinking(text)
        || has_unclosed_invoke(&text[parsed_upto..])
        || (prefill_thinking && !text.contains(THINKING_CLOSE))
}

fn has_unclosed_invoke(region: &str) -> bool {
    region.matches("<invoke ").count() > region.matches("</invoke>").count()
}

/// Bounded prefill-and-call passes until `done` or the budget runs out.
async fn continue_completion(
    provider: &dyn LlmProvider,
    base: &mut LlmRequest,
    st: &mut LoopState,
    done: impl Fn(&str) -> bool,
) -> Result<()> {
    let mut budget = CONTINUATION_BUDGET;
    while budget > 0 && !done(&st.accumulated) {
        budget -= 1;
        let prefill = st.accumulated.trim_end().to_string();
        let req = {
            let mut req = base.clone();
            if let Some(placeholder) = req.messages.last_mut() {
                placeholder.content = vec![ContentBlock::text(prefill)];
            }
            req
        };
        let completion = complete_with_retry(provider, &req).await?;
        st.accumulated.push_str(&completion.text());
        match (completion.stop_reason, completion.stop_sequence.as_deref()) {
            (StopReason::StopSequence, Some(FUNCTION_CALLS_CLOSE)) => {
                st.accumulated.push_str(FUNCTION_CALLS_CLOSE);
            }
            (StopReason::StopSequence, Some(stop)) if !done(&st.accumulated) => {
                // Still inside the block; the stop bytes belong to it.
                st.accumulated.push_str(stop);
            }
            _ => break,
        }
    }
    Ok(())
}

fn is_configured_terminal(stop: &str, config: &BotConfig) -> bool {
    config.llm.turn_end_token.as_deref() == Some(stop)
        || config.llm.message_delimiter.as_deref() == Some(stop)
}

/// Send the unsent region up to `end` (exclusive). Applies the
/// response-start hallucination check on the first send and mid-response
/// participant truncation throughout.
async fn send_progressive(
    transport: &dyn Transport,
    st: &mut LoopState,
    end: usize,
    params: InlineParams<'_>,
) -> Result<SendOutcome> {
    let region = st.accumulated[st.sent_upto..end].to_string();
    let segments = match split_segments(&region) {
        Segmented::Phantom(_) => {
            // Nothing visible yet; leave the region unsent so it rides into
            // the next segment's prefix.
            return Ok(SendOutcome::Sent);
        }
        Segmented::Segments(segments) => segments,
    };

    if st.sent_ids.is_empty() {
        let combined: String = segments
            .iter()
            .map(|s| s.visible.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if let Some(name) = truncate::starts_as_other(&combined, params.participants) {
            return Ok(SendOutcome::StartHallucination(name));
        }
    }

    // Mid-response truncation: participant lines inside visible text only.
    let mut offset = st.sent_upto;
    for (idx, segment) in segments.iter().enumerate() {
        let visible_start = offset + segment.prefix.len();
        let first_of_turn = st.sent_ids.is_empty() && idx == 0;
        match truncate::scan(
            &segment.visible,
            params.participants,
            &params.config.llm.stop_sequences,
        ) {
            truncate::Truncation::Mid { at, .. } => {
                return Ok(SendOutcome::MidCut(visible_start + at));
            }
            // A later segment opening as another participant is a mid-turn
            // hallucination too; the response-start case was handled above.
            truncate::Truncation::StartHallucination { .. } if !first_of_turn => {
                return Ok(SendOutcome::MidCut(visible_start));
            }
            _ => {}
        }
        offset = visible_start + segment.visible.len() + segment.suffix.as_deref().map_or(0, str::len);
    }

    for segment in &segments {
        let outgoing = prepare_outgoing(&segment.visible, params);
        let reply_to = st.sent_ids.is_empty().then_some(params.trigger_message_id);
        let ids = send_visible(transport, params.channel_id, &outgoing, reply_to).await?;
        record_segment(st, &ids, &segment.prefix, segment.suffix.as_deref());
        st.sent_ids.extend(ids);
    }

    st.sent_upto = end;
    Ok(SendOutcome::Sent)
}

/// First chunk carries the prefix, the last carries the suffix.
fn record_segment(st: &mut LoopState, ids: &[MessageId], prefix: &str, suffix: Option<&str>) {
    for (i, id) in ids.iter().enumerate() {
        let mut ctx = InvisibleContext::default();
        if i == 0 {
            ctx.prefix = prefix.to_string();
        }
        if i == ids.len() - 1 {
            ctx.suffix = suffix.map(str::to_string);
        }
        st.contexts.insert(*id, ctx);
    }
}

/// Rewrite `<@name>` mentions back to transport ids and strip a leading
/// reply marker; the adapter chunks anything over the transport limit.
fn prepare_outgoing(text: &str, params: InlineParams<'_>) -> String {
    let mut out = text.to_string();
    if let Some(rest) = out.strip_prefix("<reply:@") {
        if let Some(end) = rest.find("> ") {
            out = rest[end + 2..].to_string();
        }
    }
    for (name, id) in params.mention_ids {
        out = out.replace(&format!("<@{name}>"), &format!("<@{id}>"));
    }
    out
}

async fn send_visible(
    transport: &dyn Transport,
    channel_id: ChannelId,
    text: &str,
    reply_to: Option<MessageId>,
) -> Result<Vec<MessageId>> {
    let sent = retry::with_backoff("send_message", || {
        transport.send_message(channel_id, text, reply_to)
    })
    .await;
    match sent {
        Err(TransportError::MessageDeleted { .. }) if reply_to.is_some() => {
            // The reply target vanished mid-activation; send unreferenced.
            Ok(retry::with_backoff("send_message", || {
                transport.send_message(channel_id, text, None)
            })
            .await?)
        }
        other => Ok(other?),
    }
}

/// Dotted webhook view of a tool execution, with plain-send fallback.
async fn post_tool_output(
    transport: &dyn Transport,
    params: InlineParams<'_>,
    call: &tools::ToolCall,
    outcome: &tools::ToolOutcome,
) {
    const OUTPUT_PREVIEW_CHARS: usize = 600;

    let flattened: String = outcome
        .result_text()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let preview: String = flattened.chars().take(OUTPUT_PREVIEW_CHARS).collect();
    let content = format!(". [{}] {} \u{2192} {}", call.name, call.input, preview);

    let posted = transport
        .send_webhook(params.channel_id, params.bot_name, &content)
        .await;
    if let Err(e) = posted {
        debug!(error = %e, "webhook tool output failed, falling back to plain send");
        if let Err(e) = transport.send_message(params.channel_id, &content, None).await {
            warn!(error = %e, "tool output fallback send failed");
        }
    }

    for (i, image) in outcome.images.iter().enumerate() {
        let Ok(bytes) = B64.decode(&image.data) else {
            continue;
        };
        let ext = image.mime_type.strip_prefix("image/").unwrap_or("png");
        let filename = format!(".{}-{}.{}", call.name, i, ext);
        if let Err(e) = transport
            .send_image_attachment(params.channel_id, &filename, &bytes)
            .await
        {
            warn!(error = %e, "tool result image send failed");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn finalize(
    transport: &dyn Transport,
    tool_cache: &ToolCache,
    st: &mut LoopState,
    params: InlineParams<'_>,
    stop_reason: String,
    refusal: bool,
    depth_exhausted: bool,
) -> Result<InlineOutcome> {
    // 1. Truncate trailing participant hallucinations, and make the
    // persisted text match what the reader will see.
    let remaining = &st.accumulated[st.sent_upto..];
    if let truncate::Truncation::Mid { at, .. } = truncate::scan(
        remaining,
        params.participants,
        &params.config.llm.stop_sequences,
    ) {
        let cut = st.sent_upto + at;
        st.accumulated.truncate(cut);
    }
    if depth_exhausted {
        st.accumulated.push_str(MAX_TOOL_DEPTH_SUFFIX);
    }

    // 2. Persist pending tool-cache entries stamped with the final text.
    let mut executed_call_ids = Vec::with_capacity(st.pending_entries.len());
    for entry in &mut st.pending_entries {
        entry.original_assistant_text = st.accumulated.clone();
        entry.bot_message_ids = st.sent_ids.clone();
        executed_call_ids.push(entry.call.id.clone());
        tool_cache.persist_tool_use(params.bot, params.channel_id, entry)?;
    }

    // 3–5. Segment and send the remainder, or carry it as a suffix.
    let remainder = st.accumulated[st.sent_upto..].to_string();
    match split_segments(&remainder) {
        Segmented::Phantom(invisible) => {
            if invisible.is_empty() {
                // Nothing left over.
            } else if let Some(last) = st.sent_ids.last().copied() {
                let ctx = st.contexts.entry(last).or_default();
                match &mut ctx.suffix {
                    Some(existing) => existing.push_str(&invisible),
                    None => ctx.suffix = Some(invisible),
                }
            }
            // With nothing ever sent, the invisible text survives only in
            // the completion record.
        }
        Segmented::Segments(segments) => {
            emit_thinking_debug(transport, params, &remainder).await;
            for segment in &segments {
                let outgoing = prepare_outgoing(&segment.visible, params);
                let reply_to = st.sent_ids.is_empty().then_some(params.trigger_message_id);
                let ids = send_visible(transport, params.channel_id, &outgoing, reply_to).await?;
                record_segment(st, &ids, &segment.prefix, segment.suffix.as_deref());
                st.sent_ids.extend(ids);
            }
        }
    }
    st.sent_upto = st.accumulated.len();
    drain_pending_images(st);

    info!(
        stop_reason = %stop_reason,
        sent = st.sent_ids.len(),
        tools = executed_call_ids.len(),
        "inline loop finalized"
    );

    Ok(InlineOutcome {
        accumulated_text: std::mem::take(&mut st.accumulated),
        sent_message_ids: std::mem::take(&mut st.sent_ids),
        message_contexts: std::mem::take(&mut st.contexts),
        stop_reason,
        executed_call_ids,
        refusal,
    })
}

/// Surface thinking blocks on the debug channel when tool output is
/// visible: short ones as a dotted webhook, long ones as a `.md` attachment.
async fn emit_thinking_debug(transport: &dyn Transport, params: InlineParams<'_>, text: &str) {
    const WEBHOOK_LIMIT: usize = 1500;

    if !params.config.tools.tool_output_visible {
        return;
    }
    let mut thinking = String::new();
    let mut rest = text;
    while let Some(start) = rest.find(THINKING_OPEN) {
        let after = &rest[start + THINKING_OPEN.len()..];
        let Some(end) = after.find(THINKING_CLOSE) else {
            break;
        };
        thinking.push_str(&after[..end]);
        thinking.push('\n');
        rest = &after[end + THINKING_CLOSE.len()..];
    }
    let thinking = thinking.trim();
    if thinking.is_empty() {
        return;
    }

    let result = if thinking.chars().count() > WEBHOOK_LIMIT {
        transport
            .send_file_attachment(params.channel_id, ".thinking.md", thinking)
            .await
            .map(|_| Vec::new())
    } else {
        transport
            .send_webhook(params.channel_id, params.bot_name, &format!(". {thinking}"))
            .await
    };
    if let Err(e) = result {
        debug!(error = %e, "thinking debug emission failed");
    }
}
