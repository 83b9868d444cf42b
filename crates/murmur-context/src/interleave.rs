//! Steps 6 and 7: historical tool calls, or prior-activation reconstruction.
//!
//! Exactly one of the two runs per build. Tool history re-creates the
//! assistant turn and a synthetic `System<[tool]>` result at the position of
//! the message that triggered it; activation injection instead wraps the
//! bot's surviving messages with their recorded invisible prefix/suffix.

use murmur_core::config::BotConfig;
use murmur_llm::{ContentBlock, ImageSource};
use murmur_store::{Activation, ToolCacheEntry};

use crate::working::WorkingMessage;

/// Participant name carrying a tool's result.
pub fn tool_result_participant(tool_name: &str) -> String {
    format!("System<[{tool_name}]>")
}

/// Step 6: interleave the most recent tool-cache entries at the position of
/// their triggering messages, then cap MCP-sourced images.
pub fn interleave_tool_history(
    working: &mut Vec<WorkingMessage>,
    entries: &[ToolCacheEntry],
    bot_name: &str,
    config: &BotConfig,
) {
    if entries.is_empty() {
        return;
    }

    let window_start = entries
        .len()
        .saturating_sub(config.context.tool_history_window);
    let window = &entries[window_start..];

    let mut out: Vec<WorkingMessage> = Vec::with_capacity(working.len() + window.len() * 2);
    let mut mcp_messages: Vec<usize> = Vec::new();

    for msg in working.drain(..) {
        let trigger_id = msg.message_id;
        out.push(msg);
        let Some(trigger_id) = trigger_id else {
            continue;
        };

        for entry in window.iter().filter(|e| e.triggering_message_id == trigger_id) {
            let mut assistant = WorkingMessage::text(bot_name, &entry.original_assistant_text);
            assistant.is_bot_self = true;
            assistant.is_bot_author = true;
            out.push(assistant);

            let mut result =
                WorkingMessage::text(tool_result_participant(&entry.name), &entry.output);
            for image in &entry.images {
                result.content.push(ContentBlock::Image {
                    source: ImageSource {
                        media_type: image.mime_type.clone(),
                        data: image.data.clone(),
                    },
                });
            }
            if entry.mcp && !entry.images.is_empty() {
                mcp_messages.push(out.len());
            }
            out.push(result);
        }
    }

    cap_mcp_images(&mut out, &mcp_messages, config.context.max_mcp_images);
    *working = out;
}

/// Drop the oldest MCP result images beyond the cap.
fn cap_mcp_images(messages: &mut [WorkingMessage], mcp_indices: &[usize], cap: usize) {
    let total: usize = mcp_indices
        .iter()
        .map(|&i| messages[i].content.iter().filter(|b| b.is_image()).count())
        .sum();
    let mut excess = total.saturating_sub(cap);

    for &i in mcp_indices {
        if excess == 0 {
            break;
        }
        let msg = &mut messages[i];
        while excess > 0 {
            let Some(pos) = msg.content.iter().position(ContentBlock::is_image) else {
                break;
            };
            msg.content.remove(pos);
            excess -= 1;
        }
    }
}

/// Step 7: wrap surviving bot messages in their recorded invisible context
/// and materialize phantom completions, then merge within each activation.
pub fn inject_activations(
    working: &mut Vec<WorkingMessage>,
    activations: &[Activation],
    bot_name: &str,
) {
    for activation in activations {
        // Wrap each surviving sent message as prefix + existing + suffix.
        for (message_id, context) in &activation.message_contexts {
            let Some(msg) = working
                .iter_mut()
                .find(|m| m.message_id == Some(*message_id) && m.is_bot_self)
            else {
                continue;
            };
            let existing = msg.joined_text();
            let mut text = String::with_capacity(
                context.prefix.len() + existing.len() + context.suffix.as_deref().map_or(0, str::len),
            );
            text.push_str(&context.prefix);
            text.push_str(&existing);
            if let Some(suffix) = &context.suffix {
                text.push_str(suffix);
            }
            msg.content = vec![ContentBlock::text(text)];
            msg.activation_id = Some(activation.id);
        }

        // Phantom completions: nothing visible was ever sent, so their
        // invisible text rides as a synthetic turn after the anchor. With no
        // anchor in the window there is nothing to attach to — skip.
        let Some(anchor_pos) = working
            .iter()
            .position(|m| m.message_id == Some(activation.trigger.anchor_message_id))
        else {
            continue;
        };
        let mut insert_at = anchor_pos + 1;
        for completion in activation
            .completions
            .iter()
            .filter(|c| c.sent_message_ids.is_empty() && !c.text.is_empty())
        {
            let mut phantom = WorkingMessage::text(bot_name, &completion.text);
            phantom.is_bot_self = true;
            phantom.is_bot_author = true;
            phantom.activation_id = Some(activation.id);
            working.insert(insert_at, phantom);
            insert_at += 1;
        }
    }

    merge_within_activations(working);
}

/// Merge consecutive messages from the same activation, joining text blocks
/// directly — the recorded prefixes and suffixes already carry any
/// separator bytes, so a join separator would corrupt reconstruction.
fn merge_within_activations(working: &mut Vec<WorkingMessage>) {
    let mut out: Vec<WorkingMessage> = Vec::with_capacity(working.len());
    for msg in working.drain(..) {
        if let (Some(last), Some(id)) = (out.last_mut(), msg.activation_id) {
            if last.activation_id == Some(id) && last.participant == msg.participant {
                for block in msg.content {
                    match block {
                        ContentBlock::Text { text } => last.append_text(&text),
                        other => last.content.push(other),
                    }
                }
                continue;
            }
        }
        out.push(msg);
    }
    *working = out;
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_core::config::LlmConfig;
    use murmur_core::types::MessageId;
    use murmur_store::{Completion, InvisibleContext, Trigger, TriggerKind};
    use murmur_tools::ToolImage;
    use std::collections::BTreeMap;

    fn config() -> BotConfig {
        BotConfig {
            name: "Echo".into(),
            api_only: false,
            reply_on_random: None,
            reply_chain_depth_limit: 4,
            chain_limit_emote: String::new(),
            config_needed_emote: String::new(),
            stop_emote: String::new(),
            context: Default::default(),
            llm: LlmConfig {
                model: "m".into(),
                temperature: 1.0,
                top_p: None,
                max_tokens: 4096,
                mode: Default::default(),
                prefill_thinking: false,
                turn_end_token: None,
                message_delimiter: None,
                prompt_caching: true,
                stop_sequences: vec![],
            },
            tools: Default::default(),
            credit: Default::default(),
        }
    }

    fn user_msg(id: u64, text: &str) -> WorkingMessage {
        let mut msg = WorkingMessage::text("alice", text);
        msg.message_id = Some(MessageId(id));
        msg
    }

    fn bot_msg(id: u64, text: &str) -> WorkingMessage {
        let mut msg = WorkingMessage::text("Echo", text);
        msg.message_id = Some(MessageId(id));
        msg.is_bot_self = true;
        msg.is_bot_author = true;
        msg
    }

    fn entry(trigger: u64, name: &str, mcp: bool, images: usize) -> ToolCacheEntry {
        ToolCacheEntry {
            call_id: format!("toolu_{trigger}"),
            name: name.to_string(),
            input: serde_json::json!({}),
            output: "result".into(),
            images: (0..images)
                .map(|_| ToolImage {
                    data: "AAAA".into(),
                    mime_type: "image/png".into(),
                })
                .collect(),
            mcp,
            triggering_message_id: MessageId(trigger),
            bot_message_ids: vec![],
            original_assistant_text: "did it<function_calls>…</function_calls>".into(),
            created_at: String::new(),
        }
    }

    #[test]
    fn tool_history_lands_at_trigger_position() {
        let mut working = vec![user_msg(1, "run it"), user_msg(2, "later chatter")];
        interleave_tool_history(&mut working, &[entry(1, "echo", false, 0)], "Echo", &config());

        assert_eq!(working.len(), 4);
        assert_eq!(working[0].message_id, Some(MessageId(1)));
        assert_eq!(working[1].participant, "Echo");
        assert!(working[1].joined_text().contains("<function_calls>"));
        assert_eq!(working[2].participant, "System<[echo]>");
        assert_eq!(working[3].message_id, Some(MessageId(2)));
    }

    #[test]
    fn mcp_image_cap_drops_oldest() {
        let mut working = vec![user_msg(1, "a"), user_msg(2, "b")];
        let mut cfg = config();
        cfg.context.max_mcp_images = 1;
        interleave_tool_history(
            &mut working,
            &[entry(1, "shot", true, 1), entry(2, "shot", true, 1)],
            "Echo",
            &cfg,
        );

        let image_counts: Vec<usize> = working
            .iter()
            .filter(|m| m.participant.starts_with("System<["))
            .map(|m| m.content.iter().filter(|b| b.is_image()).count())
            .collect();
        assert_eq!(image_counts, vec![0, 1]);
    }

    #[test]
    fn activation_wraps_messages_and_inserts_phantoms() {
        let mut contexts = BTreeMap::new();
        contexts.insert(
            MessageId(2),
            InvisibleContext {
                prefix: "<thinking>plan</thinking>".into(),
                suffix: None,
            },
        );
        let activation = Activation {
            id: 7,
            trigger: Trigger {
                kind: TriggerKind::Mention,
                anchor_message_id: MessageId(1),
            },
            completions: vec![Completion {
                text: "<thinking>silent</thinking>".into(),
                sent_message_ids: vec![],
            }],
            message_contexts: contexts,
            completed: true,
            stop_reason: None,
        };

        let mut working = vec![user_msg(1, "hi"), bot_msg(2, "hello")];
        inject_activations(&mut working, &[activation], "Echo");

        // Phantom inserted after the anchor, then merged with the wrapped
        // bot message (same activation, same participant).
        assert_eq!(working.len(), 2);
        assert_eq!(
            working[1].joined_text(),
            "<thinking>silent</thinking><thinking>plan</thinking>hello"
        );
    }
}
