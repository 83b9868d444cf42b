//! Steps 1, 2, 4, and 9: message merging, filtering, and participant
//! formatting.

use murmur_core::config::BotConfig;
use murmur_llm::ContentBlock;
use murmur_transport::message::ChatMessage;

use crate::working::WorkingMessage;

/// Reaction that hides a message from the model.
const HIDE_EMOTE: &str = "\u{1fae5}"; // 🫥

/// Participant names the model might speak as: every non-self author in the
/// fetch, plus anyone mentioned in content. First-appearance order.
pub fn collect_participants(messages: &[ChatMessage], bot_username: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !name.is_empty() && name != bot_username && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    };

    for msg in messages {
        push(&msg.author.username);
        for mention in mention_names(&msg.content) {
            push(&mention);
        }
    }
    names
}

/// Names inside `<@name>` mentions.
pub fn mention_names(content: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find("<@") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('>') else { break };
        let name = &after[..end];
        if !name.is_empty() && !name.contains('<') {
            names.push(name.to_string());
        }
        rest = &after[end + 1..];
    }
    names
}

/// Step 1: merge runs of consecutive messages from this bot, joining content
/// with a newline. Skipped entirely under `preserve_thinking_context`, where
/// message ids must stay distinct for the activation map. Dot-messages
/// (tool-output webhooks) never merge — they are dropped in step 2.
pub fn merge_consecutive_bot_messages(
    messages: Vec<ChatMessage>,
    bot_username: &str,
    preserve_thinking_context: bool,
) -> Vec<ChatMessage> {
    if preserve_thinking_context {
        return messages;
    }

    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        let mergeable = msg.author.bot && msg.author.username == bot_username && !msg.is_dot_message();
        if mergeable {
            if let Some(last) = out.last_mut() {
                if last.author.bot
                    && last.author.username == bot_username
                    && !last.is_dot_message()
                {
                    last.content.push('\n');
                    last.content.push_str(&msg.content);
                    continue;
                }
            }
        }
        out.push(msg);
    }
    out
}

/// Step 2: drop dot-messages and messages hidden by reaction.
pub fn filter_hidden(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    messages
        .into_iter()
        .filter(|m| !m.is_dot_message() && !m.has_reaction(HIDE_EMOTE))
        .collect()
}

/// Step 4: one working message per chat message. The bot's own messages take
/// its configured participant name, and every reference to its transport
/// username is rewritten so the model only ever sees the configured name.
pub fn format_messages(
    messages: &[ChatMessage],
    bot_name: &str,
    bot_username: &str,
    config: &BotConfig,
) -> Vec<WorkingMessage> {
    messages
        .iter()
        .map(|msg| {
            let is_self = msg.author.bot && msg.author.username == bot_username;
            let participant = if is_self {
                bot_name.to_string()
            } else {
                msg.author.username.clone()
            };

            let mut text = rewrite_bot_references(&msg.content, bot_username, bot_name);

            for attachment in &msg.attachments {
                let Some(attached_text) = &attachment.text else {
                    continue;
                };
                if attached_text.chars().count() > config.context.max_attachment_chars {
                    continue;
                }
                text.push_str(&format!(
                    "\n<attachment filename=\"{}\">\n{}\n</attachment>",
                    attachment.filename, attached_text
                ));
            }

            WorkingMessage {
                participant,
                content: vec![ContentBlock::text(text)],
                message_id: Some(msg.id),
                timestamp: Some(msg.timestamp),
                is_bot_self: is_self,
                is_bot_author: msg.author.bot,
                activation_id: None,
                cache_control: None,
            }
        })
        .collect()
}

/// Rewrite `<@username>` mentions and `<reply:@username> ` prefixes that
/// refer to the bot's transport username into its configured name. Must run
/// before stop-sequence construction so the bot never stops on itself.
pub fn rewrite_bot_references(content: &str, bot_username: &str, bot_name: &str) -> String {
    if bot_username == bot_name {
        return content.to_string();
    }
    content
        .replace(
            &format!("<reply:@{bot_username}> "),
            &format!("<reply:@{bot_name}> "),
        )
        .replace(&format!("<@{bot_username}>"), &format!("<@{bot_name}>"))
}

/// Step 9: merge consecutive messages from the same participant, joining
/// text with a newline and keeping the first message's identity.
pub fn merge_same_participant(messages: Vec<WorkingMessage>) -> Vec<WorkingMessage> {
    let mut out: Vec<WorkingMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        if let Some(last) = out.last_mut() {
            if last.participant == msg.participant {
                for block in msg.content {
                    match block {
                        ContentBlock::Text { text } => {
                            last.append_text("\n");
                            last.append_text(&text);
                        }
                        other => last.content.push(other),
                    }
                }
                continue;
            }
        }
        out.push(msg);
    }
    out
}
