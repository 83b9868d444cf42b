//! Step 12: stop-sequence construction.
//!
//! The stop list is a pure function of the final participant sequence and
//! config (P7). Participants that do not fit are caught post-hoc by the
//! inline loop's mid-response truncation.

use murmur_core::config::LlmConfig;

use crate::format::mention_names;
use crate::working::WorkingMessage;

/// Floor on how many participant stops are collected.
const MIN_PARTICIPANT_STOPS: usize = 10;

/// Conversation-boundary marker, lowest priority.
const CONVERSATION_BOUNDARY: &str = "\n\nHuman:";

pub fn build_stop_sequences(
    working: &[WorkingMessage],
    bot_name: &str,
    config: &LlmConfig,
) -> Vec<String> {
    let mut stops: Vec<String> = Vec::new();
    let mut push = |s: String| {
        if !s.is_empty() && !stops.contains(&s) {
            stops.push(s);
        }
    };

    if let Some(token) = &config.turn_end_token {
        push(token.clone());
    }
    if let Some(delimiter) = &config.message_delimiter {
        push(delimiter.clone());
    }

    // Recent participants, newest first, plus anyone mentioned in their
    // text. The bot's own name never stops its own continuation.
    let distinct: usize = {
        let mut names: Vec<&str> = working.iter().map(|m| m.participant.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names.len()
    };
    let cap = distinct.max(MIN_PARTICIPANT_STOPS);

    let mut participant_stops: Vec<String> = Vec::new();
    for msg in working.iter().rev() {
        if participant_stops.len() >= cap {
            break;
        }
        let mut candidates = vec![msg.participant.clone()];
        candidates.extend(mention_names(&msg.joined_text()));
        for name in candidates {
            if name == bot_name {
                continue;
            }
            let stop = format!("\n{name}:");
            if !participant_stops.contains(&stop) {
                participant_stops.push(stop);
                if participant_stops.len() >= cap {
                    break;
                }
            }
        }
    }
    for stop in participant_stops {
        push(stop);
    }

    for stop in &config.stop_sequences {
        push(stop.clone());
    }

    push("\nSystem:".to_string());
    push(CONVERSATION_BOUNDARY.to_string());

    stops
}
