//! Step 10: size limits and the rolling discipline.
//!
//! Truncation is deliberately lazy: dropping the oldest messages moves the
//! cached-prefix boundary and costs a full cache re-write, so a roll is only
//! taken when the character ceiling forces it or enough messages have
//! accumulated since the last one.

use tracing::debug;

use murmur_core::config::ContextConfig;
use murmur_store::ChannelState;

use crate::working::WorkingMessage;

pub struct LimitOutcome {
    pub did_roll: bool,
}

/// Apply the character and message-count ceilings, truncating oldest-first.
pub fn apply_limits(
    working: &mut Vec<WorkingMessage>,
    state: &ChannelState,
    config: &ContextConfig,
) -> LimitOutcome {
    let total_chars: usize = working.iter().map(WorkingMessage::char_count).sum();
    let over_chars = total_chars > config.recency_window_characters;
    let over_hard = total_chars > config.hard_max_characters;
    let over_count = working.len() > config.recency_window_messages;
    let gate_open = state.messages_since_roll >= config.rolling_threshold;

    // The character ceiling truncates unconditionally (the hard ceiling is
    // the same cut, just never deferrable); the count ceiling waits for the
    // rolling gate.
    let truncate = over_chars || (over_count && gate_open);
    if !truncate {
        return LimitOutcome { did_roll: false };
    }

    // Keep the newest suffix that fits both ceilings, never dropping the
    // final message.
    let mut kept_chars = 0usize;
    let mut keep_from = working.len();
    for (idx, msg) in working.iter().enumerate().rev() {
        let chars = msg.char_count();
        let would_exceed = kept_chars + chars > config.recency_window_characters
            || working.len() - idx > config.recency_window_messages;
        if would_exceed && keep_from < working.len() {
            break;
        }
        kept_chars += chars;
        keep_from = idx;
    }

    let removed = keep_from;
    if removed > 0 {
        working.drain(..removed);
    }

    debug!(
        removed,
        kept = working.len(),
        kept_chars,
        over_hard,
        "context truncated"
    );
    LimitOutcome {
        did_roll: removed > 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(chars: usize) -> WorkingMessage {
        WorkingMessage::text("alice", "x".repeat(chars))
    }

    fn config(chars: usize, msgs: usize, threshold: u32) -> ContextConfig {
        ContextConfig {
            recency_window_characters: chars,
            hard_max_characters: chars * 2,
            recency_window_messages: msgs,
            rolling_threshold: threshold,
            ..Default::default()
        }
    }

    fn state(since_roll: u32) -> ChannelState {
        ChannelState {
            messages_since_roll: since_roll,
            ..Default::default()
        }
    }

    #[test]
    fn under_limits_is_untouched() {
        let mut working = vec![msg(10), msg(10)];
        let outcome = apply_limits(&mut working, &state(100), &config(80, 10, 3));
        assert!(!outcome.did_roll);
        assert_eq!(working.len(), 2);
    }

    #[test]
    fn char_ceiling_rolls_regardless_of_gate() {
        // Four 30-char messages + a 20-char mention: 140 chars > 80.
        let mut working = vec![msg(30), msg(30), msg(30), msg(30), msg(20)];
        let outcome = apply_limits(&mut working, &state(0), &config(80, 100, 3));
        assert!(outcome.did_roll);
        let total: usize = working.iter().map(WorkingMessage::char_count).sum();
        assert!(total <= 80);
        // Newest suffix kept: the last two 30s and the 20.
        assert_eq!(working.len(), 3);
    }

    #[test]
    fn count_ceiling_waits_for_the_gate() {
        let mut working = vec![msg(1), msg(1), msg(1), msg(1)];
        let closed = apply_limits(&mut working, &state(0), &config(1000, 3, 5));
        assert!(!closed.did_roll);
        assert_eq!(working.len(), 4);

        let open = apply_limits(&mut working, &state(5), &config(1000, 3, 5));
        assert!(open.did_roll);
        assert_eq!(working.len(), 3);
    }

    #[test]
    fn oversized_single_message_survives() {
        let mut working = vec![msg(10), msg(500)];
        let outcome = apply_limits(&mut working, &state(0), &config(80, 10, 3));
        assert!(outcome.did_roll);
        assert_eq!(working.len(), 1);
        assert_eq!(working[0].char_count(), 500);
    }
}
