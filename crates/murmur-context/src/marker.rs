//! Step 11: cache-marker placement.
//!
//! The marker freezes the boundary between the cached prefix and the
//! ephemeral tail. Held across roll-free activations, new arrivals only
//! grow the tail and the prefix stays byte-identical; on a roll it advances
//! in lockstep with the new prefix.

use tracing::warn;

use murmur_core::config::CACHE_MARKER_BUFFER;
use murmur_core::types::MessageId;
use murmur_llm::CacheControl;

use crate::working::WorkingMessage;

/// Place the marker and attach `cache_control` to the carrying message.
/// Returns the marker id, or `None` when no usable carrier exists (the
/// request is then built without cache control).
pub fn place_marker(
    working: &mut [WorkingMessage],
    prior_marker: Option<MessageId>,
    did_roll: bool,
    prompt_caching: bool,
) -> Option<MessageId> {
    if !prompt_caching || working.is_empty() {
        return None;
    }

    if !did_roll {
        if let Some(prior) = prior_marker {
            if let Some(idx) = working.iter().position(|m| m.message_id == Some(prior)) {
                working[idx].cache_control = Some(CacheControl::Ephemeral);
                return Some(prior);
            }
            // Orphaned by merge or filtering: downgrade to a stable non-bot
            // carrier near where the marker would sit.
            let fresh = working.len().saturating_sub(CACHE_MARKER_BUFFER);
            if let Some(idx) = fallback_scan(working, fresh) {
                let id = working[idx].message_id;
                working[idx].cache_control = Some(CacheControl::Ephemeral);
                warn!(prior = %prior, fallback = ?id, "cache marker orphaned, reassigned to non-bot fallback");
                return id;
            }
            warn!(prior = %prior, "cache marker orphaned with no usable fallback, disabling cache control");
            return None;
        }
    }

    // Fresh placement: the message at len − buffer, falling back to the
    // nearest preceding non-bot carrier when that slot has no real message.
    let fresh = working.len().saturating_sub(CACHE_MARKER_BUFFER);
    let idx = if working[fresh].message_id.is_some() {
        Some(fresh)
    } else {
        fallback_scan(working, fresh)
    };
    match idx {
        Some(idx) => {
            let id = working[idx].message_id;
            working[idx].cache_control = Some(CacheControl::Ephemeral);
            id
        }
        None => {
            warn!("no usable cache-marker carrier, disabling cache control");
            None
        }
    }
}

/// Nearest non-bot message with a real id at or before `from`, within the
/// marker buffer's look-back.
fn fallback_scan(working: &[WorkingMessage], from: usize) -> Option<usize> {
    let from = from.min(working.len().saturating_sub(1));
    let floor = from.saturating_sub(CACHE_MARKER_BUFFER - 1);
    (floor..=from)
        .rev()
        .find(|&i| working[i].message_id.is_some() && !working[i].is_bot_author)
}
