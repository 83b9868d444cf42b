//! Steps 3 and 5: the image-selection anchor and two-tier image budgeting.
//!
//! The anchor must be pinned before any pipeline step shifts indices:
//! images chosen inside the cached prefix would otherwise move between
//! activations and invalidate the prompt cache.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use tracing::warn;

use murmur_core::config::{
    BotConfig, CACHE_MARKER_BUFFER, MAX_IMAGE_BASE64_BYTES, MAX_REQUEST_IMAGE_BASE64_BYTES,
};
use murmur_core::types::MessageId;
use murmur_llm::{ContentBlock, ImageSource};
use murmur_transport::message::{ChatMessage, FetchedImage};

use crate::working::WorkingMessage;

/// Step 3: index of the boundary between cached-prefix and ephemeral-tail
/// image tiers. The prior marker's position when it is still present;
/// otherwise where a fresh marker *will* land (`len − buffer`, clamped).
pub fn select_anchor(messages: &[ChatMessage], prior_marker: Option<MessageId>) -> usize {
    if let Some(marker) = prior_marker {
        if let Some(idx) = messages.iter().position(|m| m.id == marker) {
            return idx;
        }
    }
    messages.len().saturating_sub(CACHE_MARKER_BUFFER)
}

/// Step 5: attach image blocks under the per-image and per-request byte
/// ceilings. Tier (a) — cached-prefix images at or before the anchor, only
/// when `cache_images` is set, newest first, up to `max_images`. Tier (b) —
/// ephemeral images after the anchor, newest first, up to
/// `max_ephemeral_images`. Selection is deterministic, resampling included.
pub fn attach_images(
    working: &mut [WorkingMessage],
    images: &[FetchedImage],
    anchor: usize,
    config: &BotConfig,
) {
    if images.is_empty() {
        return;
    }

    // (working index, image) pairs in chronological order.
    let located: Vec<(usize, &FetchedImage)> = images
        .iter()
        .filter_map(|img| {
            working
                .iter()
                .position(|m| m.message_id == Some(img.message_id))
                .map(|idx| (idx, img))
        })
        .collect();

    let mut budget = MAX_REQUEST_IMAGE_BASE64_BYTES;
    let mut selected: Vec<(usize, ImageSource)> = Vec::new();

    // Cached tier first: its selection must not depend on the tail.
    if config.context.cache_images {
        let cached: Vec<_> = located.iter().filter(|(idx, _)| *idx <= anchor).collect();
        pick_tier(cached.into_iter().rev(), config.context.max_images, &mut budget, &mut selected);
    }

    let ephemeral: Vec<_> = located.iter().filter(|(idx, _)| *idx > anchor).collect();
    pick_tier(
        ephemeral.into_iter().rev(),
        config.context.max_ephemeral_images,
        &mut budget,
        &mut selected,
    );

    // Attach in chronological order so content block order is stable.
    selected.sort_by_key(|(idx, _)| *idx);
    for (idx, source) in selected {
        working[idx].content.push(ContentBlock::Image { source });
    }
}

/// Walk candidates newest-first, fitting each under the per-image ceiling
/// and the shared request budget.
fn pick_tier<'a>(
    candidates: impl Iterator<Item = &'a (usize, &'a FetchedImage)>,
    cap: usize,
    budget: &mut usize,
    selected: &mut Vec<(usize, ImageSource)>,
) {
    let mut taken = 0;
    for (idx, img) in candidates {
        if taken >= cap {
            break;
        }
        let Some(source) = fit_image(img) else {
            continue;
        };
        if source.data.len() > *budget {
            continue;
        }
        *budget -= source.data.len();
        selected.push((*idx, source));
        taken += 1;
    }
}

/// Apply the per-image ceiling, resampling deterministically when needed.
fn fit_image(img: &FetchedImage) -> Option<ImageSource> {
    if img.data.len() <= MAX_IMAGE_BASE64_BYTES {
        return Some(ImageSource {
            media_type: img.mime_type.clone(),
            data: img.data.clone(),
        });
    }

    let raw = match B64.decode(&img.data) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(message = %img.message_id, error = %e, "image payload is not valid base64, skipping");
            return None;
        }
    };
    match murmur_image::fit_under_ceiling(&raw, &img.mime_type) {
        Ok((bytes, mime_type)) => Some(ImageSource {
            media_type: mime_type,
            data: B64.encode(bytes),
        }),
        Err(e) => {
            warn!(message = %img.message_id, error = %e, "image resample failed, skipping");
            None
        }
    }
}
