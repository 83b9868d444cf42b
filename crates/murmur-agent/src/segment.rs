//! Segment parsing: the bridge between one accumulated assistant string and
//! the chat messages a reader sees.
//!
//! Invisible regions (thinking, tool calls, tool results) become prefixes
//! and suffixes around the visible text between them. The partition is
//! exact: concatenating every segment's `prefix + visible + suffix`
//! reproduces the input byte-for-byte, which is what makes activation
//! reconstruction possible later.

use murmur_tools::find_invisible_regions;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Invisible content accumulated since the previous segment.
    pub prefix: String,
    /// Trimmed visible text; what actually gets sent.
    pub visible: String,
    /// Trailing invisible content, last segment only.
    pub suffix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segmented {
    Segments(Vec<Segment>),
    /// No visible text at all; the entire input is carried as invisible.
    Phantom(String),
}

/// Split an accumulated assistant chunk into sendable segments.
pub fn split_segments(text: &str) -> Segmented {
    let mut segments: Vec<Segment> = Vec::new();
    let mut pending = String::new();
    let mut pos = 0;

    let mut eat_gap = |gap: &str, pending: &mut String, segments: &mut Vec<Segment>| {
        if gap.is_empty() {
            return;
        }
        let trimmed = gap.trim();
        if trimmed.is_empty() {
            // Whitespace between invisible regions stays invisible.
            pending.push_str(gap);
            return;
        }
        let lead_len = gap.len() - gap.trim_start().len();
        pending.push_str(&gap[..lead_len]);
        segments.push(Segment {
            prefix: std::mem::take(pending),
            visible: trimmed.to_string(),
            suffix: None,
        });
        // Trailing whitespace opens the next invisible accumulation.
        pending.push_str(&gap[lead_len + trimmed.len()..]);
    };

    for region in find_invisible_regions(text) {
        eat_gap(&text[pos..region.start], &mut pending, &mut segments);
        pending.push_str(&text[region.clone()]);
        pos = region.end;
    }
    eat_gap(&text[pos..], &mut pending, &mut segments);

    match segments.last_mut() {
        Some(last) => {
            if !pending.is_empty() {
                last.suffix = Some(pending);
            }
            Segmented::Segments(segments)
        }
        None => Segmented::Phantom(pending),
    }
}
