//! Post-hoc participant truncation.
//!
//! Stop sequences catch most participant hallucinations during generation;
//! this pass catches the participants that did not fit the stop list, plus
//! the response-start case where the model never spoke as itself at all.

use murmur_tools::find_invisible_regions;

/// Outcome of scanning a chunk of assistant output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Truncation {
    /// Nothing found; use the text as-is.
    Clean,
    /// The text opened as another participant — discard everything.
    StartHallucination { participant: String },
    /// A participant line appeared mid-text; keep bytes before `at`.
    Mid { at: usize, participant: String },
}

/// A leading `<name>:` for any other participant kills the whole text;
/// otherwise the earliest `\n<name>:` or configured extra stop truncates.
/// Matches inside invisible regions are ignored: a tool result quoting a
/// user must not truncate the turn.
pub fn scan(text: &str, participants: &[String], extra_stops: &[String]) -> Truncation {
    if let Some(name) = starts_as_other(text, participants) {
        return Truncation::StartHallucination { participant: name };
    }

    let regions = find_invisible_regions(text);
    let outside = |idx: usize| !regions.iter().any(|r| r.contains(&idx));

    let mut best: Option<(usize, String)> = None;
    let mut consider = |needle: &str, label: &str| {
        let mut from = 0;
        while let Some(rel) = text[from..].find(needle) {
            let at = from + rel;
            if outside(at) {
                if best.as_ref().is_none_or(|(b, _)| at < *b) {
                    best = Some((at, label.to_string()));
                }
                break;
            }
            from = at + 1;
        }
    };

    for name in participants {
        consider(&format!("\n{name}:"), name);
    }
    for stop in extra_stops {
        consider(stop, stop);
    }

    match best {
        Some((at, participant)) => Truncation::Mid { at, participant },
        None => Truncation::Clean,
    }
}

/// Apply [`scan`], returning the surviving text and the hallucinated
/// participant name when the whole text was discarded.
pub fn apply(text: &str, participants: &[String], extra_stops: &[String]) -> (String, Option<String>) {
    match scan(text, participants, extra_stops) {
        Truncation::Clean => (text.to_string(), None),
        Truncation::StartHallucination { participant } => (String::new(), Some(participant)),
        Truncation::Mid { at, .. } => (text[..at].to_string(), None),
    }
}

/// The participant name this text opens as, if any.
pub fn starts_as_other(text: &str, participants: &[String]) -> Option<String> {
    let head = text.trim_start();
    participants
        .iter()
        .find(|name| head.starts_with(&format!("{name}:")))
        .cloned()
}
