//! The tool-XML dialect the model speaks.
//!
//! Calls arrive inline in assistant text as `<function_calls>` blocks; the
//! loop answers with `<function_results>` blocks. An older deployment used
//! `System: <results>` blocks, which are still recognized as invisible
//! regions so historical assistant text segments correctly.

use std::ops::Range;

use uuid::Uuid;

use crate::spec::ToolCall;

pub const FUNCTION_CALLS_OPEN: &str = "<function_calls>";
pub const FUNCTION_CALLS_CLOSE: &str = "</function_calls>";
pub const FUNCTION_RESULTS_OPEN: &str = "<function_results>";
pub const FUNCTION_RESULTS_CLOSE: &str = "</function_results>";
pub const THINKING_OPEN: &str = "<thinking>";
pub const THINKING_CLOSE: &str = "</thinking>";
pub const LEGACY_RESULTS_OPEN: &str = "System: <results>";
pub const LEGACY_RESULTS_CLOSE: &str = "</results>";

/// (opener, closer) pairs for every region invisible to chat readers.
const INVISIBLE_MARKERS: [(&str, &str); 4] = [
    (THINKING_OPEN, THINKING_CLOSE),
    (FUNCTION_CALLS_OPEN, FUNCTION_CALLS_CLOSE),
    (FUNCTION_RESULTS_OPEN, FUNCTION_RESULTS_CLOSE),
    (LEGACY_RESULTS_OPEN, LEGACY_RESULTS_CLOSE),
];

/// Byte ranges of every invisible region, in order. An unterminated region
/// extends to the end of the text.
pub fn find_invisible_regions(text: &str) -> Vec<Range<usize>> {
    let mut regions = Vec::new();
    let mut pos = 0;

    while pos < text.len() {
        // Earliest opener from the current position.
        let next = INVISIBLE_MARKERS
            .iter()
            .filter_map(|(open, close)| {
                text[pos..].find(open).map(|i| (pos + i, *open, *close))
            })
            .min_by_key(|(start, _, _)| *start);

        let Some((start, open, close)) = next else {
            break;
        };

        let body_start = start + open.len();
        let end = match text[body_start..].find(close) {
            Some(i) => body_start + i + close.len(),
            None => text.len(),
        };
        regions.push(start..end);
        pos = end;
    }

    regions
}

/// The first complete `<function_calls>` block in `text`, parsed.
#[derive(Debug, Clone)]
pub struct ParsedToolCalls {
    /// The whole block, open tag through close tag.
    pub full_match: String,
    /// Everything before the block.
    pub before_text: String,
    pub calls: Vec<ToolCall>,
}

/// Parse the first complete `<function_calls>` block out of `text`.
///
/// Returns `None` when there is no complete block or the block contains no
/// well-formed `<invoke>`. Each call gets a fresh `toolu_` id.
pub fn parse_tool_calls(text: &str) -> Option<ParsedToolCalls> {
    let start = text.find(FUNCTION_CALLS_OPEN)?;
    let body_start = start + FUNCTION_CALLS_OPEN.len();
    let close_rel = text[body_start..].find(FUNCTION_CALLS_CLOSE)?;
    let end = body_start + close_rel + FUNCTION_CALLS_CLOSE.len();

    let body = &text[body_start..body_start + close_rel];
    let calls = parse_invokes(body);
    if calls.is_empty() {
        return None;
    }

    Some(ParsedToolCalls {
        full_match: text[start..end].to_string(),
        before_text: text[..start].to_string(),
        calls,
    })
}

fn parse_invokes(body: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut pos = 0;

    while let Some(open_rel) = body[pos..].find("<invoke name=\"") {
        let name_start = pos + open_rel + "<invoke name=\"".len();
        let Some(name_len) = body[name_start..].find('"') else {
            break;
        };
        let name = &body[name_start..name_start + name_len];

        let Some(tag_end_rel) = body[name_start + name_len..].find('>') else {
            break;
        };
        let params_start = name_start + name_len + tag_end_rel + 1;
        let Some(close_rel) = body[params_start..].find("</invoke>") else {
            break;
        };
        let params_body = &body[params_start..params_start + close_rel];

        let mut input = serde_json::Map::new();
        for (key, value) in parse_parameters(params_body) {
            input.insert(key, serde_json::Value::String(value));
        }

        calls.push(ToolCall {
            id: format!("toolu_{}", Uuid::new_v4().simple()),
            name: name.to_string(),
            input: serde_json::Value::Object(input),
        });

        pos = params_start + close_rel + "</invoke>".len();
    }

    calls
}

fn parse_parameters(body: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut pos = 0;

    while let Some(open_rel) = body[pos..].find("<parameter name=\"") {
        let name_start = pos + open_rel + "<parameter name=\"".len();
        let Some(name_len) = body[name_start..].find('"') else {
            break;
        };
        let name = &body[name_start..name_start + name_len];

        let Some(tag_end_rel) = body[name_start + name_len..].find('>') else {
            break;
        };
        let value_start = name_start + name_len + tag_end_rel + 1;
        let Some(close_rel) = body[value_start..].find("</parameter>") else {
            break;
        };
        let value = &body[value_start..value_start + close_rel];

        params.push((name.to_string(), unescape(value)));
        pos = value_start + close_rel + "</parameter>".len();
    }

    params
}

/// Whether `text` contains a `<function_calls>` block that has not closed yet.
pub fn has_incomplete_tool_call(text: &str) -> bool {
    match (
        text.rfind(FUNCTION_CALLS_OPEN),
        text.rfind(FUNCTION_CALLS_CLOSE),
    ) {
        (Some(open), Some(close)) => open > close,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Whether `text` contains a `<thinking>` block that has not closed yet.
pub fn has_unclosed_thinking(text: &str) -> bool {
    match (text.rfind(THINKING_OPEN), text.rfind(THINKING_CLOSE)) {
        (Some(open), Some(close)) => open > close,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Render executed-tool results as a `<function_results>` block.
///
/// One `<result>` element per tool, in execution order. These exact bytes are
/// what the region scanner recognizes, so persisted assistant text
/// round-trips through segment parsing.
pub fn format_tool_results(results: &[(String, String)]) -> String {
    let mut out = String::from("\n\n");
    out.push_str(FUNCTION_RESULTS_OPEN);
    for (name, text) in results {
        out.push_str("\n<result>\n<tool_name>");
        out.push_str(name);
        out.push_str("</tool_name>\n<stdout>");
        out.push_str(text);
        out.push_str("</stdout>\n</result>");
    }
    out.push('\n');
    out.push_str(FUNCTION_RESULTS_CLOSE);
    out
}

/// Join accumulated assistant text with a rendered result block.
pub fn format_tool_result_for_injection(existing: &str, result_block: &str) -> String {
    let mut out = existing.trim_end().to_string();
    out.push_str(result_block);
    out
}

/// Remove tool-call and tool-result blocks, leaving thinking intact.
pub fn strip_tool_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    for region in find_invisible_regions(text) {
        // Thinking is not tool XML; keep it.
        if text[region.clone()].starts_with(THINKING_OPEN) {
            continue;
        }
        out.push_str(&text[pos..region.start]);
        pos = region.end;
    }
    out.push_str(&text[pos..]);
    out.trim().to_string()
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const CALL: &str = "<function_calls>\n<invoke name=\"echo\">\n<parameter name=\"x\">1</parameter>\n</invoke>\n</function_calls>";

    #[test]
    fn parses_single_call_with_parameter() {
        let text = format!("hello{CALL}");
        let parsed = parse_tool_calls(&text).unwrap();
        assert_eq!(parsed.before_text, "hello");
        assert_eq!(parsed.full_match, CALL);
        assert_eq!(parsed.calls.len(), 1);
        assert_eq!(parsed.calls[0].name, "echo");
        assert_eq!(parsed.calls[0].input["x"], "1");
        assert!(parsed.calls[0].id.starts_with("toolu_"));
    }

    #[test]
    fn parses_multiple_invokes() {
        let text = "<function_calls><invoke name=\"a\"></invoke><invoke name=\"b\"><parameter name=\"q\">hi</parameter></invoke></function_calls>";
        let parsed = parse_tool_calls(text).unwrap();
        assert_eq!(parsed.calls.len(), 2);
        assert_eq!(parsed.calls[1].input["q"], "hi");
    }

    #[test]
    fn unterminated_block_is_not_parsed() {
        assert!(parse_tool_calls("<function_calls><invoke name=\"a\">").is_none());
        assert!(has_incomplete_tool_call("<function_calls><invoke name=\"a\">"));
    }

    #[test]
    fn closed_block_is_complete() {
        assert!(!has_incomplete_tool_call(CALL));
        let two = format!("{CALL}\nmore<function_calls>");
        assert!(has_incomplete_tool_call(&two));
    }

    #[test]
    fn parameter_entities_unescape() {
        let text = "<function_calls><invoke name=\"t\"><parameter name=\"v\">a &lt;b&gt; &amp;c</parameter></invoke></function_calls>";
        let parsed = parse_tool_calls(text).unwrap();
        assert_eq!(parsed.calls[0].input["v"], "a <b> &c");
    }

    #[test]
    fn regions_cover_all_invisible_kinds() {
        let text = "<thinking>t</thinking>visible<function_calls>c</function_calls>System: <results>r</results>tail<function_results>f</function_results>";
        let regions = find_invisible_regions(text);
        assert_eq!(regions.len(), 4);
        assert_eq!(&text[regions[0].clone()], "<thinking>t</thinking>");
        assert_eq!(
            &text[regions[2].clone()],
            "System: <results>r</results>"
        );
    }

    #[test]
    fn unterminated_region_extends_to_end() {
        let text = "ok<thinking>never closed";
        let regions = find_invisible_regions(text);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].clone(), 2..text.len());
    }

    #[test]
    fn result_block_round_trips_through_region_scanner() {
        let block = format_tool_results(&[("echo".into(), "out".into())]);
        let text = format_tool_result_for_injection(CALL, &block);
        let regions = find_invisible_regions(&text);
        // The whole string is two invisible regions and a "\n\n" gap.
        assert_eq!(regions.len(), 2);
        assert!(text[regions[1].clone()].contains("<stdout>out</stdout>"));
    }

    #[test]
    fn strip_removes_tool_blocks_keeps_thinking() {
        let text = format!("<thinking>plan</thinking>say {CALL} done");
        let stripped = strip_tool_xml(&text);
        assert_eq!(stripped, "<thinking>plan</thinking>say  done");
    }

    #[test]
    fn unclosed_thinking_detection() {
        assert!(has_unclosed_thinking("<thinking>hm"));
        assert!(!has_unclosed_thinking("<thinking>hm</thinking>"));
        assert!(has_unclosed_thinking(
            "<thinking>a</thinking><thinking>b"
        ));
    }
}
