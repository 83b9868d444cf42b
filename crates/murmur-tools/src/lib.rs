//! Tool system: specifications, the tool-XML dialect, and execution.
//!
//! The model invokes tools inline by emitting `<function_calls>` XML inside
//! its text output; results are injected back as `<function_results>` blocks.
//! Everything here treats failures as values — a failed tool still produces a
//! [`ToolOutcome`] whose error text flows back to the model.

pub mod executor;
pub mod spec;
pub mod xml;

pub use executor::{McpDispatch, Tool, ToolExecutor};
pub use spec::{ToolCall, ToolImage, ToolOutcome, ToolOutput, ToolSpec};
pub use xml::{
    find_invisible_regions, format_tool_result_for_injection, format_tool_results,
    has_incomplete_tool_call, has_unclosed_thinking, parse_tool_calls, strip_tool_xml,
    ParsedToolCalls, FUNCTION_CALLS_CLOSE, FUNCTION_CALLS_OPEN, FUNCTION_RESULTS_CLOSE,
    FUNCTION_RESULTS_OPEN, THINKING_CLOSE, THINKING_OPEN,
};
