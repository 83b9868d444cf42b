//! Trace-writer contract.
//!
//! Every activation runs under a trace span. The concrete writer (JSONL
//! files under the traces directory, in the reference deployment) lives
//! outside this workspace; a no-op implementation backs tests.

use murmur_core::types::{BotId, ChannelId, MessageId};

/// Sink for one activation's structured records.
pub trait TraceSpan: Send + Sync {
    fn record_raw_messages(&self, count: usize, oldest: Option<MessageId>);
    fn record_context(&self, message_count: usize, did_roll: bool, cache_marker: Option<MessageId>);
    fn record_llm_call(&self, model: &str, latency_ms: u64, input_tokens: u32, output_tokens: u32);
    fn record_tool_execution(&self, tool: &str, error: Option<&str>);
    fn record_outcome(&self, stop_reason: &str, sent_messages: usize);
    fn record_error(&self, error: &str);
}

pub trait TraceWriter: Send + Sync {
    fn start(
        &self,
        bot: &BotId,
        channel_id: ChannelId,
        triggering_message_id: MessageId,
    ) -> Box<dyn TraceSpan>;
}

/// Discards everything.
pub struct NoopTrace;

impl TraceSpan for NoopTrace {
    fn record_raw_messages(&self, _count: usize, _oldest: Option<MessageId>) {}
    fn record_context(&self, _message_count: usize, _did_roll: bool, _marker: Option<MessageId>) {}
    fn record_llm_call(&self, _model: &str, _latency_ms: u64, _in: u32, _out: u32) {}
    fn record_tool_execution(&self, _tool: &str, _error: Option<&str>) {}
    fn record_outcome(&self, _stop_reason: &str, _sent: usize) {}
    fn record_error(&self, _error: &str) {}
}

impl TraceWriter for NoopTrace {
    fn start(&self, _bot: &BotId, _channel: ChannelId, _trigger: MessageId) -> Box<dyn TraceSpan> {
        Box::new(NoopTrace)
    }
}
