//! End-to-end activation scenarios against a mock transport and a scripted
//! provider: trigger evaluation, the inline tool loop, progressive sending,
//! state rolls, and credit refunds.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use murmur_agent::credit::{CreditClient, CreditDecision, CreditRequest};
use murmur_agent::scheduler::{bot_reply_chain_depth, ActivationDeps, Scheduler};
use murmur_agent::trace::NoopTrace;
use murmur_core::config::{BotConfig, LlmConfig};
use murmur_core::types::{BotId, ChannelId, GuildId, MessageId, UserId};
use murmur_llm::{
    ContentBlock, LlmCompletion, LlmProvider, LlmRequest, ProviderError, StopReason, Usage,
};
use murmur_store::{ChannelStateStore, TriggerKind};
use murmur_tools::{Tool, ToolExecutor, ToolOutcome};
use murmur_transport::message::{Author, ChatMessage, FetchRequest, FetchedContext};
use murmur_transport::{Transport, TransportError, TransportEvent};

const CHANNEL: ChannelId = ChannelId(77);
const BOT_USER: UserId = UserId(9000);

// ---------------------------------------------------------------------------
// Mocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct SentMessage {
    id: MessageId,
    content: String,
    reply_to: Option<MessageId>,
}

#[derive(Default)]
struct TransportInner {
    history: Vec<ChatMessage>,
    next_id: u64,
    sent: Vec<SentMessage>,
    reactions: Vec<(MessageId, String)>,
    deleted: Vec<MessageId>,
    webhooks: Vec<String>,
}

struct MockTransport {
    inner: Mutex<TransportInner>,
}

impl MockTransport {
    fn new(history: Vec<ChatMessage>) -> Arc<Self> {
        let next_id = history.iter().map(|m| m.id.get()).max().unwrap_or(0) + 100;
        Arc::new(Self {
            inner: Mutex::new(TransportInner {
                history,
                next_id,
                ..Default::default()
            }),
        })
    }

    fn sent(&self) -> Vec<SentMessage> {
        self.inner.lock().unwrap().sent.clone()
    }

    fn reactions(&self) -> Vec<(MessageId, String)> {
        self.inner.lock().unwrap().reactions.clone()
    }

    fn deleted(&self) -> Vec<MessageId> {
        self.inner.lock().unwrap().deleted.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch_context(&self, _req: FetchRequest) -> Result<FetchedContext, TransportError> {
        let inner = self.inner.lock().unwrap();
        Ok(FetchedContext {
            messages: inner.history.clone(),
            ..Default::default()
        })
    }

    async fn fetch_pinned_configs(&self, _c: ChannelId) -> Result<Vec<String>, TransportError> {
        Ok(Vec::new())
    }

    async fn send_message(
        &self,
        _channel_id: ChannelId,
        content: &str,
        reply_to: Option<MessageId>,
    ) -> Result<Vec<MessageId>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        let mut ids = Vec::new();
        for (i, chunk) in chunk_1800(content).into_iter().enumerate() {
            inner.next_id += 1;
            let id = MessageId(inner.next_id);
            inner.sent.push(SentMessage {
                id,
                content: chunk,
                reply_to: if i == 0 { reply_to } else { None },
            });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn send_webhook(
        &self,
        _channel_id: ChannelId,
        _username: &str,
        content: &str,
    ) -> Result<Vec<MessageId>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.webhooks.push(content.to_string());
        inner.next_id += 1;
        Ok(vec![MessageId(inner.next_id)])
    }

    async fn send_image_attachment(
        &self,
        _channel_id: ChannelId,
        _filename: &str,
        _data: &[u8],
    ) -> Result<MessageId, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        Ok(MessageId(inner.next_id))
    }

    async fn send_file_attachment(
        &self,
        _channel_id: ChannelId,
        _filename: &str,
        _content: &str,
    ) -> Result<MessageId, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        Ok(MessageId(inner.next_id))
    }

    async fn send_message_with_attachment(
        &self,
        channel_id: ChannelId,
        content: &str,
        _filename: &str,
        _attachment: &str,
    ) -> Result<Vec<MessageId>, TransportError> {
        self.send_message(channel_id, content, None).await
    }

    async fn pin_message(&self, _c: ChannelId, _m: MessageId) -> Result<(), TransportError> {
        Ok(())
    }

    async fn delete_message(&self, _c: ChannelId, m: MessageId) -> Result<(), TransportError> {
        self.inner.lock().unwrap().deleted.push(m);
        Ok(())
    }

    async fn add_reaction(
        &self,
        _c: ChannelId,
        m: MessageId,
        emote: &str,
    ) -> Result<(), TransportError> {
        self.inner
            .lock()
            .unwrap()
            .reactions
            .push((m, emote.to_string()));
        Ok(())
    }

    async fn start_typing(&self, _c: ChannelId) -> Result<(), TransportError> {
        Ok(())
    }

    async fn stop_typing(&self, _c: ChannelId) -> Result<(), TransportError> {
        Ok(())
    }

    async fn parent_channel_id(&self, _c: ChannelId) -> Result<Option<ChannelId>, TransportError> {
        Ok(None)
    }

    async fn channel_name(&self, _c: ChannelId) -> Result<String, TransportError> {
        Ok("general".to_string())
    }

    fn bot_user_id(&self) -> UserId {
        BOT_USER
    }

    fn bot_username(&self) -> &str {
        "echo-bot"
    }

    async fn bot_reply_chain_depth(
        &self,
        _channel_id: ChannelId,
        message: &ChatMessage,
    ) -> Result<u32, TransportError> {
        let inner = self.inner.lock().unwrap();
        let index: HashMap<MessageId, &ChatMessage> =
            inner.history.iter().map(|m| (m.id, m)).collect();
        Ok(bot_reply_chain_depth(&index, message))
    }
}

fn chunk_1800(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= 1800 {
        return vec![text.to_string()];
    }
    chars
        .chunks(1800)
        .map(|c| c.iter().collect::<String>())
        .collect()
}

struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<LlmCompletion, ProviderError>>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedProvider {
    fn new(responses: Vec<Result<LlmCompletion, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, req: &LlmRequest) -> Result<LlmCompletion, ProviderError> {
        self.requests.lock().unwrap().push(req.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Unavailable("script exhausted".into())))
    }
}

fn completion(text: &str, stop_reason: StopReason, stop_sequence: Option<&str>) -> LlmCompletion {
    LlmCompletion {
        content: vec![ContentBlock::text(text)],
        stop_reason,
        stop_sequence: stop_sequence.map(str::to_string),
        usage: Usage::default(),
        model: "scripted".into(),
    }
}

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echo the x parameter back"
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {"x": {"type": "string"}}})
    }
    async fn execute(&self, input: serde_json::Value) -> ToolOutcome {
        ToolOutcome::text(input["x"].as_str().unwrap_or_default().to_string())
    }
}

#[derive(Default)]
struct MockCredit {
    refunds: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl CreditClient for MockCredit {
    async fn check_and_deduct(&self, _req: &CreditRequest) -> std::io::Result<CreditDecision> {
        Ok(CreditDecision::allowed_with("tx-1"))
    }

    async fn refund(&self, transaction_id: &str, reason: &str) -> std::io::Result<()> {
        self.refunds
            .lock()
            .unwrap()
            .push((transaction_id.to_string(), reason.to_string()));
        Ok(())
    }

    async fn track_message(
        &self,
        _m: MessageId,
        _c: ChannelId,
        _s: Option<GuildId>,
        _u: UserId,
        _t: MessageId,
    ) -> std::io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn bot_config() -> BotConfig {
    BotConfig {
        name: "Echo".into(),
        api_only: false,
        reply_on_random: None,
        reply_chain_depth_limit: 4,
        chain_limit_emote: "🔁".into(),
        config_needed_emote: "⚙️".into(),
        stop_emote: "🛑".into(),
        context: Default::default(),
        llm: LlmConfig {
            model: "scripted".into(),
            temperature: 1.0,
            top_p: None,
            max_tokens: 4096,
            mode: Default::default(),
            prefill_thinking: false,
            turn_end_token: None,
            message_delimiter: None,
            prompt_caching: true,
            stop_sequences: vec![],
        },
        tools: Default::default(),
        credit: Default::default(),
    }
}

struct Harness {
    scheduler: Scheduler,
    transport: Arc<MockTransport>,
    provider: Arc<ScriptedProvider>,
    state_store: Arc<ChannelStateStore>,
    tool_cache: Arc<murmur_store::ToolCache>,
    activation_store: Arc<murmur_store::ActivationStore>,
    credit: Option<Arc<MockCredit>>,
}

fn harness(
    config: BotConfig,
    history: Vec<ChatMessage>,
    responses: Vec<Result<LlmCompletion, ProviderError>>,
    with_credit: bool,
) -> Harness {
    let (tool_cache, activation_store) = murmur_store::open_in_memory().unwrap();
    let tool_cache = Arc::new(tool_cache);
    let activation_store = Arc::new(activation_store);
    let transport = MockTransport::new(history);
    let provider = ScriptedProvider::new(responses);
    let state_store = Arc::new(ChannelStateStore::new());
    let credit = with_credit.then(|| Arc::new(MockCredit::default()));

    let deps = ActivationDeps {
        bot: BotId::new("echo"),
        config: Arc::new(config),
        transport: transport.clone(),
        provider: provider.clone(),
        executor: Arc::new(ToolExecutor::new(vec![Arc::new(EchoTool)], None)),
        tool_cache: tool_cache.clone(),
        activation_store: activation_store.clone(),
        state_store: state_store.clone(),
        credit: credit.clone().map(|c| c as Arc<dyn CreditClient>),
        trace: Arc::new(NoopTrace),
        system_prompt: "You are Echo.".into(),
    };

    Harness {
        scheduler: Scheduler::new(Arc::new(deps)),
        transport,
        provider,
        state_store,
        tool_cache,
        activation_store,
        credit,
    }
}

fn user_msg(id: u64, username: &str, content: &str) -> ChatMessage {
    ChatMessage {
        id: MessageId(id),
        channel_id: CHANNEL,
        guild_id: Some(GuildId(1)),
        author: Author {
            id: UserId(id % 100 + 1),
            username: username.to_string(),
            display_name: username.to_string(),
            bot: false,
        },
        content: content.to_string(),
        timestamp: Utc.timestamp_opt(1_700_000_000 + id as i64, 0).unwrap(),
        system: false,
        attachments: vec![],
        reactions: vec![],
        referenced_message_id: None,
    }
}

async fn settle(h: &Harness, min_sends: usize) {
    for _ in 0..300 {
        if h.transport.sent().len() >= min_sends && h.provider.calls() > 0 {
            // One extra tick lets the post-send bookkeeping finish.
            tokio::time::sleep(Duration::from_millis(30)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("activation did not settle");
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn simple_mention_sends_one_reply() {
    let history = vec![
        user_msg(1, "Alice", "hi"),
        user_msg(2, "Alice", "<@echo-bot> what time is it?"),
    ];
    let trigger = history[1].clone();
    let h = harness(
        bot_config(),
        history,
        vec![Ok(completion("It's four o'clock.", StopReason::EndTurn, None))],
        false,
    );

    h.scheduler
        .process_batch(CHANNEL, vec![TransportEvent::Message(trigger.clone())])
        .await;
    settle(&h, 1).await;

    let sent = h.transport.sent();
    assert_eq!(h.provider.calls(), 1);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].content, "It's four o'clock.");
    assert_eq!(sent[0].reply_to, Some(trigger.id));

    let state = h.state_store.get_or_initialize(&BotId::new("echo"), CHANNEL);
    assert_eq!(state.messages_since_roll, 1);
}

#[tokio::test]
async fn roll_boundary_resets_counter_and_anchor() {
    let mut config = bot_config();
    config.context.recency_window_characters = 80;
    config.context.hard_max_characters = 160;
    config.context.rolling_threshold = 3;

    // Alternate authors so the same-participant merge leaves five separate
    // messages for the truncation to work on.
    let mut history: Vec<ChatMessage> = (1..=4)
        .map(|i| user_msg(i, if i % 2 == 0 { "Bob" } else { "Alice" }, &"x".repeat(30)))
        .collect();
    history.push(user_msg(5, "Bob", "<@echo-bot> hi"));
    let trigger = history[4].clone();

    let h = harness(
        config,
        history,
        vec![Ok(completion("short", StopReason::EndTurn, None))],
        false,
    );
    h.scheduler
        .process_batch(CHANNEL, vec![TransportEvent::Message(trigger)])
        .await;
    settle(&h, 1).await;

    let state = h.state_store.get_or_initialize(&BotId::new("echo"), CHANNEL);
    assert_eq!(state.messages_since_roll, 0);
    let anchor = state.cache_oldest_message_id.expect("anchor recorded");
    assert!(anchor > MessageId(1));
}

#[tokio::test]
async fn inline_tool_call_interleaves_send_execute_continue() {
    let history = vec![user_msg(1, "Alice", "<@echo-bot> run echo")];
    let trigger = history[0].clone();

    let first = "<thinking>plan</thinking>hello<function_calls>\n<invoke name=\"echo\">\n<parameter name=\"x\">1</parameter>\n</invoke>\n";
    let h = harness(
        bot_config(),
        history,
        vec![
            Ok(completion(first, StopReason::StopSequence, Some("</function_calls>"))),
            Ok(completion("done.", StopReason::EndTurn, None)),
        ],
        false,
    );
    h.scheduler
        .process_batch(CHANNEL, vec![TransportEvent::Message(trigger.clone())])
        .await;
    settle(&h, 2).await;

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].content, "hello");
    assert_eq!(sent[0].reply_to, Some(trigger.id));
    assert_eq!(sent[1].content, "done.");
    assert_eq!(sent[1].reply_to, None);

    // The continuation request prefilled everything said so far, tool
    // results included.
    let requests = h.provider.requests();
    assert_eq!(requests.len(), 2);
    let prefill = requests[1].messages.last().unwrap().joined_text();
    assert!(prefill.contains("<function_calls>"));
    assert!(prefill.contains("<stdout>1</stdout>"));

    // Tool cache entry persisted with the final assistant text.
    let bot = BotId::new("echo");
    let entries = h.tool_cache.load_with_results(&bot, CHANNEL, None).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "echo");
    assert_eq!(entries[0].input["x"], "1");
    assert_eq!(entries[0].triggering_message_id, trigger.id);
    assert!(entries[0].original_assistant_text.ends_with("done."));
    assert_eq!(
        entries[0].bot_message_ids,
        vec![sent[0].id, sent[1].id]
    );

    // Activation round-trip (P5): prefix + content + suffix per sent
    // message reconstructs the accumulated text.
    let window = [trigger.id, sent[0].id, sent[1].id].into_iter().collect();
    let activations = h
        .activation_store
        .load_for_channel(&bot, CHANNEL, &window)
        .unwrap();
    assert_eq!(activations.len(), 1);
    let activation = &activations[0];
    assert_eq!(activation.stop_reason.as_deref(), Some("end_turn"));
    let mut rebuilt = String::new();
    for completion in &activation.completions {
        for id in &completion.sent_message_ids {
            let ctx = &activation.message_contexts[id];
            let content = &sent.iter().find(|s| s.id == *id).unwrap().content;
            rebuilt.push_str(&ctx.prefix);
            rebuilt.push_str(content);
            if let Some(suffix) = &ctx.suffix {
                rebuilt.push_str(suffix);
            }
        }
    }
    assert_eq!(rebuilt, activation.completions[0].text);
    assert!(rebuilt.starts_with("<thinking>plan</thinking>hello<function_calls>"));
    assert!(rebuilt.ends_with("done."));

    // Second message carries the tool XML and results as its prefix.
    let second_ctx = &activation.message_contexts[&sent[1].id];
    assert!(second_ctx.prefix.starts_with("<function_calls>"));
    assert!(second_ctx.prefix.contains("<stdout>1</stdout>"));
}

#[tokio::test]
async fn hallucinated_participant_discards_completion() {
    let history = vec![
        user_msg(1, "Alice", "hi"),
        user_msg(2, "Alice", "<@echo-bot> thoughts?"),
    ];
    let trigger = history[1].clone();
    let first = "Alice: I think so<function_calls>\n<invoke name=\"echo\">\n<parameter name=\"x\">1</parameter>\n</invoke>\n";
    let h = harness(
        bot_config(),
        history,
        vec![Ok(completion(first, StopReason::StopSequence, Some("</function_calls>")))],
        false,
    );
    h.scheduler
        .process_batch(CHANNEL, vec![TransportEvent::Message(trigger.clone())])
        .await;

    // No sends will ever arrive; wait on the activation record instead.
    let bot = BotId::new("echo");
    let mut stop_reason = None;
    for _ in 0..300 {
        let window = [trigger.id].into_iter().collect();
        let activations = h
            .activation_store
            .load_for_channel(&bot, CHANNEL, &window)
            .unwrap();
        if let Some(a) = activations.iter().find(|a| a.completed) {
            stop_reason = a.stop_reason.clone();
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(stop_reason.as_deref(), Some("hallucination"));
    assert!(h.transport.sent().is_empty());
    assert!(h.transport.reactions().is_empty());
    // The tool inside the discarded completion never ran.
    assert!(h.tool_cache.load_with_results(&bot, CHANNEL, None).unwrap().is_empty());
}

#[tokio::test]
async fn max_tool_depth_appends_suffix_and_stops() {
    let mut config = bot_config();
    config.tools.max_tool_depth = 2;

    let call = "<function_calls>\n<invoke name=\"echo\">\n<parameter name=\"x\">go</parameter>\n</invoke>\n";
    let history = vec![user_msg(1, "Alice", "<@echo-bot> loop forever")];
    let trigger = history[0].clone();
    let h = harness(
        config,
        history,
        vec![
            Ok(completion(call, StopReason::StopSequence, Some("</function_calls>"))),
            Ok(completion(call, StopReason::StopSequence, Some("</function_calls>"))),
            Ok(completion(call, StopReason::StopSequence, Some("</function_calls>"))),
        ],
        false,
    );
    h.scheduler
        .process_batch(CHANNEL, vec![TransportEvent::Message(trigger)])
        .await;
    settle(&h, 1).await;

    // Exactly two executions, two LLM calls, and the visible suffix.
    assert_eq!(h.provider.calls(), 2);
    let bot = BotId::new("echo");
    let entries = h.tool_cache.load_with_results(&bot, CHANNEL, None).unwrap();
    assert_eq!(entries.len(), 2);

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].content, "[Max tool depth reached]");
}

#[tokio::test]
async fn provider_failure_refunds_credit() {
    let mut config = bot_config();
    config.credit.enabled = true;

    let history = vec![user_msg(1, "Alice", "<@echo-bot> hello")];
    let trigger = history[0].clone();
    let h = harness(
        config,
        history,
        vec![Err(ProviderError::Api {
            status: 400,
            message: "bad".into(),
        })],
        true,
    );
    h.scheduler
        .process_batch(CHANNEL, vec![TransportEvent::Message(trigger)])
        .await;

    let credit = h.credit.clone().unwrap();
    for _ in 0..300 {
        if !credit.refunds.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let refunds = credit.refunds.lock().unwrap().clone();
    assert_eq!(refunds, vec![("tx-1".to_string(), "inference_failed".to_string())]);
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn m_command_activates_and_is_deleted() {
    let history = vec![user_msg(1, "Alice", "m summarize <@echo-bot>")];
    let trigger = history[0].clone();
    let h = harness(
        bot_config(),
        history,
        vec![Ok(completion("Summary: hi.", StopReason::EndTurn, None))],
        false,
    );
    h.scheduler
        .process_batch(CHANNEL, vec![TransportEvent::Message(trigger.clone())])
        .await;
    settle(&h, 1).await;

    assert_eq!(h.transport.deleted(), vec![trigger.id]);
    let bot = BotId::new("echo");
    let window = [trigger.id].into_iter().collect();
    let activations = h
        .activation_store
        .load_for_channel(&bot, CHANNEL, &window)
        .unwrap();
    assert_eq!(activations[0].trigger.kind, TriggerKind::MCommand);
}

#[tokio::test]
async fn foreign_m_command_suppresses_batch() {
    let history = vec![
        user_msg(1, "Alice", "m wake <@other-bot>"),
        user_msg(2, "Alice", "<@echo-bot> you too"),
    ];
    let events = history
        .iter()
        .cloned()
        .map(TransportEvent::Message)
        .collect();
    let h = harness(bot_config(), history, vec![], false);
    h.scheduler.process_batch(CHANNEL, events).await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.provider.calls(), 0);
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn reply_chain_at_limit_reacts_instead_of_activating() {
    let mut config = bot_config();
    config.reply_chain_depth_limit = 1;

    // Bot message replying chain: bot → trigger mentions bot.
    let mut bot_msg = user_msg(1, "other-bot", "beep");
    bot_msg.author.bot = true;
    bot_msg.author.id = UserId(500);
    let mut trigger = user_msg(2, "Alice", "<@echo-bot> and?");
    trigger.referenced_message_id = Some(bot_msg.id);

    let h = harness(config, vec![bot_msg, trigger.clone()], vec![], false);
    h.scheduler
        .process_batch(CHANNEL, vec![TransportEvent::Message(trigger.clone())])
        .await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.provider.calls(), 0);
    assert_eq!(h.transport.reactions(), vec![(trigger.id, "🔁".to_string())]);
}
