//! The activation scheduler: decides whether a batch of transport events
//! warrants a reply, enforces per-channel mutual exclusion and credit
//! policy, and drives one activation to completion.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashSet;
use tracing::{debug, info, warn};

use murmur_core::config::BotConfig;
use murmur_core::types::{BotId, ChannelId, MessageId, UserId};
use murmur_llm::LlmProvider;
use murmur_store::{
    ActivationStore, ChannelStateStore, ToolCache, Trigger, TriggerKind,
};
use murmur_tools::ToolExecutor;
use murmur_transport::message::{ChatMessage, FetchRequest};
use murmur_transport::typing::TypingGuard;
use murmur_transport::{Transport, TransportEvent};

use crate::credit::{CreditClient, CreditRequest, REFUND_INFERENCE_FAILED};
use crate::error::Result;
use crate::inline::{run_inline_loop, InlineParams};
use crate::trace::TraceWriter;

/// Credit refusal reason that earns a visible reaction instead of silence.
const REASON_BOT_NOT_CONFIGURED: &str = "bot_not_configured";

/// Everything an activation needs, shared across channels.
pub struct ActivationDeps {
    pub bot: BotId,
    pub config: Arc<BotConfig>,
    pub transport: Arc<dyn Transport>,
    pub provider: Arc<dyn LlmProvider>,
    pub executor: Arc<ToolExecutor>,
    pub tool_cache: Arc<ToolCache>,
    pub activation_store: Arc<ActivationStore>,
    pub state_store: Arc<ChannelStateStore>,
    pub credit: Option<Arc<dyn CreditClient>>,
    pub trace: Arc<dyn TraceWriter>,
    /// Base system prompt; pinned channel configs are appended per fetch.
    pub system_prompt: String,
}

pub struct Scheduler {
    deps: Arc<ActivationDeps>,
    /// Channels with an activation in flight. Events for a locked channel
    /// are dropped, not queued.
    active: Arc<DashSet<ChannelId>>,
}

struct Evaluated {
    trigger: Trigger,
    trigger_message: ChatMessage,
    /// `m`-command to delete once the activation is underway.
    m_command: Option<MessageId>,
}

impl Scheduler {
    pub fn new(deps: Arc<ActivationDeps>) -> Self {
        Self {
            deps,
            active: Arc::new(DashSet::new()),
        }
    }

    /// Handle one batch of events, all for the same channel.
    pub async fn process_batch(&self, channel_id: ChannelId, events: Vec<TransportEvent>) {
        let deps = &self.deps;

        // Deleted bot messages invalidate the tool-cache entries they
        // recorded, whether or not this batch activates.
        self.sweep_deletions(channel_id, &events).await;

        if deps.config.api_only {
            return;
        }

        let sent_ids = deps
            .activation_store
            .sent_message_ids(&deps.bot, channel_id)
            .unwrap_or_default();
        let Some(evaluated) = self.evaluate_triggers(channel_id, &events, &sent_ids).await else {
            return;
        };

        if let Some(command_id) = evaluated.m_command {
            if let Err(e) = deps.transport.delete_message(channel_id, command_id).await {
                debug!(error = %e, "m-command deletion failed");
            }
        }

        // Per-channel mutual exclusion: a locked channel drops the batch.
        if !self.active.insert(channel_id) {
            debug!(channel = %channel_id, "channel already active, dropping batch");
            return;
        }

        let transaction_id = match self.credit_gate(channel_id, &evaluated).await {
            Ok(tx) => tx,
            Err(()) => {
                self.active.remove(&channel_id);
                return;
            }
        };

        let deps = Arc::clone(&self.deps);
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            let result = run_activation(&deps, channel_id, &evaluated.trigger, &evaluated.trigger_message).await;
            if let Err(e) = result {
                warn!(channel = %channel_id, error = %e, "activation failed");
                if let (Some(credit), Some(tx)) = (&deps.credit, &transaction_id) {
                    if let Err(e) = credit.refund(tx, REFUND_INFERENCE_FAILED).await {
                        warn!(error = %e, "credit refund failed");
                    }
                }
            }
            active.remove(&channel_id);
        });
    }

    async fn sweep_deletions(&self, channel_id: ChannelId, events: &[TransportEvent]) {
        let deps = &self.deps;
        let mut sent_ids: Option<HashSet<MessageId>> = None;
        for event in events {
            let TransportEvent::Delete { message_id, .. } = event else {
                continue;
            };
            let sent = sent_ids.get_or_insert_with(|| {
                deps.activation_store
                    .sent_message_ids(&deps.bot, channel_id)
                    .unwrap_or_default()
            });
            if !sent.contains(message_id) {
                continue;
            }
            if let Err(e) =
                deps.tool_cache
                    .remove_entries_by_bot_message_id(&deps.bot, channel_id, *message_id)
            {
                warn!(error = %e, message = %message_id, "tool-cache delete sweep failed");
            }
        }
    }

    /// Evaluate activation triggers over the batch, in event order.
    async fn evaluate_triggers(
        &self,
        channel_id: ChannelId,
        events: &[TransportEvent],
        sent_ids: &HashSet<MessageId>,
    ) -> Option<Evaluated> {
        let deps = &self.deps;
        let config = &deps.config;
        let bot_name = &config.name;
        let bot_username = deps.transport.bot_username();

        let messages: Vec<&ChatMessage> = events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Message(m) => Some(m),
                _ => None,
            })
            .collect();

        let mut trigger: Option<(TriggerKind, &ChatMessage)> = None;
        let mut m_command: Option<MessageId> = None;

        for msg in &messages {
            if msg.system {
                continue;
            }
            let mentions_bot = mentions(&msg.content, bot_name) || mentions(&msg.content, bot_username);
            let replies_to_bot = msg
                .referenced_message_id
                .is_some_and(|id| sent_ids.contains(&id));

            // Bot traffic only counts when it addresses this bot directly.
            if msg.author.bot && !mentions_bot {
                continue;
            }

            // `m`-command: must be addressed to this bot, otherwise it
            // belongs to another bot and suppresses this batch entirely.
            if msg.content_after_reply_prefix().starts_with("m ") {
                if mentions_bot || replies_to_bot {
                    m_command = Some(msg.id);
                    trigger = Some((TriggerKind::MCommand, msg));
                    break;
                }
                debug!(channel = %channel_id, "m-command for another bot, suppressing batch");
                return None;
            }

            if mentions_bot {
                let depth = deps
                    .transport
                    .bot_reply_chain_depth(channel_id, msg)
                    .await
                    .unwrap_or(0);
                if depth >= config.reply_chain_depth_limit {
                    debug!(depth, "reply chain at limit, reacting instead of activating");
                    let _ = deps
                        .transport
                        .add_reaction(channel_id, msg.id, &config.chain_limit_emote)
                        .await;
                    continue;
                }
                trigger = Some((TriggerKind::Mention, msg));
                break;
            }

            if replies_to_bot && !msg.author.bot {
                trigger = Some((TriggerKind::Reply, msg));
                break;
            }
        }

        if trigger.is_none() {
            if let Some(n) = config.reply_on_random {
                if n > 0 && random_roll(n) {
                    if let Some(msg) = messages.iter().find(|m| !m.system && !m.author.bot) {
                        trigger = Some((TriggerKind::Random, msg));
                    }
                }
            }
        }

        let (kind, matched) = trigger?;

        // Triggering message: first non-system non-bot message event,
        // falling back to the first message event.
        let trigger_message = messages
            .iter()
            .find(|m| !m.system && !m.author.bot)
            .or_else(|| messages.first())
            .copied()
            .unwrap_or(matched)
            .clone();

        info!(channel = %channel_id, kind = kind.as_str(), trigger = %trigger_message.id, "activating");
        Some(Evaluated {
            trigger: Trigger {
                kind,
                anchor_message_id: trigger_message.id,
            },
            trigger_message,
            m_command,
        })
    }

    /// Returns the transaction id to refund on failure, or `Err(())` when
    /// the activation is blocked.
    async fn credit_gate(
        &self,
        channel_id: ChannelId,
        evaluated: &Evaluated,
    ) -> std::result::Result<Option<String>, ()> {
        let deps = &self.deps;
        let config = &deps.config;
        if !config.credit.enabled || !evaluated.trigger.kind.chargeable() {
            return Ok(None);
        }
        let Some(credit) = &deps.credit else {
            return Ok(None);
        };

        let msg = &evaluated.trigger_message;
        let request = CreditRequest {
            user_id: msg.author.id,
            server_id: msg.guild_id,
            channel_id,
            bot_id: deps.bot.as_str().to_string(),
            message_id: msg.id,
            trigger_type: evaluated.trigger.kind,
            user_roles: Vec::new(),
        };

        match credit.check_and_deduct(&request).await {
            Ok(decision) if decision.allowed => Ok(decision.transaction_id),
            Ok(decision) => {
                if decision.reason.as_deref() == Some(REASON_BOT_NOT_CONFIGURED) {
                    let _ = deps
                        .transport
                        .add_reaction(channel_id, msg.id, &config.config_needed_emote)
                        .await;
                }
                // Other refusals are silent; the credit system owns the
                // user-facing notification.
                Err(())
            }
            Err(e) => {
                // Fail open: billing problems must not mute the bot.
                warn!(error = %e, "credit check failed, allowing activation");
                Ok(None)
            }
        }
    }
}

/// Distinct consecutive bot identities along the reply chain of `message`.
/// Consecutive messages from the same bot count once; the walk stops at the
/// first non-bot author, a broken reference, or a cycle.
pub fn bot_reply_chain_depth(
    messages_by_id: &HashMap<MessageId, &ChatMessage>,
    message: &ChatMessage,
) -> u32 {
    let mut depth = 0u32;
    let mut last_bot: Option<UserId> = None;
    let mut visited: HashSet<MessageId> = HashSet::new();
    let mut current = message.referenced_message_id;

    while let Some(id) = current {
        if !visited.insert(id) {
            break; // malformed reply cycle
        }
        let Some(parent) = messages_by_id.get(&id) else {
            break;
        };
        if !parent.author.bot {
            break;
        }
        if last_bot != Some(parent.author.id) {
            depth += 1;
            last_bot = Some(parent.author.id);
        }
        current = parent.referenced_message_id;
    }
    depth
}

/// One-in-`n` roll derived from the clock's subsecond nanos; no rand
/// dependency.
fn random_roll(n: u32) -> bool {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    nanos % n == 0
}

fn mentions(content: &str, name: &str) -> bool {
    !name.is_empty() && content.contains(&format!("<@{name}>"))
}

/// Drive one activation: fetch, build, run the inline loop, update state.
async fn run_activation(
    deps: &ActivationDeps,
    channel_id: ChannelId,
    trigger: &Trigger,
    trigger_message: &ChatMessage,
) -> Result<()> {
    let config = &deps.config;
    let span = deps
        .trace
        .start(&deps.bot, channel_id, trigger.anchor_message_id);
    let typing = TypingGuard::start(Arc::clone(&deps.transport), channel_id);

    let activation_id = deps
        .activation_store
        .start_activation(&deps.bot, channel_id, *trigger)?;

    let state = deps.state_store.get_or_initialize(&deps.bot, channel_id);
    let fetched = deps
        .transport
        .fetch_context(FetchRequest {
            channel_id,
            depth: config.context.recency_window_messages,
            first_message_id: state.cache_oldest_message_id,
            target_message_id: Some(trigger.anchor_message_id),
            ignore_history: false,
        })
        .await?;
    span.record_raw_messages(fetched.messages.len(), fetched.messages.first().map(|m| m.id));

    if let (Some(wanted), Some(oldest)) = (
        state.cache_oldest_message_id,
        fetched.messages.first().map(|m| m.id),
    ) {
        if oldest > wanted {
            // Leave the anchor for the next roll to rewrite.
            warn!(wanted = %wanted, oldest = %oldest, "fetch could not reach back to the cache anchor");
        }
    }

    let existing: HashSet<MessageId> = fetched.messages.iter().map(|m| m.id).collect();
    let tool_cache_slice =
        deps.tool_cache
            .load_with_results(&deps.bot, channel_id, Some(&existing))?;
    let activations = if config.context.preserve_thinking_context {
        deps.activation_store
            .load_for_channel(&deps.bot, channel_id, &existing)?
    } else {
        Vec::new()
    };
    if let Some(oldest) = fetched.messages.first().map(|m| m.id) {
        deps.tool_cache.prune(&deps.bot, channel_id, oldest)?;
    }

    let mut system_prompt = deps.system_prompt.clone();
    for pinned in &fetched.pinned_configs {
        system_prompt.push_str("\n\n");
        system_prompt.push_str(pinned);
    }

    let mut mention_ids: HashMap<String, UserId> = fetched
        .messages
        .iter()
        .map(|m| (m.author.username.clone(), m.author.id))
        .collect();
    mention_ids.insert(config.name.clone(), deps.transport.bot_user_id());

    let built = murmur_context::build_context(murmur_context::ContextInput {
        bot: &deps.bot,
        bot_name: &config.name,
        bot_username: deps.transport.bot_username(),
        messages: fetched.messages,
        images: fetched.images,
        tool_cache: tool_cache_slice,
        activations,
        injections: Vec::new(),
        state: state.clone(),
        system_prompt,
        config: config.as_ref(),
        tools: deps.executor.definitions(),
    });
    span.record_context(built.request.messages.len(), built.did_roll, built.cache_marker);

    let outcome = run_inline_loop(
        deps.transport.as_ref(),
        deps.provider.as_ref(),
        &deps.executor,
        &deps.tool_cache,
        built.request,
        InlineParams {
            bot: &deps.bot,
            bot_name: &config.name,
            channel_id,
            trigger_message_id: trigger.anchor_message_id,
            participants: &built.participants,
            mention_ids: &mention_ids,
            config: config.as_ref(),
        },
    )
    .await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            span.record_error(&e.to_string());
            typing.stop().await;
            return Err(e);
        }
    };

    if outcome.refusal {
        // A refusal is an ordinary completion; mark it visibly.
        let react_on = outcome
            .sent_message_ids
            .last()
            .copied()
            .unwrap_or(trigger.anchor_message_id);
        let _ = deps
            .transport
            .add_reaction(channel_id, react_on, &config.stop_emote)
            .await;
    }

    deps.activation_store.add_completion(
        activation_id,
        &outcome.accumulated_text,
        &outcome.sent_message_ids,
    )?;
    for (message_id, context) in &outcome.message_contexts {
        deps.activation_store
            .set_message_context(activation_id, *message_id, context)?;
    }
    deps.activation_store
        .complete_activation(activation_id, &outcome.stop_reason)?;

    if !outcome.executed_call_ids.is_empty() {
        deps.tool_cache.update_bot_message_ids(
            &deps.bot,
            channel_id,
            &outcome.executed_call_ids,
            &outcome.sent_message_ids,
        )?;
    }

    deps.state_store
        .update_cache_marker(&deps.bot, channel_id, built.cache_marker);
    if built.did_roll {
        deps.state_store.reset_message_count(&deps.bot, channel_id);
        deps.state_store.update_cache_oldest_message_id(
            &deps.bot,
            channel_id,
            built.oldest_message_id,
        );
    } else {
        deps.state_store
            .increment_message_count(&deps.bot, channel_id);
    }

    if let (Some(credit), Some(first_sent)) = (&deps.credit, outcome.sent_message_ids.first()) {
        let _ = credit
            .track_message(
                *first_sent,
                channel_id,
                trigger_message.guild_id,
                trigger_message.author.id,
                trigger.anchor_message_id,
            )
            .await;
    }

    span.record_outcome(&outcome.stop_reason, outcome.sent_message_ids.len());
    typing.stop().await;
    Ok(())
}
