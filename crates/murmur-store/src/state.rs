use dashmap::DashMap;

use murmur_core::types::{BotId, ChannelId, MessageId};

use crate::types::ChannelState;

/// Process-wide channel state, lazily initialised per (bot, channel).
///
/// Operations are synchronous and non-suspending; the per-channel activation
/// lock bounds concurrency, so each entry only ever has one writer.
#[derive(Default)]
pub struct ChannelStateStore {
    states: DashMap<(BotId, ChannelId), ChannelState>,
}

impl ChannelStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_initialize(&self, bot: &BotId, channel: ChannelId) -> ChannelState {
        self.states
            .entry((bot.clone(), channel))
            .or_default()
            .clone()
    }

    pub fn update_cache_marker(&self, bot: &BotId, channel: ChannelId, marker: Option<MessageId>) {
        self.states
            .entry((bot.clone(), channel))
            .or_default()
            .last_cache_marker = marker;
    }

    pub fn update_cache_oldest_message_id(
        &self,
        bot: &BotId,
        channel: ChannelId,
        oldest: Option<MessageId>,
    ) {
        self.states
            .entry((bot.clone(), channel))
            .or_default()
            .cache_oldest_message_id = oldest;
    }

    pub fn reset_message_count(&self, bot: &BotId, channel: ChannelId) {
        self.states
            .entry((bot.clone(), channel))
            .or_default()
            .messages_since_roll = 0;
    }

    pub fn increment_message_count(&self, bot: &BotId, channel: ChannelId) -> u32 {
        let mut entry = self.states.entry((bot.clone(), channel)).or_default();
        entry.messages_since_roll += 1;
        entry.messages_since_roll
    }
}
