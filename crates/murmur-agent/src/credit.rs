//! Credit-system client contract.
//!
//! The scheduler charges chargeable triggers before activating and refunds
//! on failure. Any transport problem talking to the credit system fails
//! open — the bot answers rather than going silent on billing hiccups.

use async_trait::async_trait;

use murmur_core::types::{ChannelId, GuildId, MessageId, UserId};
use murmur_store::TriggerKind;

/// Refund reason recorded when an activation fails after charging.
pub const REFUND_INFERENCE_FAILED: &str = "inference_failed";

#[derive(Debug, Clone)]
pub struct CreditRequest {
    pub user_id: UserId,
    pub server_id: Option<GuildId>,
    pub channel_id: ChannelId,
    pub bot_id: String,
    pub message_id: MessageId,
    pub trigger_type: TriggerKind,
    pub user_roles: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CreditDecision {
    pub allowed: bool,
    pub transaction_id: Option<String>,
    pub cost: Option<f64>,
    pub balance_after: Option<f64>,
    /// Machine-readable refusal reason (e.g. `bot_not_configured`).
    pub reason: Option<String>,
}

impl CreditDecision {
    pub fn allowed_with(transaction_id: impl Into<String>) -> Self {
        Self {
            allowed: true,
            transaction_id: Some(transaction_id.into()),
            cost: None,
            balance_after: None,
            reason: None,
        }
    }

    pub fn refused(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            transaction_id: None,
            cost: None,
            balance_after: None,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait CreditClient: Send + Sync {
    async fn check_and_deduct(&self, req: &CreditRequest) -> std::io::Result<CreditDecision>;

    async fn refund(&self, transaction_id: &str, reason: &str) -> std::io::Result<()>;

    /// Record a delivered bot message for usage accounting.
    async fn track_message(
        &self,
        message_id: MessageId,
        channel_id: ChannelId,
        server_id: Option<GuildId>,
        trigger_user_id: UserId,
        trigger_message_id: MessageId,
    ) -> std::io::Result<()>;
}
