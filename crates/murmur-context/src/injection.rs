//! Step 8: plugin context injections with depth aging.
//!
//! A just-modified injection surfaces near the tail (depth 0) and drifts
//! back toward its target depth as newer messages accumulate — recency
//! salience without destroying cache stability once it settles.

use murmur_core::types::MessageId;
use murmur_llm::ContentBlock;

use crate::working::WorkingMessage;

#[derive(Debug, Clone)]
pub struct ContextInjection {
    pub id: String,
    pub content: InjectionContent,
    /// Negative: fixed position `|target_depth| − 1` from the start, no
    /// aging. Non-negative: messages from the end, aged from 0.
    pub target_depth: i32,
    /// The message whose arrival last changed this injection's content.
    pub last_modified_at: Option<MessageId>,
    pub priority: i32,
    pub as_system: bool,
}

#[derive(Debug, Clone)]
pub enum InjectionContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl ContextInjection {
    fn blocks(&self) -> Vec<ContentBlock> {
        match &self.content {
            InjectionContent::Text(text) => vec![ContentBlock::text(text.clone())],
            InjectionContent::Blocks(blocks) => blocks.clone(),
        }
    }

    fn participant(&self) -> String {
        if self.as_system {
            "System".to_string()
        } else {
            format!("System<[{}]>", self.id)
        }
    }
}

/// Where an injection currently sits, measured from the end of the list.
fn current_depth(injection: &ContextInjection, working: &[WorkingMessage]) -> i32 {
    let Some(modified_at) = injection.last_modified_at else {
        return injection.target_depth; // settled
    };
    let Some(pos) = working
        .iter()
        .position(|m| m.message_id == Some(modified_at))
    else {
        return injection.target_depth; // modification aged out — settled
    };
    let since_modification = (working.len() - 1 - pos) as i32;
    since_modification.min(injection.target_depth)
}

/// Insert every injection at its current depth.
pub fn apply_injections(working: &mut Vec<WorkingMessage>, injections: Vec<ContextInjection>) {
    let (negative, mut positive): (Vec<_>, Vec<_>) =
        injections.into_iter().partition(|i| i.target_depth < 0);

    // Positive depths: deepest first, each computed against the list as it
    // grows, so earlier insertions never shift later ones.
    positive.sort_by(|a, b| {
        let da = current_depth(a, working);
        let db = current_depth(b, working);
        db.cmp(&da).then(b.priority.cmp(&a.priority))
    });
    for injection in &positive {
        let depth = current_depth(injection, working).max(0) as usize;
        let idx = working.len().saturating_sub(depth);
        working.insert(idx, to_message(injection));
    }

    // Negative depths: fixed positions from the start. Sorted ascending and
    // applied in reverse, so the smaller positions land first and stay put.
    let mut negative = negative;
    negative.sort_by_key(|i| i.target_depth);
    for injection in negative.iter().rev() {
        let idx = (injection.target_depth.unsigned_abs() as usize - 1).min(working.len());
        working.insert(idx, to_message(injection));
    }
}

fn to_message(injection: &ContextInjection) -> WorkingMessage {
    WorkingMessage {
        participant: injection.participant(),
        content: injection.blocks(),
        message_id: None,
        timestamp: None,
        is_bot_self: false,
        is_bot_author: false,
        activation_id: None,
        cache_control: None,
    }
}
