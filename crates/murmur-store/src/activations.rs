use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::instrument;

use murmur_core::types::{BotId, ChannelId, MessageId};

use crate::error::{Result, StoreError};
use crate::types::{Activation, Completion, InvisibleContext, Trigger, TriggerKind};

/// Durable record of activations: trigger, completions, and per-message
/// invisible content. This is what lets a later context build reconstruct
/// the exact assistant text (thinking and tool XML included) around the
/// messages still visible in the channel.
pub struct ActivationStore {
    db: Arc<Mutex<Connection>>,
}

impl ActivationStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Record the start of an activation; returns its id.
    #[instrument(skip(self), fields(bot = %bot, channel = %channel))]
    pub fn start_activation(
        &self,
        bot: &BotId,
        channel: ChannelId,
        trigger: Trigger,
    ) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO activations (bot, channel, trigger_kind, anchor_message_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                bot.as_str(),
                channel.get() as i64,
                trigger.kind.as_str(),
                trigger.anchor_message_id.get() as i64,
                now,
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub fn add_completion(
        &self,
        activation_id: i64,
        text: &str,
        sent_message_ids: &[MessageId],
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO activation_completions (activation_id, text, sent_message_ids)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![
                activation_id,
                text,
                serde_json::to_string(sent_message_ids)?
            ],
        )?;
        Ok(())
    }

    /// Upsert the invisible context recorded around one sent message.
    pub fn set_message_context(
        &self,
        activation_id: i64,
        message_id: MessageId,
        context: &InvisibleContext,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO activation_message_contexts (activation_id, message_id, prefix, suffix)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(activation_id, message_id)
             DO UPDATE SET prefix = ?3, suffix = ?4",
            rusqlite::params![
                activation_id,
                message_id.get() as i64,
                context.prefix,
                context.suffix,
            ],
        )?;
        Ok(())
    }

    pub fn complete_activation(&self, activation_id: i64, stop_reason: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE activations SET completed = 1, stop_reason = ?2 WHERE id = ?1",
            rusqlite::params![activation_id, stop_reason],
        )?;
        if changed == 0 {
            return Err(StoreError::ActivationNotFound { id: activation_id });
        }
        Ok(())
    }

    /// All message ids this bot has sent in the channel, across activations.
    /// Backs the reply trigger and the delete sweep.
    pub fn sent_message_ids(&self, bot: &BotId, channel: ChannelId) -> Result<HashSet<MessageId>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT c.sent_message_ids
             FROM activation_completions c
             JOIN activations a ON a.id = c.activation_id
             WHERE a.bot = ?1 AND a.channel = ?2",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![bot.as_str(), channel.get() as i64],
            |row| row.get::<_, String>(0),
        )?;

        let mut ids = HashSet::new();
        for row in rows {
            let decoded: Vec<MessageId> = serde_json::from_str(&row?).unwrap_or_default();
            ids.extend(decoded);
        }
        Ok(ids)
    }

    /// Load completed activations still anchored in the current window:
    /// those whose anchor message or any sent message is in `existing`.
    #[instrument(skip(self, existing), fields(bot = %bot, channel = %channel))]
    pub fn load_for_channel(
        &self,
        bot: &BotId,
        channel: ChannelId,
        existing: &HashSet<MessageId>,
    ) -> Result<Vec<Activation>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, trigger_kind, anchor_message_id, completed, stop_reason
             FROM activations
             WHERE bot = ?1 AND channel = ?2
             ORDER BY id",
        )?;
        let headers: Vec<(i64, String, i64, bool, Option<String>)> = stmt
            .query_map(
                rusqlite::params![bot.as_str(), channel.get() as i64],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get::<_, i64>(3)? != 0,
                        row.get(4)?,
                    ))
                },
            )?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        let mut activations = Vec::new();
        for (id, kind, anchor, completed, stop_reason) in headers {
            let Some(kind) = TriggerKind::parse(&kind) else {
                continue;
            };
            let completions = load_completions(&db, id)?;
            let anchor = MessageId(anchor as u64);

            let in_window = existing.contains(&anchor)
                || completions
                    .iter()
                    .flat_map(|c| c.sent_message_ids.iter())
                    .any(|m| existing.contains(m));
            if !in_window {
                continue;
            }

            activations.push(Activation {
                id,
                trigger: Trigger {
                    kind,
                    anchor_message_id: anchor,
                },
                completions,
                message_contexts: load_contexts(&db, id)?,
                completed,
                stop_reason,
            });
        }
        Ok(activations)
    }
}

fn load_completions(db: &Connection, activation_id: i64) -> Result<Vec<Completion>> {
    let mut stmt = db.prepare(
        "SELECT text, sent_message_ids FROM activation_completions
         WHERE activation_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(rusqlite::params![activation_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut completions = Vec::new();
    for row in rows {
        let (text, encoded) = row?;
        completions.push(Completion {
            text,
            sent_message_ids: serde_json::from_str(&encoded).unwrap_or_default(),
        });
    }
    Ok(completions)
}

fn load_contexts(
    db: &Connection,
    activation_id: i64,
) -> Result<BTreeMap<MessageId, InvisibleContext>> {
    let mut stmt = db.prepare(
        "SELECT message_id, prefix, suffix FROM activation_message_contexts
         WHERE activation_id = ?1",
    )?;
    let rows = stmt.query_map(rusqlite::params![activation_id], |row| {
        Ok((
            MessageId(row.get::<_, i64>(0)? as u64),
            InvisibleContext {
                prefix: row.get(1)?,
                suffix: row.get(2)?,
            },
        ))
    })?;
    let mut contexts = BTreeMap::new();
    for row in rows {
        let (id, ctx) = row?;
        contexts.insert(id, ctx);
    }
    Ok(contexts)
}
