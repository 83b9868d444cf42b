use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, instrument};

use murmur_core::types::{BotId, ChannelId, MessageId};
use murmur_tools::{ToolCall, ToolImage};

use crate::error::Result;
use crate::types::ToolCacheEntry;

/// Append-only log of executed tool calls, per (bot, channel).
///
/// Entries survive bot-message deletion (they are filtered at context-build
/// time instead) and are pruned only when their triggering message ages out
/// of the fetch window.
pub struct ToolCache {
    db: Arc<Mutex<Connection>>,
}

/// Fields known at execution time; `bot_message_ids` and the final
/// assistant text are stamped later via [`ToolCache::update_bot_message_ids`]
/// and arrive with the entry at persist time.
pub struct NewToolCacheEntry {
    pub call: ToolCall,
    pub output: String,
    pub images: Vec<ToolImage>,
    pub mcp: bool,
    pub triggering_message_id: MessageId,
    pub bot_message_ids: Vec<MessageId>,
    pub original_assistant_text: String,
}

impl ToolCache {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Load entries in insertion order. When `existing_message_ids` is
    /// supplied, entries whose triggering message is outside that set are
    /// filtered from the result but kept on disk — a later fetch reaching
    /// further back may rehydrate them.
    #[instrument(skip(self, existing_message_ids), fields(bot = %bot, channel = %channel))]
    pub fn load_with_results(
        &self,
        bot: &BotId,
        channel: ChannelId,
        existing_message_ids: Option<&HashSet<MessageId>>,
    ) -> Result<Vec<ToolCacheEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT call_id, name, input, output, images, mcp,
                    triggering_message_id, bot_message_ids,
                    original_assistant_text, created_at
             FROM tool_cache
             WHERE bot = ?1 AND channel = ?2
             ORDER BY id",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![bot.as_str(), channel.get() as i64],
            row_to_entry,
        )?;

        let mut entries = Vec::new();
        for row in rows {
            let entry = row?;
            if let Some(existing) = existing_message_ids {
                if !existing.contains(&entry.triggering_message_id) {
                    continue;
                }
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Append one executed call.
    #[instrument(skip(self, entry), fields(bot = %bot, channel = %channel, tool = %entry.call.name))]
    pub fn persist_tool_use(
        &self,
        bot: &BotId,
        channel: ChannelId,
        entry: &NewToolCacheEntry,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO tool_cache
             (bot, channel, call_id, name, input, output, images, mcp,
              triggering_message_id, bot_message_ids, original_assistant_text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                bot.as_str(),
                channel.get() as i64,
                entry.call.id,
                entry.call.name,
                entry.call.input.to_string(),
                entry.output,
                serde_json::to_string(&entry.images)?,
                entry.mcp as i64,
                entry.triggering_message_id.get() as i64,
                serde_json::to_string(&entry.bot_message_ids)?,
                entry.original_assistant_text,
                now,
            ],
        )?;
        Ok(())
    }

    /// Stamp the bot messages sent while the given calls' activation ran.
    pub fn update_bot_message_ids(
        &self,
        bot: &BotId,
        channel: ChannelId,
        call_ids: &[String],
        bot_message_ids: &[MessageId],
    ) -> Result<()> {
        let encoded = serde_json::to_string(bot_message_ids)?;
        let db = self.db.lock().unwrap();
        for call_id in call_ids {
            db.execute(
                "UPDATE tool_cache SET bot_message_ids = ?1
                 WHERE bot = ?2 AND channel = ?3 AND call_id = ?4",
                rusqlite::params![encoded, bot.as_str(), channel.get() as i64, call_id],
            )?;
        }
        Ok(())
    }

    /// Drop entries recorded by a bot message that was deleted.
    pub fn remove_entries_by_bot_message_id(
        &self,
        bot: &BotId,
        channel: ChannelId,
        message_id: MessageId,
    ) -> Result<usize> {
        // bot_message_ids is a JSON array; decode per row rather than
        // substring-matching the encoded id (12 would match 123).
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, bot_message_ids FROM tool_cache
             WHERE bot = ?1 AND channel = ?2",
        )?;
        let rows: Vec<(i64, String)> = stmt
            .query_map(
                rusqlite::params![bot.as_str(), channel.get() as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        let mut removed = 0;
        for (row_id, encoded) in rows {
            let ids: Vec<MessageId> = serde_json::from_str(&encoded).unwrap_or_default();
            if ids.contains(&message_id) {
                db.execute(
                    "DELETE FROM tool_cache WHERE id = ?1",
                    rusqlite::params![row_id],
                )?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(bot = %bot, channel = %channel, message = %message_id, removed, "removed tool-cache entries for deleted bot message");
        }
        Ok(removed)
    }

    /// Drop entries whose triggering message fell out of the fetch window.
    pub fn prune(
        &self,
        bot: &BotId,
        channel: ChannelId,
        oldest_fetched: MessageId,
    ) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let removed = db.execute(
            "DELETE FROM tool_cache
             WHERE bot = ?1 AND channel = ?2 AND triggering_message_id < ?3",
            rusqlite::params![
                bot.as_str(),
                channel.get() as i64,
                oldest_fetched.get() as i64
            ],
        )?;
        Ok(removed)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolCacheEntry> {
    let input: String = row.get(2)?;
    let images: String = row.get(4)?;
    let bot_message_ids: String = row.get(7)?;
    Ok(ToolCacheEntry {
        call_id: row.get(0)?,
        name: row.get(1)?,
        input: serde_json::from_str(&input).unwrap_or(serde_json::Value::Null),
        output: row.get(3)?,
        images: serde_json::from_str(&images).unwrap_or_default(),
        mcp: row.get::<_, i64>(5)? != 0,
        triggering_message_id: MessageId(row.get::<_, i64>(6)? as u64),
        bot_message_ids: serde_json::from_str(&bot_message_ids).unwrap_or_default(),
        original_assistant_text: row.get(8)?,
        created_at: row.get(9)?,
    })
}
