use rusqlite::Connection;

use crate::error::Result;

/// Initialise store tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tool_cache (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            bot                     TEXT NOT NULL,
            channel                 INTEGER NOT NULL,
            call_id                 TEXT NOT NULL,
            name                    TEXT NOT NULL,
            input                   TEXT NOT NULL,
            output                  TEXT NOT NULL,
            images                  TEXT NOT NULL DEFAULT '[]',
            mcp                     INTEGER NOT NULL DEFAULT 0,
            triggering_message_id   INTEGER NOT NULL,
            bot_message_ids         TEXT NOT NULL DEFAULT '[]',
            original_assistant_text TEXT NOT NULL,
            created_at              TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tool_cache_channel
            ON tool_cache(bot, channel, id);

        CREATE TABLE IF NOT EXISTS activations (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            bot               TEXT NOT NULL,
            channel           INTEGER NOT NULL,
            trigger_kind      TEXT NOT NULL,
            anchor_message_id INTEGER NOT NULL,
            completed         INTEGER NOT NULL DEFAULT 0,
            stop_reason       TEXT,
            created_at        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_activations_channel
            ON activations(bot, channel, id);

        CREATE TABLE IF NOT EXISTS activation_completions (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            activation_id    INTEGER NOT NULL REFERENCES activations(id),
            text             TEXT NOT NULL,
            sent_message_ids TEXT NOT NULL DEFAULT '[]'
        );
        CREATE INDEX IF NOT EXISTS idx_completions_activation
            ON activation_completions(activation_id);

        CREATE TABLE IF NOT EXISTS activation_message_contexts (
            activation_id INTEGER NOT NULL REFERENCES activations(id),
            message_id    INTEGER NOT NULL,
            prefix        TEXT NOT NULL DEFAULT '',
            suffix        TEXT,
            PRIMARY KEY (activation_id, message_id)
        );",
    )?;
    Ok(())
}
