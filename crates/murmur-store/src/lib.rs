//! Durable and process-lifetime state behind the scheduler and context
//! builder: the per-channel state store, the tool cache, and the activation
//! store.
//!
//! The tool cache and activation store are SQLite-backed and survive
//! restarts; channel state is in-process only. Mutation happens exclusively
//! under the per-channel activation lock, so plain `Mutex<Connection>`
//! access is sufficient.

pub mod activations;
pub mod db;
pub mod error;
pub mod state;
pub mod tool_cache;
pub mod types;

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

pub use activations::ActivationStore;
pub use error::{Result, StoreError};
pub use state::ChannelStateStore;
pub use tool_cache::{NewToolCacheEntry, ToolCache};
pub use types::{
    Activation, ChannelState, Completion, InvisibleContext, ToolCacheEntry, Trigger, TriggerKind,
};

/// Open (or create) the durable store file and hand out the two managers
/// that share its connection.
pub fn open(path: impl AsRef<Path>) -> Result<(ToolCache, ActivationStore)> {
    let conn = Connection::open(path)?;
    db::init_db(&conn)?;
    let conn = Arc::new(Mutex::new(conn));
    Ok((
        ToolCache::new(Arc::clone(&conn)),
        ActivationStore::new(conn),
    ))
}

/// In-memory variant for tests.
pub fn open_in_memory() -> Result<(ToolCache, ActivationStore)> {
    let conn = Connection::open_in_memory()?;
    db::init_db(&conn)?;
    let conn = Arc::new(Mutex::new(conn));
    Ok((
        ToolCache::new(Arc::clone(&conn)),
        ActivationStore::new(conn),
    ))
}
