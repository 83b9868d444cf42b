//! Transport contract and event plumbing.
//!
//! The core never talks to a chat platform directly — it consumes the
//! [`adapter::Transport`] trait and the event queue defined here. A concrete
//! adapter (serenity, a test double, …) lives outside this workspace.

pub mod adapter;
pub mod error;
pub mod events;
pub mod message;
pub mod retry;
pub mod typing;

pub use adapter::Transport;
pub use error::{Result, TransportError};
pub use events::{EventQueue, EventSender, TransportEvent};
pub use message::{
    Attachment, Author, ChatMessage, FetchRequest, FetchedContext, InheritanceInfo, Reaction,
};
