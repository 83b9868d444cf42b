//! Bounded transport event queue with batch draining.
//!
//! The gateway side pushes; the agent loop drains. Draining takes whatever is
//! immediately available after the first event so one activation can consume
//! a burst of messages as a single batch.

use tokio::sync::mpsc;

use murmur_core::types::{ChannelId, MessageId};

use crate::message::ChatMessage;

/// Default queue capacity. Pushes beyond it drop the event (the transport
/// history is the source of truth; a dropped event only delays activation).
const QUEUE_CAPACITY: usize = 1024;
/// Maximum events drained into one batch.
const BATCH_MAX: usize = 64;

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(ChatMessage),
    Edit {
        channel_id: ChannelId,
        message_id: MessageId,
        content: String,
    },
    Delete {
        channel_id: ChannelId,
        message_id: MessageId,
    },
}

impl TransportEvent {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            TransportEvent::Message(m) => m.channel_id,
            TransportEvent::Edit { channel_id, .. } => *channel_id,
            TransportEvent::Delete { channel_id, .. } => *channel_id,
        }
    }
}

/// Producer handle given to the transport gateway.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<TransportEvent>,
}

impl EventSender {
    /// Push an event, dropping it when the queue is full.
    pub fn push(&self, event: TransportEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::warn!(error = %e, "event queue full, dropping transport event");
        }
    }
}

/// Consumer half owned by the agent loop.
pub struct EventQueue {
    rx: mpsc::Receiver<TransportEvent>,
}

impl EventQueue {
    pub fn new() -> (EventSender, EventQueue) {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (EventSender, EventQueue) {
        let (tx, rx) = mpsc::channel(capacity);
        (EventSender { tx }, EventQueue { rx })
    }

    /// Wait for at least one event, then drain whatever else is already
    /// queued, up to [`BATCH_MAX`]. Returns `None` when all senders are gone.
    pub async fn next_batch(&mut self) -> Option<Vec<TransportEvent>> {
        let first = self.rx.recv().await?;
        let mut batch = vec![first];
        while batch.len() < BATCH_MAX {
            match self.rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batch_drains_pending_events() {
        let (tx, mut queue) = EventQueue::with_capacity(8);
        for i in 0..3u64 {
            tx.push(TransportEvent::Delete {
                channel_id: ChannelId(1),
                message_id: MessageId(i),
            });
        }
        let batch = queue.next_batch().await.unwrap();
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test]
    async fn closed_queue_yields_none() {
        let (tx, mut queue) = EventQueue::with_capacity(8);
        drop(tx);
        assert!(queue.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let (tx, mut queue) = EventQueue::with_capacity(1);
        tx.push(TransportEvent::Delete {
            channel_id: ChannelId(1),
            message_id: MessageId(1),
        });
        // Dropped silently; the queue only holds one.
        tx.push(TransportEvent::Delete {
            channel_id: ChannelId(1),
            message_id: MessageId(2),
        });
        let batch = queue.next_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
    }
}
