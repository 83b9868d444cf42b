//! The top-level agent loop: a single task draining the event queue and
//! handing each batch to the scheduler.
//!
//! The handoff spawns the activation and returns immediately, so queue
//! draining is never blocked behind LLM latency. A batch may span channels;
//! it is split per channel before dispatch so each channel's lock is taken
//! independently.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use murmur_core::types::ChannelId;
use murmur_transport::{EventQueue, TransportEvent};

use crate::scheduler::Scheduler;

pub struct AgentLoop {
    queue: EventQueue,
    scheduler: Arc<Scheduler>,
}

impl AgentLoop {
    pub fn new(queue: EventQueue, scheduler: Arc<Scheduler>) -> Self {
        Self { queue, scheduler }
    }

    /// Pump until every event sender is dropped.
    pub async fn run(mut self) {
        info!("agent loop started");
        while let Some(batch) = self.queue.next_batch().await {
            for (channel_id, events) in split_by_channel(batch) {
                self.scheduler.process_batch(channel_id, events).await;
            }
        }
        info!("agent loop stopped, event queue closed");
    }
}

/// Group a mixed batch per channel, preserving event order within each.
fn split_by_channel(batch: Vec<TransportEvent>) -> Vec<(ChannelId, Vec<TransportEvent>)> {
    let mut grouped: Vec<(ChannelId, Vec<TransportEvent>)> = Vec::new();
    let mut index: HashMap<ChannelId, usize> = HashMap::new();
    for event in batch {
        let channel_id = event.channel_id();
        match index.get(&channel_id) {
            Some(&i) => grouped[i].1.push(event),
            None => {
                index.insert(channel_id, grouped.len());
                grouped.push((channel_id, vec![event]));
            }
        }
    }
    grouped
}
