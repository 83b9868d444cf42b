//! Typing-indicator refresher.
//!
//! The transport's typing pulse expires after roughly ten seconds, so an
//! activation holds a [`TypingGuard`] that re-pulses every
//! [`TYPING_REFRESH_SECS`] until dropped or explicitly stopped.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use murmur_core::config::TYPING_REFRESH_SECS;
use murmur_core::types::ChannelId;

use crate::adapter::Transport;

pub struct TypingGuard {
    cancel: CancellationToken,
    transport: Arc<dyn Transport>,
    channel_id: ChannelId,
    stopped: bool,
}

impl TypingGuard {
    /// Pulse immediately and spawn the refresher task.
    pub fn start(transport: Arc<dyn Transport>, channel_id: ChannelId) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task_transport = Arc::clone(&transport);
        tokio::spawn(async move {
            loop {
                if let Err(e) = task_transport.start_typing(channel_id).await {
                    debug!(channel = %channel_id, error = %e, "typing pulse failed");
                }
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(TYPING_REFRESH_SECS)) => {}
                }
            }
        });
        Self {
            cancel,
            transport,
            channel_id,
            stopped: false,
        }
    }

    /// Stop refreshing and clear the indicator. Errors are logged, not fatal.
    pub async fn stop(mut self) {
        self.stopped = true;
        self.cancel.cancel();
        if let Err(e) = self.transport.stop_typing(self.channel_id).await {
            debug!(channel = %self.channel_id, error = %e, "stop typing failed");
        }
    }
}

impl Drop for TypingGuard {
    fn drop(&mut self) {
        // Guarantees the refresher dies even when the activation panics.
        if !self.stopped {
            self.cancel.cancel();
        }
    }
}
