//! Channel fan-out.
//!
//! Resolves a channel to its current live subscribers and hands each one
//! the formatted line. Delivery is independent per subscriber: a dead or
//! slow session never affects the others, and nothing is raised.

use tracing::debug;

use crate::registry::Registry;

/// Formats a broadcast line as every subscriber receives it.
pub fn format_broadcast(channel: &str, sender: &str, content: &str) -> String {
    format!("[{channel}] {sender}: {content}")
}

/// Publishes messages to channel subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastEngine {
    registry: Registry,
}

impl BroadcastEngine {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Delivers `content` from `sender` to every live subscriber of `channel`.
    ///
    /// The sender is not special-cased: it receives its own line iff it is
    /// subscribed. Returns the number of sessions the line was handed to;
    /// an unknown channel is a no-op returning 0.
    pub async fn publish(&self, channel: &str, sender: &str, content: &str) -> usize {
        let Some(targets) = self.registry.subscriber_sessions(channel).await else {
            debug!(channel = %channel, sender = %sender, "Publish to unknown channel ignored");
            return 0;
        };

        let line = format_broadcast(channel, sender, content);
        self.registry.observer().on_log(&line);

        for target in &targets {
            target.send(line.clone());
        }

        debug!(channel = %channel, sender = %sender, recipients = targets.len(), "Message broadcast");
        targets.len()
    }
}
