//! Observer sinks for the presentation layer.
//!
//! The relay core reports three kinds of notifications: free-form log
//! lines, the roster of registered names, and the subscriber list of a
//! channel. Sinks are fire-and-forget: they must not block and their
//! failures are never reported back to the core.

use tokio::sync::broadcast;
use tracing::{debug, info};

/// Receives notifications from the relay core.
pub trait RelayObserver: Send + Sync {
    /// A human-readable log line.
    fn on_log(&self, text: &str);

    /// The full, sorted list of registered display names.
    fn on_roster_changed(&self, names: &[String]);

    /// The full, sorted subscriber list of one channel.
    fn on_channel_subscribers_changed(&self, channel: &str, names: &[String]);
}

/// Observer that writes every notification through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl RelayObserver for TracingObserver {
    fn on_log(&self, text: &str) {
        info!(target: "disucordd::relay", "{text}");
    }

    fn on_roster_changed(&self, names: &[String]) {
        debug!(clients = ?names, "Roster changed");
    }

    fn on_channel_subscribers_changed(&self, channel: &str, names: &[String]) {
        debug!(channel = %channel, subscribers = ?names, "Channel subscribers changed");
    }
}

/// A notification published by [`EventObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A log line
    Log(String),

    /// The registered names after a change
    RosterChanged(Vec<String>),

    /// A channel's subscribers after a change
    ChannelSubscribersChanged {
        channel: String,
        subscribers: Vec<String>,
    },
}

/// Observer that republishes notifications on a broadcast channel.
///
/// Sends never block; with no receivers the events are dropped.
#[derive(Debug, Clone)]
pub struct EventObserver {
    sender: broadcast::Sender<RelayEvent>,
}

impl EventObserver {
    /// Creates an observer with room for `capacity` buffered events per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.sender.subscribe()
    }
}

impl RelayObserver for EventObserver {
    fn on_log(&self, text: &str) {
        let _ = self.sender.send(RelayEvent::Log(text.to_string()));
    }

    fn on_roster_changed(&self, names: &[String]) {
        let _ = self.sender.send(RelayEvent::RosterChanged(names.to_vec()));
    }

    fn on_channel_subscribers_changed(&self, channel: &str, names: &[String]) {
        let _ = self.sender.send(RelayEvent::ChannelSubscribersChanged {
            channel: channel.to_string(),
            subscribers: names.to_vec(),
        });
    }
}
