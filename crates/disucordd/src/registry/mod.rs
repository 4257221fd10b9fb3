//! Client and channel registry.
//!
//! The registry is the only shared mutable state in the relay. It maps
//! display names to live sessions and channel names to subscriber sets,
//! and keeps the two in lockstep: a name in a channel's subscriber set is
//! always a key in the client map.
//!
//! # Locking
//!
//! ```text
//! ┌──────────────────────────┐      ┌──────────────────────────────┐
//! │ clients (RwLock)         │ ───▶ │ channels (RwLock)            │
//! │ name → SessionHandle     │      │ channel → {subscriber names} │
//! └──────────────────────────┘      └──────────────────────────────┘
//! ```
//!
//! Each map has its own lock. Any operation touching both acquires
//! `clients` first, then `channels`, and holds both before reading either.
//! Observer notifications are emitted while the locks are still held, so
//! observers always see snapshots in mutation order.
//!
//! Every operation on a missing name or unknown channel is a silent no-op.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::observer::RelayObserver;
use crate::server::{SessionHandle, SessionId};

type ClientMap = BTreeMap<String, SessionHandle>;
type ChannelMap = BTreeMap<String, BTreeSet<String>>;

/// Shared handle to the registry. Cheap to clone.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    clients: RwLock<ClientMap>,
    channels: RwLock<ChannelMap>,

    /// Channel names in configured order, restored on every reset
    startup_channels: Vec<String>,

    observer: Arc<dyn RelayObserver>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("channels", &self.inner.startup_channels)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Creates a registry with a fixed set of channels, all empty.
    pub fn new<I, S>(channels: I, observer: Arc<dyn RelayObserver>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut startup_channels: Vec<String> = Vec::new();
        for channel in channels {
            let channel = channel.into();
            if !startup_channels.contains(&channel) {
                startup_channels.push(channel);
            }
        }

        let channels = initial_channels(&startup_channels);
        Self {
            inner: Arc::new(RegistryInner {
                clients: RwLock::new(ClientMap::new()),
                channels: RwLock::new(channels),
                startup_channels,
                observer,
            }),
        }
    }

    /// The observer notified of every registry change.
    pub fn observer(&self) -> &Arc<dyn RelayObserver> {
        &self.inner.observer
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Registers `name` for `session`.
    ///
    /// Returns `false` without touching the registry if the name is taken.
    pub async fn add_client(&self, name: &str, session: SessionHandle) -> bool {
        let addr = session.addr();
        let mut clients = self.inner.clients.write().await;

        if clients.contains_key(name) {
            debug!(client = %name, %addr, "Rejecting duplicate name");
            self.log(&format!(
                "Connection attempt with taken username `{name}` from {addr}"
            ));
            return false;
        }

        clients.insert(name.to_string(), session);
        info!(client = %name, %addr, total_clients = clients.len(), "Client registered");

        self.log(&format!("New connection from {addr} as `{name}`"));
        self.notify_roster(&clients);
        true
    }

    /// Removes `name` from the client map and from every channel.
    ///
    /// Both steps run even if the name is missing from one of them.
    pub async fn remove_client(&self, name: &str) {
        self.remove(name, None).await;
    }

    /// Removes `name` only while it still belongs to session `id`.
    ///
    /// A session tearing down late must not evict a newer holder of the
    /// same name. Returns `true` if the entry was removed.
    pub async fn remove_session(&self, name: &str, id: SessionId) -> bool {
        self.remove(name, Some(id)).await
    }

    /// Subscribes a registered client to a known channel.
    ///
    /// Returns `true` if the client is now subscribed (including when it
    /// already was), `false` if the channel or client is unknown.
    pub async fn subscribe(&self, name: &str, channel: &str) -> bool {
        let clients = self.inner.clients.read().await;
        let mut channels = self.inner.channels.write().await;

        if !clients.contains_key(name) {
            debug!(client = %name, channel = %channel, "Subscribe from unregistered client ignored");
            return false;
        }

        let Some(subscribers) = channels.get_mut(channel) else {
            debug!(client = %name, channel = %channel, "Subscribe to unknown channel ignored");
            return false;
        };

        if subscribers.insert(name.to_string()) {
            debug!(client = %name, channel = %channel, "Client subscribed");
            self.log(&format!("`{name}` subscribed to {channel}"));
            self.notify_channel(channel, subscribers);
        }
        true
    }

    /// Unsubscribes a client from a channel.
    ///
    /// Returns `true` only if the client was subscribed.
    pub async fn unsubscribe(&self, name: &str, channel: &str) -> bool {
        let clients = self.inner.clients.read().await;
        let mut channels = self.inner.channels.write().await;

        if !clients.contains_key(name) {
            return false;
        }

        let Some(subscribers) = channels.get_mut(channel) else {
            return false;
        };

        if !subscribers.remove(name) {
            return false;
        }

        debug!(client = %name, channel = %channel, "Client unsubscribed");
        self.log(&format!("`{name}` unsubscribed from {channel}"));
        self.notify_channel(channel, subscribers);
        true
    }

    /// Clears every client and restores the startup channel set.
    pub async fn reset(&self) {
        let mut clients = self.inner.clients.write().await;
        let mut channels = self.inner.channels.write().await;

        let dropped = clients.len();
        clients.clear();
        *channels = initial_channels(&self.inner.startup_channels);

        info!(dropped_clients = dropped, "Registry reset");
        self.notify_roster(&clients);
        for (channel, subscribers) in channels.iter() {
            self.notify_channel(channel, subscribers);
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Registered display names, sorted.
    pub async fn client_names(&self) -> Vec<String> {
        self.inner.clients.read().await.keys().cloned().collect()
    }

    pub async fn client_count(&self) -> usize {
        self.inner.clients.read().await.len()
    }

    pub async fn contains_client(&self, name: &str) -> bool {
        self.inner.clients.read().await.contains_key(name)
    }

    /// Channel names in configured order.
    pub fn channel_names(&self) -> &[String] {
        &self.inner.startup_channels
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.inner.startup_channels.iter().any(|c| c == channel)
    }

    /// Sorted subscriber names of `channel`, or `None` if it is unknown.
    pub async fn subscribers(&self, channel: &str) -> Option<Vec<String>> {
        self.inner
            .channels
            .read()
            .await
            .get(channel)
            .map(|subscribers| subscribers.iter().cloned().collect())
    }

    /// Snapshot of every registered session.
    pub async fn sessions(&self) -> Vec<SessionHandle> {
        self.inner.clients.read().await.values().cloned().collect()
    }

    /// Live sessions subscribed to `channel`, or `None` if it is unknown.
    ///
    /// Subscriber names without a live session are skipped.
    pub async fn subscriber_sessions(&self, channel: &str) -> Option<Vec<SessionHandle>> {
        let clients = self.inner.clients.read().await;
        let channels = self.inner.channels.read().await;

        let subscribers = channels.get(channel)?;
        Some(
            subscribers
                .iter()
                .filter_map(|name| clients.get(name).cloned())
                .collect(),
        )
    }

    /// Returns `(channel, name)` pairs whose name is not a registered client.
    ///
    /// Always empty while the registry is consistent.
    pub async fn dangling_subscribers(&self) -> Vec<(String, String)> {
        let clients = self.inner.clients.read().await;
        let channels = self.inner.channels.read().await;

        let mut dangling = Vec::new();
        for (channel, subscribers) in channels.iter() {
            for name in subscribers {
                if !clients.contains_key(name) {
                    dangling.push((channel.clone(), name.clone()));
                }
            }
        }
        dangling
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn remove(&self, name: &str, expected: Option<SessionId>) -> bool {
        let mut clients = self.inner.clients.write().await;
        let mut channels = self.inner.channels.write().await;

        if let Some(id) = expected {
            match clients.get(name) {
                Some(session) if session.id() == id => {}
                _ => {
                    debug!(client = %name, session = %id, "Stale removal ignored");
                    return false;
                }
            }
        }

        let removed = clients.remove(name).is_some();

        let mut unsubscribed = false;
        for subscribers in channels.values_mut() {
            unsubscribed |= subscribers.remove(name);
        }

        if removed {
            info!(client = %name, total_clients = clients.len(), "Client removed");
            self.log(&format!("`{name}` disconnected."));
            self.notify_roster(&clients);
        }
        if removed || unsubscribed {
            for (channel, subscribers) in channels.iter() {
                self.notify_channel(channel, subscribers);
            }
        }

        removed
    }

    fn log(&self, text: &str) {
        self.inner.observer.on_log(text);
    }

    fn notify_roster(&self, clients: &ClientMap) {
        let names: Vec<String> = clients.keys().cloned().collect();
        self.inner.observer.on_roster_changed(&names);
    }

    fn notify_channel(&self, channel: &str, subscribers: &BTreeSet<String>) {
        let names: Vec<String> = subscribers.iter().cloned().collect();
        self.inner
            .observer
            .on_channel_subscribers_changed(channel, &names);
    }
}

fn initial_channels(names: &[String]) -> ChannelMap {
    names
        .iter()
        .map(|name| (name.clone(), BTreeSet::new()))
        .collect()
}
