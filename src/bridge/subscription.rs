//! Streaming subscriptions
//!
//! One [`ActiveSubscription`] per subscribed channel or pattern. Each owns the
//! open stream and a [`FrameReader`], and walks
//! `Requesting -> Subscribed -> Receiving -> Closed`. Closed subscriptions are
//! never reopened here; the caller subscribes again explicitly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use super::codec::{Command, Frame, FrameReader};
use super::error::TransportError;
use super::transport::StreamHandle;

/// Subscription identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    /// Create a new random SubscriptionId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a subscription stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionState {
    /// Stream requested, nothing received yet
    Requesting,
    /// Acknowledgment received
    Subscribed,
    /// At least one frame processed after the acknowledgment
    Receiving,
    /// Stream released; terminal
    Closed,
}

/// An open `SUBSCRIBE`/`PSUBSCRIBE` stream
#[derive(Debug)]
pub struct ActiveSubscription {
    id: SubscriptionId,
    remote: String,
    command: Command,
    state: SubscriptionState,
    reader: FrameReader,
    stream: StreamHandle,
    messages: u64,
}

impl ActiveSubscription {
    /// Track a stream that has just been requested.
    pub fn new(id: SubscriptionId, remote: &str, stream: StreamHandle) -> Self {
        Self {
            id,
            remote: remote.to_string(),
            command: Command::subscribe_for(remote),
            state: SubscriptionState::Requesting,
            reader: FrameReader::new(),
            stream,
            messages: 0,
        }
    }

    /// Subscription id
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Channel or pattern subscribed to
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Command that opened the stream
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Current state
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Number of message frames seen
    pub fn messages(&self) -> u64 {
        self.messages
    }

    /// Feed raw stream bytes; returns the message frames to route, in order.
    ///
    /// Acknowledgments only advance the state. Malformed frames are logged
    /// and skipped.
    pub fn on_chunk(&mut self, bytes: &[u8]) -> Vec<Frame> {
        if self.state == SubscriptionState::Closed {
            tracing::debug!(remote = %self.remote, "dropping data for closed subscription");
            return Vec::new();
        }

        let mut messages = Vec::new();
        for decoded in self.reader.push(bytes) {
            match decoded {
                Ok(frame) if frame.is_message() => {
                    self.state = SubscriptionState::Receiving;
                    self.messages += 1;
                    messages.push(frame);
                }
                Ok(frame) => {
                    if self.state == SubscriptionState::Requesting {
                        tracing::info!(
                            remote = %self.remote,
                            verb = self.command.verb(),
                            acknowledged = frame.route_name(),
                            "subscribed"
                        );
                        self.state = SubscriptionState::Subscribed;
                    }
                }
                Err(err) => {
                    tracing::warn!(remote = %self.remote, error = %err, "malformed frame dropped");
                    if self.state == SubscriptionState::Subscribed {
                        self.state = SubscriptionState::Receiving;
                    }
                }
            }
        }
        messages
    }

    /// Release the stream and enter `Closed`.
    pub fn close(&mut self) {
        if self.state != SubscriptionState::Closed {
            tracing::info!(remote = %self.remote, messages = self.messages, "subscription closed");
        }
        self.state = SubscriptionState::Closed;
        self.stream.close();
    }
}

/// All subscriptions owned by one engine, keyed by remote name
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    by_remote: HashMap<String, ActiveSubscription>,
    remotes: HashMap<SubscriptionId, String>,
}

impl SubscriptionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Live (not closed) subscription for `remote`, if any.
    pub fn get(&self, remote: &str) -> Option<&ActiveSubscription> {
        self.by_remote
            .get(remote)
            .filter(|sub| sub.state() != SubscriptionState::Closed)
    }

    /// State of the subscription for `remote`, including `Closed` ones.
    pub fn state(&self, remote: &str) -> Option<SubscriptionState> {
        self.by_remote.get(remote).map(ActiveSubscription::state)
    }

    /// Reuse the live subscription for `remote` or open a new one with `open`.
    ///
    /// Returns the subscription id and whether a new stream was opened.
    pub fn open_or_reuse<F>(&mut self, remote: &str, open: F) -> (SubscriptionId, bool)
    where
        F: FnOnce(SubscriptionId) -> StreamHandle,
    {
        if let Some(existing) = self.get(remote) {
            return (existing.id(), false);
        }

        let id = SubscriptionId::new();
        let subscription = ActiveSubscription::new(id, remote, open(id));
        if let Some(stale) = self.by_remote.insert(remote.to_string(), subscription) {
            self.remotes.remove(&stale.id());
        }
        self.remotes.insert(id, remote.to_string());
        (id, true)
    }

    /// Route raw bytes to the owning subscription.
    pub fn on_chunk(&mut self, id: SubscriptionId, bytes: &[u8]) -> Vec<Frame> {
        match self.lookup_mut(id) {
            Some(subscription) => subscription.on_chunk(bytes),
            None => {
                tracing::debug!(subscription = %id, "data for unknown subscription dropped");
                Vec::new()
            }
        }
    }

    /// Mark the subscription closed after its stream ended.
    pub fn on_ended(&mut self, id: SubscriptionId, reason: &TransportError) {
        if let Some(subscription) = self.lookup_mut(id) {
            if subscription.state() != SubscriptionState::Closed {
                tracing::warn!(remote = %subscription.remote(), error = %reason, "subscription stream ended");
            }
            subscription.close();
        }
    }

    /// Explicitly tear down the subscription for `remote`.
    pub fn close(&mut self, remote: &str) -> bool {
        match self.by_remote.get_mut(remote) {
            Some(subscription) if subscription.state() != SubscriptionState::Closed => {
                subscription.close();
                true
            }
            _ => false,
        }
    }

    /// Remote names with a live subscription.
    pub fn live(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .by_remote
            .values()
            .filter(|sub| sub.state() != SubscriptionState::Closed)
            .map(|sub| sub.remote().to_string())
            .collect();
        names.sort();
        names
    }

    fn lookup_mut(&mut self, id: SubscriptionId) -> Option<&mut ActiveSubscription> {
        let remote = self.remotes.get(&id)?;
        self.by_remote.get_mut(remote).filter(|sub| sub.id() == id)
    }
}
