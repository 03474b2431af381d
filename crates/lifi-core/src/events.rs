//! Events published to dashboard clients
//!
//! The transport that carries these to browsers is not part of this crate;
//! [`EventSink`] is the seam, and [`BroadcastSink`] is an in-process fan-out
//! over `tokio::sync::broadcast` that a transport (or the console) subscribes to.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::LinkStatus;

/// Identity of one connected dashboard client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Fresh random identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event delivered to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// One line for the dashboard log console
    LogMessage(String),
    /// The link was opened, closed or replaced
    LinkStatus(LinkStatus),
}

impl Event {
    /// Shorthand for [`Event::LogMessage`]
    pub fn log(text: impl Into<String>) -> Self {
        Event::LogMessage(text.into())
    }
}

/// Who an event is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// Every connected client
    All,
    /// One client only
    Client(ClientId),
}

/// An event and who it is for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Recipients
    pub target: Target,
    /// Payload
    pub event: Event,
}

/// Receives events for delivery to dashboard clients
pub trait EventSink: Send + Sync {
    /// Hand one envelope to the transport
    fn publish(&self, envelope: Envelope);

    /// Fan out to every connected client
    fn broadcast(&self, event: Event) {
        self.publish(Envelope {
            target: Target::All,
            event,
        });
    }

    /// Deliver to one client only
    fn reply(&self, client: ClientId, event: Event) {
        self.publish(Envelope {
            target: Target::Client(client),
            event,
        });
    }
}

/// Default capacity of the broadcast ring
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// In-process fan-out of events to subscribed clients
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Envelope>,
}

impl BroadcastSink {
    /// Sink buffering up to `capacity` events per lagging subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Start receiving events on behalf of `client`
    pub fn subscribe(&self, client: ClientId) -> Subscription {
        Subscription {
            client,
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, envelope: Envelope) {
        tracing::trace!("publish {:?}", envelope);
        // Having nobody subscribed is not an error
        let _ = self.tx.send(envelope);
    }
}

/// One client's view of the event stream
#[derive(Debug)]
pub struct Subscription {
    client: ClientId,
    rx: broadcast::Receiver<Envelope>,
}

impl Subscription {
    /// Client this subscription delivers to
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Next event for this client; `None` once the sink is gone
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => {
                    if self.accepts(&envelope.target) {
                        return Some(envelope.event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("client {} lagged, {} events dropped", self.client, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) => {
                    if self.accepts(&envelope.target) {
                        return Some(envelope.event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("client {} lagged, {} events dropped", self.client, skipped);
                }
                Err(_) => return None,
            }
        }
    }

    fn accepts(&self, target: &Target) -> bool {
        match target {
            Target::All => true,
            Target::Client(id) => *id == self.client,
        }
    }
}
