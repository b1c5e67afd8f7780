//! Client connection seam: replies and fan-out leave the service through here.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::errors::StorageError;
use crate::types::{Binding, ConnectionId, MapHandle};

/// Storage-changed notification. A clear carries no key and no values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// Handle of the originating view when delivered back to the originator, otherwise `MapHandle::NONE`.
    pub source: MapHandle,
    pub key: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub url: String,
}

/// Messages the service sends to a client, addressed to one of its map handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    DidGetValues { seed: u64, items: HashMap<String, String> },
    DidSetItem { seed: u64, key: String, quota_exceeded: bool },
    DidRemoveItem { seed: u64, key: String },
    DidClear { seed: u64 },
    StorageEvent(StorageEvent),
    /// Stored contents were wiped administratively; drop any cached copy.
    CacheInvalidated,
}

/// A message bound for one listener binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub target: Binding,
    pub message: ClientMessage,
}

/// Transport capability for one client connection.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Fire-and-forget delivery to the client-side view `destination`.
    fn send(&self, destination: MapHandle, message: ClientMessage);

    /// The client broke the protocol; the transport should disconnect it.
    fn protocol_violation(&self, error: &StorageError) {
        debug!(connection = %self.id(), error = %error, "protocol violation ignored by transport");
    }
}

pub type ConnectionRef = Arc<dyn Connection>;

/// What a [`ChannelConnection`] forwards to its receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Message { destination: MapHandle, message: ClientMessage },
    Terminated { reason: String },
}

/// Connection backed by an unbounded tokio channel.
pub struct ChannelConnection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ChannelConnection {
    pub fn new(id: ConnectionId) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { id, tx }), rx)
    }
}

impl Connection for ChannelConnection {
    fn id(&self) -> ConnectionId { self.id }

    fn send(&self, destination: MapHandle, message: ClientMessage) {
        if self.tx.send(ConnectionEvent::Message { destination, message }).is_err() {
            debug!(connection = %self.id, %destination, "receiver dropped; message discarded");
        }
    }

    fn protocol_violation(&self, error: &StorageError) {
        if self.tx.send(ConnectionEvent::Terminated { reason: error.to_string() }).is_err() {
            debug!(connection = %self.id, error = %error, "receiver dropped; termination discarded");
        }
    }
}
