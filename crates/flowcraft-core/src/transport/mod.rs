//! Peer transports.
//!
//! A transport discovers the other peers of a topic and replicates the
//! document and awareness state between them. The session only needs to
//! connect, learn when the initial sync is done, pump it, and destroy it.
//!
//! Two implementations ship with the crate:
//! - [`MemoryNetwork`]: in-process delivery between peers that share one
//!   network value. Used by tests and by hosts that embed several peers.
//! - [`RelayTransport`]: WebSocket client for the `flowcraft-signal` relay
//!   (native targets only).

mod memory;
#[cfg(not(target_arch = "wasm32"))]
mod relay;

pub use memory::MemoryNetwork;
#[cfg(not(target_arch = "wasm32"))]
pub use relay::{ClientMessage, RelayTransport, ServerMessage};

use crate::awareness::Awareness;
use crate::crdt::CrdtDocument;
use crate::error::TransportResult;

/// Connection options passed through from the join request and config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub signaling_endpoints: Vec<String>,
    pub password: Option<String>,
    pub max_peers: usize,
}

/// Called once when the initial sync with the room has completed.
pub type SyncedCallback = Box<dyn FnMut()>;

/// Creates connections for a topic.
pub trait Transport {
    /// Start replicating `doc` and `awareness` with every peer on `topic`.
    fn connect(
        &self,
        topic: &str,
        doc: &CrdtDocument,
        awareness: &Awareness,
        options: &TransportOptions,
    ) -> TransportResult<Box<dyn TransportHandle>>;
}

/// A live connection to one topic.
pub trait TransportHandle {
    /// Register the synced callback. If the handle is already synced it
    /// fires on the next [`TransportHandle::poll`].
    fn on_synced(&mut self, callback: SyncedCallback);

    fn is_synced(&self) -> bool;

    /// Exchange pending document and presence updates. An error means the
    /// connection is lost.
    fn poll(&mut self) -> TransportResult<()>;

    /// Number of other peers currently connected to the topic.
    fn peer_count(&self) -> usize;

    /// Send anything still pending and disconnect. Idempotent.
    fn destroy(&mut self);
}
