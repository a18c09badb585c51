//! Flowcraft Core Library
//!
//! Peer-to-peer synchronization for collaborative diagrams: a replicated
//! document mirrored into local stores, presence for every peer in a room,
//! and the room lifecycle that ties them to a transport.

pub mod awareness;
pub mod binding;
pub mod config;
pub mod crdt;
pub mod error;
pub mod history;
pub mod model;
pub mod room;
pub mod session;
pub mod store;
pub mod throttle;
pub mod transport;

pub use awareness::{Awareness, AwarenessChange, AwarenessUpdate, PresencePatch, PresenceRecord};
pub use binding::{RemoteGuard, SyncEngine};
pub use config::CollabConfig;
pub use crdt::{ContainerKey, CrdtDocument, UpdateOrigin};
pub use error::{CollabError, CollabResult, ConfigError, DocumentError, SyncError, TransportError};
pub use history::{HistoryHook, UndoHistory};
pub use model::{AuxDocument, DiagramEdge, DiagramNode, DiagramState};
pub use room::{AddressBar, MemoryAddressBar, RoomId, extract_room_id};
pub use session::{CollabEvent, CollaborationSession, ConnectionStatus, JoinRequest};
pub use store::{DiagramStores, Store, Subscription};
pub use transport::{MemoryNetwork, Transport, TransportHandle, TransportOptions};
#[cfg(not(target_arch = "wasm32"))]
pub use transport::RelayTransport;
