//! Error types for the collaboration engine.

use thiserror::Error;

/// Errors raised by the replicated document wrapper.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("CRDT error: {0}")]
    Crdt(#[from] loro::LoroError),
    #[error("Failed to encode document: {0}")]
    Encode(String),
    #[error("Document has been destroyed")]
    Destroyed,
}

/// Errors raised by a peer transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("No signaling endpoint reachable: {0}")]
    Unreachable(String),
    #[error("Room is full ({0} peers)")]
    RoomFull(usize),
    #[error("Room rejected the connection: {0}")]
    Rejected(String),
    #[error("Connection lost: {0}")]
    Disconnected(String),
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Errors raised while binding local stores to the document.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Sync engine is no longer bound")]
    Unbound,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced to the host application by the room lifecycle.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("Invalid room id: {0:?}")]
    InvalidRoomId(String),
    #[error("Not in a room")]
    NotInRoom,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for document operations.
pub type DocumentResult<T> = Result<T, DocumentError>;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type for binding operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for public collaboration operations.
pub type CollabResult<T> = Result<T, CollabError>;
