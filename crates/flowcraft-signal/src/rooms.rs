//! Room registry.

use std::collections::HashSet;
use std::fmt;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tracing::debug;

use crate::protocol::ServerMessage;

const CHANNEL_CAPACITY: usize = 256;

/// A message tagged with the connection that sent it.
pub type Relayed = (String, ServerMessage);

/// Why a join was refused. The text is sent to the client; a full room
/// must mention "full".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    PasswordMismatch,
    Full(usize),
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::PasswordMismatch => f.write_str("Room password does not match"),
            JoinError::Full(cap) => write!(f, "Room is full ({} peers)", cap),
        }
    }
}

struct Room {
    tx: broadcast::Sender<Relayed>,
    peers: HashSet<String>,
    password: Option<String>,
    max_peers: usize,
}

impl Room {
    fn new(password: Option<String>, max_peers: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            peers: HashSet::new(),
            password,
            max_peers,
        }
    }
}

/// Shared application state
pub struct AppState {
    rooms: DashMap<String, Room>,
    max_room_peers: usize,
}

impl AppState {
    pub fn new(max_room_peers: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            max_room_peers,
        }
    }

    /// Add a connection to a room, creating the room if needed.
    ///
    /// The creator's password and peer limit stick to the room. Each joiner
    /// is held to the smallest of the room limit, its own request and the
    /// server cap. Returns the room receiver and the new peer count.
    pub fn join_room(
        &self,
        room_id: &str,
        conn_id: &str,
        password: Option<String>,
        max_peers: usize,
    ) -> Result<(broadcast::Receiver<Relayed>, usize), JoinError> {
        let max_peers = max_peers.min(self.max_room_peers).max(1);
        let mut room = match self.rooms.entry(room_id.to_string()) {
            Entry::Occupied(entry) => {
                let room = entry.into_ref();
                if room.password != password {
                    return Err(JoinError::PasswordMismatch);
                }
                let cap = room.max_peers.min(max_peers);
                if room.peers.len() >= cap {
                    return Err(JoinError::Full(cap));
                }
                room
            }
            Entry::Vacant(entry) => {
                debug!("Creating room {}", room_id);
                entry.insert(Room::new(password, max_peers))
            }
        };
        room.peers.insert(conn_id.to_string());
        Ok((room.tx.subscribe(), room.peers.len()))
    }

    /// Remove a connection, tell the rest of the room, and drop the room
    /// once it is empty.
    pub fn leave_room(&self, room_id: &str, conn_id: &str) {
        let empty = match self.rooms.get_mut(room_id) {
            Some(mut room) => {
                if !room.peers.remove(conn_id) {
                    return;
                }
                let _ = room.tx.send((
                    conn_id.to_string(),
                    ServerMessage::PeerLeft {
                        peer_id: conn_id.to_string(),
                    },
                ));
                room.peers.is_empty()
            }
            None => return,
        };
        if empty {
            self.rooms.remove_if(room_id, |_, room| room.peers.is_empty());
            debug!("Dropped empty room {}", room_id);
        }
    }

    /// Send to every receiver of the room. Receivers skip their own messages.
    pub fn broadcast(&self, room_id: &str, from: &str, msg: ServerMessage) {
        if let Some(room) = self.rooms.get(room_id) {
            let _ = room.tx.send((from.to_string(), msg));
        }
    }

    /// Ask the rest of the room to resend snapshots to a connection that
    /// missed relayed messages.
    pub fn request_resync(&self, room_id: &str, conn_id: &str) {
        self.broadcast(
            room_id,
            conn_id,
            ServerMessage::Resync {
                peer_id: conn_id.to_string(),
            },
        );
    }

    #[cfg(test)]
    pub fn peer_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, |room| room.peers.len())
    }

    #[cfg(test)]
    pub fn has_room(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }
}
