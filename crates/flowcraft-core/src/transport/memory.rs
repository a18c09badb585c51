//! In-process transport.
//!
//! Every peer that connects through the same [`MemoryNetwork`] value joins
//! the room for its topic. Nothing is delivered until [`MemoryNetwork::flush`]
//! (or a handle's `poll`) runs; a flush keeps exchanging document updates and
//! presence messages until no member has anything left to send.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use super::{SyncedCallback, Transport, TransportHandle, TransportOptions};
use crate::awareness::{Awareness, AwarenessUpdate};
use crate::crdt::{CrdtDocument, UpdateOrigin, VersionVector};
use crate::error::{TransportError, TransportResult};

/// Upper bound on exchange rounds in one flush.
const MAX_FLUSH_ROUNDS: usize = 64;

struct Member {
    conn: u64,
    doc: CrdtDocument,
    awareness: Awareness,
    /// Version of this member's document last delivered to each other member.
    delivered: HashMap<u64, VersionVector>,
    flushed: bool,
    severed: bool,
}

struct Room {
    password: Option<String>,
    max_peers: usize,
    members: Vec<Member>,
}

#[derive(Default)]
struct NetworkState {
    rooms: BTreeMap<String, Room>,
    next_conn: u64,
    unreachable: bool,
}

enum Delivery {
    Document { to: CrdtDocument, bytes: Vec<u8> },
    Presence { to: Awareness, update: AwarenessUpdate },
}

/// Shared in-process network. Cloning shares the same rooms.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Rc<RefCell<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `connect` fail as if no endpoint answered.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.borrow_mut().unreachable = unreachable;
    }

    /// Cut every connection of `topic`. Their handles report the loss on
    /// the next poll.
    pub fn sever(&self, topic: &str) {
        if let Some(room) = self.state.borrow_mut().rooms.get_mut(topic) {
            for member in &mut room.members {
                member.severed = true;
            }
        }
    }

    pub fn member_count(&self, topic: &str) -> usize {
        self.state
            .borrow()
            .rooms
            .get(topic)
            .map_or(0, |room| room.members.len())
    }

    pub fn has_room(&self, topic: &str) -> bool {
        self.state.borrow().rooms.contains_key(topic)
    }

    /// Deliver everything pending until the network is quiet. Returns the
    /// number of messages delivered.
    pub fn flush(&self) -> usize {
        let mut delivered = 0;
        for _ in 0..MAX_FLUSH_ROUNDS {
            let deliveries = self.collect_deliveries();
            if deliveries.is_empty() {
                break;
            }
            delivered += deliveries.len();
            for delivery in deliveries {
                match delivery {
                    Delivery::Document { to, bytes } => {
                        if let Err(e) = to.apply_update(&bytes, UpdateOrigin::Remote) {
                            log::warn!("Dropping document update: {}", e);
                        }
                    }
                    Delivery::Presence { to, update } => {
                        to.apply_remote(update);
                    }
                }
            }
        }

        let mut state = self.state.borrow_mut();
        for room in state.rooms.values_mut() {
            for member in room.members.iter_mut().filter(|m| !m.severed) {
                member.flushed = true;
            }
        }
        delivered
    }

    fn collect_deliveries(&self) -> Vec<Delivery> {
        let mut state = self.state.borrow_mut();
        let mut deliveries = Vec::new();
        for (topic, room) in state.rooms.iter_mut() {
            let targets: Vec<(u64, CrdtDocument, Awareness)> = room
                .members
                .iter()
                .filter(|m| !m.severed && !m.doc.is_destroyed())
                .map(|m| (m.conn, m.doc.clone(), m.awareness.clone()))
                .collect();

            for member in room.members.iter_mut() {
                if member.severed || member.doc.is_destroyed() {
                    continue;
                }
                let version = member.doc.version();
                let presence = member.awareness.take_outgoing();
                for (conn, doc, awareness) in &targets {
                    if *conn == member.conn {
                        continue;
                    }
                    let since = member.delivered.entry(*conn).or_default();
                    if *since != version {
                        match member.doc.export_updates(since) {
                            Ok(bytes) => {
                                deliveries.push(Delivery::Document {
                                    to: doc.clone(),
                                    bytes,
                                });
                                *since = version.clone();
                            }
                            Err(e) => log::warn!("Export failed in {}: {}", topic, e),
                        }
                    }
                    for update in &presence {
                        deliveries.push(Delivery::Presence {
                            to: awareness.clone(),
                            update: update.clone(),
                        });
                    }
                }
            }
        }
        deliveries
    }

    fn is_flushed(&self, topic: &str, conn: u64) -> bool {
        self.with_member(topic, conn, |m| m.flushed).unwrap_or(false)
    }

    fn is_severed(&self, topic: &str, conn: u64) -> bool {
        self.with_member(topic, conn, |m| m.severed).unwrap_or(true)
    }

    fn with_member<R>(&self, topic: &str, conn: u64, f: impl FnOnce(&Member) -> R) -> Option<R> {
        let state = self.state.borrow();
        let room = state.rooms.get(topic)?;
        room.members.iter().find(|m| m.conn == conn).map(f)
    }

    /// Remove a member and tell the others its presence is gone.
    fn leave(&self, topic: &str, conn: u64) {
        let (departed, others) = {
            let mut state = self.state.borrow_mut();
            let Some(room) = state.rooms.get_mut(topic) else {
                return;
            };
            let Some(index) = room.members.iter().position(|m| m.conn == conn) else {
                return;
            };
            let departed = room.members.remove(index);
            let others: Vec<Awareness> = room.members.iter().map(|m| m.awareness.clone()).collect();
            if room.members.is_empty() {
                state.rooms.remove(topic);
            }
            (departed, others)
        };

        let peer_id = departed.awareness.local_peer_id();
        for awareness in others {
            awareness.remove_peer(peer_id);
        }
        log::debug!("Connection {} left {}", conn, topic);
    }
}

impl Transport for MemoryNetwork {
    fn connect(
        &self,
        topic: &str,
        doc: &CrdtDocument,
        awareness: &Awareness,
        options: &TransportOptions,
    ) -> TransportResult<Box<dyn TransportHandle>> {
        let (conn, existing): (u64, Vec<Awareness>) = {
            let mut state = self.state.borrow_mut();
            if state.unreachable {
                return Err(TransportError::Unreachable(
                    "memory network is offline".to_string(),
                ));
            }
            let conn = state.next_conn;
            let room = state.rooms.entry(topic.to_string()).or_insert_with(|| Room {
                password: options.password.clone(),
                max_peers: options.max_peers,
                members: Vec::new(),
            });
            if room.password != options.password {
                return Err(TransportError::Rejected("password mismatch".to_string()));
            }
            let cap = room.max_peers.min(options.max_peers);
            if room.members.len() >= cap {
                return Err(TransportError::RoomFull(cap));
            }

            let existing = room.members.iter().map(|m| m.awareness.clone()).collect();
            room.members.push(Member {
                conn,
                doc: doc.clone(),
                awareness: awareness.clone(),
                delivered: HashMap::new(),
                flushed: false,
                severed: false,
            });
            state.next_conn += 1;
            log::debug!("Connection {} joined {}", conn, topic);
            (conn, existing)
        };

        // Exchange current presence so both sides see each other right away.
        for other in &existing {
            if let Some(update) = other.local_update() {
                awareness.apply_remote(update);
            }
            if let Some(update) = awareness.local_update() {
                other.apply_remote(update);
            }
        }

        Ok(Box::new(MemoryHandle {
            network: self.clone(),
            topic: topic.to_string(),
            conn,
            synced: false,
            callback: None,
            destroyed: false,
        }))
    }
}

struct MemoryHandle {
    network: MemoryNetwork,
    topic: String,
    conn: u64,
    synced: bool,
    callback: Option<SyncedCallback>,
    destroyed: bool,
}

impl TransportHandle for MemoryHandle {
    fn on_synced(&mut self, callback: SyncedCallback) {
        self.callback = Some(callback);
    }

    fn is_synced(&self) -> bool {
        self.synced
    }

    fn poll(&mut self) -> TransportResult<()> {
        if self.destroyed {
            return Ok(());
        }
        if self.network.is_severed(&self.topic, self.conn) {
            return Err(TransportError::Disconnected(format!(
                "connection to {} was severed",
                self.topic
            )));
        }
        self.network.flush();
        if !self.synced && self.network.is_flushed(&self.topic, self.conn) {
            self.synced = true;
            if let Some(callback) = self.callback.as_mut() {
                callback();
            }
        }
        Ok(())
    }

    fn peer_count(&self) -> usize {
        self.network.member_count(&self.topic).saturating_sub(1)
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if !self.network.is_severed(&self.topic, self.conn) {
            self.network.flush();
        }
        self.network.leave(&self.topic, self.conn);
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        self.destroy();
    }
}
