//! Room lifecycle: joining, leaving and refreshing a collaboration room.
//!
//! A [`CollaborationSession`] owns everything that lives for one room: the
//! replicated document, the awareness state, the sync engine and the
//! transport connection. Joining builds them in order; leaving tears them
//! down in reverse, flushing buffered writes first.
//!
//! The local stores are attached only after the transport reports its
//! initial sync. A peer that finds the room empty seeds it; a peer joining
//! a room with content takes that content instead of pushing its own.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

use kurbo::Point;

use crate::awareness::{Awareness, PresencePatch, PresenceRecord, color_for_peer, unix_millis};
use crate::binding::SyncEngine;
use crate::config::CollabConfig;
use crate::crdt::CrdtDocument;
use crate::error::{CollabError, CollabResult};
use crate::history::{HistoryHook, RemotePredicate};
use crate::room::{AddressBar, RoomId, clear_room_id, embed_room_id};
use crate::store::{DiagramStores, Subscription};
use crate::transport::{Transport, TransportHandle, TransportOptions};

/// Connection state shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Parameters for [`CollaborationSession::join_room`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub room_id: RoomId,
    pub user_name: String,
    pub password: Option<String>,
}

impl JoinRequest {
    pub fn new(room_id: RoomId, user_name: impl Into<String>) -> Self {
        Self {
            room_id,
            user_name: user_name.into(),
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// Notifications queued for the host, drained with
/// [`CollaborationSession::take_events`].
#[derive(Debug, Clone, PartialEq)]
pub enum CollabEvent {
    StatusChanged(ConnectionStatus),
    /// Initial sync with the room completed
    Synced,
    PeerJoined { peer_id: u64, name: String },
    PeerLeft { peer_id: u64, name: String },
}

type EventQueue = Rc<RefCell<Vec<CollabEvent>>>;

/// Everything that exists only while in a room.
struct ActiveRoom {
    request: JoinRequest,
    doc: CrdtDocument,
    awareness: Awareness,
    engine: SyncEngine,
    transport: Box<dyn TransportHandle>,
    synced: Rc<Cell<bool>>,
    /// Stores are seeded or loaded and bound.
    attached: bool,
    presence: Option<Subscription>,
}

/// Drives collaboration for one set of local stores.
pub struct CollaborationSession {
    config: CollabConfig,
    stores: DiagramStores,
    transport: Box<dyn Transport>,
    address_bar: Option<Rc<dyn AddressBar>>,
    history_hooks: Vec<Rc<dyn HistoryHook>>,
    room: Option<ActiveRoom>,
    status: ConnectionStatus,
    last_error: Option<String>,
    events: EventQueue,
}

impl CollaborationSession {
    pub fn new(
        config: CollabConfig,
        stores: DiagramStores,
        transport: impl Transport + 'static,
    ) -> CollabResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            stores,
            transport: Box::new(transport),
            address_bar: None,
            history_hooks: Vec::new(),
            room: None,
            status: ConnectionStatus::Disconnected,
            last_error: None,
            events: Rc::new(RefCell::new(Vec::new())),
        })
    }

    /// Keep the room id of the active room in `bar`.
    pub fn with_address_bar(mut self, bar: Rc<dyn AddressBar>) -> Self {
        self.address_bar = Some(bar);
        self
    }

    /// Register an undo/redo history that should skip remote changes.
    pub fn register_history_hook(&mut self, hook: Rc<dyn HistoryHook>) {
        if let Some(room) = &self.room {
            hook.set_remote_predicate(Some(remote_predicate(&room.engine)));
        }
        self.history_hooks.push(hook);
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn stores(&self) -> &DiagramStores {
        &self.stores
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room.as_ref().map(|room| &room.request.room_id)
    }

    /// True while in a room that has not failed.
    pub fn is_collaborating(&self) -> bool {
        self.room.is_some()
            && matches!(
                self.status,
                ConnectionStatus::Connecting | ConnectionStatus::Connected
            )
    }

    /// True while a remote change is being written into the local stores.
    pub fn is_applying_remote_update(&self) -> bool {
        self.room
            .as_ref()
            .is_some_and(|room| room.engine.is_applying_remote())
    }

    pub fn document(&self) -> Option<&CrdtDocument> {
        self.room.as_ref().map(|room| &room.doc)
    }

    /// Presence of the other peers in the room.
    pub fn peers(&self) -> Vec<PresenceRecord> {
        self.room
            .as_ref()
            .map(|room| room.awareness.peers())
            .unwrap_or_default()
    }

    pub fn local_presence(&self) -> Option<PresenceRecord> {
        self.room.as_ref().and_then(|room| room.awareness.local_state())
    }

    pub fn take_events(&mut self) -> Vec<CollabEvent> {
        std::mem::take(&mut *self.events.borrow_mut())
    }

    /// Earliest time a buffered position or cursor becomes due.
    pub fn next_deadline(&self) -> Option<Instant> {
        let room = self.room.as_ref()?;
        match (room.engine.next_deadline(), room.awareness.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            log::info!("Collaboration status: {:?} -> {:?}", self.status, status);
            self.status = status;
            self.events
                .borrow_mut()
                .push(CollabEvent::StatusChanged(status));
        }
    }

    fn fail(&mut self, error: &CollabError) {
        log::error!("Collaboration failed: {}", error);
        self.last_error = Some(error.to_string());
        self.set_status(ConnectionStatus::Error);
    }

    // --- Lifecycle ---

    /// Join a room, leaving the current one first.
    ///
    /// On failure the session is left with status `Error` and no room.
    /// Seeding waits for the transport's initial sync, see [`SyncEngine::attach`].
    pub fn join_room(&mut self, request: JoinRequest) -> CollabResult<()> {
        self.leave_room();
        self.last_error = None;
        self.set_status(ConnectionStatus::Connecting);

        let room = match self.open_room(request) {
            Ok(room) => room,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        let predicate = remote_predicate(&room.engine);
        for hook in &self.history_hooks {
            hook.set_remote_predicate(Some(Rc::clone(&predicate)));
        }
        if let Some(bar) = &self.address_bar {
            bar.replace(embed_room_id(&bar.current(), &room.request.room_id));
        }
        log::info!("Joined room {}", room.request.room_id);
        self.room = Some(room);

        self.pump_transport()
    }

    fn open_room(&self, request: JoinRequest) -> CollabResult<ActiveRoom> {
        let doc = CrdtDocument::new();
        let awareness = Awareness::new(doc.peer_id(), self.config.cursor_flush_interval());
        match self.connect_room(request, &doc, &awareness) {
            Ok(room) => Ok(room),
            Err(e) => {
                awareness.destroy();
                doc.destroy();
                Err(e)
            }
        }
    }

    fn connect_room(
        &self,
        request: JoinRequest,
        doc: &CrdtDocument,
        awareness: &Awareness,
    ) -> CollabResult<ActiveRoom> {
        let engine = SyncEngine::from_config(doc.clone(), &self.config);

        let topic = self.config.topic_for(request.room_id.as_str());
        let options = TransportOptions {
            signaling_endpoints: self.config.signaling_endpoints.clone(),
            password: request.password.clone(),
            max_peers: self.config.max_peers,
        };
        let mut transport = self.transport.connect(&topic, doc, awareness, &options)?;

        awareness.set_local_presence(
            PresencePatch::default()
                .name(request.user_name.clone())
                .color(color_for_peer(awareness.local_peer_id())),
        );
        let presence = Some(watch_presence(awareness, &self.events));

        let synced = Rc::new(Cell::new(false));
        let flag = Rc::clone(&synced);
        transport.on_synced(Box::new(move || flag.set(true)));

        Ok(ActiveRoom {
            request,
            doc: doc.clone(),
            awareness: awareness.clone(),
            engine,
            transport,
            synced,
            attached: false,
            presence,
        })
    }

    /// Tear down the current room. Safe to call at any time.
    pub fn leave_room(&mut self) {
        if let Some(mut room) = self.room.take() {
            room.engine.unbind();
            room.presence = None;
            room.awareness.destroy();
            for hook in &self.history_hooks {
                hook.set_remote_predicate(None);
            }
            room.transport.destroy();
            room.doc.destroy();
            if let Some(bar) = &self.address_bar {
                bar.replace(clear_room_id(&bar.current()));
            }
            log::info!("Left room {}", room.request.room_id);
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Move to a fresh room with the same user, password and local state.
    pub fn refresh_room(&mut self) -> CollabResult<RoomId> {
        let previous = self
            .room
            .as_ref()
            .map(|room| room.request.clone())
            .ok_or(CollabError::NotInRoom)?;
        let room_id = RoomId::generate();
        self.join_room(JoinRequest {
            room_id: room_id.clone(),
            ..previous
        })?;
        Ok(room_id)
    }

    /// Flush due buffers, keep presence fresh and exchange updates.
    ///
    /// Transport loss moves the session to `Error`; the room stays in place
    /// until [`CollaborationSession::leave_room`].
    pub fn poll(&mut self, now: Instant) {
        let Some(room) = &self.room else {
            return;
        };
        if let Err(e) = room.engine.poll(now) {
            log::warn!("Position flush failed: {}", e);
        }
        room.awareness.poll(now);
        let now_ms = unix_millis();
        room.awareness
            .renew(now_ms, self.config.presence_timeout_ms / 2);
        room.awareness
            .prune_stale(now_ms, self.config.presence_timeout_ms);

        if let Err(e) = self.pump_transport() {
            log::debug!("Transport poll failed: {}", e);
        }
    }

    fn pump_transport(&mut self) -> CollabResult<()> {
        let Some(room) = self.room.as_mut() else {
            return Err(CollabError::NotInRoom);
        };
        if self.status == ConnectionStatus::Error {
            return Ok(());
        }
        if let Err(e) = room.transport.poll() {
            let error = CollabError::from(e);
            self.fail(&error);
            return Err(error);
        }
        if room.synced.get() && !room.attached {
            match room.engine.attach(&self.stores) {
                Ok(seeded) => {
                    room.attached = true;
                    log::debug!(
                        "Attached stores to {} ({})",
                        room.request.room_id,
                        if seeded { "seeded" } else { "loaded" }
                    );
                }
                Err(e) => {
                    let error = CollabError::from(e);
                    self.fail(&error);
                    return Err(error);
                }
            }
        }
        if room.synced.get() && self.status == ConnectionStatus::Connecting {
            self.set_status(ConnectionStatus::Connected);
            self.events.borrow_mut().push(CollabEvent::Synced);
        }
        Ok(())
    }

    // --- Presence ---

    pub fn set_local_display_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        if let Some(room) = self.room.as_mut() {
            room.request.user_name = name.clone();
            room.awareness.set_local_display_name(name);
        }
    }

    /// Buffered; sent on the next poll after the cursor interval.
    pub fn broadcast_cursor(&self, position: Point, now: Instant) {
        if let Some(room) = &self.room {
            room.awareness.broadcast_cursor(position, now);
        }
    }

    pub fn clear_cursor(&self) {
        if let Some(room) = &self.room {
            room.awareness.clear_cursor();
        }
    }

    pub fn broadcast_selection(&self, nodes: Vec<String>, edges: Vec<String>) {
        if let Some(room) = &self.room {
            room.awareness.broadcast_selection(nodes, edges);
        }
    }
}

impl Drop for CollaborationSession {
    fn drop(&mut self) {
        self.leave_room();
    }
}

fn remote_predicate(engine: &SyncEngine) -> RemotePredicate {
    let guard = engine.remote_guard();
    Rc::new(move || guard.is_active())
}

/// Translate awareness changes into join/leave events for the host.
fn watch_presence(awareness: &Awareness, events: &EventQueue) -> Subscription {
    let names: Rc<RefCell<BTreeMap<u64, String>>> = Rc::new(RefCell::new(BTreeMap::new()));
    let local = awareness.local_peer_id();
    let handle = awareness.clone();
    let events = Rc::clone(events);
    awareness.on_change(move |change| {
        for peer_id in change.added.iter().chain(&change.updated) {
            if *peer_id == local {
                continue;
            }
            let Some(record) = handle.get(*peer_id) else {
                continue;
            };
            let previous = names.borrow_mut().insert(*peer_id, record.name.clone());
            if previous.is_none() {
                events.borrow_mut().push(CollabEvent::PeerJoined {
                    peer_id: *peer_id,
                    name: record.name,
                });
            }
        }
        for peer_id in &change.removed {
            if let Some(name) = names.borrow_mut().remove(peer_id) {
                events.borrow_mut().push(CollabEvent::PeerLeft {
                    peer_id: *peer_id,
                    name,
                });
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::model::{DiagramNode, DiagramState};
    use crate::room::MemoryAddressBar;
    use crate::transport::MemoryNetwork;

    const ROOM: &str = "00112233445566778899aabbccddeeff";

    fn session(network: &MemoryNetwork, stores: DiagramStores) -> CollaborationSession {
        CollaborationSession::new(CollabConfig::default(), stores, network.clone()).unwrap()
    }

    fn request(name: &str) -> JoinRequest {
        JoinRequest::new(RoomId::parse(ROOM).unwrap(), name)
    }

    #[test]
    fn test_join_connects_and_seeds() {
        let network = MemoryNetwork::new();
        let stores = DiagramStores::new(DiagramState::new(
            vec![DiagramNode::new("n1", "shapeNode", Point::ZERO)],
            vec![],
        ));
        let mut a = session(&network, stores);
        a.join_room(request("Ada")).unwrap();

        assert_eq!(a.status(), ConnectionStatus::Connected);
        assert!(a.is_collaborating());
        assert_eq!(a.room_id().unwrap().as_str(), ROOM);
        assert_eq!(
            a.document().unwrap().len(crate::crdt::ContainerKey::Nodes),
            1
        );
        let events = a.take_events();
        assert_eq!(
            events,
            vec![
                CollabEvent::StatusChanged(ConnectionStatus::Connecting),
                CollabEvent::StatusChanged(ConnectionStatus::Connected),
                CollabEvent::Synced,
            ]
        );
    }

    #[test]
    fn test_join_failure_sets_error() {
        let network = MemoryNetwork::new();
        network.set_unreachable(true);
        let mut a = session(&network, DiagramStores::default());
        let err = a.join_room(request("Ada")).unwrap_err();
        assert!(matches!(
            err,
            CollabError::Transport(TransportError::Unreachable(_))
        ));
        assert_eq!(a.status(), ConnectionStatus::Error);
        assert!(!a.is_collaborating());
        assert!(a.last_error().is_some());
        assert!(a.room_id().is_none());
    }

    #[test]
    fn test_leave_is_idempotent_and_clears_address() {
        let network = MemoryNetwork::new();
        let bar = Rc::new(MemoryAddressBar::new("https://app.example/edit"));
        let mut a = session(&network, DiagramStores::default()).with_address_bar(bar.clone());
        a.join_room(request("Ada")).unwrap();
        assert!(bar.current().contains(ROOM));
        let doc = a.document().unwrap().clone();

        a.leave_room();
        a.leave_room();
        assert_eq!(a.status(), ConnectionStatus::Disconnected);
        assert!(doc.is_destroyed());
        assert_eq!(bar.current(), "https://app.example/edit");
        assert!(!network.has_room(&a.config().topic_for(ROOM)));
    }

    #[test]
    fn test_refresh_moves_to_new_room() {
        let network = MemoryNetwork::new();
        let stores = DiagramStores::new(DiagramState::new(
            vec![DiagramNode::new("n1", "shapeNode", Point::ZERO)],
            vec![],
        ));
        let mut a = session(&network, stores);
        assert!(matches!(a.refresh_room(), Err(CollabError::NotInRoom)));
        a.join_room(request("Ada").with_password("pw")).unwrap();

        let new_id = a.refresh_room().unwrap();
        assert_ne!(new_id.as_str(), ROOM);
        assert_eq!(a.room_id(), Some(&new_id));
        assert_eq!(a.local_presence().unwrap().name, "Ada");
        assert_eq!(
            a.document().unwrap().len(crate::crdt::ContainerKey::Nodes),
            1
        );
        assert!(!network.has_room(&a.config().topic_for(ROOM)));
    }

    #[test]
    fn test_transport_loss_sets_error() {
        let network = MemoryNetwork::new();
        let mut a = session(&network, DiagramStores::default());
        a.join_room(request("Ada")).unwrap();
        network.sever(&a.config().topic_for(ROOM));
        a.poll(Instant::now());
        assert_eq!(a.status(), ConnectionStatus::Error);
        assert!(a.last_error().is_some());
        a.leave_room();
        assert_eq!(a.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_history_hook_predicate_installed() {
        struct Recorder(RefCell<Option<RemotePredicate>>);
        impl HistoryHook for Recorder {
            fn set_remote_predicate(&self, predicate: Option<RemotePredicate>) {
                *self.0.borrow_mut() = predicate;
            }
        }

        let network = MemoryNetwork::new();
        let hook = Rc::new(Recorder(RefCell::new(None)));
        let mut a = session(&network, DiagramStores::default());
        a.register_history_hook(hook.clone());
        a.join_room(request("Ada")).unwrap();
        let predicate = hook.0.borrow().clone().unwrap();
        assert!(!predicate());
        a.leave_room();
        assert!(hook.0.borrow().is_none());
    }
}
