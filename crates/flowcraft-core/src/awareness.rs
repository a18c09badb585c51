//! Ephemeral per-peer presence: cursor, selection, display name and color.
//!
//! Presence is broadcast next to the document but is never part of its
//! history. Each peer owns exactly one [`PresenceRecord`] and stamps every
//! broadcast with a monotonically increasing clock, so receivers can drop
//! reordered or duplicated updates.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use kurbo::Point;
use serde::{Deserialize, Serialize};

use crate::store::Subscription;
use crate::throttle::Throttle;

/// Cursor and selection colors, assigned by `peer_id % PEER_COLORS.len()`.
pub const PEER_COLORS: &[&str] = &[
    "#e03131", "#2f9e44", "#1971c2", "#f08c00", "#9c36b5", "#0c8599", "#e8590c", "#5c940d",
];

/// Display name used until the host sets one.
pub const DEFAULT_DISPLAY_NAME: &str = "Anonymous";

pub fn color_for_peer(peer_id: u64) -> &'static str {
    PEER_COLORS[(peer_id % PEER_COLORS.len() as u64) as usize]
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One peer's presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub peer_id: u64,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub cursor: Option<Point>,
    #[serde(default)]
    pub selected_node_ids: Vec<String>,
    #[serde(default)]
    pub selected_edge_ids: Vec<String>,
    /// Unix millis of the owner's last change.
    pub last_active: u64,
}

impl PresenceRecord {
    pub fn new(peer_id: u64) -> Self {
        Self {
            peer_id,
            name: DEFAULT_DISPLAY_NAME.to_string(),
            color: color_for_peer(peer_id).to_string(),
            cursor: None,
            selected_node_ids: Vec::new(),
            selected_edge_ids: Vec::new(),
            last_active: unix_millis(),
        }
    }
}

/// Partial update of the local record. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresencePatch {
    pub name: Option<String>,
    pub color: Option<String>,
    pub cursor: Option<Option<Point>>,
    pub selected_node_ids: Option<Vec<String>>,
    pub selected_edge_ids: Option<Vec<String>>,
}

impl PresencePatch {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn cursor(mut self, cursor: Option<Point>) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn selection(mut self, nodes: Vec<String>, edges: Vec<String>) -> Self {
        self.selected_node_ids = Some(nodes);
        self.selected_edge_ids = Some(edges);
        self
    }

    fn apply(self, record: &mut PresenceRecord) {
        if let Some(name) = self.name {
            record.name = name;
        }
        if let Some(color) = self.color {
            record.color = color;
        }
        if let Some(cursor) = self.cursor {
            record.cursor = cursor;
        }
        if let Some(nodes) = self.selected_node_ids {
            record.selected_node_ids = nodes;
        }
        if let Some(edges) = self.selected_edge_ids {
            record.selected_edge_ids = edges;
        }
    }
}

/// Presence message exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AwarenessUpdate {
    /// Full record of one peer.
    Update { clock: u64, record: PresenceRecord },
    /// The peer's session ended.
    Remove { peer_id: u64, clock: u64 },
}

impl AwarenessUpdate {
    pub fn peer_id(&self) -> u64 {
        match self {
            AwarenessUpdate::Update { record, .. } => record.peer_id,
            AwarenessUpdate::Remove { peer_id, .. } => *peer_id,
        }
    }

    pub fn clock(&self) -> u64 {
        match self {
            AwarenessUpdate::Update { clock, .. } | AwarenessUpdate::Remove { clock, .. } => *clock,
        }
    }
}

/// Peers whose records changed in one notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

type ChangeListener = Rc<dyn Fn(&AwarenessChange)>;

struct AwarenessInner {
    local_peer_id: u64,
    states: RefCell<BTreeMap<u64, PresenceRecord>>,
    /// Highest clock seen per peer. Kept after removal so late updates stay dropped.
    clocks: RefCell<HashMap<u64, u64>>,
    /// Local unix millis at which each remote record was last received.
    received_at: RefCell<HashMap<u64, u64>>,
    listeners: RefCell<Vec<(u64, ChangeListener)>>,
    next_listener: Cell<u64>,
    outgoing: RefCell<Vec<AwarenessUpdate>>,
    cursor: RefCell<Throttle<(), Option<Point>>>,
    destroyed: Cell<bool>,
}

/// Presence state of one session. Cloning shares the same state.
#[derive(Clone)]
pub struct Awareness {
    inner: Rc<AwarenessInner>,
}

impl Awareness {
    pub fn new(local_peer_id: u64, cursor_flush: Duration) -> Self {
        Self {
            inner: Rc::new(AwarenessInner {
                local_peer_id,
                states: RefCell::new(BTreeMap::new()),
                clocks: RefCell::new(HashMap::new()),
                received_at: RefCell::new(HashMap::new()),
                listeners: RefCell::new(Vec::new()),
                next_listener: Cell::new(0),
                outgoing: RefCell::new(Vec::new()),
                cursor: RefCell::new(Throttle::new(cursor_flush)),
                destroyed: Cell::new(false),
            }),
        }
    }

    pub fn local_peer_id(&self) -> u64 {
        self.inner.local_peer_id
    }

    pub fn local_state(&self) -> Option<PresenceRecord> {
        self.inner
            .states
            .borrow()
            .get(&self.inner.local_peer_id)
            .cloned()
    }

    /// Remote records, ordered by peer id.
    pub fn peers(&self) -> Vec<PresenceRecord> {
        self.inner
            .states
            .borrow()
            .values()
            .filter(|record| record.peer_id != self.inner.local_peer_id)
            .cloned()
            .collect()
    }

    pub fn get(&self, peer_id: u64) -> Option<PresenceRecord> {
        self.inner.states.borrow().get(&peer_id).cloned()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }

    /// Merge `patch` into the local record and queue a broadcast.
    pub fn set_local_presence(&self, patch: PresencePatch) {
        if self.is_destroyed() {
            return;
        }
        let peer_id = self.inner.local_peer_id;
        let (record, added) = {
            let mut states = self.inner.states.borrow_mut();
            let added = !states.contains_key(&peer_id);
            let record = states
                .entry(peer_id)
                .or_insert_with(|| PresenceRecord::new(peer_id));
            patch.apply(record);
            record.last_active = unix_millis();
            (record.clone(), added)
        };
        let clock = self.bump_local_clock();
        self.inner
            .outgoing
            .borrow_mut()
            .push(AwarenessUpdate::Update { clock, record });

        let mut change = AwarenessChange::default();
        if added {
            change.added.push(peer_id);
        } else {
            change.updated.push(peer_id);
        }
        self.notify(&change);
    }

    pub fn set_local_display_name(&self, name: impl Into<String>) {
        self.set_local_presence(PresencePatch::default().name(name));
    }

    /// Buffer a cursor position. Only the latest value within one flush
    /// interval is broadcast, when [`Awareness::poll`] finds it due.
    pub fn broadcast_cursor(&self, position: Point, now: Instant) {
        if self.is_destroyed() {
            return;
        }
        self.inner.cursor.borrow_mut().push((), Some(position), now);
    }

    /// Cancel any buffered cursor and broadcast "no cursor" right away.
    pub fn clear_cursor(&self) {
        self.inner.cursor.borrow_mut().take();
        self.set_local_presence(PresencePatch::default().cursor(None));
    }

    /// Selections are broadcast immediately.
    pub fn broadcast_selection(&self, nodes: Vec<String>, edges: Vec<String>) {
        self.set_local_presence(PresencePatch::default().selection(nodes, edges));
    }

    /// Flush the buffered cursor if due. Returns whether a broadcast was queued.
    pub fn poll(&self, now: Instant) -> bool {
        let due = self.inner.cursor.borrow_mut().take_due(now);
        self.publish_cursor(due)
    }

    /// Flush the buffered cursor regardless of the deadline.
    pub fn flush(&self) -> bool {
        let pending = self.inner.cursor.borrow_mut().take();
        self.publish_cursor(Some(pending))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.cursor.borrow().deadline()
    }

    fn publish_cursor(&self, batch: Option<BTreeMap<(), Option<Point>>>) -> bool {
        match batch.and_then(|mut batch| batch.remove(&())) {
            Some(cursor) => {
                self.set_local_presence(PresencePatch::default().cursor(cursor));
                true
            }
            None => false,
        }
    }

    /// Apply a presence message from another peer.
    ///
    /// Messages about the local peer, and messages whose clock is not newer
    /// than the last one seen for that peer, are ignored. Returns whether the
    /// message changed anything.
    pub fn apply_remote(&self, update: AwarenessUpdate) -> bool {
        if self.is_destroyed() {
            return false;
        }
        let peer_id = update.peer_id();
        if peer_id == self.inner.local_peer_id {
            return false;
        }
        let clock = update.clock();
        {
            let mut clocks = self.inner.clocks.borrow_mut();
            match clocks.get(&peer_id) {
                Some(known) if *known >= clock => {
                    log::trace!("Dropping stale presence from {} ({} <= {})", peer_id, clock, known);
                    return false;
                }
                _ => {
                    clocks.insert(peer_id, clock);
                }
            }
        }

        let mut change = AwarenessChange::default();
        match update {
            AwarenessUpdate::Update { record, .. } => {
                let previous = self.inner.states.borrow_mut().insert(peer_id, record.clone());
                self.inner
                    .received_at
                    .borrow_mut()
                    .insert(peer_id, unix_millis());
                match previous {
                    None => change.added.push(peer_id),
                    Some(previous) if previous != record => change.updated.push(peer_id),
                    Some(_) => {}
                }
            }
            AwarenessUpdate::Remove { .. } => {
                if self.forget(peer_id) {
                    change.removed.push(peer_id);
                }
            }
        }

        if change.is_empty() {
            return false;
        }
        self.notify(&change);
        true
    }

    /// Drop a peer's record because its session ended.
    pub fn remove_peer(&self, peer_id: u64) -> bool {
        if peer_id == self.inner.local_peer_id || !self.forget(peer_id) {
            return false;
        }
        log::debug!("Removed presence of peer {}", peer_id);
        self.notify(&AwarenessChange {
            removed: vec![peer_id],
            ..Default::default()
        });
        true
    }

    /// Drop remote records with no activity for longer than `timeout_ms`.
    /// Returns the removed peer ids.
    pub fn prune_stale(&self, now_ms: u64, timeout_ms: u64) -> Vec<u64> {
        let stale: Vec<u64> = {
            let states = self.inner.states.borrow();
            let received = self.inner.received_at.borrow();
            states
                .values()
                .filter(|record| record.peer_id != self.inner.local_peer_id)
                .filter(|record| {
                    let seen = received
                        .get(&record.peer_id)
                        .copied()
                        .unwrap_or(0)
                        .max(record.last_active);
                    now_ms.saturating_sub(seen) > timeout_ms
                })
                .map(|record| record.peer_id)
                .collect()
        };
        for peer_id in &stale {
            self.forget(*peer_id);
        }
        if !stale.is_empty() {
            log::debug!("Pruned {} stale presence record(s)", stale.len());
            self.notify(&AwarenessChange {
                removed: stale.clone(),
                ..Default::default()
            });
        }
        stale
    }

    /// Re-broadcast the local record if it was last sent more than
    /// `max_age_ms` ago, so idle peers are not pruned by others.
    pub fn renew(&self, now_ms: u64, max_age_ms: u64) -> bool {
        let Some(local) = self.local_state() else {
            return false;
        };
        if now_ms.saturating_sub(local.last_active) <= max_age_ms {
            return false;
        }
        self.set_local_presence(PresencePatch::default());
        true
    }

    fn forget(&self, peer_id: u64) -> bool {
        self.inner.received_at.borrow_mut().remove(&peer_id);
        self.inner.states.borrow_mut().remove(&peer_id).is_some()
    }

    /// The local record as a message, for peers that just connected.
    pub fn local_update(&self) -> Option<AwarenessUpdate> {
        let record = self.local_state()?;
        let clock = self.local_clock();
        Some(AwarenessUpdate::Update { clock, record })
    }

    /// Messages queued for broadcast since the last call.
    pub fn take_outgoing(&self) -> Vec<AwarenessUpdate> {
        std::mem::take(&mut *self.inner.outgoing.borrow_mut())
    }

    /// Register a change listener. It is called once right away with every
    /// currently known peer reported as added.
    pub fn on_change(&self, listener: impl Fn(&AwarenessChange) + 'static) -> Subscription {
        let listener: ChangeListener = Rc::new(listener);
        let id = self.inner.next_listener.get();
        self.inner.next_listener.set(id + 1);
        self.inner
            .listeners
            .borrow_mut()
            .push((id, Rc::clone(&listener)));

        let initial = AwarenessChange {
            added: self.inner.states.borrow().keys().copied().collect(),
            ..Default::default()
        };
        listener(&initial);

        let weak: Weak<AwarenessInner> = Rc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.borrow_mut().retain(|(lid, _)| *lid != id);
            }
        })
    }

    /// Flush the buffered cursor, announce departure and stop accepting
    /// updates. Idempotent.
    pub fn destroy(&self) {
        if self.is_destroyed() {
            return;
        }
        self.flush();
        if self.local_state().is_some() {
            let clock = self.bump_local_clock();
            self.inner.outgoing.borrow_mut().push(AwarenessUpdate::Remove {
                peer_id: self.inner.local_peer_id,
                clock,
            });
        }
        self.inner.destroyed.set(true);
        self.inner.listeners.borrow_mut().clear();
        self.inner.states.borrow_mut().clear();
        self.inner.received_at.borrow_mut().clear();
    }

    fn local_clock(&self) -> u64 {
        self.inner
            .clocks
            .borrow()
            .get(&self.inner.local_peer_id)
            .copied()
            .unwrap_or(0)
    }

    fn bump_local_clock(&self) -> u64 {
        let clock = self.local_clock() + 1;
        self.inner
            .clocks
            .borrow_mut()
            .insert(self.inner.local_peer_id, clock);
        clock
    }

    fn notify(&self, change: &AwarenessChange) {
        let listeners: Vec<ChangeListener> = self
            .inner
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| Rc::clone(l))
            .collect();
        for listener in listeners {
            listener(change);
        }
    }
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awareness")
            .field("local_peer_id", &self.inner.local_peer_id)
            .field("peers", &self.inner.states.borrow().len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CURSOR: Duration = Duration::from_millis(50);

    #[test]
    fn test_color_from_palette() {
        assert_eq!(color_for_peer(0), PEER_COLORS[0]);
        assert_eq!(
            color_for_peer(PEER_COLORS.len() as u64 + 3),
            PEER_COLORS[3]
        );
        assert_eq!(PresenceRecord::new(9).color, color_for_peer(9));
    }

    #[test]
    fn test_set_local_presence_queues_broadcast() {
        let awareness = Awareness::new(1, CURSOR);
        awareness.set_local_display_name("Ada");
        awareness.broadcast_selection(vec!["n1".into()], vec![]);

        let out = awareness.take_outgoing();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].clock(), 1);
        assert_eq!(out[1].clock(), 2);
        match &out[1] {
            AwarenessUpdate::Update { record, .. } => {
                assert_eq!(record.name, "Ada");
                assert_eq!(record.selected_node_ids, vec!["n1".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cursor_coalesced() {
        let awareness = Awareness::new(1, CURSOR);
        let start = Instant::now();
        awareness.broadcast_cursor(Point::new(1.0, 1.0), start);
        awareness.broadcast_cursor(Point::new(2.0, 2.0), start + Duration::from_millis(10));
        assert!(awareness.take_outgoing().is_empty());

        assert!(!awareness.poll(start + Duration::from_millis(20)));
        assert!(awareness.poll(start + CURSOR));
        let out = awareness.take_outgoing();
        assert_eq!(out.len(), 1);
        match &out[0] {
            AwarenessUpdate::Update { record, .. } => {
                assert_eq!(record.cursor, Some(Point::new(2.0, 2.0)))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_clear_cursor_cancels_pending() {
        let awareness = Awareness::new(1, CURSOR);
        let start = Instant::now();
        awareness.broadcast_cursor(Point::new(1.0, 1.0), start);
        awareness.clear_cursor();
        assert!(!awareness.poll(start + CURSOR));
        assert_eq!(awareness.local_state().unwrap().cursor, None);
    }

    #[test]
    fn test_remote_updates_and_stale_clocks() {
        let awareness = Awareness::new(1, CURSOR);
        let changes = Rc::new(RefCell::new(Vec::new()));
        let sink = changes.clone();
        let _sub = awareness.on_change(move |change| sink.borrow_mut().push(change.clone()));

        let mut record = PresenceRecord::new(2);
        record.name = "Grace".into();
        assert!(awareness.apply_remote(AwarenessUpdate::Update {
            clock: 3,
            record: record.clone()
        }));
        record.name = "Old".into();
        assert!(!awareness.apply_remote(AwarenessUpdate::Update { clock: 2, record }));
        assert_eq!(awareness.get(2).unwrap().name, "Grace");

        assert!(awareness.remove_peer(2));
        assert!(awareness.peers().is_empty());

        let changes = changes.borrow();
        // Initial call, add, remove.
        assert_eq!(changes.len(), 3);
        assert!(changes[0].is_empty());
        assert_eq!(changes[1].added, vec![2]);
        assert_eq!(changes[2].removed, vec![2]);
    }

    #[test]
    fn test_on_change_initial_call_lists_known_peers() {
        let awareness = Awareness::new(1, CURSOR);
        awareness.set_local_display_name("me");
        awareness.apply_remote(AwarenessUpdate::Update {
            clock: 1,
            record: PresenceRecord::new(5),
        });
        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        let _sub = awareness.on_change(move |change| {
            sink.borrow_mut().get_or_insert_with(|| change.clone());
        });
        assert_eq!(seen.borrow().as_ref().unwrap().added, vec![1, 5]);
    }

    #[test]
    fn test_prune_stale() {
        let awareness = Awareness::new(1, CURSOR);
        let mut record = PresenceRecord::new(2);
        record.last_active = 1_000;
        awareness.apply_remote(AwarenessUpdate::Update { clock: 1, record });

        let now = unix_millis();
        assert!(awareness.prune_stale(now, 60_000).is_empty());
        assert_eq!(awareness.prune_stale(now + 60_001, 60_000), vec![2]);
        assert!(awareness.get(2).is_none());
    }

    #[test]
    fn test_renew_only_when_old() {
        let awareness = Awareness::new(1, CURSOR);
        assert!(!awareness.renew(unix_millis(), 1_000));
        awareness.set_local_display_name("me");
        awareness.take_outgoing();
        let sent = awareness.local_state().unwrap().last_active;
        assert!(!awareness.renew(sent + 500, 1_000));
        assert!(awareness.renew(sent + 1_001, 1_000));
        assert_eq!(awareness.take_outgoing().len(), 1);
    }

    #[test]
    fn test_destroy_announces_departure() {
        let awareness = Awareness::new(7, CURSOR);
        awareness.set_local_display_name("me");
        awareness.broadcast_cursor(Point::new(3.0, 4.0), Instant::now());
        awareness.take_outgoing();

        awareness.destroy();
        awareness.destroy();
        let out = awareness.take_outgoing();
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], AwarenessUpdate::Remove { peer_id: 7, .. }));
        assert!(awareness.local_state().is_none());
        awareness.set_local_display_name("ignored");
        assert!(awareness.take_outgoing().is_empty());
    }
}
