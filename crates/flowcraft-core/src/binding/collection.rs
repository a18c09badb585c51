//! Binding between the entity collections of the primary store and their
//! containers in the document.
//!
//! Local changes are diffed by id against the last state the binding saw.
//! A changed `Rc` pointer is treated as an update, and only the fields that
//! actually differ are written. Node positions go through the shared position
//! buffer instead of the transaction.
//!
//! Remote changes rebuild the whole collection from the document, then lay
//! any buffered local positions back on top so an in-progress drag is not
//! snapped back to a stale remote value.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use std::time::Instant;

use kurbo::Point;
use loro::{LoroMap, LoroValue};
use serde_json::Value;

use super::{Binding, EngineShared};
use crate::crdt::{
    ContainerKey, DocumentEvent, ObserverId, Transaction, UpdateOrigin, edge_from_loro,
    edge_scalar_fields, entity_map, node_from_loro, node_scalar_fields, write_data_diff,
    write_edge, write_node, write_scalar,
};
use crate::error::DocumentResult;
use crate::model::{DiagramEdge, DiagramNode, DiagramState, Entity, JsonMap};
use crate::store::Store;

/// An entity type that lives in one keyed collection of [`DiagramState`].
pub(crate) trait SyncedEntity: Entity + 'static {
    const CONTAINER: ContainerKey;
    /// Whether position changes go through the shared position buffer.
    const BUFFERS_POSITION: bool = false;

    fn select(state: &DiagramState) -> &[Rc<Self>];
    fn replace(state: &mut DiagramState, items: Vec<Rc<Self>>);

    fn write_full(collection: &LoroMap, entity: &Self) -> DocumentResult<()>;
    fn scalar_fields(&self) -> Vec<(&'static str, Option<Value>)>;
    fn data(&self) -> &JsonMap;
    fn from_loro(key: &str, value: &LoroValue) -> Self;

    /// Position synced through the position buffer, if the entity has one.
    fn position(&self) -> Option<Point> {
        None
    }

    fn set_position(&mut self, _position: Point) {}
}

impl SyncedEntity for DiagramNode {
    const CONTAINER: ContainerKey = ContainerKey::Nodes;
    const BUFFERS_POSITION: bool = true;

    fn select(state: &DiagramState) -> &[Rc<Self>] {
        &state.nodes
    }

    fn replace(state: &mut DiagramState, items: Vec<Rc<Self>>) {
        state.nodes = items;
    }

    fn write_full(collection: &LoroMap, entity: &Self) -> DocumentResult<()> {
        write_node(collection, entity)
    }

    fn scalar_fields(&self) -> Vec<(&'static str, Option<Value>)> {
        node_scalar_fields(self)
    }

    fn data(&self) -> &JsonMap {
        &self.data
    }

    fn from_loro(key: &str, value: &LoroValue) -> Self {
        node_from_loro(key, value)
    }

    fn position(&self) -> Option<Point> {
        Some(self.position)
    }

    fn set_position(&mut self, position: Point) {
        self.position = position;
    }
}

impl SyncedEntity for DiagramEdge {
    const CONTAINER: ContainerKey = ContainerKey::Edges;

    fn select(state: &DiagramState) -> &[Rc<Self>] {
        &state.edges
    }

    fn replace(state: &mut DiagramState, items: Vec<Rc<Self>>) {
        state.edges = items;
    }

    fn write_full(collection: &LoroMap, entity: &Self) -> DocumentResult<()> {
        write_edge(collection, entity)
    }

    fn scalar_fields(&self) -> Vec<(&'static str, Option<Value>)> {
        edge_scalar_fields(self)
    }

    fn data(&self) -> &JsonMap {
        &self.data
    }

    fn from_loro(key: &str, value: &LoroValue) -> Self {
        edge_from_loro(key, value)
    }
}

/// Result of comparing two snapshots of one collection by id.
pub(crate) struct EntityDiff<'a, E> {
    pub added: Vec<&'a Rc<E>>,
    pub removed: Vec<String>,
    /// `(old, new)` pairs whose `Rc` pointer changed.
    pub updated: Vec<(&'a Rc<E>, &'a Rc<E>)>,
}

impl<E> EntityDiff<'_, E> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

pub(crate) fn diff_entities<'a, E: Entity>(old: &'a [Rc<E>], new: &'a [Rc<E>]) -> EntityDiff<'a, E> {
    let previous: HashMap<&str, &Rc<E>> = old.iter().map(|e| (e.id(), e)).collect();
    let current: HashSet<&str> = new.iter().map(|e| e.id()).collect();

    let mut diff = EntityDiff {
        added: Vec::new(),
        removed: Vec::new(),
        updated: Vec::new(),
    };
    for entity in new {
        match previous.get(entity.id()) {
            None => diff.added.push(entity),
            Some(prev) if !Rc::ptr_eq(prev, entity) => diff.updated.push((prev, entity)),
            Some(_) => {}
        }
    }
    for entity in old {
        if !current.contains(entity.id()) {
            diff.removed.push(entity.id().to_string());
        }
    }
    diff
}

/// Field-level changes of one updated entity.
struct FieldUpdate<'a, E> {
    old: &'a E,
    new: &'a E,
    scalars: Vec<(&'static str, Option<Value>)>,
    data_changed: bool,
}

/// Everything one collection needs written for a local change, after
/// positions have been moved to the buffer.
pub(crate) struct StagedChange<'a, E> {
    added: Vec<&'a Rc<E>>,
    removed: Vec<String>,
    updates: Vec<FieldUpdate<'a, E>>,
}

impl<E> StagedChange<'_, E> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updates.is_empty()
    }
}

/// Diff one collection, buffer its position changes and collect the
/// remaining writes.
pub(crate) fn stage_local_change<'a, E: SyncedEntity>(
    shared: &EngineShared,
    old: &'a [Rc<E>],
    new: &'a [Rc<E>],
    now: Instant,
) -> StagedChange<'a, E> {
    let diff = diff_entities(old, new);

    let mut moved = Vec::new();
    let mut updates = Vec::new();
    for &(old, new) in &diff.updated {
        if let (true, Some(from), Some(to)) = (E::BUFFERS_POSITION, old.position(), new.position()) {
            if from != to {
                moved.push((new.id().to_string(), to));
            }
        }
        let scalars: Vec<_> = old
            .scalar_fields()
            .into_iter()
            .zip(new.scalar_fields())
            .filter(|(before, after)| before.1 != after.1)
            .map(|(_, after)| after)
            .collect();
        let data_changed = old.data() != new.data();
        if !scalars.is_empty() || data_changed {
            updates.push(FieldUpdate {
                old: Rc::as_ref(old),
                new: Rc::as_ref(new),
                scalars,
                data_changed,
            });
        }
    }

    if E::BUFFERS_POSITION {
        let mut positions = shared.positions.borrow_mut();
        for id in &diff.removed {
            positions.remove(id);
        }
        for (id, position) in moved {
            positions.push(id, position, now);
        }
    }

    StagedChange {
        added: diff.added,
        removed: diff.removed,
        updates,
    }
}

/// Write a staged change into its container. Returns the number of
/// entities touched.
pub(crate) fn write_staged<E: SyncedEntity>(
    txn: &mut Transaction<'_>,
    change: &StagedChange<'_, E>,
) -> DocumentResult<usize> {
    if change.is_empty() {
        return Ok(0);
    }
    let collection = txn.map(E::CONTAINER);
    let mut touched = 0;
    for entity in &change.added {
        E::write_full(&collection, entity)?;
        touched += 1;
    }
    for id in &change.removed {
        collection.delete(id)?;
        touched += 1;
    }
    for update in &change.updates {
        match entity_map(&collection, update.new.id()) {
            Some(map) => {
                for (key, value) in &update.scalars {
                    write_scalar(&map, key, value.as_ref())?;
                }
                if update.data_changed {
                    write_data_diff(&map, update.old.data(), update.new.data())?;
                }
            }
            // Gone from the document but still present locally: write it back whole.
            None => E::write_full(&collection, update.new)?,
        }
        touched += 1;
    }
    log::debug!(
        "Synced {} local change(s) to {} (+{} -{} ~{})",
        touched,
        E::CONTAINER,
        change.added.len(),
        change.removed.len(),
        change.updates.len()
    );
    Ok(touched)
}

/// Push one notification of the primary store into the document.
///
/// Node and edge writes share one transaction. Returns the number of
/// entities touched through it.
pub(crate) fn write_local_change(
    shared: &EngineShared,
    previous: &DiagramState,
    current: &DiagramState,
    now: Instant,
) -> DocumentResult<usize> {
    let nodes = stage_local_change(shared, &previous.nodes, &current.nodes, now);
    let edges = stage_local_change(shared, &previous.edges, &current.edges, now);
    if nodes.is_empty() && edges.is_empty() {
        return Ok(0);
    }
    shared.doc.transact(UpdateOrigin::Local, |txn| {
        Ok(write_staged(txn, &nodes)? + write_staged(txn, &edges)?)
    })
}

/// Rebuild a collection from the document.
///
/// Entities keep the order they had in `current`; ids new to this peer are
/// appended in id order. An entity whose content is unchanged keeps its
/// existing `Rc`. Buffered positions override the stored ones.
pub(crate) fn rebuild_from_document<E: SyncedEntity>(
    shared: &EngineShared,
    current: &[Rc<E>],
) -> Vec<Rc<E>> {
    let mut stored: BTreeMap<String, E> = shared
        .doc
        .entities(E::CONTAINER)
        .into_iter()
        .map(|(key, value)| {
            let entity = E::from_loro(&key, &value);
            (key, entity)
        })
        .collect();

    if E::BUFFERS_POSITION {
        let positions = shared.positions.borrow();
        for (id, position) in positions.iter() {
            if let Some(entity) = stored.get_mut(id) {
                entity.set_position(*position);
            }
        }
    }

    let mut rebuilt = Vec::with_capacity(stored.len());
    for existing in current {
        if let Some(entity) = stored.remove(existing.id()) {
            if entity == **existing {
                rebuilt.push(Rc::clone(existing));
            } else {
                rebuilt.push(Rc::new(entity));
            }
        }
    }
    rebuilt.extend(stored.into_values().map(Rc::new));
    rebuilt
}

/// Install both directions of the binding for the primary store.
///
/// One store listener covers both collections; each collection has its own
/// document observer.
pub(crate) fn bind_diagram(shared: &Rc<EngineShared>, store: &Store<DiagramState>) -> Binding {
    let cache: Rc<RefCell<DiagramState>> = Rc::new(RefCell::new(store.snapshot()));

    let local_shared = Rc::clone(shared);
    let local_cache = Rc::clone(&cache);
    let subscription = store.subscribe(move |state: &DiagramState| {
        if local_shared.guard.is_active() || local_shared.is_closed() {
            return;
        }
        let previous = local_cache.borrow().clone();
        if let Err(e) = write_local_change(&local_shared, &previous, state, Instant::now()) {
            log::error!("Failed to sync local diagram change: {}", e);
        }
        *local_cache.borrow_mut() = state.clone();
    });

    let observers = vec![
        observe_collection::<DiagramNode>(shared, store, &cache),
        observe_collection::<DiagramEdge>(shared, store, &cache),
    ];

    Binding {
        subscription,
        observers,
    }
}

fn observe_collection<E: SyncedEntity>(
    shared: &Rc<EngineShared>,
    store: &Store<DiagramState>,
    cache: &Rc<RefCell<DiagramState>>,
) -> ObserverId {
    let remote_shared = Rc::clone(shared);
    let remote_store = store.clone();
    let cache = Rc::clone(cache);
    shared.doc.observe(E::CONTAINER, move |event: &DocumentEvent| {
        if event.origin == UpdateOrigin::Local || remote_shared.is_closed() {
            return;
        }
        let _scope = remote_shared.guard.enter();
        let current = E::select(&cache.borrow()).to_vec();
        let rebuilt = rebuild_from_document(&remote_shared, &current);
        log::trace!(
            "Applying remote {} change ({} entities)",
            E::CONTAINER,
            rebuilt.len()
        );
        E::replace(&mut cache.borrow_mut(), rebuilt.clone());
        remote_store.update(|state| E::replace(state, rebuilt));
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> Rc<DiagramNode> {
        Rc::new(DiagramNode::new(id, "shapeNode", Point::ZERO))
    }

    #[test]
    fn test_diff_by_reference() {
        let a = node("a");
        let b = node("b");
        let c = node("c");
        let old = vec![a.clone(), b.clone()];
        let b2 = Rc::new(DiagramNode::clone(&b));
        let new = vec![a.clone(), b2, c];

        let diff = diff_entities(&old, &new);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].id, "c");
        assert!(diff.removed.is_empty());
        // Equal content under a new pointer still counts as an update.
        assert_eq!(diff.updated.len(), 1);
        assert_eq!(diff.updated[0].1.id, "b");
    }

    #[test]
    fn test_diff_removed() {
        let old = vec![node("a"), node("b")];
        let new = vec![old[1].clone()];
        let diff = diff_entities(&old, &new);
        assert_eq!(diff.removed, vec!["a".to_string()]);
        assert!(diff.added.is_empty() && diff.updated.is_empty());
    }

    #[test]
    fn test_unchanged_is_empty() {
        let old = vec![node("a")];
        let new = old.clone();
        assert!(diff_entities(&old, &new).is_empty());
    }
}
