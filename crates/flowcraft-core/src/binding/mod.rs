//! Two-way binding between local stores and the replicated document.
//!
//! The [`SyncEngine`] subscribes to every store and observes every document
//! container. Local store changes become `Local` document transactions;
//! remote document changes are written back into the stores while the
//! [`RemoteGuard`] is set, so they never echo into the document.
//!
//! Node drags are the hot path: position changes are buffered per node and
//! written in one batch when [`SyncEngine::poll`] finds the flush interval
//! has elapsed.

mod collection;
mod guard;
mod settings;

pub use guard::{RemoteGuard, RemoteScope};

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use kurbo::Point;

use crate::config::CollabConfig;
use crate::crdt::{
    ContainerKey, CrdtDocument, ObserverId, UpdateOrigin, entity_map, json_to_loro, write_edge,
    write_node, write_position,
};
use crate::error::{SyncError, SyncResult};
use crate::model::{AuxDocument, DiagramState, JsonMap};
use crate::store::{DiagramStores, Store, Subscription};
use crate::throttle::Throttle;

/// State shared by every binding of one engine.
pub(crate) struct EngineShared {
    pub doc: CrdtDocument,
    pub guard: RemoteGuard,
    pub positions: RefCell<Throttle<String, Point>>,
    closed: Cell<bool>,
}

impl EngineShared {
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

/// One installed binding: a store listener plus its document observers.
pub(crate) struct Binding {
    subscription: Subscription,
    observers: Vec<ObserverId>,
}

/// Keeps a set of [`DiagramStores`] and a [`CrdtDocument`] in sync.
pub struct SyncEngine {
    shared: Rc<EngineShared>,
    bindings: Vec<Binding>,
}

impl SyncEngine {
    /// Create an engine for `doc` with the given position flush interval.
    pub fn new(doc: CrdtDocument, position_flush: Duration) -> Self {
        Self {
            shared: Rc::new(EngineShared {
                doc,
                guard: RemoteGuard::new(),
                positions: RefCell::new(Throttle::new(position_flush)),
                closed: Cell::new(false),
            }),
            bindings: Vec::new(),
        }
    }

    pub fn from_config(doc: CrdtDocument, config: &CollabConfig) -> Self {
        Self::new(doc, config.position_flush_interval())
    }

    /// Create an engine and bind every store in `stores`.
    pub fn bind(doc: CrdtDocument, stores: &DiagramStores, config: &CollabConfig) -> SyncResult<Self> {
        let mut engine = Self::from_config(doc, config);
        engine.bind_stores(stores)?;
        Ok(engine)
    }

    pub fn document(&self) -> &CrdtDocument {
        &self.shared.doc
    }

    /// Handle to the remote-apply flag, for undo integration.
    pub fn remote_guard(&self) -> RemoteGuard {
        self.shared.guard.clone()
    }

    /// True while a remote change is being written into local stores.
    pub fn is_applying_remote(&self) -> bool {
        self.shared.guard.is_active()
    }

    pub fn is_bound(&self) -> bool {
        !self.shared.is_closed() && !self.bindings.is_empty()
    }

    /// Bind the primary store and all auxiliary stores.
    pub fn bind_stores(&mut self, stores: &DiagramStores) -> SyncResult<()> {
        self.bind_diagram(&stores.diagram);
        self.bind_settings(&stores.swimlanes)?;
        self.bind_settings(&stores.legends)?;
        self.bind_settings(&stores.banners)?;
        self.bind_settings(&stores.layers)?;
        self.bind_settings(&stores.styles)?;
        self.bind_settings(&stores.meta)?;
        Ok(())
    }

    /// Bind the node and edge collections of the primary store.
    pub fn bind_diagram(&mut self, store: &Store<DiagramState>) {
        self.bindings
            .push(collection::bind_diagram(&self.shared, store));
    }

    /// Bind one auxiliary store to its container.
    pub fn bind_settings<T: AuxDocument>(&mut self, store: &Store<T>) -> SyncResult<()> {
        let binding = settings::bind_aux(&self.shared, store)?;
        self.bindings.push(binding);
        Ok(())
    }

    /// Write the local stores into the document if it has no nodes yet.
    ///
    /// Returns whether seeding happened. A non-empty document is left
    /// untouched, and a settings container that already has entries is
    /// never overwritten.
    pub fn seed(&self, stores: &DiagramStores) -> SyncResult<bool> {
        if !self.shared.doc.is_empty() {
            log::debug!("Document already has content, skipping seed");
            return Ok(false);
        }

        let diagram = stores.diagram.snapshot();
        let aux: Vec<(ContainerKey, JsonMap)> = vec![
            settings_fields(&stores.swimlanes)?,
            settings_fields(&stores.legends)?,
            settings_fields(&stores.banners)?,
            settings_fields(&stores.layers)?,
            settings_fields(&stores.styles)?,
            settings_fields(&stores.meta)?,
        ];
        let aux: Vec<_> = aux
            .into_iter()
            .filter(|(key, _)| self.shared.doc.len(*key) == 0)
            .collect();

        self.shared.doc.transact(UpdateOrigin::Local, |txn| {
            let nodes = txn.map(ContainerKey::Nodes);
            for node in &diagram.nodes {
                write_node(&nodes, node)?;
            }
            let edges = txn.map(ContainerKey::Edges);
            for edge in &diagram.edges {
                write_edge(&edges, edge)?;
            }
            for (key, fields) in &aux {
                let container = txn.map(*key);
                for (field, value) in fields {
                    container.insert(field, json_to_loro(value))?;
                }
            }
            Ok(())
        })?;

        log::info!(
            "Seeded document with {} nodes and {} edges",
            diagram.nodes.len(),
            diagram.edges.len()
        );
        Ok(true)
    }

    /// Replace the local stores with what the document holds.
    ///
    /// Runs under the remote guard. Settings containers without entries
    /// leave their store alone.
    pub fn load(&self, stores: &DiagramStores) -> SyncResult<()> {
        let _scope = self.shared.guard.enter();
        let current = stores.diagram.snapshot();
        let nodes = collection::rebuild_from_document(&self.shared, &current.nodes);
        let edges = collection::rebuild_from_document(&self.shared, &current.edges);
        stores.diagram.update(|state| {
            state.nodes = nodes;
            state.edges = edges;
        });
        load_settings(&self.shared, &stores.swimlanes)?;
        load_settings(&self.shared, &stores.legends)?;
        load_settings(&self.shared, &stores.banners)?;
        load_settings(&self.shared, &stores.layers)?;
        load_settings(&self.shared, &stores.styles)?;
        load_settings(&self.shared, &stores.meta)?;
        Ok(())
    }

    /// Connect the stores to a document that has finished its initial sync.
    ///
    /// An empty document is seeded from the stores; otherwise the stores
    /// take the document's content. Either way the bindings are installed
    /// afterwards. Returns whether seeding happened.
    pub fn attach(&mut self, stores: &DiagramStores) -> SyncResult<bool> {
        let seeded = self.seed(stores)?;
        self.load(stores)?;
        self.bind_stores(stores)?;
        Ok(seeded)
    }

    /// Flush buffered positions if the flush interval has elapsed.
    /// Returns the number of positions written.
    pub fn poll(&self, now: Instant) -> SyncResult<usize> {
        let batch = self.shared.positions.borrow_mut().take_due(now);
        match batch {
            Some(batch) => self.write_positions(batch),
            None => Ok(0),
        }
    }

    /// Write every buffered position now.
    pub fn flush(&self) -> SyncResult<usize> {
        let batch = self.shared.positions.borrow_mut().take();
        self.write_positions(batch)
    }

    /// Positions still waiting to be written.
    pub fn pending_positions(&self) -> usize {
        self.shared.positions.borrow().iter().count()
    }

    /// When the buffered positions will be due, if any are pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.shared.positions.borrow().deadline()
    }

    fn write_positions(
        &self,
        batch: std::collections::BTreeMap<String, Point>,
    ) -> SyncResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        if self.shared.doc.is_destroyed() {
            return Err(SyncError::Unbound);
        }

        let written = self.shared.doc.transact(UpdateOrigin::Local, |txn| {
            let nodes = txn.map(ContainerKey::Nodes);
            let mut written = 0;
            for (id, position) in &batch {
                match entity_map(&nodes, id) {
                    Some(node) => {
                        write_position(&node, *position)?;
                        written += 1;
                    }
                    None => log::debug!("Dropping buffered position for removed node {}", id),
                }
            }
            Ok(written)
        })?;
        log::trace!("Flushed {} node position(s)", written);
        Ok(written)
    }

    /// Flush pending positions, then detach every binding.
    ///
    /// Safe to call more than once.
    pub fn unbind(&mut self) {
        if self.shared.is_closed() {
            return;
        }
        if !self.shared.doc.is_destroyed() {
            if let Err(e) = self.flush() {
                log::warn!("Failed to flush positions on unbind: {}", e);
            }
        }
        self.shared.closed.set(true);
        for binding in self.bindings.drain(..) {
            for observer in binding.observers {
                self.shared.doc.unobserve(observer);
            }
            binding.subscription.unsubscribe();
        }
        log::debug!("Sync engine unbound");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.unbind();
    }
}

fn settings_fields<T: AuxDocument>(store: &Store<T>) -> SyncResult<(ContainerKey, JsonMap)> {
    Ok((T::CONTAINER, store.with(settings::fields_of)?))
}

fn load_settings<T: AuxDocument>(shared: &EngineShared, store: &Store<T>) -> SyncResult<()> {
    if shared.doc.len(T::CONTAINER) == 0 {
        return Ok(());
    }
    let current = store.with(settings::fields_of)?;
    let value: T = settings::merge_from_document(shared, &current)?;
    if store.with(|existing| *existing != value) {
        store.set(value);
    }
    Ok(())
}
