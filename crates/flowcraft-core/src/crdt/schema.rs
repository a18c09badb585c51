//! Loro document schema, origin-tagged transactions and change observers.

use loro::event::DiffEvent;
use loro::{ContainerID, ExportMode, LoroDoc, LoroMap, LoroValue, Subscription, VersionVector};
use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use crate::error::{DocumentError, DocumentResult};

/// Named top-level containers of the diagram document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContainerKey {
    Nodes,
    Edges,
    Swimlanes,
    Legends,
    Banners,
    Layers,
    Styles,
    Meta,
}

impl ContainerKey {
    pub const ALL: [ContainerKey; 8] = [
        ContainerKey::Nodes,
        ContainerKey::Edges,
        ContainerKey::Swimlanes,
        ContainerKey::Legends,
        ContainerKey::Banners,
        ContainerKey::Layers,
        ContainerKey::Styles,
        ContainerKey::Meta,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContainerKey::Nodes => "nodes",
            ContainerKey::Edges => "edges",
            ContainerKey::Swimlanes => "swimlanes",
            ContainerKey::Legends => "legends",
            ContainerKey::Banners => "banners",
            ContainerKey::Layers => "layers",
            ContainerKey::Styles => "styles",
            ContainerKey::Meta => "meta",
        }
    }
}

impl std::fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a batch of document changes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOrigin {
    /// Written by this process from its local stores.
    Local,
    /// Imported from another peer.
    Remote,
}

impl UpdateOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateOrigin::Local => "local",
            UpdateOrigin::Remote => "remote",
        }
    }
}

impl std::fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification that one container changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentEvent {
    pub container: ContainerKey,
    pub origin: UpdateOrigin,
}

/// Handle returned by [`CrdtDocument::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Rc<dyn Fn(&DocumentEvent)>;

/// Root containers named in Loro's change events since the last drain.
type ChangedRoots = Arc<Mutex<BTreeSet<ContainerKey>>>;

struct DocInner {
    doc: LoroDoc,
    changed: ChangedRoots,
    _changes: Subscription,
    observers: RefCell<Vec<(ObserverId, ContainerKey, Observer)>>,
    next_observer: Cell<u64>,
    transactions: Cell<u64>,
    destroyed: Cell<bool>,
}

/// A CRDT-backed diagram document.
///
/// Cloning is cheap and shares the same underlying `LoroDoc`, so the binding
/// engine, the transport and the session can all hold a handle.
#[derive(Clone)]
pub struct CrdtDocument {
    inner: Rc<DocInner>,
}

/// Write access to the document inside [`CrdtDocument::transact`].
///
/// Every container touched through [`Transaction::map`] is reported to its
/// observers once the transaction commits.
pub struct Transaction<'a> {
    doc: &'a LoroDoc,
    touched: BTreeSet<ContainerKey>,
}

impl Transaction<'_> {
    /// Get a container for writing.
    pub fn map(&mut self, key: ContainerKey) -> LoroMap {
        self.touched.insert(key);
        self.doc.get_map(key.as_str())
    }
}

impl CrdtDocument {
    /// Create a new empty document with a random peer id.
    pub fn new() -> Self {
        Self::from_loro(LoroDoc::new())
    }

    /// Create a document with a fixed peer id.
    pub fn with_peer_id(peer_id: u64) -> DocumentResult<Self> {
        let doc = LoroDoc::new();
        doc.set_peer_id(peer_id)?;
        Ok(Self::from_loro(doc))
    }

    /// Create a document from a snapshot.
    pub fn from_snapshot(bytes: &[u8]) -> DocumentResult<Self> {
        let doc = LoroDoc::new();
        doc.import(bytes)?;
        Ok(Self::from_loro(doc))
    }

    fn from_loro(doc: LoroDoc) -> Self {
        let changed: ChangedRoots = Arc::default();
        let sink = Arc::clone(&changed);
        let changes = doc.subscribe_root(Arc::new(move |event: DiffEvent<'_>| {
            let Ok(mut roots) = sink.lock() else {
                return;
            };
            for diff in &event.events {
                let root = diff.path.first().map_or(diff.target, |(id, _)| id);
                if let ContainerID::Root { name, .. } = root {
                    if let Some(key) = ContainerKey::from_name(name) {
                        roots.insert(key);
                    }
                }
            }
        }));
        Self {
            inner: Rc::new(DocInner {
                doc,
                changed,
                _changes: changes,
                observers: RefCell::new(Vec::new()),
                next_observer: Cell::new(0),
                transactions: Cell::new(0),
                destroyed: Cell::new(false),
            }),
        }
    }

    /// Peer id of this replica.
    pub fn peer_id(&self) -> u64 {
        self.inner.doc.peer_id()
    }

    /// Get the underlying LoroDoc.
    pub fn loro_doc(&self) -> &LoroDoc {
        &self.inner.doc
    }

    /// Read-only access to a container.
    pub fn container(&self, key: ContainerKey) -> LoroMap {
        self.inner.doc.get_map(key.as_str())
    }

    /// Number of entries in a container.
    pub fn len(&self, key: ContainerKey) -> usize {
        self.container(key).len()
    }

    /// True when the node collection is empty, which is the seeding criterion.
    pub fn is_empty(&self) -> bool {
        self.len(ContainerKey::Nodes) == 0
    }

    /// Deep value of a container.
    pub fn value(&self, key: ContainerKey) -> LoroValue {
        self.container(key).get_deep_value()
    }

    /// Entries of a container as `(key, deep value)` pairs sorted by key.
    pub fn entities(&self, key: ContainerKey) -> Vec<(String, LoroValue)> {
        let mut entries: Vec<(String, LoroValue)> = match self.value(key) {
            LoroValue::Map(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => Vec::new(),
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Number of transactions committed through [`CrdtDocument::transact`].
    pub fn transaction_count(&self) -> u64 {
        self.inner.transactions.get()
    }

    /// Run `f` as one atomic batch tagged with `origin`.
    ///
    /// All writes are committed together, then observers of each touched
    /// container are notified. If `f` fails, the writes it already made are
    /// reverted and no observer runs.
    pub fn transact<R>(
        &self,
        origin: UpdateOrigin,
        f: impl FnOnce(&mut Transaction<'_>) -> DocumentResult<R>,
    ) -> DocumentResult<R> {
        if self.is_destroyed() {
            return Err(DocumentError::Destroyed);
        }

        let doc = &self.inner.doc;
        let before = doc.state_frontiers();
        let mut txn = Transaction {
            doc,
            touched: BTreeSet::new(),
        };
        let result = f(&mut txn);
        let touched = txn.touched;

        doc.set_next_commit_origin(origin.as_str());
        doc.commit();
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                log::error!("Transaction failed, reverting its writes: {}", e);
                doc.revert_to(&before)?;
                doc.set_next_commit_origin(origin.as_str());
                doc.commit();
                return Err(e);
            }
        };
        self.inner.transactions.set(self.inner.transactions.get() + 1);

        for container in touched {
            self.emit(DocumentEvent { container, origin });
        }
        Ok(value)
    }

    /// Register an observer for one container.
    pub fn observe(
        &self,
        key: ContainerKey,
        callback: impl Fn(&DocumentEvent) + 'static,
    ) -> ObserverId {
        let id = ObserverId(self.inner.next_observer.get());
        self.inner.next_observer.set(id.0 + 1);
        self.inner
            .observers
            .borrow_mut()
            .push((id, key, Rc::new(callback)));
        id
    }

    /// Remove an observer. Unknown ids are ignored.
    pub fn unobserve(&self, id: ObserverId) {
        self.inner
            .observers
            .borrow_mut()
            .retain(|(oid, _, _)| *oid != id);
    }

    fn emit(&self, event: DocumentEvent) {
        let callbacks: Vec<Observer> = self
            .inner
            .observers
            .borrow()
            .iter()
            .filter(|(_, key, _)| *key == event.container)
            .map(|(_, _, cb)| Rc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(&event);
        }
    }

    // --- Network Sync ---

    /// Export the document as a snapshot (full state).
    pub fn export_snapshot(&self) -> DocumentResult<Vec<u8>> {
        self.inner
            .doc
            .export(ExportMode::Snapshot)
            .map_err(|e| DocumentError::Encode(e.to_string()))
    }

    /// Export incremental updates since a version.
    pub fn export_updates(&self, since: &VersionVector) -> DocumentResult<Vec<u8>> {
        self.inner
            .doc
            .export(ExportMode::updates(since))
            .map_err(|e| DocumentError::Encode(e.to_string()))
    }

    /// Import updates or a snapshot from another peer.
    ///
    /// Observers are notified for each container the import changed.
    pub fn apply_update(&self, bytes: &[u8], origin: UpdateOrigin) -> DocumentResult<()> {
        if self.is_destroyed() {
            return Err(DocumentError::Destroyed);
        }

        self.take_changed();
        let status = self.inner.doc.import(bytes)?;
        if let Some(pending) = status.pending {
            log::debug!("Import left ops waiting on missing history: {:?}", pending);
        }

        for container in self.take_changed() {
            self.emit(DocumentEvent { container, origin });
        }
        Ok(())
    }

    fn take_changed(&self) -> BTreeSet<ContainerKey> {
        match self.inner.changed.lock() {
            Ok(mut roots) => std::mem::take(&mut *roots),
            Err(_) => BTreeSet::new(),
        }
    }

    /// Get the current version vector.
    pub fn version(&self) -> VersionVector {
        self.inner.doc.oplog_vv()
    }

    // --- Lifecycle ---

    /// Drop all observers and refuse further writes.
    pub fn destroy(&self) {
        self.inner.destroyed.set(true);
        self.inner.observers.borrow_mut().clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }
}

impl Default for CrdtDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CrdtDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrdtDocument")
            .field("peer_id", &self.peer_id())
            .field("nodes", &self.len(ContainerKey::Nodes))
            .field("edges", &self.len(ContainerKey::Edges))
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
