//! Field-level binding for auxiliary settings documents.
//!
//! Each top-level field of the serialized settings value is one entry in the
//! document container. A local change writes only the fields whose value
//! differs; a remote change merges the container over the current value.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;

use super::{Binding, EngineShared};
use crate::crdt::{DocumentEvent, UpdateOrigin, json_to_loro, loro_to_json};
use crate::error::{SyncError, SyncResult};
use crate::model::{AuxDocument, JsonMap};
use crate::store::Store;

/// Serialize an auxiliary document into its top-level fields.
pub(crate) fn fields_of<T: AuxDocument>(value: &T) -> SyncResult<JsonMap> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(SyncError::Serialization(serde::ser::Error::custom(format!(
            "{} must serialize to an object, got {}",
            T::CONTAINER,
            other
        )))),
    }
}

/// Write the fields of `new` that differ from `old`. Returns the number of
/// entries written or deleted.
pub(crate) fn write_field_diff<T: AuxDocument>(
    shared: &EngineShared,
    old: &JsonMap,
    new: &JsonMap,
) -> SyncResult<usize> {
    let changed: Vec<(&String, &Value)> = new
        .iter()
        .filter(|(key, value)| old.get(*key) != Some(*value))
        .collect();
    let removed: Vec<&String> = old.keys().filter(|key| !new.contains_key(*key)).collect();
    if changed.is_empty() && removed.is_empty() {
        return Ok(0);
    }

    let written = shared.doc.transact(UpdateOrigin::Local, |txn| {
        let container = txn.map(T::CONTAINER);
        for (key, value) in &changed {
            container.insert(key, json_to_loro(value))?;
        }
        for key in &removed {
            container.delete(key)?;
        }
        Ok(changed.len() + removed.len())
    })?;
    log::debug!("Synced {} field(s) of {}", written, T::CONTAINER);
    Ok(written)
}

/// Current value overlaid with the fields stored in the document.
///
/// Fields are applied one at a time. A field whose stored value does not
/// fit the settings type keeps its current value, so one malformed entry
/// never blocks the rest of the container.
pub(crate) fn merge_from_document<T: AuxDocument>(
    shared: &EngineShared,
    current: &JsonMap,
) -> SyncResult<T> {
    let mut merged = current.clone();
    for (key, value) in shared.doc.entities(T::CONTAINER) {
        let value = loro_to_json(&value);
        if merged.get(&key) == Some(&value) {
            continue;
        }
        let mut candidate = merged.clone();
        candidate.insert(key.clone(), value);
        match serde_json::from_value::<T>(Value::Object(candidate.clone())) {
            Ok(_) => merged = candidate,
            Err(e) => log::warn!("Keeping local {}.{}, remote value is malformed: {}", T::CONTAINER, key, e),
        }
    }
    Ok(serde_json::from_value(Value::Object(merged))?)
}

pub(crate) fn bind_aux<T: AuxDocument>(
    shared: &Rc<EngineShared>,
    store: &Store<T>,
) -> SyncResult<Binding> {
    let cache = Rc::new(RefCell::new(store.with(fields_of)?));

    let local_shared = Rc::clone(shared);
    let local_cache = Rc::clone(&cache);
    let subscription = store.subscribe(move |value: &T| {
        if local_shared.guard.is_active() || local_shared.is_closed() {
            return;
        }
        let fields = match fields_of(value) {
            Ok(fields) => fields,
            Err(e) => {
                log::error!("Failed to serialize {}: {}", T::CONTAINER, e);
                return;
            }
        };
        let previous = local_cache.borrow().clone();
        if let Err(e) = write_field_diff::<T>(&local_shared, &previous, &fields) {
            log::error!("Failed to sync local {} change: {}", T::CONTAINER, e);
        }
        *local_cache.borrow_mut() = fields;
    });

    let remote_shared = Rc::clone(shared);
    let remote_store = store.clone();
    let observer = shared.doc.observe(T::CONTAINER, move |event: &DocumentEvent| {
        if event.origin == UpdateOrigin::Local || remote_shared.is_closed() {
            return;
        }
        let current = cache.borrow().clone();
        let value: T = match merge_from_document(&remote_shared, &current) {
            Ok(value) => value,
            Err(e) => {
                log::error!("Failed to merge remote {}: {}", T::CONTAINER, e);
                return;
            }
        };
        match fields_of(&value) {
            Ok(fields) => *cache.borrow_mut() = fields,
            Err(e) => log::warn!("Failed to re-serialize remote {}: {}", T::CONTAINER, e),
        }
        let _scope = remote_shared.guard.enter();
        remote_store.set(value);
    });

    Ok(Binding {
        subscription,
        observers: vec![observer],
    })
}
