//! Undo/redo over store snapshots.
//!
//! Changes written into a store by a remote peer must not land on the local
//! undo stack, or undo would revert someone else's edit. While a session is
//! active it installs a predicate on every registered [`HistoryHook`] that
//! reports whether the current change comes from a remote apply.

use std::cell::RefCell;
use std::rc::Rc;

use crate::store::{Store, Subscription};

/// Returns true while a remote change is being applied.
pub type RemotePredicate = Rc<dyn Fn() -> bool>;

/// Something that records history and can be told to ignore remote changes.
pub trait HistoryHook {
    /// Install the predicate, or remove it with `None`.
    fn set_remote_predicate(&self, predicate: Option<RemotePredicate>);
}

struct HistoryState<T> {
    undo_stack: Vec<T>,
    redo_stack: Vec<T>,
    /// Store value after the last recorded or skipped change.
    current: T,
    max_history: usize,
    predicate: Option<RemotePredicate>,
    restoring: bool,
}

/// Snapshot undo stack for one store.
pub struct UndoHistory<T> {
    store: Store<T>,
    state: Rc<RefCell<HistoryState<T>>>,
    _subscription: Subscription,
}

impl<T: Clone + PartialEq + 'static> UndoHistory<T> {
    pub fn new(store: &Store<T>, max_history: usize) -> Self {
        let state = Rc::new(RefCell::new(HistoryState {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            current: store.snapshot(),
            max_history,
            predicate: None,
            restoring: false,
        }));

        let listener_state = Rc::clone(&state);
        let subscription = store.subscribe(move |value: &T| {
            let predicate = listener_state.borrow().predicate.clone();
            let remote = predicate.is_some_and(|is_remote| is_remote());

            let mut state = listener_state.borrow_mut();
            if state.current == *value {
                return;
            }
            if state.restoring || remote {
                state.current = value.clone();
                return;
            }
            let previous = std::mem::replace(&mut state.current, value.clone());
            state.undo_stack.push(previous);
            state.redo_stack.clear();
            while state.undo_stack.len() > state.max_history {
                state.undo_stack.remove(0);
            }
        });

        Self {
            store: store.clone(),
            state,
            _subscription: subscription,
        }
    }

    /// Restore the previous snapshot. Returns false when there is nothing to undo.
    pub fn undo(&self) -> bool {
        let previous = {
            let mut state = self.state.borrow_mut();
            let Some(previous) = state.undo_stack.pop() else {
                return false;
            };
            let current = state.current.clone();
            state.redo_stack.push(current);
            previous
        };
        self.restore(previous);
        true
    }

    pub fn redo(&self) -> bool {
        let next = {
            let mut state = self.state.borrow_mut();
            let Some(next) = state.redo_stack.pop() else {
                return false;
            };
            let current = state.current.clone();
            state.undo_stack.push(current);
            next
        };
        self.restore(next);
        true
    }

    fn restore(&self, value: T) {
        self.state.borrow_mut().restoring = true;
        self.store.set(value);
        self.state.borrow_mut().restoring = false;
    }

    pub fn can_undo(&self) -> bool {
        !self.state.borrow().undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.state.borrow().redo_stack.is_empty()
    }

    pub fn undo_count(&self) -> usize {
        self.state.borrow().undo_stack.len()
    }

    pub fn clear(&self) {
        let mut state = self.state.borrow_mut();
        state.undo_stack.clear();
        state.redo_stack.clear();
    }
}

impl<T: Clone + PartialEq + 'static> HistoryHook for UndoHistory<T> {
    fn set_remote_predicate(&self, predicate: Option<RemotePredicate>) {
        self.state.borrow_mut().predicate = predicate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_undo_redo() {
        let store = Store::new(0);
        let history = UndoHistory::new(&store, 10);
        store.set(1);
        store.set(2);

        assert!(history.undo());
        assert_eq!(store.snapshot(), 1);
        assert!(history.undo());
        assert_eq!(store.snapshot(), 0);
        assert!(!history.undo());
        assert!(history.redo());
        assert_eq!(store.snapshot(), 1);
    }

    #[test]
    fn test_remote_changes_not_recorded() {
        let store = Store::new(0);
        let history = UndoHistory::new(&store, 10);
        let remote = Rc::new(Cell::new(false));
        let flag = remote.clone();
        history.set_remote_predicate(Some(Rc::new(move || flag.get())));

        store.set(1);
        remote.set(true);
        store.set(5);
        remote.set(false);

        assert_eq!(history.undo_count(), 1);
        assert!(history.undo());
        // Snapshot undo returns to the state before the local edit.
        assert_eq!(store.snapshot(), 0);
        assert!(history.redo());
        assert_eq!(store.snapshot(), 5);
    }

    #[test]
    fn test_history_capped() {
        let store = Store::new(0);
        let history = UndoHistory::new(&store, 2);
        for v in 1..=5 {
            store.set(v);
        }
        assert_eq!(history.undo_count(), 2);
    }
}
