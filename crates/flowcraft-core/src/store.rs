//! Local reactive state containers.
//!
//! A [`Store`] holds one snapshot value and a list of listeners. Every
//! mutation replaces the snapshot and then notifies listeners with the new
//! value. Listeners run after all internal borrows are released, so a
//! listener may read the store or even mutate it again.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::model::{
    BannerSettings, DiagramMeta, DiagramState, LayerSettings, LegendSettings, StyleSettings,
    SwimlaneSettings,
};

type Listener<T> = Rc<dyn Fn(&T)>;

struct StoreInner<T> {
    value: RefCell<T>,
    listeners: RefCell<Vec<(u64, Listener<T>)>>,
    next_listener: Cell<u64>,
}

/// Shared handle to a reactive store. Cloning shares the same state.
pub struct Store<T> {
    inner: Rc<StoreInner<T>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Default + Clone + 'static> Default for Store<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + 'static> Store<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(StoreInner {
                value: RefCell::new(value),
                listeners: RefCell::new(Vec::new()),
                next_listener: Cell::new(0),
            }),
        }
    }

    /// Current value.
    pub fn snapshot(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Read the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.borrow())
    }

    /// Replace the value and notify listeners.
    pub fn set(&self, value: T) {
        *self.inner.value.borrow_mut() = value;
        self.notify();
    }

    /// Mutate the value in place and notify listeners.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.inner.value.borrow_mut());
        self.notify();
        result
    }

    /// Register a listener. It stays installed until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe(&self, listener: impl Fn(&T) + 'static) -> Subscription {
        let id = self.inner.next_listener.get();
        self.inner.next_listener.set(id + 1);
        self.inner
            .listeners
            .borrow_mut()
            .push((id, Rc::new(listener)));

        let weak: Weak<StoreInner<T>> = Rc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.borrow_mut().retain(|(lid, _)| *lid != id);
            }
        })
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    fn notify(&self) {
        let snapshot = self.snapshot();
        let listeners: Vec<Listener<T>> = self
            .inner
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| Rc::clone(l))
            .collect();
        for listener in listeners {
            listener(&snapshot);
        }
    }
}

/// Removes a listener when dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// The set of stores the host application renders from.
///
/// `diagram` is the primary store (nodes and edges); the others each hold one
/// auxiliary document.
#[derive(Clone, Default)]
pub struct DiagramStores {
    pub diagram: Store<DiagramState>,
    pub swimlanes: Store<SwimlaneSettings>,
    pub legends: Store<LegendSettings>,
    pub banners: Store<BannerSettings>,
    pub layers: Store<LayerSettings>,
    pub styles: Store<StyleSettings>,
    pub meta: Store<DiagramMeta>,
}

impl DiagramStores {
    pub fn new(diagram: DiagramState) -> Self {
        Self {
            diagram: Store::new(diagram),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listeners_receive_new_value() {
        let store = Store::new(1);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = store.subscribe(move |v| seen_clone.borrow_mut().push(*v));

        store.set(2);
        store.update(|v| *v += 3);

        assert_eq!(*seen.borrow(), vec![2, 5]);
        assert_eq!(store.snapshot(), 5);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let store = Store::new(0);
        let count = Rc::new(Cell::new(0));
        let count_clone = count.clone();
        let sub = store.subscribe(move |_| count_clone.set(count_clone.get() + 1));
        store.set(1);
        drop(sub);
        store.set(2);
        assert_eq!(count.get(), 1);
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn test_listener_may_mutate_store() {
        let store = Store::new(0);
        let handle = store.clone();
        let _sub = store.subscribe(move |v| {
            if *v == 1 {
                handle.set(10);
            }
        });
        store.set(1);
        assert_eq!(store.snapshot(), 10);
    }
}
