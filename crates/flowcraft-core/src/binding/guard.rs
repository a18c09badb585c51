//! Reentrancy guard for applying remote changes to local stores.

use std::cell::Cell;
use std::rc::Rc;

/// Set while remote document changes are being written into local stores.
///
/// Store listeners check it and skip, so a remote write never flows back
/// into the document. Cloning shares the flag.
#[derive(Clone, Default)]
pub struct RemoteGuard {
    active: Rc<Cell<bool>>,
    violations: Rc<Cell<u32>>,
}

impl RemoteGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Number of times a remote apply started while the flag was already set.
    pub fn violations(&self) -> u32 {
        self.violations.get()
    }

    /// Set the flag until the returned scope is dropped.
    pub fn enter(&self) -> RemoteScope {
        if self.active.replace(true) {
            self.violations.set(self.violations.get() + 1);
            log::error!(
                "applying_remote was already set when a remote apply started; \
                 a previous apply did not release the guard"
            );
        }
        RemoteScope {
            active: Rc::clone(&self.active),
        }
    }
}

impl std::fmt::Debug for RemoteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteGuard")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Clears the guard on drop, including during unwinding.
#[must_use]
pub struct RemoteScope {
    active: Rc<Cell<bool>>,
}

impl Drop for RemoteScope {
    fn drop(&mut self) {
        self.active.set(false);
    }
}
