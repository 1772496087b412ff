//! Exit flags: the only safe way to learn that a target thread died
//! before satisfying a request.
//!
//! A requester registers a flag on the target while holding the thread
//! list lock. When the target unregisters, it trips every flag it still
//! carries. A flag that has tripped is no longer in any registry; a
//! requester that sees `has_exited()` must not unlink it (the registry is
//! already gone) and simply drops its own handle.

use std::sync::atomic::{AtomicBool, Ordering};

pub struct ThreadExitFlag {
    exited: AtomicBool,
}

impl Default for ThreadExitFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadExitFlag {
    pub fn new() -> Self {
        ThreadExitFlag {
            exited: AtomicBool::new(false),
        }
    }

    /// Has the thread this flag was registered on exited?
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub(crate) fn signal(&self) {
        self.exited.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unexited() {
        let flag = ThreadExitFlag::new();
        assert!(!flag.has_exited());
        flag.signal();
        assert!(flag.has_exited());
    }
}
