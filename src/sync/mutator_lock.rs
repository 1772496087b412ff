//! The mutator lock: a shared/exclusive lock with a timed exclusive
//! acquire.
//!
//! Every Runnable thread logically holds a share. The share is *not* an
//! explicit reader registration: the Runnable state transition itself is
//! the acquisition (its CAS orderings provide the happens-before edges),
//! and a thread with a pending suspend request cannot become Runnable, so
//! an exclusive acquire that happens after every thread acknowledged a
//! suspend barrier cannot race a transition-held share. Explicit shares
//! (`shared_lock`) are only taken by requesters that need to keep the
//! world from being re-suspended while they work, e.g. the flip
//! coordinator.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::sync::LockLevel;
use crate::thread::Thread;

/// Explicit holders: -1 while exclusively held, otherwise the number of
/// explicit shared holders.
struct LockWord {
    state: i32,
    /// Internal thread id of the exclusive owner, for diagnostics.
    exclusive_owner: u32,
}

pub struct MutatorLock {
    word: Mutex<LockWord>,
    changed: Condvar,
}

impl Default for MutatorLock {
    fn default() -> Self {
        Self::new()
    }
}

impl MutatorLock {
    pub fn new() -> Self {
        MutatorLock {
            word: Mutex::new(LockWord {
                state: 0,
                exclusive_owner: 0,
            }),
            changed: Condvar::new(),
        }
    }

    /// Acquire exclusively, blocking until all explicit shares are gone.
    pub fn exclusive_lock(&self, thread: &Thread) {
        thread.assert_can_acquire(LockLevel::Mutator, "mutator lock");
        let mut word = self.word.lock().unwrap_or_else(PoisonError::into_inner);
        while word.state != 0 {
            word = self
                .changed
                .wait(word)
                .unwrap_or_else(PoisonError::into_inner);
        }
        word.state = -1;
        word.exclusive_owner = thread.thread_id();
        thread.set_lock_held(LockLevel::Mutator, true);
    }

    /// Timed exclusive acquire. Returns false on timeout.
    pub fn exclusive_lock_timed(&self, thread: &Thread, timeout: Duration) -> bool {
        thread.assert_can_acquire(LockLevel::Mutator, "mutator lock");
        let deadline = Instant::now() + timeout;
        let mut word = self.word.lock().unwrap_or_else(PoisonError::into_inner);
        while word.state != 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (w, _) = self
                .changed
                .wait_timeout(word, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            word = w;
        }
        word.state = -1;
        word.exclusive_owner = thread.thread_id();
        thread.set_lock_held(LockLevel::Mutator, true);
        true
    }

    pub fn exclusive_unlock(&self, thread: &Thread) {
        let mut word = self.word.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(word.state, -1, "exclusive unlock of unheld mutator lock");
        debug_assert_eq!(word.exclusive_owner, thread.thread_id());
        word.state = 0;
        word.exclusive_owner = 0;
        self.changed.notify_all();
        thread.set_lock_held(LockLevel::Mutator, false);
    }

    /// Take an explicit share without blocking. Fails if exclusively held.
    pub fn shared_try_lock(&self, thread: &Thread) -> bool {
        let mut word = self.word.lock().unwrap_or_else(PoisonError::into_inner);
        if word.state < 0 {
            return false;
        }
        word.state += 1;
        thread.set_lock_held(LockLevel::Mutator, true);
        true
    }

    /// Take an explicit share, blocking while exclusively held.
    pub fn shared_lock(&self, thread: &Thread) {
        thread.assert_can_acquire(LockLevel::Mutator, "mutator lock");
        let mut word = self.word.lock().unwrap_or_else(PoisonError::into_inner);
        while word.state < 0 {
            word = self
                .changed
                .wait(word)
                .unwrap_or_else(PoisonError::into_inner);
        }
        word.state += 1;
        thread.set_lock_held(LockLevel::Mutator, true);
    }

    pub fn shared_unlock(&self, thread: &Thread) {
        let mut word = self.word.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(word.state > 0, "shared unlock of unheld mutator lock");
        word.state -= 1;
        if word.state == 0 {
            self.changed.notify_all();
        }
        thread.set_lock_held(LockLevel::Mutator, false);
    }

    /// Record the release of the Runnable share. Bookkeeping only; the
    /// state-word CAS in the transition is the real release.
    pub fn transition_from_runnable_to_suspended(&self, thread: &Thread) {
        thread.set_lock_held(LockLevel::Mutator, false);
    }

    /// Record the acquisition of the Runnable share.
    pub fn transition_from_suspended_to_runnable(&self, thread: &Thread) {
        thread.set_lock_held(LockLevel::Mutator, true);
    }

    /// Does the calling thread hold a share (explicit or via Runnable)?
    pub fn is_shared_held(&self, thread: &Thread) -> bool {
        thread.is_lock_held(LockLevel::Mutator)
    }

    pub fn is_exclusive_held(&self, thread: &Thread) -> bool {
        let word = self.word.lock().unwrap_or_else(PoisonError::into_inner);
        word.state == -1 && word.exclusive_owner == thread.thread_id()
    }

    pub fn assert_not_held(&self, thread: &Thread) {
        debug_assert!(
            !thread.is_lock_held(LockLevel::Mutator),
            "mutator lock unexpectedly held"
        );
    }

    pub fn assert_shared_held(&self, thread: &Thread) {
        debug_assert!(
            thread.is_lock_held(LockLevel::Mutator),
            "mutator lock share expected to be held"
        );
    }

    pub fn assert_not_exclusive_held(&self, thread: &Thread) {
        debug_assert!(!self.is_exclusive_held(thread));
    }

    /// Describe the lock state for timeout diagnostics.
    pub fn describe(&self) -> String {
        let word = self.word.lock().unwrap_or_else(PoisonError::into_inner);
        if word.state < 0 {
            format!("mutator lock: exclusive, owner id {}", word.exclusive_owner)
        } else {
            format!("mutator lock: {} explicit share(s)", word.state)
        }
    }
}
