//! Synchronization primitives and the global lock-ordering discipline.
//!
//! Every lock in the crate is assigned a [`LockLevel`]. Locks must be
//! acquired in increasing level order; debug builds record the set of held
//! levels per thread and panic on a violation. This is the crate's
//! rendition of per-level held-mutex slots in the original runtime.

mod barrier;
mod mutator_lock;
mod suspend_barrier;

pub use barrier::Barrier;
pub use mutator_lock::MutatorLock;
pub use suspend_barrier::SuspendBarrier;
pub(crate) use suspend_barrier::SUSPEND_BARRIER_ITERS;

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use enum_map::Enum;

use crate::thread::Thread;

/// Acquisition order for the crate's locks: a thread may only acquire a
/// lock whose level is strictly greater than every level it already holds.
///
/// `MonitorPlaceholder` is never a real lock. While a checkpoint closure
/// runs, debug builds pretend the thread holds it, so that the closure is
/// caught if it tries to acquire the mutator lock (or a user-code
/// suspension guard) and deadlock a pause.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Enum)]
pub enum LockLevel {
    /// Guards user-code (debugger) suspend/resume pairing.
    UserCodeSuspension,
    /// The mutator lock, held shared by every Runnable thread.
    Mutator,
    /// Placeholder level for checkpoint lock checking.
    MonitorPlaceholder,
    /// Guards the thread registry and exit-flag registration.
    ThreadList,
    /// Guards suspend counts, suspend barriers and `suspend_all_count`.
    ThreadSuspendCount,
    /// Guards the internal thread-id bitmap.
    AllocatedThreadIds,
}

/// A mutex with a [`LockLevel`], tracked in the acquiring thread's
/// held-lock table in debug builds.
pub struct TrackedMutex<T> {
    name: &'static str,
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> TrackedMutex<T> {
    pub fn new(name: &'static str, level: LockLevel, value: T) -> Self {
        TrackedMutex {
            name,
            level,
            inner: Mutex::new(value),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Lock on behalf of `thread`, which must be the calling thread.
    pub fn lock<'a>(&'a self, thread: &'a Thread) -> TrackedGuard<'a, T> {
        thread.assert_can_acquire(self.level, self.name);
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        thread.set_lock_held(self.level, true);
        TrackedGuard {
            guard: Some(guard),
            lock: self,
            thread,
        }
    }
}

/// Guard for a [`TrackedMutex`]. Dropping it clears the held-lock record.
pub struct TrackedGuard<'a, T> {
    // Only None transiently inside `wait`/`wait_timeout`.
    guard: Option<MutexGuard<'a, T>>,
    lock: &'a TrackedMutex<T>,
    thread: &'a Thread,
}

impl<'a, T> TrackedGuard<'a, T> {
    /// Wait on `cond`, releasing and re-acquiring the mutex. The held-lock
    /// record is kept across the wait, matching the discipline that the
    /// waiter still logically owns the critical section.
    pub fn wait(&mut self, cond: &Condvar) {
        let guard = self.guard.take().unwrap();
        self.guard = Some(cond.wait(guard).unwrap_or_else(PoisonError::into_inner));
    }

    /// Like [`TrackedGuard::wait`] with a timeout. Returns true if the wait
    /// timed out.
    pub fn wait_timeout(&mut self, cond: &Condvar, timeout: Duration) -> bool {
        let guard = self.guard.take().unwrap();
        match cond.wait_timeout(guard, timeout) {
            Ok((guard, result)) => {
                self.guard = Some(guard);
                result.timed_out()
            }
            Err(poisoned) => {
                let (guard, result) = poisoned.into_inner();
                self.guard = Some(guard);
                result.timed_out()
            }
        }
    }
}

impl<'a, T> std::ops::Deref for TrackedGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<'a, T> std::ops::DerefMut for TrackedGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<'a, T> Drop for TrackedGuard<'a, T> {
    fn drop(&mut self) {
        self.thread.set_lock_held(self.lock.level, false);
    }
}
