//! The counting barrier a suspend requester waits on and target threads
//! decrement as they acknowledge a suspend request.
//!
//! A `SuspendBarrier` starts at the number of threads that still have to
//! acknowledge. Each target decrements it once from
//! `pass_active_suspend_barriers`; the requester waits for zero with the
//! staged-timeout protocol in `ThreadList::wait_for_suspend_barrier`.

use std::sync::atomic::{AtomicU32, Ordering};

/// Number of sub-waits a full barrier wait is broken into, so the waiter
/// can re-sample the world between sub-waits.
pub(crate) const SUSPEND_BARRIER_ITERS: u32 = 20;

pub struct SuspendBarrier {
    count: AtomicU32,
}

impl SuspendBarrier {
    pub fn new(count: u32) -> Self {
        SuspendBarrier {
            count: AtomicU32::new(count),
        }
    }

    /// Re-arm the barrier. Only legal while nobody is waiting on it.
    pub(crate) fn reset(&self, count: u32) {
        self.count.store(count, Ordering::Relaxed);
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Acknowledge one suspend request. Wakes the waiter when the count
    /// hits zero.
    pub(crate) fn pass(&self) {
        let old = self.count.fetch_sub(1, Ordering::SeqCst);
        assert!(old > 0, "suspend barrier passed below zero");
        if old == 1 {
            self.wake_waiters();
        }
    }

    cfg_if::cfg_if! {
        if #[cfg(all(target_os = "linux", feature = "futex"))] {
            fn wake_waiters(&self) {
                crate::util::os::futex_wake_all(&self.count);
            }

            /// One sub-wait: up to `timeout_ns / SUSPEND_BARRIER_ITERS`.
            /// Returns true if it timed out without seeing a change.
            pub(crate) fn wait_once(&self, cur_val: u32, timeout_ns: u64) -> bool {
                let slice =
                    std::time::Duration::from_nanos(timeout_ns / SUSPEND_BARRIER_ITERS as u64);
                crate::util::os::futex_wait(&self.count, cur_val, Some(slice))
            }
        } else {
            fn wake_waiters(&self) {
                // Waiters are yield-spinning on the count; nothing to do.
            }

            pub(crate) fn wait_once(&self, _cur_val: u32, timeout_ns: u64) -> bool {
                // Aim for roughly one yield per microsecond of the slice.
                let inner_iters = (timeout_ns / 1000) / SUSPEND_BARRIER_ITERS as u64;
                for _ in 0..inner_iters.max(1) {
                    unsafe { libc::sched_yield() };
                    if self.count.load(Ordering::Acquire) == 0 {
                        return false;
                    }
                }
                true
            }
        }
    }
}
