//! A monitor-style barrier for empty checkpoints: targets pass it once
//! each, the requester adds its expected count and waits for zero.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

pub struct Barrier {
    count: Mutex<i64>,
    // Signalled whenever the count reaches zero.
    condition: Condvar,
}

impl Barrier {
    pub fn new(count: i64) -> Self {
        Barrier {
            count: Mutex::new(count),
            condition: Condvar::new(),
        }
    }

    /// Reset the barrier to a known count before reuse.
    pub fn init(&self, count: i64) {
        let mut guard = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = count;
        if *guard == 0 {
            self.condition.notify_all();
        }
    }

    pub fn count(&self) -> i64 {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decrement the count, waking waiters when it reaches zero. The count
    /// may transiently go negative when targets pass before the requester
    /// has added its expectation; the requester's `increment` settles it.
    pub fn pass(&self) {
        let mut guard = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *guard -= 1;
        if *guard == 0 {
            self.condition.notify_all();
        }
    }

    /// Add `delta` to the count, then wait until the count reaches zero or
    /// the timeout elapses. Returns true if the wait timed out.
    pub fn increment(&self, delta: i64, timeout: Duration) -> bool {
        let mut guard = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += delta;
        if *guard == 0 {
            self.condition.notify_all();
            return false;
        }
        let deadline = Instant::now() + timeout;
        while *guard != 0 {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let (g, result) = self
                .condition
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            guard = g;
            if result.timed_out() && *guard != 0 {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::panic_after;
    use std::time::Duration;

    #[test]
    fn increment_returns_when_passed() {
        panic_after(10_000, || {
            let barrier = Barrier::new(0);
            std::thread::scope(|scope| {
                for _ in 0..4 {
                    scope.spawn(|| {
                        std::thread::sleep(Duration::from_millis(10));
                        barrier.pass();
                    });
                }
                assert!(!barrier.increment(4, Duration::from_secs(10)));
            });
            assert_eq!(barrier.count(), 0);
        });
    }

    #[test]
    fn increment_times_out() {
        let barrier = Barrier::new(0);
        assert!(barrier.increment(1, Duration::from_millis(50)));
        assert_eq!(barrier.count(), 1);
    }

    #[test]
    fn early_pass_is_settled_by_increment() {
        let barrier = Barrier::new(0);
        barrier.pass();
        assert_eq!(barrier.count(), -1);
        assert!(!barrier.increment(1, Duration::from_millis(50)));
    }
}
