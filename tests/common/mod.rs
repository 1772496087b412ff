//! Helpers shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use quiesce::{Options, Thread, ThreadList, ThreadState};

/// Options with a short suspend timeout so failing tests fail quickly.
pub fn test_options() -> Options {
    let mut options = Options::default();
    options.thread_suspend_timeout_ns = 2_000_000_000;
    options
}

pub fn new_list() -> Arc<ThreadList> {
    let _ = quiesce::util::logger::try_init();
    ThreadList::new(test_options())
}

/// Fail the whole test process if `f` does not finish in time; a wedged
/// suspension test would otherwise hang the suite.
pub fn panic_after<T, F>(millis: u64, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T,
    F: Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let val = f();
        done_tx.send(()).expect("Unable to send completion signal");
        val
    });

    match done_rx.recv_timeout(Duration::from_millis(millis)) {
        Ok(_) => handle.join().expect("Thread panicked"),
        Err(e) => panic!("Thread took too long: {}", e),
    }
}

/// Body of a cooperative mutator thread: spin Runnable, polling the
/// suspension flags and bumping `progress`, until `stop` is set.
pub fn spin_runnable(
    list: &ThreadList,
    thread: &Arc<Thread>,
    stop: &AtomicBool,
    progress: &AtomicUsize,
) {
    list.transition_from_suspended_to_runnable(thread);
    while !stop.load(Ordering::Relaxed) {
        progress.fetch_add(1, Ordering::Relaxed);
        list.check_suspend(thread);
    }
    list.transition_from_runnable_to_suspended(thread, ThreadState::Native);
}

/// Wait until `cond` holds, or fail after `timeout`.
pub fn wait_until(timeout: Duration, what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}
