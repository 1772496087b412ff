//! Checkpoint dispatch: counting, on-behalf execution for suspended
//! targets, execution-context safety and the empty-checkpoint kick.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use quiesce::{Closure, OpaquePointer, Thread, ThreadState};

/// Counts every thread the checkpoint runs for.
struct CountingCheckpoint {
    ran_for: AtomicUsize,
}

impl Closure for CountingCheckpoint {
    fn run(&self, thread: &Thread) {
        // If somebody else runs the closure on the target's behalf, the
        // target must be verifiably suspended for the duration.
        if quiesce::util::os::gettid() != thread.tid() {
            assert!(thread.is_suspended(), "on-behalf run of {}", thread);
        }
        self.ran_for.fetch_add(1, Ordering::SeqCst);
    }
}

/// Checkpoints run on runnable targets (by themselves) and on suspended
/// targets (by the requester), and the return value counts both.
#[test]
fn run_checkpoint_covers_runnable_and_suspended() {
    common::panic_after(60_000, || {
        let list = common::new_list();
        let runnable = 3;
        let native = 2;
        let stop = AtomicBool::new(false);
        let progress: Vec<AtomicUsize> = (0..runnable).map(|_| AtomicUsize::new(0)).collect();

        std::thread::scope(|scope| {
            for i in 0..runnable {
                let list = list.clone();
                let stop = &stop;
                let progress = &progress;
                scope.spawn(move || {
                    let me = list.register("runnable", OpaquePointer::UNINITIALIZED);
                    common::spin_runnable(&list, &me, stop, &progress[i]);
                    list.unregister(&me, false);
                });
            }
            for _ in 0..native {
                let list = list.clone();
                let stop = &stop;
                scope.spawn(move || {
                    // Stays Native, like a thread blocked in a syscall.
                    let me = list.register("native", OpaquePointer::UNINITIALIZED);
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    list.unregister(&me, false);
                });
            }

            let requester = list.register("requester", OpaquePointer::UNINITIALIZED);
            common::wait_until(Duration::from_secs(10), "threads to attach", || {
                list.size(&requester) == runnable + native + 1
            });

            let counting = Arc::new(CountingCheckpoint {
                ran_for: AtomicUsize::new(0),
            });
            let checkpoint: Arc<dyn Closure> = counting.clone();
            let count = list.run_checkpoint(&requester, &checkpoint, None, true, false);
            assert_eq!(count, runnable + native + 1);

            // Suspended targets and self already ran; runnable targets do
            // so at their next poll.
            common::wait_until(Duration::from_secs(10), "checkpoints to run", || {
                counting.ran_for.load(Ordering::SeqCst) == count
            });

            stop.store(true, Ordering::Relaxed);
            list.unregister(&requester, false);
        });
    });
}

/// The callback runs inside the capture critical section, before any
/// checkpoint is executed on the requester.
#[test]
fn run_checkpoint_callback_runs_once() {
    common::panic_after(30_000, || {
        let list = common::new_list();
        let requester = list.register("requester", OpaquePointer::UNINITIALIZED);

        let callback_runs = AtomicUsize::new(0);
        let callback = |_t: &Thread| {
            callback_runs.fetch_add(1, Ordering::SeqCst);
        };
        let checkpoint: Arc<dyn Closure> = Arc::new(|_t: &Thread| {});
        let count = list.run_checkpoint(&requester, &checkpoint, Some(&callback), true, false);
        assert_eq!(count, 1);
        assert_eq!(callback_runs.load(Ordering::SeqCst), 1);
        list.unregister(&requester, false);
    });
}

/// A checkpoint installed on a runnable target runs before the target
/// leaves its next suspension point: the payload written before the
/// target's last transition is never seen torn.
#[test]
fn checkpoint_observes_consistent_target_state() {
    common::panic_after(120_000, || {
        let list = common::new_list();
        let stop = AtomicBool::new(false);
        // The target publishes two halves that must always agree.
        let halves = Arc::new((AtomicUsize::new(0), AtomicUsize::new(0)));

        std::thread::scope(|scope| {
            {
                let list = list.clone();
                let stop = &stop;
                let halves = halves.clone();
                scope.spawn(move || {
                    let me = list.register("target", OpaquePointer::UNINITIALIZED);
                    let mut i = 0usize;
                    while !stop.load(Ordering::Relaxed) {
                        list.transition_from_suspended_to_runnable(&me);
                        // While Runnable both halves are updated together.
                        halves.0.store(i, Ordering::Relaxed);
                        halves.1.store(i, Ordering::Relaxed);
                        list.transition_from_runnable_to_suspended(&me, ThreadState::Native);
                        i = i.wrapping_add(1);
                    }
                    list.unregister(&me, false);
                });
            }

            let requester = list.register("requester", OpaquePointer::UNINITIALIZED);
            common::wait_until(Duration::from_secs(10), "target to attach", || {
                list.size(&requester) == 2
            });

            let halves_in_checkpoint = halves.clone();
            let checkpoint: Arc<dyn Closure> = Arc::new(move |thread: &Thread| {
                if quiesce::util::os::gettid() != thread.tid() {
                    // The target is pinned suspended: the halves cannot be
                    // mid-update.
                    assert_eq!(
                        halves_in_checkpoint.0.load(Ordering::Relaxed),
                        halves_in_checkpoint.1.load(Ordering::Relaxed)
                    );
                }
            });
            for _ in 0..1000 {
                list.run_checkpoint(&requester, &checkpoint, None, true, false);
            }

            stop.store(true, Ordering::Relaxed);
            list.unregister(&requester, false);
        });
    });
}

/// A thread blocked in a weak-reference accessor while Runnable still
/// passes the empty checkpoint, via the registered wakeup hook.
#[test]
fn empty_checkpoint_kicks_weak_ref_waiter() {
    common::panic_after(60_000, || {
        let list = common::new_list();
        // The "weak ref" gate the waiter blocks on while Runnable.
        let gate: Arc<(Mutex<bool>, Condvar)> = Arc::new((Mutex::new(false), Condvar::new()));
        {
            let gate = gate.clone();
            list.add_empty_checkpoint_wakeup(Box::new(move || {
                let _held = gate.0.lock().unwrap();
                gate.1.notify_all();
            }));
        }

        std::thread::scope(|scope| {
            {
                let list = list.clone();
                let gate = gate.clone();
                scope.spawn(move || {
                    let me = list.register("weak-ref-waiter", OpaquePointer::UNINITIALIZED);
                    list.transition_from_suspended_to_runnable(&me);
                    let mut released = gate.0.lock().unwrap();
                    while !*released {
                        // Runnable, but blocked: the poll in this loop is
                        // the only suspension point we ever reach.
                        drop(released);
                        me.check_empty_checkpoint_from_weak_ref_access(&list);
                        released = gate.0.lock().unwrap();
                        if !*released {
                            released = gate.1.wait(released).unwrap();
                        }
                    }
                    drop(released);
                    list.transition_from_runnable_to_suspended(&me, ThreadState::Native);
                    list.unregister(&me, false);
                });
            }

            let requester = list.register("requester", OpaquePointer::UNINITIALIZED);
            common::wait_until(Duration::from_secs(10), "waiter to attach", || {
                list.size(&requester) == 2
            });
            // Give the waiter time to actually block on the gate.
            std::thread::sleep(Duration::from_millis(50));

            // Must return despite the waiter never reaching a transition.
            list.run_empty_checkpoint(&requester);

            *gate.0.lock().unwrap() = true;
            gate.1.notify_all();
            list.unregister(&requester, false);
        });
    });
}

/// A barrier wait on an unresponsive target reports a diagnostic string;
/// it does not abort on early attempts.
#[test]
fn barrier_timeout_is_reported_not_fatal() {
    let list = common::new_list();
    let barrier = quiesce::sync::SuspendBarrier::new(1);
    let diagnosis = list.wait_for_suspend_barrier(&barrier, quiesce::util::os::gettid(), 1);
    let message = diagnosis.expect("stuck barrier must time out");
    assert!(!message.is_empty());
    assert_eq!(barrier.count(), 1);
}
