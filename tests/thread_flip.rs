//! Flip-function protocol: each registered thread runs the flip closure
//! exactly once per flip_thread_roots call, no matter who gets there
//! first.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quiesce::{Closure, GcPauseListener, OpaquePointer, Thread, ThreadState};

struct FlipCounter {
    runs: Mutex<HashMap<u32, usize>>,
}

impl Closure for FlipCounter {
    fn run(&self, thread: &Thread) {
        *self
            .runs
            .lock()
            .unwrap()
            .entry(thread.thread_id())
            .or_insert(0) += 1;
    }
}

struct PauseCounter {
    starts: AtomicUsize,
    ends: AtomicUsize,
}

impl GcPauseListener for PauseCounter {
    fn start_pause(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }
    fn end_pause(&self) {
        self.ends.fetch_add(1, Ordering::SeqCst);
    }
}

/// Under heavy transition traffic, every thread's flip runs exactly once
/// per round: some by the thread itself on its way back to Runnable, some
/// by the flip coordinator, never both.
#[test]
fn flip_runs_exactly_once_per_thread() {
    common::panic_after(120_000, || {
        let list = common::new_list();
        let mutators = 8.min(2 * num_cpus::get());
        let stop = AtomicBool::new(false);

        std::thread::scope(|scope| {
            for _ in 0..mutators {
                let list = list.clone();
                let stop = &stop;
                scope.spawn(move || {
                    let me = list.register("flipper", OpaquePointer::UNINITIALIZED);
                    while !stop.load(Ordering::Relaxed) {
                        // Bounce through Runnable so self-started flips and
                        // coordinator-run flips race for the claim.
                        list.transition_from_suspended_to_runnable(&me);
                        list.transition_from_runnable_to_suspended(&me, ThreadState::Native);
                    }
                    list.unregister(&me, false);
                });
            }

            let gc = list.register("gc", OpaquePointer::UNINITIALIZED);
            common::wait_until(Duration::from_secs(10), "mutators to attach", || {
                list.size(&gc) == mutators + 1
            });

            let listener = PauseCounter {
                starts: AtomicUsize::new(0),
                ends: AtomicUsize::new(0),
            };
            for round in 0..10usize {
                let counter = Arc::new(FlipCounter {
                    runs: Mutex::new(HashMap::new()),
                });
                let visitor: Arc<dyn Closure> = counter.clone();
                let flip_callback = |_t: &Thread| {};
                list.flip_thread_roots(&gc, &visitor, &flip_callback, Some(&listener));

                let runs = counter.runs.lock().unwrap();
                // Every registered thread was covered, once each.
                assert_eq!(runs.len(), mutators + 1, "round {}", round);
                assert!(runs.contains_key(&gc.thread_id()));
                for (thread_id, count) in runs.iter() {
                    assert_eq!(*count, 1, "thread id {} in round {}", thread_id, round);
                }
                assert_eq!(listener.starts.load(Ordering::SeqCst), round + 1);
                assert_eq!(listener.ends.load(Ordering::SeqCst), round + 1);
            }

            stop.store(true, Ordering::Relaxed);
            list.unregister(&gc, false);
        });
    });
}

/// Flips and thread exits can overlap: a thread that unregisters after the
/// pause but before its flip is claimed just drops out, and the
/// coordinator still terminates.
#[test]
fn flip_survives_exiting_threads() {
    common::panic_after(120_000, || {
        let list = common::new_list();
        let churners = 4;
        let stop = AtomicBool::new(false);

        std::thread::scope(|scope| {
            for _ in 0..churners {
                let list = list.clone();
                let stop = &stop;
                scope.spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let me = list.register("churner", OpaquePointer::UNINITIALIZED);
                        list.transition_from_suspended_to_runnable(&me);
                        list.transition_from_runnable_to_suspended(&me, ThreadState::Native);
                        list.unregister(&me, false);
                    }
                });
            }

            let gc = list.register("gc", OpaquePointer::UNINITIALIZED);
            for _ in 0..20 {
                let counter = Arc::new(FlipCounter {
                    runs: Mutex::new(HashMap::new()),
                });
                let visitor: Arc<dyn Closure> = counter.clone();
                let flip_callback = |_t: &Thread| {};
                list.flip_thread_roots(&gc, &visitor, &flip_callback, None);

                // At-most-once even with churn.
                for (thread_id, count) in counter.runs.lock().unwrap().iter() {
                    assert_eq!(*count, 1, "thread id {}", thread_id);
                }
            }

            stop.store(true, Ordering::Relaxed);
            list.unregister(&gc, false);
        });
    });
}
