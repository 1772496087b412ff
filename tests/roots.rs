//! Root visiting: all-thread visits and suspended-only visits with
//! per-thread pinning.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use quiesce::{OpaquePointer, RootVisitor, Thread, ThreadState, VisitRootFlags};

#[derive(Default)]
struct CollectingVisitor {
    visited: Vec<u32>,
}

impl RootVisitor for CollectingVisitor {
    fn visit_thread_roots(&mut self, thread: &Thread, flags: VisitRootFlags) {
        assert_eq!(flags, VisitRootFlags::AllRoots);
        // Whoever hands us a thread must have made sure it cannot be
        // mutating roots right now.
        self.visited.push(thread.thread_id());
    }
}

/// Inside a pause, visit_roots covers every registered thread.
#[test]
fn visit_roots_covers_all_threads_in_pause() {
    common::panic_after(60_000, || {
        let list = common::new_list();
        let stop = AtomicBool::new(false);
        let progress = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            {
                let list = list.clone();
                let (stop, progress) = (&stop, &progress);
                scope.spawn(move || {
                    let me = list.register("mutator", OpaquePointer::UNINITIALIZED);
                    common::spin_runnable(&list, &me, stop, progress);
                    list.unregister(&me, false);
                });
            }

            let gc = list.register("gc", OpaquePointer::UNINITIALIZED);
            common::wait_until(Duration::from_secs(10), "mutator to attach", || {
                list.size(&gc) == 2
            });

            list.suspend_all(&gc, "root visit", false);
            let mut visitor = CollectingVisitor::default();
            list.visit_roots(&gc, &mut visitor, VisitRootFlags::AllRoots);
            assert_eq!(visitor.visited.len(), 2);
            list.resume_all(&gc);

            stop.store(true, Ordering::Relaxed);
            list.unregister(&gc, false);
        });
    });
}

/// Without a pause, only threads that are already suspended (plus the
/// requester) are visited, each pinned for the duration of its visit.
#[test]
fn visit_roots_for_suspended_threads_skips_runnable() {
    common::panic_after(60_000, || {
        let list = common::new_list();
        let stop = AtomicBool::new(false);
        let progress = AtomicUsize::new(0);
        let native_attached = AtomicBool::new(false);

        std::thread::scope(|scope| {
            {
                let list = list.clone();
                let (stop, progress) = (&stop, &progress);
                scope.spawn(move || {
                    let me = list.register("runnable", OpaquePointer::UNINITIALIZED);
                    common::spin_runnable(&list, &me, stop, progress);
                    list.unregister(&me, false);
                });
            }
            {
                let list = list.clone();
                let (stop, native_attached) = (&stop, &native_attached);
                scope.spawn(move || {
                    let me = list.register("native", OpaquePointer::UNINITIALIZED);
                    native_attached.store(true, Ordering::Release);
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    list.unregister(&me, false);
                });
            }

            let gc = list.register("gc", OpaquePointer::UNINITIALIZED);
            common::wait_until(Duration::from_secs(10), "threads to attach", || {
                list.size(&gc) == 3 && native_attached.load(Ordering::Acquire)
            });
            // Make sure the runnable thread is actually spinning.
            common::wait_until(Duration::from_secs(10), "spinner to spin", || {
                progress.load(Ordering::Relaxed) > 0
            });

            let mut visitor = CollectingVisitor::default();
            list.visit_roots_for_suspended_threads(&gc, &mut visitor);
            // The native thread and ourselves; the spinner may only appear
            // if it happened to be mid-transition, never more than once.
            assert!(visitor.visited.contains(&gc.thread_id()));
            assert!(visitor.visited.len() >= 2);
            let mut deduped = visitor.visited.clone();
            deduped.sort_unstable();
            deduped.dedup();
            assert_eq!(deduped.len(), visitor.visited.len());

            stop.store(true, Ordering::Relaxed);
            list.unregister(&gc, false);
        });
    });
}
