//! Single-thread suspension: by id, by peer, resume pairing, caller-driven
//! retry timeouts, and racing target exits.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;

use quiesce::{OpaquePointer, SuspendReason, ThreadState};

#[test]
fn suspend_and_resume_by_thread_id() {
    common::panic_after(60_000, || {
        let list = common::new_list();
        let stop = AtomicBool::new(false);
        let progress = AtomicUsize::new(0);
        let target_id = AtomicU32::new(0);

        std::thread::scope(|scope| {
            {
                let list = list.clone();
                let (stop, progress, target_id) = (&stop, &progress, &target_id);
                scope.spawn(move || {
                    let me = list.register("target", OpaquePointer::UNINITIALIZED);
                    target_id.store(me.thread_id(), Ordering::Release);
                    common::spin_runnable(&list, &me, stop, progress);
                    list.unregister(&me, false);
                });
            }

            let requester = list.register("requester", OpaquePointer::UNINITIALIZED);
            common::wait_until(Duration::from_secs(10), "target id", || {
                target_id.load(Ordering::Acquire) != 0
            });
            let id = target_id.load(Ordering::Acquire);

            let target = list
                .suspend_thread_by_thread_id(&requester, id, SuspendReason::Internal, 0)
                .expect("target should suspend");
            assert!(target.is_suspended());
            let before = progress.load(Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(20));
            // Pinned: no progress while suspended.
            assert_eq!(progress.load(Ordering::Relaxed), before);

            assert!(list.resume(&requester, &target, SuspendReason::Internal));
            common::wait_until(Duration::from_secs(5), "target to resume", || {
                progress.load(Ordering::Relaxed) > before
            });

            stop.store(true, Ordering::Relaxed);
            list.unregister(&requester, false);
        });
    });
}

#[test]
fn suspend_by_peer_for_user_code() {
    common::panic_after(60_000, || {
        let list = common::new_list();
        let stop = AtomicBool::new(false);
        let progress = AtomicUsize::new(0);
        let attached = AtomicBool::new(false);
        let peer = OpaquePointer::from_usize(0x7ee1);

        std::thread::scope(|scope| {
            {
                let list = list.clone();
                let (stop, progress, attached) = (&stop, &progress, &attached);
                scope.spawn(move || {
                    let me = list.register("debuggee", peer);
                    attached.store(true, Ordering::Release);
                    common::spin_runnable(&list, &me, stop, progress);
                    list.unregister(&me, false);
                });
            }

            let requester = list.register("debugger", OpaquePointer::UNINITIALIZED);
            common::wait_until(Duration::from_secs(10), "debuggee to attach", || {
                attached.load(Ordering::Acquire)
            });

            {
                // User-code suspension requires its pairing lock.
                let _user_code = list.user_code_suspension_lock().lock(&requester);
                let target = list
                    .suspend_thread_by_peer(&requester, peer, SuspendReason::ForUserCode)
                    .expect("debuggee should suspend");
                assert!(target.is_suspended());
                assert!(list.resume(&requester, &target, SuspendReason::ForUserCode));
            }

            // Unknown peer is reported, not fatal.
            assert!(list
                .suspend_thread_by_peer(
                    &requester,
                    OpaquePointer::from_usize(0xdead),
                    SuspendReason::Internal
                )
                .is_none());

            stop.store(true, Ordering::Relaxed);
            list.unregister(&requester, false);
        });
    });
}

/// A user-code resume of a thread that is not suspended reports failure
/// instead of aborting.
#[test]
fn user_code_resume_of_running_thread_fails() {
    common::panic_after(60_000, || {
        let list = common::new_list();
        let stop = AtomicBool::new(false);
        let progress = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            {
                let list = list.clone();
                let (stop, progress) = (&stop, &progress);
                scope.spawn(move || {
                    let me = list.register("running", OpaquePointer::UNINITIALIZED);
                    common::spin_runnable(&list, &me, stop, progress);
                    list.unregister(&me, false);
                });
            }

            let requester = list.register("requester", OpaquePointer::UNINITIALIZED);
            common::wait_until(Duration::from_secs(10), "thread to attach", || {
                list.size(&requester) == 2
            });
            let mut target = None;
            list.for_each(&requester, |t| {
                if t.name() == "running" {
                    target = Some(t.clone());
                }
            });
            let target = target.unwrap();

            let _user_code = list.user_code_suspension_lock().lock(&requester);
            assert!(!list.resume(&requester, &target, SuspendReason::ForUserCode));

            stop.store(true, Ordering::Relaxed);
            drop(_user_code);
            list.unregister(&requester, false);
        });
    });
}

/// An early attempt (1 of 4) against a non-polling target gives up,
/// cleans up its suspend request, and leaves the world functional.
#[test]
fn fractional_attempt_gives_up_cleanly() {
    common::panic_after(120_000, || {
        let list = common::new_list();
        let stop = AtomicBool::new(false);
        let target_id = AtomicU32::new(0);

        std::thread::scope(|scope| {
            {
                let list = list.clone();
                let (stop, target_id) = (&stop, &target_id);
                scope.spawn(move || {
                    let me = list.register("oblivious", OpaquePointer::UNINITIALIZED);
                    target_id.store(me.thread_id(), Ordering::Release);
                    list.transition_from_suspended_to_runnable(&me);
                    // Ignore the world for a while: no polls at all.
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    list.transition_from_runnable_to_suspended(&me, ThreadState::Native);
                    list.unregister(&me, false);
                });
            }

            let requester = list.register("requester", OpaquePointer::UNINITIALIZED);
            common::wait_until(Duration::from_secs(10), "target id", || {
                target_id.load(Ordering::Acquire) != 0
            });
            let id = target_id.load(Ordering::Acquire);

            // A quarter of the 2s test timeout is far too short for a
            // thread that never polls.
            let result =
                list.suspend_thread_by_thread_id(&requester, id, SuspendReason::Internal, 1);
            assert!(result.is_none());

            // The failed attempt left no residue: the target can still be
            // suspended once it cooperates.
            stop.store(true, Ordering::Relaxed);
            let target = list.suspend_thread_by_thread_id(&requester, id, SuspendReason::Internal, 0);
            if let Some(target) = target {
                assert!(target.is_suspended());
                assert!(list.resume(&requester, &target, SuspendReason::Internal));
            }
            // Else: it already unregistered, which is a legal outcome.

            list.unregister(&requester, false);
        });
    });
}

/// Suspending threads that are concurrently exiting either succeeds (and
/// must then be resumed) or reports failure; it never wedges or touches a
/// dead thread.
#[test]
fn suspend_races_with_exit() {
    common::panic_after(300_000, || {
        let list = common::new_list();
        let done = AtomicBool::new(false);
        let latest_id = AtomicU32::new(0);

        std::thread::scope(|scope| {
            {
                let list = list.clone();
                let (done, latest_id) = (&done, &latest_id);
                scope.spawn(move || {
                    for _ in 0..300 {
                        let me = list.register("ephemeral", OpaquePointer::UNINITIALIZED);
                        latest_id.store(me.thread_id(), Ordering::Release);
                        list.transition_from_suspended_to_runnable(&me);
                        list.check_suspend(&me);
                        list.transition_from_runnable_to_suspended(&me, ThreadState::Native);
                        list.unregister(&me, false);
                    }
                    done.store(true, Ordering::Release);
                });
            }

            let requester = list.register("requester", OpaquePointer::UNINITIALIZED);
            let mut rng = rand::rng();
            while !done.load(Ordering::Acquire) {
                let id = latest_id.load(Ordering::Acquire);
                if id == 0 {
                    continue;
                }
                if let Some(target) =
                    list.suspend_thread_by_thread_id(&requester, id, SuspendReason::Internal, 0)
                {
                    assert!(target.is_suspended());
                    assert!(list.resume(&requester, &target, SuspendReason::Internal));
                }
                // Jitter the attack phase so attempts land all over the
                // target's lifecycle.
                std::thread::sleep(Duration::from_micros(rng.random_range(0..200)));
            }
            list.unregister(&requester, false);
        });
    });
}
