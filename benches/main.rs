use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};

use quiesce::{OpaquePointer, Options, ThreadList, ThreadState};

/// The Runnable fast path: one transition out and back in, no pending
/// requests.
fn bench_transition_round_trip(c: &mut Criterion) {
    let list = ThreadList::new(Options::default());
    let thread = list.register("bench", OpaquePointer::UNINITIALIZED);
    c.bench_function("transition_round_trip", |b| {
        b.iter(|| {
            list.transition_from_suspended_to_runnable(&thread);
            list.transition_from_runnable_to_suspended(&thread, ThreadState::Native);
        })
    });
    list.unregister(&thread, false);
}

/// A full stop-the-world pause against a handful of polling mutators.
fn bench_suspend_all(c: &mut Criterion) {
    let list = ThreadList::new(Options::default());
    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let list = list.clone();
        let stop = stop.clone();
        handles.push(std::thread::spawn(move || {
            let me = list.register("bench-mutator", OpaquePointer::UNINITIALIZED);
            list.transition_from_suspended_to_runnable(&me);
            while !stop.load(Ordering::Relaxed) {
                list.check_suspend(&me);
            }
            list.transition_from_runnable_to_suspended(&me, ThreadState::Native);
            list.unregister(&me, false);
        }));
    }
    let requester = list.register("bench-requester", OpaquePointer::UNINITIALIZED);
    while list.size(&requester) < 5 {
        std::thread::sleep(Duration::from_millis(1));
    }

    c.bench_function("suspend_all_resume_all", |b| {
        b.iter(|| {
            list.suspend_all(&requester, "bench", false);
            list.resume_all(&requester);
        })
    });

    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }
    list.unregister(&requester, false);
}

criterion_group!(benches, bench_transition_round_trip, bench_suspend_all);
criterion_main!(benches);
