//! The process-wide registry of mutator threads and every operation that
//! coordinates more than one of them: checkpoints, stop-the-world pauses,
//! single-thread suspension, root flipping and the staged timeout
//! diagnostics used when a thread fails to respond.

use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use atomic::Ordering;
use itertools::Itertools;
use probe::probe;

use crate::closure::{Closure, GcPauseListener, RootVisitor, VisitRootFlags};
use crate::sync::{
    Barrier, LockLevel, MutatorLock, SuspendBarrier, TrackedGuard, TrackedMutex,
    SUSPEND_BARRIER_ITERS,
};
use crate::thread::{
    SuspendReason, Thread, ThreadExitFlag, ThreadFlag, ThreadState, FLIP_FUNCTION_FLAGS,
};
use crate::util::options::Options;
use crate::util::os;
use crate::util::OpaquePointer;

/// Largest internal thread id we hand out; ids are recycled from a bitmap.
pub const MAX_THREAD_ID: u32 = 0xFFFF;
/// Zero is reserved to mean "invalid".
pub const INVALID_THREAD_ID: u32 = 0;

/// The number of times we may retry when we find ourselves in a
/// suspend-unfriendly state. We fail more aggressively in debug builds to
/// catch potential issues early.
const MAX_SUSPEND_RETRIES: u32 = if cfg!(debug_assertions) { 500 } else { 5000 };

/// Sleep between retries of a suspend-unfriendly state.
const THREAD_SUSPEND_SLEEP: Duration = Duration::from_micros(100);

/// A stop-the-world pause slower than this is logged.
const LONG_THREAD_SUSPEND_THRESHOLD: Duration = Duration::from_millis(5);

const EMPTY_CHECKPOINT_PERIODIC_TIMEOUT: Duration = Duration::from_millis(100);
const EMPTY_CHECKPOINT_TOTAL_TIMEOUT: Duration = Duration::from_secs(600);

/// Total timeout increment if we see a concurrent SIGQUIT dump in
/// progress, distributed across the remaining barrier sub-waits.
const DUMP_WAIT_NS: u64 = 30_000_000_000;
/// Replacement timeout if the target is stopped for tracing, probably by a
/// debugger: a bit under 2 hours.
const TRACING_WAIT_NS: u64 = 7_200_000_000_000;

/// Aggregate timing of stop-the-world pauses.
#[derive(Copy, Clone, Debug, Default)]
pub struct SuspendAllStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

struct ThreadListState {
    list: Vec<Arc<Thread>>,
    /// Threads mid-unregister; see `wait_for_unregister_to_complete`.
    unregistering_count: usize,
}

pub(crate) struct SuspendCountState {
    /// Always 0 or 1. Concurrent SuspendAlls serialize on `resume_cond`.
    suspend_all_count: u32,
}

/// Bitmap allocator for internal thread ids.
struct ThreadIdAllocator {
    words: Vec<u64>,
}

impl ThreadIdAllocator {
    fn new() -> Self {
        ThreadIdAllocator {
            words: vec![0; (MAX_THREAD_ID as usize).div_ceil(64)],
        }
    }

    fn alloc(&mut self) -> u32 {
        for (word_index, word) in self.words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                let id = word_index * 64 + bit;
                if id < MAX_THREAD_ID as usize {
                    *word |= 1 << bit;
                    // Zero is reserved to mean "invalid".
                    return id as u32 + 1;
                }
            }
        }
        panic!("out of internal thread ids");
    }

    fn release(&mut self, id: u32) {
        let id = (id - 1) as usize;
        debug_assert!(self.words[id / 64] & (1 << (id % 64)) != 0, "{}", id);
        self.words[id / 64] &= !(1 << (id % 64));
    }
}

/// The process-wide singleton coordinating all registered threads.
pub struct ThreadList {
    list_lock: TrackedMutex<ThreadListState>,
    /// Signalled when a thread finishes unregistering.
    thread_exit_cond: Condvar,

    suspend_count_lock: TrackedMutex<SuspendCountState>,
    /// Signalled on resume, flip completion and exit-flag trips. Paired
    /// with `suspend_count_lock`.
    resume_cond: Condvar,

    mutator_lock: MutatorLock,
    user_code_suspension_lock: TrackedMutex<()>,

    /// The shared SuspendAll barrier slot, holding live_threads - 1.
    suspendall_barrier: Arc<SuspendBarrier>,
    empty_checkpoint_barrier: Barrier,

    allocated_ids: spin::Mutex<ThreadIdAllocator>,

    options: Options,

    /// Whether the current pause is expected to be long; long pauses
    /// exempt concurrent exclusive-lock attempts from their timeout.
    long_suspend: AtomicBool,

    /// Monotonic nanotime of an in-progress SIGQUIT dump, or 0. Suspend
    /// waits stretch their deadline while a dump is running.
    sig_quit_nanotime: AtomicU64,

    suspend_all_stats: Mutex<SuspendAllStats>,

    /// Wakeup hooks for threads that may be blocked in weak-reference
    /// accessors while Runnable; see `run_empty_checkpoint`.
    empty_checkpoint_wakeups: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,

    /// Callbacks run while a thread unregisters.
    exit_callbacks: Mutex<Vec<Box<dyn Fn(&Thread) + Send + Sync>>>,
}

impl ThreadList {
    pub fn new(options: Options) -> Arc<ThreadList> {
        debug!(
            "quiesce {} ({}) starting, suspend timeout {}ns",
            crate::build_info::PKG_VERSION,
            *crate::build_info::GIT_VERSION,
            options.thread_suspend_timeout_ns
        );
        Arc::new(ThreadList {
            list_lock: TrackedMutex::new(
                "thread list lock",
                LockLevel::ThreadList,
                ThreadListState {
                    list: Vec::new(),
                    unregistering_count: 0,
                },
            ),
            thread_exit_cond: Condvar::new(),
            suspend_count_lock: TrackedMutex::new(
                "thread suspend count lock",
                LockLevel::ThreadSuspendCount,
                SuspendCountState {
                    suspend_all_count: 0,
                },
            ),
            resume_cond: Condvar::new(),
            mutator_lock: MutatorLock::new(),
            user_code_suspension_lock: TrackedMutex::new(
                "user code suspension lock",
                LockLevel::UserCodeSuspension,
                (),
            ),
            suspendall_barrier: Arc::new(SuspendBarrier::new(0)),
            empty_checkpoint_barrier: Barrier::new(0),
            allocated_ids: spin::Mutex::new(ThreadIdAllocator::new()),
            options,
            long_suspend: AtomicBool::new(false),
            sig_quit_nanotime: AtomicU64::new(0),
            suspend_all_stats: Mutex::new(SuspendAllStats::default()),
            empty_checkpoint_wakeups: Mutex::new(Vec::new()),
            exit_callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn mutator_lock(&self) -> &MutatorLock {
        &self.mutator_lock
    }

    /// The lock user-code (debugger) suspend/resume pairs must hold.
    pub fn user_code_suspension_lock(&self) -> &TrackedMutex<()> {
        &self.user_code_suspension_lock
    }

    pub(crate) fn suspend_count_lock(&self) -> &TrackedMutex<SuspendCountState> {
        &self.suspend_count_lock
    }

    pub(crate) fn resume_cond(&self) -> &Condvar {
        &self.resume_cond
    }

    pub(crate) fn suspendall_barrier(&self) -> &Arc<SuspendBarrier> {
        &self.suspendall_barrier
    }

    pub(crate) fn empty_checkpoint_barrier(&self) -> &Barrier {
        &self.empty_checkpoint_barrier
    }

    pub fn suspend_all_stats(&self) -> SuspendAllStats {
        *self
            .suspend_all_stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Tell suspend waits that a SIGQUIT dump started now, so they widen
    /// their deadlines instead of blaming a thread busy dumping.
    pub fn note_sig_quit_in_progress(&self) {
        self.sig_quit_nanotime
            .store(os::nanotime().max(1), Ordering::Relaxed);
    }

    pub fn clear_sig_quit(&self) {
        self.sig_quit_nanotime
            .store(0, Ordering::Relaxed);
    }

    /// Register a wakeup hook broadcast while an empty checkpoint waits,
    /// to kick threads blocked in weak-reference accessors.
    pub fn add_empty_checkpoint_wakeup(&self, hook: Box<dyn Fn() + Send + Sync>) {
        self.empty_checkpoint_wakeups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    /// Register a callback run on each thread as it unregisters.
    pub fn add_thread_exit_callback(&self, callback: Box<dyn Fn(&Thread) + Send + Sync>) {
        self.exit_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    // ------------------------------------------------------------------
    // Registration.
    // ------------------------------------------------------------------

    /// Attach the calling thread. The new thread starts in `Native` and
    /// inherits any SuspendAll in progress, so it cannot enter Runnable
    /// during a pause.
    pub fn register(&self, name: &str, peer: OpaquePointer) -> Arc<Thread> {
        let thread = Arc::new(Thread::new(self.allocated_ids.lock().alloc(), name, peer));
        debug!("registering {}", thread);
        let mut list_guard = self.list_lock.lock(&thread);
        let suspend_guard = self.suspend_count_lock.lock(&thread);
        if suspend_guard.suspend_all_count == 1 {
            thread.increment_suspend_count(&thread, false, None, SuspendReason::Internal);
        } else {
            debug_assert_eq!(suspend_guard.suspend_all_count, 0);
        }
        assert!(!contains(&list_guard.list, &thread));
        list_guard.list.push(thread.clone());
        drop(suspend_guard);
        drop(list_guard);
        thread
    }

    /// Detach the calling thread. Blocks while the thread has a pending
    /// suspend request or somebody is running its flip function, since
    /// requesters still hold references into it.
    pub fn unregister(&self, thread: &Arc<Thread>, run_callbacks: bool) {
        assert_ne!(thread.state(), ThreadState::Runnable);
        self.mutator_lock.assert_not_held(thread);
        debug!("unregistering {}", thread);

        {
            let mut list_guard = self.list_lock.lock(thread);
            list_guard.unregistering_count += 1;
        }

        // Anything that can call back into the embedder happens here, not
        // after we start tearing the thread down.
        if run_callbacks {
            let callbacks = self
                .exit_callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for callback in callbacks.iter() {
                callback(thread);
            }
        }

        loop {
            {
                let mut list_guard = self.list_lock.lock(thread);
                assert!(
                    contains(&list_guard.list, thread),
                    "request to unregister unattached {}",
                    thread
                );
                let suspend_guard = self.suspend_count_lock.lock(thread);
                let state_and_flags = thread.state_and_flags(Ordering::Acquire);
                if !state_and_flags.is_flag_set(ThreadFlag::RunningFlipFunction)
                    && !state_and_flags.is_flag_set(ThreadFlag::SuspendRequest)
                {
                    let index = list_guard
                        .list
                        .iter()
                        .position(|t| Arc::ptr_eq(t, thread))
                        .unwrap();
                    list_guard.list.remove(index);
                    thread.signal_exit_flags();
                    // Wake waiters polling exit flags under the suspend
                    // count lock (flip helpers).
                    self.resume_cond.notify_all();
                    drop(suspend_guard);
                    break;
                }
            }
            // A suspend request or flip is in flight; give the requester
            // time to finish with us. Important with realtime priorities.
            std::thread::sleep(Duration::from_micros(1));
        }

        // Release the id only now, so no concurrent thread can observe two
        // live threads with the same id.
        self.allocated_ids.lock().release(thread.thread_id());

        let mut list_guard = self.list_lock.lock(thread);
        list_guard.unregistering_count -= 1;
        self.thread_exit_cond.notify_all();
    }

    /// Wait until no unregister is in flight. Only meaningful when the
    /// caller knows no new unregisters can start.
    pub fn wait_for_unregister_to_complete(&self, self_thread: &Thread) {
        let mut guard = self.list_lock.lock(self_thread);
        while guard.unregistering_count != 0 {
            warn!("waiting for a thread to finish unregistering");
            guard.wait(&self.thread_exit_cond);
        }
    }

    pub fn size(&self, self_thread: &Thread) -> usize {
        self.list_lock.lock(self_thread).list.len()
    }

    /// Run `f` for every registered thread.
    pub fn for_each(&self, self_thread: &Thread, mut f: impl FnMut(&Arc<Thread>)) {
        let guard = self.list_lock.lock(self_thread);
        for thread in &guard.list {
            f(thread);
        }
    }

    pub fn find_thread_by_thread_id(&self, self_thread: &Thread, id: u32) -> Option<Arc<Thread>> {
        let guard = self.list_lock.lock(self_thread);
        guard.list.iter().find(|t| t.thread_id() == id).cloned()
    }

    pub fn find_thread_by_tid(&self, self_thread: &Thread, tid: libc::pid_t) -> Option<Arc<Thread>> {
        let guard = self.list_lock.lock(self_thread);
        guard.list.iter().find(|t| t.tid() == tid).cloned()
    }

    // ------------------------------------------------------------------
    // Transitions and polls, re-exported at the list level because they
    // need the list's locks and barriers.
    // ------------------------------------------------------------------

    /// Leave Runnable, running any pending checkpoints and acknowledging
    /// suspend barriers on the way out.
    pub fn transition_from_runnable_to_suspended(&self, thread: &Thread, new_state: ThreadState) {
        thread.transition_from_runnable_to_suspended(self, new_state);
    }

    /// Enter Runnable, blocking while a suspend request is pending and
    /// settling any flip function first.
    pub fn transition_from_suspended_to_runnable(&self, thread: &Thread) -> ThreadState {
        thread
            .transition_from_suspended_to_runnable(self, false)
            .expect("infallible transition failed")
    }

    /// Like `transition_from_suspended_to_runnable` but returns `None`
    /// instead of blocking when a suspend request is pending.
    pub fn try_transition_from_suspended_to_runnable(&self, thread: &Thread) -> Option<ThreadState> {
        thread.transition_from_suspended_to_runnable(self, true)
    }

    /// The cooperative poll a mutator inserts into long-running code.
    pub fn check_suspend(&self, thread: &Thread) {
        thread.check_suspend(self);
    }

    // ------------------------------------------------------------------
    // Checkpoints.
    // ------------------------------------------------------------------

    /// Run `checkpoint` on all registered threads. Returns the number of
    /// threads that have run it or will run it at their next suspension
    /// point. Runnable targets run it themselves; suspended targets have
    /// it run on their behalf by this thread. `callback`, if given, runs
    /// inside the initial critical section, after the target set is
    /// captured.
    ///
    /// Does not wait for Runnable targets to get around to the closure;
    /// callers that need completion pair the closure with a barrier.
    pub fn run_checkpoint(
        &self,
        self_thread: &Arc<Thread>,
        checkpoint: &Arc<dyn Closure>,
        callback: Option<&dyn Closure>,
        allow_lock_checking: bool,
        acquire_mutator_lock: bool,
    ) -> usize {
        self.mutator_lock.assert_not_exclusive_held(self_thread);
        debug_assert!(!self_thread.is_lock_held(LockLevel::ThreadList));
        debug_assert!(!self_thread.is_lock_held(LockLevel::ThreadSuspendCount));
        let mutator_lock_held = self.mutator_lock.is_shared_held(self_thread);
        debug_assert!(!(mutator_lock_held && acquire_mutator_lock));
        let old_state = self_thread.state();

        if cfg!(debug_assertions) && allow_lock_checking && !acquire_mutator_lock {
            self_thread.disallow_pre_monitor_mutexes();
        }

        if acquire_mutator_lock {
            self.transition_from_suspended_to_runnable(self_thread);
        }
        let mut list_guard = Some(self.list_lock.lock(self_thread));
        let mut suspend_guard = Some(self.suspend_count_lock.lock(self_thread));

        // First try to install the checkpoint in each thread. This only
        // succeeds for Runnable threads; track the rest.
        let mut count = list_guard.as_ref().unwrap().list.len();
        let mut remaining: Vec<Option<Arc<Thread>>> = Vec::new();
        for thread in &list_guard.as_ref().unwrap().list {
            if !Arc::ptr_eq(thread, self_thread) && !thread.request_checkpoint(checkpoint.clone()) {
                remaining.push(Some(thread.clone()));
            }
        }

        // Register an exit flag for each remaining thread: they may die
        // before we get to them.
        let exit_flags: Vec<Arc<ThreadExitFlag>> = remaining
            .iter()
            .map(|_| Arc::new(ThreadExitFlag::new()))
            .collect();
        for (thread, exit_flag) in remaining.iter().zip(exit_flags.iter()) {
            thread.as_ref().unwrap().notify_on_thread_exit(exit_flag);
        }

        if let Some(callback) = callback {
            callback.run(self_thread);
        }

        let nthreads = remaining.len();
        let mut starting_thread = 0;
        // Run the checkpoint for the suspended threads, in rounds: a
        // target may bounce back to Runnable between our observations.
        while starting_thread != nthreads {
            let mut next_starting_thread = nthreads;
            for i in 0..nthreads {
                let Some(thread) = remaining[i].clone() else {
                    continue;
                };
                if exit_flags[i].has_exited() {
                    remaining[i] = None;
                    count -= 1;
                    continue;
                }
                if thread.request_checkpoint(checkpoint.clone()) {
                    // Thread became runnable and will run it; we're done.
                    thread.unregister_thread_exit_flag(&exit_flags[i]);
                    remaining[i] = None;
                    continue;
                }
                // Still suspended, as expected. Pin it that way.
                thread.increment_suspend_count(self_thread, false, None, SuspendReason::Internal);
                if thread.is_suspended() {
                    // Run the closure on the target's behalf, without the
                    // thread list and suspend count locks.
                    suspend_guard.take();
                    list_guard.take();
                    if mutator_lock_held || acquire_mutator_lock {
                        // A heap-accessing checkpoint must not run before
                        // the target's flip function.
                        Thread::ensure_flip_function_started(self, self_thread, &thread, None);
                        if thread
                            .state_and_flags(Ordering::Acquire)
                            .is_any_flag_set(FLIP_FUNCTION_FLAGS)
                        {
                            // Another thread is running the flip for this
                            // target; retry it in the next round.
                            next_starting_thread = next_starting_thread.min(i);
                            list_guard = Some(self.list_lock.lock(self_thread));
                            suspend_guard = Some(self.suspend_count_lock.lock(self_thread));
                            thread.decrement_suspend_count(self_thread, false);
                            self.resume_cond.notify_all();
                            continue;
                        }
                    }
                    checkpoint.run(&thread);
                    if acquire_mutator_lock {
                        {
                            let _guard = self.suspend_count_lock.lock(self_thread);
                            thread.decrement_suspend_count(self_thread, false);
                            // With no waiters this broadcast stays cheap.
                            self.resume_cond.notify_all();
                        }
                        // Let ourselves run checkpoints, or be suspended,
                        // between checkpoint invocations.
                        self.transition_from_runnable_to_suspended(self_thread, old_state);
                        self.transition_from_suspended_to_runnable(self_thread);
                        list_guard = Some(self.list_lock.lock(self_thread));
                        suspend_guard = Some(self.suspend_count_lock.lock(self_thread));
                    } else {
                        list_guard = Some(self.list_lock.lock(self_thread));
                        suspend_guard = Some(self.suspend_count_lock.lock(self_thread));
                        thread.decrement_suspend_count(self_thread, false);
                        self.resume_cond.notify_all();
                    }
                    thread.unregister_thread_exit_flag(&exit_flags[i]);
                    remaining[i] = None;
                } else {
                    // It became runnable between our check and the count
                    // bump; defer to the next round rather than wait.
                    thread.decrement_suspend_count(self_thread, false);
                    self.resume_cond.notify_all();
                    next_starting_thread = next_starting_thread.min(i);
                }
            }
            starting_thread = next_starting_thread;
        }

        suspend_guard.take();
        list_guard.take();

        // Finally run the checkpoint on ourself.
        checkpoint.run(self_thread);

        if acquire_mutator_lock {
            self.transition_from_runnable_to_suspended(self_thread, old_state);
        }

        debug_assert!(remaining.iter().all(Option::is_none));
        self.debug_check_unregistered_everywhere(self_thread, &exit_flags);

        if cfg!(debug_assertions) && allow_lock_checking && !acquire_mutator_lock {
            self_thread.allow_pre_monitor_mutexes();
        }
        count
    }

    /// Returns only when every thread that was Runnable at the start has
    /// passed at least one suspension point, proving no in-flight mutator
    /// heap access survives. Threads stuck in weak-reference accessors
    /// stay Runnable without reaching a transition, so registered wakeup
    /// hooks are re-broadcast every 100ms until everyone has passed.
    pub fn run_empty_checkpoint(&self, self_thread: &Arc<Thread>) {
        self.mutator_lock.assert_not_exclusive_held(self_thread);
        debug_assert!(!self_thread.is_lock_held(LockLevel::ThreadList));
        debug_assert!(!self_thread.is_lock_held(LockLevel::ThreadSuspendCount));
        let barrier = &self.empty_checkpoint_barrier;
        barrier.init(0);
        let mut count: i64 = 0;
        let mut runnable_thread_ids: Vec<u32> = Vec::new();
        {
            let list_guard = self.list_lock.lock(self_thread);
            let _suspend_guard = self.suspend_count_lock.lock(self_thread);
            for thread in &list_guard.list {
                if Arc::ptr_eq(thread, self_thread) {
                    continue;
                }
                loop {
                    if thread.request_empty_checkpoint() {
                        // It will decrement the barrier at its next
                        // suspension point.
                        count += 1;
                        if cfg!(debug_assertions) {
                            runnable_thread_ids.push(thread.thread_id());
                        }
                        break;
                    }
                    if thread.state() != ThreadState::Runnable {
                        // Seen suspended: it cannot be mid heap access.
                        break;
                    }
                }
            }
        }

        // Wake up threads blocked on weak-ref access so they poll the
        // request; they are Runnable and will never reach a transition.
        self.broadcast_empty_checkpoint_wakeups();

        let old_state = enter_state(self, self_thread, ThreadState::WaitingForCheckpointsToRun);
        let mut total_wait = Duration::ZERO;
        let mut first_iter = true;
        loop {
            // Re-broadcast every iteration: a target can be preempted
            // between observing the request and blocking on the mutex it
            // waits on, missing a single wakeup.
            self.broadcast_empty_checkpoint_wakeups();
            let barrier_count = if first_iter { count } else { 0 };
            first_iter = false;
            let timed_out = barrier.increment(barrier_count, EMPTY_CHECKPOINT_PERIODIC_TIMEOUT);
            if !timed_out {
                break;
            }
            total_wait += EMPTY_CHECKPOINT_PERIODIC_TIMEOUT;
            if total_wait > EMPTY_CHECKPOINT_TOTAL_TIMEOUT {
                let mut message = format!(
                    "empty checkpoint timeout: barrier count {}, runnable thread ids [{}]",
                    barrier.count(),
                    runnable_thread_ids.iter().map(|id| id.to_string()).join(", ")
                );
                let list_guard = self.list_lock.lock(self_thread);
                for thread in &list_guard.list {
                    if thread.read_flag(ThreadFlag::EmptyCheckpointRequest, Ordering::Relaxed) {
                        message.push_str(&format!("\nunresponsive: {}", thread));
                    }
                }
                message.push('\n');
                message.push_str(&self.mutator_lock.describe());
                panic!("{}", message);
            }
        }
        restore_state(self, self_thread, old_state);
    }

    fn broadcast_empty_checkpoint_wakeups(&self) {
        let hooks = self
            .empty_checkpoint_wakeups
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for hook in hooks.iter() {
            hook();
        }
    }

    // ------------------------------------------------------------------
    // SuspendAll / ResumeAll.
    // ------------------------------------------------------------------

    /// Suspend every other thread and take the mutator lock exclusively.
    /// If `long_suspend`, concurrent suspend attempts never time out
    /// against this pause.
    pub fn suspend_all(&self, self_thread: &Arc<Thread>, cause: &str, long_suspend: bool) {
        debug!("{} SuspendAll for {} starting...", self_thread, cause);
        probe!(quiesce, suspend_all_begin);
        let start_time = Instant::now();

        self.suspend_all_internal(self_thread, SuspendReason::Internal);
        // All threads are known to have acknowledged (but one may still
        // hold an explicit mutator share); grab exclusive access.
        let timeout = Duration::from_nanos(self.options.effective_suspend_timeout_ns());
        loop {
            if self.mutator_lock.exclusive_lock_timed(self_thread, timeout) {
                break;
            }
            // Reading long_suspend without the mutator lock is slightly
            // racy; in rare cases this produces an extra timeout round.
            if !self.long_suspend.load(Ordering::Relaxed) {
                panic!(
                    "thread suspend timeout waiting for exclusive mutator lock; {}",
                    self.mutator_lock.describe()
                );
            }
        }
        self.long_suspend
            .store(long_suspend, Ordering::Relaxed);

        let suspend_time = start_time.elapsed();
        {
            let mut stats = self
                .suspend_all_stats
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            stats.count += 1;
            stats.total += suspend_time;
            stats.max = stats.max.max(suspend_time);
        }
        if suspend_time > LONG_THREAD_SUSPEND_THRESHOLD {
            warn!("suspending all threads took: {:?}", suspend_time);
        }

        if cfg!(debug_assertions) {
            self.assert_other_threads_are_suspended(self_thread);
        }
        // suspend_all_internal blocks if we are in the middle of a flip.
        debug_assert!(!self_thread.read_flag(ThreadFlag::PendingFlipFunction, Ordering::Relaxed));
        debug_assert!(!self_thread.read_flag(ThreadFlag::RunningFlipFunction, Ordering::Relaxed));
        debug!("{} SuspendAll complete", self_thread);
    }

    /// Request that every other thread suspend and wait for the
    /// acknowledgements, without touching the mutator lock.
    fn suspend_all_internal(&self, self_thread: &Arc<Thread>, reason: SuspendReason) {
        self.mutator_lock.assert_not_exclusive_held(self_thread);
        debug_assert!(!self_thread.is_lock_held(LockLevel::ThreadList));
        debug_assert!(!self_thread.is_lock_held(LockLevel::ThreadSuspendCount));
        debug_assert_ne!(self_thread.state(), ThreadState::Runnable);

        // First request that all threads suspend, then wait for them. The
        // scheme relies on two other behaviours: threads cannot be deleted
        // while suspended or carrying a suspend request (see unregister),
        // and new threads attach suspended whenever suspend_all_count is
        // set (see register).
        let mut iter_count = 0;
        loop {
            iter_count += 1;
            {
                let list_guard = self.list_lock.lock(self_thread);
                let mut suspend_guard = self.suspend_count_lock.lock(self_thread);
                if suspend_guard.suspend_all_count == 0 {
                    // Never run multiple SuspendAlls concurrently. If we
                    // are also a suspend target ourselves, proceed anyway
                    // and ignore requests from others until we resume.
                    suspend_guard.suspend_all_count = 1;
                    let mut found_myself = false;
                    self.suspendall_barrier
                        .reset(list_guard.list.len() as u32 - 1);
                    for thread in &list_guard.list {
                        if Arc::ptr_eq(thread, self_thread) {
                            found_myself = true;
                            continue;
                        }
                        trace!("requesting thread suspend: {}", thread);
                        thread.increment_suspend_count(self_thread, true, None, reason);
                        if thread.is_suspended() {
                            // Effectively pass the barrier on behalf of the
                            // already suspended thread. It cannot yet have
                            // acted on the request since we still hold the
                            // suspend count lock; it will see the barrier
                            // bookkeeping already cleared if and when it
                            // reaches pass_active_suspend_barriers.
                            thread.clear_suspendall_barrier();
                            self.suspendall_barrier.pass();
                            if !thread.has_active_suspend_barrier() {
                                thread.atomic_clear_flag(
                                    ThreadFlag::ActiveSuspendBarrier,
                                    Ordering::SeqCst,
                                );
                            }
                        }
                        // Otherwise the target is Runnable and will hit
                        // transition_from_runnable_to_suspended shortly.
                        // It sees SuspendRequest and then necessarily
                        // ActiveSuspendBarrier: state and flags share one
                        // atomic word, so the bits cannot be observed
                        // apart.
                    }
                    self_thread.atomic_set_flag(ThreadFlag::SuspensionImmune, Ordering::Relaxed);
                    debug_assert!(found_myself);
                    break;
                }
                drop(suspend_guard);
                drop(list_guard);
            }
            if iter_count >= MAX_SUSPEND_RETRIES {
                panic!("too many SuspendAll retries: {}", iter_count);
            }
            {
                let mut suspend_guard = self.suspend_count_lock.lock(self_thread);
                debug_assert!(suspend_guard.suspend_all_count <= 1);
                if suspend_guard.suspend_all_count != 0 {
                    // Another SuspendAll holds the pause. We are not
                    // runnable, so simply wait for its resume broadcast.
                    suspend_guard.wait(&self.resume_cond);
                }
            }
        }

        // Wait for the barrier with staged timeouts, gathering diagnostics
        // as attempts fail.
        let mut culprit: Option<Arc<Thread>> = None;
        let mut tid: libc::pid_t = 0;
        let mut details = String::new();
        for attempt_of_4 in 1..=4u32 {
            let result = self.wait_for_suspend_barrier(&self.suspendall_barrier, tid, attempt_of_4);
            let Some(failure_info) = result else {
                break;
            };
            if attempt_of_4 == 3 {
                // Second to last attempt; find who is still not suspended.
                let list_guard = self.list_lock.lock(self_thread);
                let _suspend_guard = self.suspend_count_lock.lock(self_thread);
                let holdouts: Vec<&Arc<Thread>> = list_guard
                    .list
                    .iter()
                    .filter(|t| !Arc::ptr_eq(t, self_thread) && !t.is_suspended())
                    .collect();
                details = format!(
                    "remaining threads: {}",
                    holdouts.iter().map(|t| t.to_string()).join(", ")
                );
                if let Some(last) = holdouts.last() {
                    culprit = Some(Arc::clone(last));
                    tid = last.tid();
                }
            } else if attempt_of_4 == 4 {
                // Final attempt still timed out.
                match culprit {
                    None => panic!("SuspendAll timeout; couldn't find holdouts"),
                    Some(ref culprit) => {
                        let message = format!(
                            "SuspendAll timeout; {}: Info for {}: state&flags: {:#x}, native priority: {}, barrier value: {}, {}",
                            details,
                            culprit.name(),
                            culprit.state_and_flags(Ordering::Relaxed).value(),
                            os::native_priority(culprit.tid()),
                            self.suspendall_barrier.count(),
                            failure_info
                        );
                        culprit.abort_in_this(message);
                    }
                }
            }
        }
    }

    /// Resume all threads suspended by `suspend_all`.
    pub fn resume_all(&self, self_thread: &Arc<Thread>) {
        if cfg!(debug_assertions) {
            self.assert_other_threads_are_suspended(self_thread);
        }
        let list_guard = self.list_lock.lock(self_thread);
        let mut suspend_guard = self.suspend_count_lock.lock(self_thread);
        self.resume_all_internal(self_thread, &list_guard, &mut suspend_guard);
        probe!(quiesce, suspend_all_end);
    }

    /// The shared tail of `resume_all` and `flip_thread_roots`: drops the
    /// exclusive mutator lock and undoes the suspension while both locks
    /// are held.
    fn resume_all_internal(
        &self,
        self_thread: &Arc<Thread>,
        list_guard: &TrackedGuard<'_, ThreadListState>,
        suspend_guard: &mut TrackedGuard<'_, SuspendCountState>,
    ) {
        debug_assert_ne!(self_thread.state(), ThreadState::Runnable);
        trace!("{} ResumeAll starting", self_thread);
        self.long_suspend
            .store(false, Ordering::Relaxed);

        self.mutator_lock.exclusive_unlock(self_thread);

        for thread in &list_guard.list {
            if !Arc::ptr_eq(thread, self_thread) {
                thread.decrement_suspend_count(self_thread, false);
            }
        }

        // Unblocks attaching threads and other SuspendAlls once the
        // suspend count lock is released.
        assert_eq!(suspend_guard.suspend_all_count, 1);
        suspend_guard.suspend_all_count -= 1;
        self_thread.atomic_clear_flag(ThreadFlag::SuspensionImmune, Ordering::Relaxed);
        // Pending suspend requests against us are honoured on our next
        // Runnable transition.

        // Broadcast to all suspended threads, some or all of which may
        // choose to wake up. No need to wait for them.
        self.resume_cond.notify_all();
        trace!("{} ResumeAll complete", self_thread);
    }

    fn assert_other_threads_are_suspended(&self, self_thread: &Arc<Thread>) {
        let list_guard = self.list_lock.lock(self_thread);
        let _suspend_guard = self.suspend_count_lock.lock(self_thread);
        for thread in &list_guard.list {
            if !Arc::ptr_eq(thread, self_thread) {
                assert!(
                    thread.is_suspended(),
                    "unsuspended thread: {} (requester {})",
                    thread,
                    self_thread
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Single-thread suspension.
    // ------------------------------------------------------------------

    /// Resume a single thread suspended by `suspend_thread_by_*`. Returns
    /// false if the thread was not suspended; that is fatal for internal
    /// resumes, which must be paired with a successful suspend.
    pub fn resume(&self, self_thread: &Arc<Thread>, thread: &Arc<Thread>, reason: SuspendReason) -> bool {
        debug_assert!(!Arc::ptr_eq(thread, self_thread));
        trace!("Resume({}) starting... {}", thread, reason);

        {
            let list_guard = self.list_lock.lock(self_thread);
            let _suspend_guard = self.suspend_count_lock.lock(self_thread);
            if !thread.is_suspended() {
                if reason == SuspendReason::ForUserCode {
                    error!("Resume({}): thread not suspended", thread);
                    return false;
                }
                panic!("Resume({}): thread not suspended", thread);
            }
            if !contains(&list_guard.list, thread) {
                // Only threads within the list can be suspended, else we
                // cannot stop them from deleting themselves.
                if reason == SuspendReason::ForUserCode {
                    error!("Resume({}): thread not within thread list", thread);
                    return false;
                }
                panic!("Resume({}): thread not within thread list", thread);
            }
            thread.decrement_suspend_count(self_thread, reason == SuspendReason::ForUserCode);
            self.resume_cond.notify_all();
        }

        trace!("Resume({}) finished waking others", thread);
        true
    }

    /// Suspend the thread whose peer matches. Returns the thread on
    /// success, or `None` if no such thread exists, it exited mid-call,
    /// or (with `attempt_of_4` in 1..4) the attempt timed out. The caller
    /// must be in a suspended state; it is briefly made Runnable while
    /// identities are inspected.
    pub fn suspend_thread_by_peer(
        &self,
        self_thread: &Arc<Thread>,
        peer: OpaquePointer,
        reason: SuspendReason,
    ) -> Option<Arc<Thread>> {
        let old_self_state = self_thread.state();
        // Runnable, so the target cannot be flipped out from under us
        // while we inspect identities.
        self.transition_from_suspended_to_runnable(self_thread);
        let list_guard = self.list_lock.lock(self_thread);
        let thread = list_guard
            .list
            .iter()
            .find(|t| t.peer() == peer)
            .cloned();
        let Some(thread) = thread else {
            warn!("No such thread for suspend: peer {:#x}", peer.to_usize());
            drop(list_guard);
            self.transition_from_runnable_to_suspended(self_thread, old_self_state);
            return None;
        };
        trace!("SuspendThreadByPeer found thread: {}", thread);
        // Releases the thread list lock and our Runnable state.
        let success = self.suspend_thread(
            self_thread,
            &thread,
            reason,
            old_self_state,
            "SuspendThreadByPeer",
            0,
            list_guard,
        );
        success.then_some(thread)
    }

    /// Suspend a thread by internal id, typically for monitor inflation.
    /// Ids are recycled, so this may find a different thread than the one
    /// the id was captured from; exit flags catch the stale case.
    /// `attempt_of_4` is 0 for a single full-timeout attempt, or 1..=4 for
    /// caller-driven retries with fractional timeouts. The caller must be
    /// in a suspended state.
    pub fn suspend_thread_by_thread_id(
        &self,
        self_thread: &Arc<Thread>,
        thread_id: u32,
        reason: SuspendReason,
        attempt_of_4: u32,
    ) -> Option<Arc<Thread>> {
        assert_ne!(thread_id, INVALID_THREAD_ID);
        let old_self_state = self_thread.state();
        self.transition_from_suspended_to_runnable(self_thread);
        let list_guard = self.list_lock.lock(self_thread);
        let thread = list_guard
            .list
            .iter()
            .find(|t| t.thread_id() == thread_id)
            .cloned();
        let Some(thread) = thread else {
            // There's a race in inflating a lock and the owner giving up
            // ownership and then dying.
            warn!("No such thread id {} for suspend", thread_id);
            drop(list_guard);
            self.transition_from_runnable_to_suspended(self_thread, old_self_state);
            return None;
        };
        trace!("SuspendThreadByThreadId found thread: {}", thread);
        let success = self.suspend_thread(
            self_thread,
            &thread,
            reason,
            old_self_state,
            "SuspendThreadByThreadId",
            attempt_of_4,
            list_guard,
        );
        success.then_some(thread)
    }

    /// Suspend one thread and wait for its acknowledgement. Consumes the
    /// held thread list guard; on return no locks are held and `self` is
    /// back in `self_state`.
    #[allow(clippy::too_many_arguments)]
    fn suspend_thread(
        &self,
        self_thread: &Arc<Thread>,
        thread: &Arc<Thread>,
        reason: SuspendReason,
        self_state: ThreadState,
        func_name: &str,
        attempt_of_4: u32,
        list_guard: TrackedGuard<'_, ThreadListState>,
    ) -> bool {
        // This implementation fails if thread == self; callers handle that
        // case themselves.
        assert!(!Arc::ptr_eq(thread, self_thread), "{}(self)", func_name);
        let mut is_suspended = false;
        let tid = thread.tid();
        let wrapped_barrier = Arc::new(SuspendBarrier::new(1));
        let suspended_count = thread.suspended_count_stat();
        let checkpoint_count = thread.checkpoint_count_stat();
        let exit_flag = Arc::new(ThreadExitFlag::new());
        thread.notify_on_thread_exit(&exit_flag);

        let mut list_guard = Some(list_guard);
        let mut exited = false;
        let mut iter_count = 0;
        loop {
            iter_count += 1;
            {
                debug_assert!(contains(&list_guard.as_ref().unwrap().list, thread));
                trace!("{} suspending: {}", func_name, thread);
                let _suspend_guard = self.suspend_count_lock.lock(self_thread);
                if self_thread.suspend_count() == 0 {
                    thread.increment_suspend_count(
                        self_thread,
                        false,
                        Some(&wrapped_barrier),
                        reason,
                    );
                    if thread.is_suspended() {
                        // Already quiescent: pass the barrier on its
                        // behalf. It cannot have seen the barrier, since
                        // pass_active_suspend_barriers also takes the
                        // suspend count lock.
                        thread.remove_suspend1_barrier(&wrapped_barrier);
                        if !thread.has_active_suspend_barrier() {
                            thread.atomic_clear_flag(
                                ThreadFlag::ActiveSuspendBarrier,
                                Ordering::SeqCst,
                            );
                        }
                        is_suspended = true;
                    }
                    debug_assert!(thread.suspend_count() > 0);
                    break;
                }
                // We hold the suspend count lock but somebody is trying to
                // suspend *us*; suspending another thread now could
                // deadlock a cycle of suspenders. Back off and let it
                // happen first.
            }
            if iter_count >= MAX_SUSPEND_RETRIES {
                panic!("too many suspend retries of {}", thread);
            }
            list_guard.take();
            {
                self.transition_from_runnable_to_suspended(self_thread, ThreadState::Suspended);
                std::thread::sleep(THREAD_SUSPEND_SLEEP);
                self.transition_from_suspended_to_runnable(self_thread);
            }
            list_guard = Some(self.list_lock.lock(self_thread));
            if exit_flag.has_exited() {
                exited = true;
                break;
            }
        }
        if !exited {
            thread.unregister_thread_exit_flag(&exit_flag);
        }
        list_guard.take();
        self.transition_from_runnable_to_suspended(self_thread, self_state);
        if exited {
            // Benign: e.g. the owner of an inflating lock gave up
            // ownership and died before we got to it.
            warn!("thread with tid {} exited before suspending", tid);
            return false;
        }

        // Now wait for the target to decrement the suspend barrier.
        let mut failure_info = None;
        if !is_suspended {
            failure_info = self.wait_for_suspend_barrier(&wrapped_barrier, tid, attempt_of_4);
            if failure_info.is_none() {
                is_suspended = true;
            }
        }
        while !is_suspended {
            if (1..4).contains(&attempt_of_4) {
                // The caller will try again; undo our request so the
                // barrier can be freed. The barrier must leave the
                // target's list before this frame returns.
                let _suspend_guard = self.suspend_count_lock.lock(self_thread);
                if wrapped_barrier.count() == 0 {
                    // Succeeded in the meantime.
                    is_suspended = true;
                    continue;
                }
                if !thread.try_remove_suspend1_barrier(&wrapped_barrier) {
                    // The target drained its barrier list and is about to
                    // decrement: it reached a suspension point after all.
                    is_suspended = true;
                    continue;
                }
                if !thread.has_active_suspend_barrier() {
                    thread.atomic_clear_flag(ThreadFlag::ActiveSuspendBarrier, Ordering::SeqCst);
                }
                // Do not use resume(): the target is probably not fully
                // suspended.
                thread.decrement_suspend_count(self_thread, reason == SuspendReason::ForUserCode);
                self.resume_cond.notify_all();
                return false;
            }
            let message = format!(
                "{} timed out: {}: state&flags: {:#x}, native priority: {}, barrier value: {}, nsusps: {}, ncheckpts: {}, thread_info: {}",
                func_name,
                thread.name(),
                thread.state_and_flags(Ordering::Relaxed).value(),
                os::native_priority(thread.tid()),
                wrapped_barrier.count(),
                thread.suspended_count_stat().wrapping_sub(suspended_count),
                thread.checkpoint_count_stat().wrapping_sub(checkpoint_count),
                failure_info.as_deref().unwrap_or("")
            );
            // Check one last time whether the thread passed the barrier;
            // empirically this happens a few percent of the time.
            if wrapped_barrier.count() != 0 {
                // The target still holds a pointer to our barrier;
                // returning would be unsafe. Crash in its stack instead.
                thread.abort_in_this(message);
            }
            is_suspended = true;
        }
        trace!("{} suspended: {}", func_name, thread);
        if cfg!(debug_assertions) {
            assert!(thread.is_suspended());
            let _suspend_guard = self.suspend_count_lock.lock(self_thread);
            thread.debug_check_barrier_inactive(&wrapped_barrier);
        }
        true
    }

    // ------------------------------------------------------------------
    // Barrier waits and timeout diagnostics.
    // ------------------------------------------------------------------

    /// Wait for a suspend barrier to reach zero, in up to
    /// `SUSPEND_BARRIER_ITERS` sub-waits. Returns `None` on success, or a
    /// diagnostic string on timeout; never aborts. `tid`, if non-zero, is
    /// sampled for OS scheduler state. `attempt_of_4` of 0 means one
    /// attempt with the full timeout; 1..=4 use a quarter each, with the
    /// last compensating for priority multipliers skipped on the first.
    pub fn wait_for_suspend_barrier(
        &self,
        barrier: &SuspendBarrier,
        tid: libc::pid_t,
        attempt_of_4: u32,
    ) -> Option<String> {
        let start_time = os::nanotime();
        let mut timeout_ns = if attempt_of_4 == 0 {
            self.options.effective_suspend_timeout_ns()
        } else {
            self.options.effective_suspend_timeout_ns() / 4
        };
        let mut avg_wait_multiplier: u64 = 1;
        let mut wait_multiplier: u64 = 1;
        if attempt_of_4 != 1 {
            if os::native_priority(0) > 0 {
                // We are low priority, and thus have a longer ANR timeout;
                // stretch the suspend timeout to match.
                avg_wait_multiplier = 3;
            }
            // To keep system calls off the common path, the first of four
            // waits skips the multiplier and the last one compensates.
            wait_multiplier = if attempt_of_4 == 4 {
                2 * avg_wait_multiplier - 1
            } else {
                avg_wait_multiplier
            };
            timeout_ns *= wait_multiplier;
        }
        let collect_state = tid != 0 && (attempt_of_4 == 0 || attempt_of_4 == 4);

        let mut cur_val = barrier.count();
        if cur_val == 0 {
            return None;
        }
        let mut i = 0;
        if barrier.wait_once(cur_val, timeout_ns) {
            i = 1;
        }
        cur_val = barrier.count();
        if cur_val == 0 {
            return None;
        }

        // Long wait; gather information in case of timeout.
        let sampled_state = if collect_state {
            os::thread_stat_quick(tid)
        } else {
            String::new()
        };
        if collect_state && os::state_from_stat(&sampled_state) == Some('t') {
            warn!("thread suspension nearly timed out due to tracing stop (debugger attached?)");
            timeout_ns = TRACING_WAIT_NS;
        }
        // Extra timeout to compensate for concurrent thread dumps, so we
        // are less likely to time out during an ANR dump.
        let mut dump_adjustment_ns: u64 = 0;
        // Only fail after SUSPEND_BARRIER_ITERS sub-timeouts, to stay
        // robust against app freezing.
        while i < SUSPEND_BARRIER_ITERS {
            if barrier.wait_once(cur_val, timeout_ns + dump_adjustment_ns) {
                i += 1;
            }
            cur_val = barrier.count();
            if cur_val == 0 {
                return None;
            }
            let sig_quit = self
                .sig_quit_nanotime
                .load(Ordering::Relaxed);
            if sig_quit != 0 && i < SUSPEND_BARRIER_ITERS {
                // Spread what remains of the dump allowance over the
                // remaining sub-waits.
                let unscaled = (sig_quit + DUMP_WAIT_NS).saturating_sub(os::nanotime());
                dump_adjustment_ns =
                    unscaled * (SUSPEND_BARRIER_ITERS - i) as u64 / SUSPEND_BARRIER_ITERS as u64;
            }
            // Keep the old adjustment if the dump marker was cleared.
        }
        let final_wait_ns = os::nanotime() - start_time;
        let total_wait_ns = if attempt_of_4 == 0 {
            final_wait_ns
        } else {
            4 * final_wait_ns * avg_wait_multiplier / wait_multiplier
        };
        let mut message = if collect_state {
            format!(
                "Target states: [{:?}, {:?}]",
                os::state_from_stat(&sampled_state),
                os::state_from_stat(&os::thread_stat_quick(tid))
            )
        } else {
            format!("Barrier value: {}", cur_val)
        };
        if barrier.count() == 0 {
            message.push_str(" (barrier now passed)");
        }
        message.push_str(&format!(
            " Final wait time: {:?}; appr. total wait time: {:?}",
            Duration::from_nanos(final_wait_ns),
            Duration::from_nanos(total_wait_ns)
        ));
        Some(message)
    }

    // ------------------------------------------------------------------
    // Flip functions.
    // ------------------------------------------------------------------

    /// A checkpoint/suspend-all hybrid used to retag thread roots, e.g.
    /// from from-space to to-space references. Installs `flip_visitor` on
    /// every thread during a pause, runs `flip_callback` while the world
    /// is stopped, then resumes; each thread's visitor runs exactly once,
    /// either by the thread itself before it re-enters Runnable, by us, or
    /// by a checkpoint requester that got there first. Does not return
    /// until every visitor has run.
    pub fn flip_thread_roots(
        &self,
        self_thread: &Arc<Thread>,
        flip_visitor: &Arc<dyn Closure>,
        flip_callback: &dyn Closure,
        pause_listener: Option<&dyn GcPauseListener>,
    ) {
        self.mutator_lock.assert_not_held(self_thread);
        debug_assert!(!self_thread.is_lock_held(LockLevel::ThreadList));
        debug_assert!(!self_thread.is_lock_held(LockLevel::ThreadSuspendCount));
        assert_ne!(self_thread.state(), ThreadState::Runnable);

        let suspend_start = Instant::now();
        trace!("suspending all for thread flip");
        probe!(quiesce, thread_flip_begin);
        self.suspend_all_internal(self_thread, SuspendReason::Internal);

        if let Some(listener) = pause_listener {
            listener.start_pause();
        }

        // Run the flip callback for the collector.
        self.mutator_lock.exclusive_lock(self_thread);
        flip_callback.run(self_thread);

        // All suspended threads, ourselves first so other threads are more
        // likely to have finished flipping before we reach them; plus an
        // exit flag each, since they may exit once resumed.
        let mut flipping_threads: Vec<Arc<Thread>> = Vec::new();
        let mut exit_flags: Vec<Arc<ThreadExitFlag>> = Vec::new();
        {
            let list_guard = self.list_lock.lock(self_thread);
            let _suspend_guard = self.suspend_count_lock.lock(self_thread);
            flipping_threads.push(self_thread.clone());
            for thread in &list_guard.list {
                // Install on every thread, including us: once any thread
                // resumes, it may need to run flips on behalf of others.
                debug_assert!(Arc::ptr_eq(thread, self_thread) || thread.is_suspended());
                thread.set_flip_function(flip_visitor.clone());
                if !Arc::ptr_eq(thread, self_thread) {
                    flipping_threads.push(thread.clone());
                }
            }
            for thread in &flipping_threads {
                let exit_flag = Arc::new(ThreadExitFlag::new());
                thread.notify_on_thread_exit(&exit_flag);
                exit_flags.push(exit_flag);
            }
        }

        if let Some(listener) = pause_listener {
            listener.end_pause();
        }
        // Any thread created from here on is created by a thread that
        // already ran its flip, and so observes only flipped state.

        // Resume threads without releasing the suspend count lock until we
        // have reacquired the mutator lock in shared mode and dropped
        // suspend_all_count. This keeps a concurrent SuspendAll from
        // seeing suspend_all_count == 0 while we still need the lock, and
        // makes newly attaching threads see a consistent pause state.
        {
            let list_guard = self.list_lock.lock(self_thread);
            let mut suspend_guard = self.suspend_count_lock.lock(self_thread);
            self.resume_all_internal(self_thread, &list_guard, &mut suspend_guard);
            drop(list_guard);
            // Cannot fail: suspend_all_count was seen zero under the lock
            // we still hold, so no exclusive holder can exist.
            let locked = self.mutator_lock.shared_try_lock(self_thread);
            assert!(locked);
        }
        // A concurrent SuspendAll may now see suspend_all_count == 0, but
        // blocks on the mutator lock until the flips are done.

        let thread_count = flipping_threads.len();
        let elapsed = suspend_start.elapsed();
        {
            let mut stats = self
                .suspend_all_stats
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            stats.count += 1;
            stats.total += elapsed;
            stats.max = stats.max.max(elapsed);
        }

        // Try to run the visitor for the other threads; each suspended
        // thread will otherwise attempt it before re-entering Runnable.
        // Exactly one attempt per thread succeeds.
        let mut finished: Vec<bool> = vec![false; thread_count];
        for i in 0..thread_count {
            finished[i] = Thread::ensure_flip_function_started(
                self,
                self_thread,
                &flipping_threads[i],
                Some(&exit_flags[i]),
            );
            if finished[i] {
                let _list_guard = self.list_lock.lock(self_thread);
                flipping_threads[i].unregister_thread_exit_flag(&exit_flags[i]);
            }
        }
        // Make sure all flips complete before we return.
        for i in 0..thread_count {
            if !finished[i] {
                flipping_threads[i].wait_for_flip_function_testing_exited(
                    self,
                    self_thread,
                    &exit_flags[i],
                );
                let _list_guard = self.list_lock.lock(self_thread);
                flipping_threads[i].unregister_thread_exit_flag(&exit_flags[i]);
            }
        }

        self.debug_check_unregistered_everywhere(self_thread, &exit_flags);

        self.mutator_lock.shared_unlock(self_thread);
        probe!(quiesce, thread_flip_end);
    }

    // ------------------------------------------------------------------
    // Root visiting.
    // ------------------------------------------------------------------

    /// Visit the roots of every thread. The caller must have quiesced the
    /// world (it holds the mutator lock exclusively during a pause).
    pub fn visit_roots(
        &self,
        self_thread: &Arc<Thread>,
        visitor: &mut dyn RootVisitor,
        flags: VisitRootFlags,
    ) {
        let guard = self.list_lock.lock(self_thread);
        for thread in &guard.list {
            visitor.visit_thread_roots(thread, flags);
        }
    }

    /// Visit the roots of only the threads that happen to be suspended
    /// right now, pinning each for the duration of its visit.
    pub fn visit_roots_for_suspended_threads(
        &self,
        self_thread: &Arc<Thread>,
        visitor: &mut dyn RootVisitor,
    ) {
        let mut threads_to_visit: Vec<Arc<Thread>> = Vec::new();
        {
            let list_guard = self.list_lock.lock(self_thread);
            let _suspend_guard = self.suspend_count_lock.lock(self_thread);
            for thread in &list_guard.list {
                thread.increment_suspend_count(self_thread, false, None, SuspendReason::Internal);
                if Arc::ptr_eq(thread, self_thread) || thread.is_suspended() {
                    threads_to_visit.push(thread.clone());
                } else {
                    thread.decrement_suspend_count(self_thread, false);
                }
            }
        }

        // Visit roots without the list locks, to keep lock order clean
        // against whatever the visitor touches.
        for thread in &threads_to_visit {
            visitor.visit_thread_roots(thread, VisitRootFlags::AllRoots);
        }

        {
            let _suspend_guard = self.suspend_count_lock.lock(self_thread);
            for thread in &threads_to_visit {
                thread.decrement_suspend_count(self_thread, false);
            }
            self.resume_cond.notify_all();
        }
    }

    fn debug_check_unregistered_everywhere(
        &self,
        self_thread: &Arc<Thread>,
        exit_flags: &[Arc<ThreadExitFlag>],
    ) {
        if !cfg!(debug_assertions) {
            return;
        }
        let guard = self.list_lock.lock(self_thread);
        for thread in &guard.list {
            for exit_flag in exit_flags {
                assert!(
                    !thread.debug_is_exit_flag_registered(exit_flag),
                    "exit flag still registered on {}",
                    thread
                );
            }
        }
    }
}

fn contains(list: &[Arc<Thread>], thread: &Arc<Thread>) -> bool {
    list.iter().any(|t| Arc::ptr_eq(t, thread))
}

/// Move `thread` into `new_state`, whatever its current state, returning
/// what to hand back to [`restore_state`].
fn enter_state(list: &ThreadList, thread: &Arc<Thread>, new_state: ThreadState) -> ThreadState {
    let old_state = thread.state();
    if old_state == ThreadState::Runnable {
        list.transition_from_runnable_to_suspended(thread, new_state);
    } else {
        thread.set_state(new_state);
    }
    old_state
}

fn restore_state(list: &ThreadList, thread: &Arc<Thread>, old_state: ThreadState) {
    if old_state == ThreadState::Runnable {
        list.transition_from_suspended_to_runnable(thread);
    } else {
        thread.set_state(old_state);
    }
}

/// Suspends all threads for the lifetime of the guard.
pub struct ScopedSuspendAll<'a> {
    list: &'a ThreadList,
    self_thread: &'a Arc<Thread>,
}

impl<'a> ScopedSuspendAll<'a> {
    pub fn new(
        list: &'a ThreadList,
        self_thread: &'a Arc<Thread>,
        cause: &str,
        long_suspend: bool,
    ) -> Self {
        list.suspend_all(self_thread, cause, long_suspend);
        ScopedSuspendAll { list, self_thread }
    }
}

impl<'a> Drop for ScopedSuspendAll<'a> {
    fn drop(&mut self) {
        self.list.resume_all(self.self_thread);
    }
}
