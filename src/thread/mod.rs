//! Per-thread suspension state and the cooperative state machine.
//!
//! A [`Thread`] is registered once per OS thread that may touch managed
//! references. All coordination runs through the single atomic
//! state-and-flags word: requesters set flags, the owning thread observes
//! them at its next transition or [`check_suspend`](crate::ThreadList::check_suspend)
//! poll and reacts before it can return to Runnable.

mod exit_flag;
mod state_and_flags;

pub use exit_flag::ThreadExitFlag;
pub use state_and_flags::{StateAndFlags, ThreadFlag, ThreadState};
pub(crate) use state_and_flags::{FLIP_FUNCTION_FLAGS, SUSPEND_OR_CHECKPOINT_REQUEST_FLAGS};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32};
use std::sync::{Arc, Mutex, PoisonError};

use atomic::{Atomic, Ordering};
use atomic_refcell::AtomicRefCell;
use enum_map::EnumMap;
use strum_macros::Display;

use crate::closure::Closure;
use crate::sync::{LockLevel, SuspendBarrier};
use crate::thread_list::ThreadList;
use crate::util::os;
use crate::util::OpaquePointer;

/// Why a thread is being suspended. User-code suspensions (debugger) are
/// counted separately so that internal operations can ignore them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum SuspendReason {
    Internal,
    ForUserCode,
}

/// One registered mutator thread.
pub struct Thread {
    /// OS thread id, for scheduler-state sampling and abort routing.
    tid: libc::pid_t,
    /// Internal id allocated from the thread list's bitmap. Never zero.
    thread_id: u32,
    name: String,
    /// Opaque identity of the managed-side peer object, if any.
    peer: OpaquePointer,

    /// The coordinator word. See [`StateAndFlags`].
    state_and_flags: Atomic<u32>,

    /// How many outstanding suspensions target this thread. Written only
    /// under the thread list's suspend-count lock.
    suspend_count: AtomicI32,
    /// The subset of `suspend_count` requested on behalf of user code.
    user_code_suspend_count: AtomicI32,

    /// Completed Runnable->suspended transitions; reported in timeout
    /// diagnostics to show whether the thread made progress.
    suspended_count: AtomicU32,
    /// Completed checkpoint executions, same purpose.
    checkpoint_count: AtomicU32,

    /// Checkpoint closures installed by requesters. Pushed and popped
    /// under the suspend-count lock.
    checkpoints: Mutex<VecDeque<Arc<dyn Closure>>>,

    /// The installed flip function. Written while the world is stopped,
    /// taken exactly once by whoever wins the Pending->Running CAS.
    flip_function: AtomicRefCell<Option<Arc<dyn Closure>>>,

    /// Single-thread suspend barriers registered on this thread. The
    /// requester owns the barrier; entries are removed before the
    /// requester's call frame returns. Guarded by the suspend-count lock.
    suspend1_barriers: Mutex<Vec<Arc<SuspendBarrier>>>,
    /// Whether this thread still owes an acknowledgement to the shared
    /// SuspendAll barrier. Guarded by the suspend-count lock.
    suspendall_barrier_active: AtomicBool,

    /// Exit flags registered by requesters, tripped on unregister.
    /// Guarded by the thread list lock.
    exit_flags: Mutex<Vec<Arc<ThreadExitFlag>>>,

    /// Which lock levels this thread currently holds. Debug-only
    /// discipline checks read it; maintained in all builds (cheap).
    held_locks: EnumMap<LockLevel, AtomicBool>,
}

impl std::fmt::Display for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Thread[id={},tid={},name=\"{}\",state={}]",
            self.thread_id,
            self.tid,
            self.name,
            self.state()
        )
    }
}

impl Thread {
    pub(crate) fn new(thread_id: u32, name: &str, peer: OpaquePointer) -> Thread {
        Thread {
            tid: os::gettid(),
            thread_id,
            name: name.to_string(),
            peer,
            // Threads attach in Native: suspended until they transition.
            state_and_flags: Atomic::new(
                StateAndFlags::from_value(0)
                    .with_state(ThreadState::Native)
                    .value(),
            ),
            suspend_count: AtomicI32::new(0),
            user_code_suspend_count: AtomicI32::new(0),
            suspended_count: AtomicU32::new(0),
            checkpoint_count: AtomicU32::new(0),
            checkpoints: Mutex::new(VecDeque::new()),
            flip_function: AtomicRefCell::new(None),
            suspend1_barriers: Mutex::new(Vec::new()),
            suspendall_barrier_active: AtomicBool::new(false),
            exit_flags: Mutex::new(Vec::new()),
            held_locks: EnumMap::default(),
        }
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn tid(&self) -> libc::pid_t {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> OpaquePointer {
        self.peer
    }

    pub(crate) fn state_and_flags(&self, order: Ordering) -> StateAndFlags {
        StateAndFlags::from_value(self.state_and_flags.load(order))
    }

    pub fn state(&self) -> ThreadState {
        self.state_and_flags(Ordering::Relaxed).state()
    }

    pub(crate) fn read_flag(&self, flag: ThreadFlag, order: Ordering) -> bool {
        self.state_and_flags(order).is_flag_set(flag)
    }

    pub(crate) fn atomic_set_flag(&self, flag: ThreadFlag, order: Ordering) {
        self.state_and_flags.fetch_or(flag as u32, order);
    }

    pub(crate) fn atomic_clear_flag(&self, flag: ThreadFlag, order: Ordering) {
        self.state_and_flags.fetch_and(!(flag as u32), order);
    }

    fn compare_and_set_weak(
        &self,
        old: StateAndFlags,
        new: StateAndFlags,
        success: Ordering,
    ) -> bool {
        self.state_and_flags
            .compare_exchange_weak(old.value(), new.value(), success, Ordering::Relaxed)
            .is_ok()
    }

    /// A thread counts as suspended once it is out of Runnable *and* the
    /// suspend request is visible, i.e. it can no longer sneak back in.
    pub fn is_suspended(&self) -> bool {
        let state_and_flags = self.state_and_flags(Ordering::Acquire);
        state_and_flags.state().is_suspended()
            && state_and_flags.is_flag_set(ThreadFlag::SuspendRequest)
    }

    pub(crate) fn suspend_count(&self) -> i32 {
        self.suspend_count.load(Ordering::Relaxed)
    }

    pub(crate) fn user_code_suspend_count(&self) -> i32 {
        self.user_code_suspend_count.load(Ordering::Relaxed)
    }

    pub(crate) fn suspended_count_stat(&self) -> u32 {
        self.suspended_count.load(Ordering::Relaxed)
    }

    pub(crate) fn checkpoint_count_stat(&self) -> u32 {
        self.checkpoint_count.load(Ordering::Relaxed)
    }

    /// Change between two suspended states, e.g. Native -> Waiting.
    /// Never changes into or out of Runnable: entering Runnable must fail
    /// on a pending suspend request and leaving it must pass suspend
    /// barriers, neither of which this does.
    pub fn set_state(&self, new_state: ThreadState) -> ThreadState {
        assert_ne!(new_state, ThreadState::Runnable);
        loop {
            let old = self.state_and_flags(Ordering::Relaxed);
            assert_ne!(
                old.state(),
                ThreadState::Runnable,
                "set_state called on a runnable thread: {}",
                self
            );
            if self.compare_and_set_weak(old, old.with_state(new_state), Ordering::Relaxed) {
                return old.state();
            }
        }
    }

    // ------------------------------------------------------------------
    // Suspend-count bookkeeping. All of these require the thread list's
    // suspend-count lock; increments on another thread also require the
    // thread list lock.
    // ------------------------------------------------------------------

    pub(crate) fn increment_suspend_count(
        &self,
        self_thread: &Thread,
        with_suspendall_barrier: bool,
        suspend1_barrier: Option<&Arc<SuspendBarrier>>,
        reason: SuspendReason,
    ) {
        debug_assert!(self_thread.is_lock_held(LockLevel::ThreadSuspendCount));
        if !std::ptr::eq(self, self_thread) {
            debug_assert!(self_thread.is_lock_held(LockLevel::ThreadList));
        }
        if reason == SuspendReason::ForUserCode {
            debug_assert!(self_thread.is_lock_held(LockLevel::UserCodeSuspension));
        }

        let mut flags = ThreadFlag::SuspendRequest as u32;
        if with_suspendall_barrier {
            debug_assert!(suspend1_barrier.is_none());
            debug_assert!(!self.suspendall_barrier_active.load(Ordering::Relaxed));
            self.suspendall_barrier_active.store(true, Ordering::Relaxed);
            flags |= ThreadFlag::ActiveSuspendBarrier as u32;
        } else if let Some(barrier) = suspend1_barrier {
            self.add_suspend1_barrier(barrier);
            flags |= ThreadFlag::ActiveSuspendBarrier as u32;
        }

        self.suspend_count.fetch_add(1, Ordering::Relaxed);
        if reason == SuspendReason::ForUserCode {
            self.user_code_suspend_count.fetch_add(1, Ordering::Relaxed);
        }

        // Both bits may be set simultaneously; the release makes them and
        // the count visible together.
        self.state_and_flags.fetch_or(flags, Ordering::Release);
    }

    pub(crate) fn decrement_suspend_count(&self, self_thread: &Thread, for_user_code: bool) {
        debug_assert!(self_thread.is_lock_held(LockLevel::ThreadSuspendCount));
        debug_assert!(self.read_flag(ThreadFlag::SuspendRequest, Ordering::Relaxed));
        if self.suspend_count.load(Ordering::Relaxed) <= 0 {
            error!("decrementing suspend count of {} below zero", self);
            panic!("negative suspend count on {}", self);
        }
        if for_user_code {
            debug_assert!(self_thread.is_lock_held(LockLevel::UserCodeSuspension));
            if self.user_code_suspend_count.load(Ordering::Relaxed) <= 0 {
                error!("user_code_suspend_count incorrect on {}", self);
                panic!("negative user-code suspend count on {}", self);
            }
            self.user_code_suspend_count.fetch_sub(1, Ordering::Relaxed);
        }

        if self.suspend_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.atomic_clear_flag(ThreadFlag::SuspendRequest, Ordering::Release);
        }
    }

    // ------------------------------------------------------------------
    // Suspend barriers (target side).
    // ------------------------------------------------------------------

    fn add_suspend1_barrier(&self, barrier: &Arc<SuspendBarrier>) {
        let mut barriers = self
            .suspend1_barriers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        debug_assert!(!barriers.iter().any(|b| Arc::ptr_eq(b, barrier)));
        barriers.insert(0, barrier.clone());
    }

    /// Unlink a barrier that was satisfied on the target's behalf. The
    /// caller has held the suspend-count lock since registering it, so it
    /// must still be present.
    pub(crate) fn remove_suspend1_barrier(&self, barrier: &Arc<SuspendBarrier>) {
        assert!(
            self.try_remove_suspend1_barrier(barrier),
            "suspend barrier not registered on this thread"
        );
    }

    /// Unlink a barrier whose wait is being abandoned. Returns false if
    /// the target has already drained its barrier list, i.e. it is mid
    /// acknowledgement and the decrement is imminent. Requires the
    /// suspend-count lock.
    pub(crate) fn try_remove_suspend1_barrier(&self, barrier: &Arc<SuspendBarrier>) -> bool {
        let mut barriers = self
            .suspend1_barriers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match barriers.iter().position(|b| Arc::ptr_eq(b, barrier)) {
            Some(index) => {
                barriers.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn debug_check_barrier_inactive(&self, barrier: &Arc<SuspendBarrier>) {
        if cfg!(debug_assertions) {
            let barriers = self
                .suspend1_barriers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            assert!(!barriers.iter().any(|b| Arc::ptr_eq(b, barrier)));
        }
    }

    pub(crate) fn has_active_suspend_barrier(&self) -> bool {
        self.suspendall_barrier_active.load(Ordering::Relaxed)
            || !self
                .suspend1_barriers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
    }

    pub(crate) fn clear_suspendall_barrier(&self) {
        self.suspendall_barrier_active.store(false, Ordering::Relaxed);
    }

    /// Acknowledge every barrier currently registered on this thread.
    /// Returns false if the flag was already clear. Called by the thread
    /// itself with no locks held.
    pub(crate) fn pass_active_suspend_barriers(&self, list: &ThreadList) -> bool {
        let mut barriers: Vec<Arc<SuspendBarrier>> = Vec::new();
        {
            let _guard = list.suspend_count_lock().lock(self);
            if !self.read_flag(ThreadFlag::ActiveSuspendBarrier, Ordering::Relaxed) {
                return false;
            }
            if self.suspendall_barrier_active.swap(false, Ordering::Relaxed) {
                barriers.push(list.suspendall_barrier().clone());
            }
            barriers.append(
                &mut self
                    .suspend1_barriers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
            self.atomic_clear_flag(ThreadFlag::ActiveSuspendBarrier, Ordering::Relaxed);
        }
        // Decrement outside the lock; the requesters wait on the counters,
        // not the lock.
        for barrier in barriers {
            barrier.pass();
        }
        true
    }

    fn check_active_suspend_barriers(&self, list: &ThreadList) {
        debug_assert_ne!(self.state(), ThreadState::Runnable);
        loop {
            let state_and_flags = self.state_and_flags(Ordering::Relaxed);
            if !state_and_flags.is_flag_set(ThreadFlag::CheckpointRequest)
                && !state_and_flags.is_flag_set(ThreadFlag::EmptyCheckpointRequest)
                && !state_and_flags.is_flag_set(ThreadFlag::ActiveSuspendBarrier)
            {
                break;
            } else if state_and_flags.is_flag_set(ThreadFlag::ActiveSuspendBarrier) {
                self.pass_active_suspend_barriers(list);
            } else {
                panic!(
                    "{} transitioned into suspended without running the checkpoint",
                    self
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Checkpoints (target side).
    // ------------------------------------------------------------------

    /// Install a checkpoint iff the target is currently Runnable. Requires
    /// the suspend-count lock, which also orders the queue push against
    /// the target's pop.
    pub(crate) fn request_checkpoint(&self, checkpoint: Arc<dyn Closure>) -> bool {
        let old = self.state_and_flags(Ordering::Relaxed);
        if old.state() != ThreadState::Runnable {
            return false;
        }
        let new = old.with_flag(ThreadFlag::CheckpointRequest);
        if self.compare_and_set_weak(old, new, Ordering::SeqCst) {
            self.checkpoints
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(checkpoint);
            true
        } else {
            false
        }
    }

    /// Ask the target to pass the empty-checkpoint barrier iff Runnable.
    pub(crate) fn request_empty_checkpoint(&self) -> bool {
        let old = self.state_and_flags(Ordering::Relaxed);
        if old.state() != ThreadState::Runnable {
            return false;
        }
        let new = old.with_flag(ThreadFlag::EmptyCheckpointRequest);
        self.compare_and_set_weak(old, new, Ordering::SeqCst)
    }

    /// Run one queued checkpoint. Only called by the thread itself.
    fn run_checkpoint_function(&self, list: &ThreadList) {
        let checkpoint = {
            let _guard = list.suspend_count_lock().lock(self);
            let mut queue = self
                .checkpoints
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let checkpoint = queue
                .pop_front()
                .expect("checkpoint flag set with no checkpoint installed");
            if queue.is_empty() {
                // The lock we hold orders this against concurrent installs.
                self.atomic_clear_flag(ThreadFlag::CheckpointRequest, Ordering::Relaxed);
            }
            checkpoint
        };
        self.checkpoint_count.fetch_add(1, Ordering::Relaxed);
        checkpoint.run(self);
    }

    /// Pass the process-wide empty-checkpoint barrier. Only called by the
    /// thread itself.
    fn run_empty_checkpoint(&self, list: &ThreadList) {
        // Stronger than strictly needed; kept until the empty-checkpoint
        // ordering is redesigned.
        self.atomic_clear_flag(ThreadFlag::EmptyCheckpointRequest, Ordering::Release);
        list.empty_checkpoint_barrier().pass();
    }

    /// Poll for pending work from an accessor that blocks on `cond_mutex`
    /// while Runnable (e.g. a weak-reference accessor). Such a thread
    /// never reaches a state transition, so it must poll here instead.
    pub fn check_empty_checkpoint_from_weak_ref_access(&self, list: &ThreadList) {
        while self.read_flag(ThreadFlag::EmptyCheckpointRequest, Ordering::Acquire) {
            self.run_empty_checkpoint(list);
        }
    }

    // ------------------------------------------------------------------
    // State transitions. Only the owning thread runs these.
    // ------------------------------------------------------------------

    fn transition_to_suspended_and_run_checkpoints(
        &self,
        list: &ThreadList,
        new_state: ThreadState,
    ) {
        debug_assert_ne!(new_state, ThreadState::Runnable);
        loop {
            let old = self.state_and_flags(Ordering::Acquire);
            assert_eq!(
                old.state(),
                ThreadState::Runnable,
                "suspending transition from non-runnable state on {}",
                self
            );
            if old.is_flag_set(ThreadFlag::CheckpointRequest) {
                self.run_checkpoint_function(list);
                continue;
            }
            if old.is_flag_set(ThreadFlag::EmptyCheckpointRequest) {
                self.run_empty_checkpoint(list);
                continue;
            }
            // The release makes every prior write visible to whoever
            // observes us suspended.
            let new = old.with_state(new_state);
            if self.compare_and_set_weak(old, new, Ordering::Release) {
                self.suspended_count.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    pub(crate) fn transition_from_runnable_to_suspended(
        &self,
        list: &ThreadList,
        new_state: ThreadState,
    ) {
        self.assert_thread_suspension_is_allowable(true);
        self.transition_to_suspended_and_run_checkpoints(list, new_state);
        // Mark the release of the mutator-lock share.
        list.mutator_lock().transition_from_runnable_to_suspended(self);
        // Once suspended, acknowledge any barriers that were waiting on us.
        self.check_active_suspend_barriers(list);
    }

    pub(crate) fn transition_from_suspended_to_runnable(
        &self,
        list: &ThreadList,
        fail_on_suspend_req: bool,
    ) -> Option<ThreadState> {
        let mut old = self.state_and_flags(Ordering::Relaxed);
        let old_state = old.state();
        assert_ne!(old_state, ThreadState::Runnable, "{}", self);
        loop {
            debug_assert!(!old.is_flag_set(ThreadFlag::SuspensionImmune));
            // We must not explicitly hold the mutator lock here, or we
            // starve stop-the-world requesters.
            list.mutator_lock().assert_not_held(self);
            const CHECKED_FLAGS: u32 = SUSPEND_OR_CHECKPOINT_REQUEST_FLAGS
                | ThreadFlag::ActiveSuspendBarrier as u32
                | FLIP_FUNCTION_FLAGS;
            if !old.is_any_flag_set(CHECKED_FLAGS) {
                // Fast path: no pending requests.
                let new = old.with_state(ThreadState::Runnable);
                if self.compare_and_set_weak(old, new, Ordering::Acquire) {
                    list.mutator_lock().transition_from_suspended_to_runnable(self);
                    break;
                }
            } else if old.is_flag_set(ThreadFlag::ActiveSuspendBarrier) {
                self.pass_active_suspend_barriers(list);
            } else if old.is_flag_set(ThreadFlag::CheckpointRequest)
                || old.is_flag_set(ThreadFlag::EmptyCheckpointRequest)
            {
                // Checkpoints are only ever installed on Runnable threads.
                panic!(
                    "transitioning {} to Runnable with checkpoint flag set (flags {:#x})",
                    self,
                    old.value()
                );
            } else if old.is_flag_set(ThreadFlag::SuspendRequest) {
                if fail_on_suspend_req {
                    return None;
                }
                // Wait until our suspend count drops to zero.
                let mut guard = list.suspend_count_lock().lock(self);
                old = self.state_and_flags(Ordering::Relaxed);
                debug_assert_eq!(old.state(), old_state);
                while old.is_flag_set(ThreadFlag::SuspendRequest) {
                    guard.wait(list.resume_cond());
                    old = self.state_and_flags(Ordering::Relaxed);
                }
                debug_assert_eq!(self.suspend_count(), 0);
            } else if old.is_flag_set(ThreadFlag::RunningFlipFunction) {
                // Someone is running our flip function on our behalf; wait
                // before becoming runnable so they can rely on our state.
                self.wait_for_flip_function(list);
            } else if old.is_flag_set(ThreadFlag::PendingFlipFunction) {
                if self.try_start_flip_for_self(list) {
                    break;
                }
            }
            old = self.state_and_flags(Ordering::Relaxed);
        }
        debug_assert_eq!(self.state(), ThreadState::Runnable);
        Some(old_state)
    }

    /// The explicit suspension poll: runs checkpoints, honours suspend
    /// requests, passes empty checkpoints. Returns with no flags pending
    /// (unless we are suspension-immune).
    pub(crate) fn check_suspend(&self, list: &ThreadList) {
        loop {
            // Acquire is needed for the empty-checkpoint path.
            let state_and_flags = self.state_and_flags(Ordering::Acquire);
            if !state_and_flags.is_any_flag_set(SUSPEND_OR_CHECKPOINT_REQUEST_FLAGS) {
                break;
            } else if state_and_flags.is_flag_set(ThreadFlag::CheckpointRequest) {
                self.run_checkpoint_function(list);
            } else if state_and_flags.is_flag_set(ThreadFlag::SuspendRequest)
                && !state_and_flags.is_flag_set(ThreadFlag::SuspensionImmune)
            {
                self.full_suspend_check(list);
            } else if state_and_flags.is_flag_set(ThreadFlag::EmptyCheckpointRequest) {
                self.run_empty_checkpoint(list);
            } else {
                debug_assert!(state_and_flags.is_flag_set(ThreadFlag::SuspensionImmune));
                break;
            }
        }
    }

    fn full_suspend_check(&self, list: &ThreadList) {
        trace!("{} full suspend check", self);
        self.transition_from_runnable_to_suspended(list, ThreadState::Suspended);
        self.transition_from_suspended_to_runnable(list, false);
        trace!("{} resumed from full suspend check", self);
    }

    // ------------------------------------------------------------------
    // Flip functions.
    // ------------------------------------------------------------------

    /// Install the flip function. The world is stopped, so nobody races
    /// the store; the release publishes the closure with the flag.
    pub(crate) fn set_flip_function(&self, closure: Arc<dyn Closure>) {
        debug_assert!(!self.read_flag(ThreadFlag::PendingFlipFunction, Ordering::Relaxed));
        debug_assert!(!self.read_flag(ThreadFlag::RunningFlipFunction, Ordering::Relaxed));
        *self.flip_function.borrow_mut() = Some(closure);
        self.atomic_set_flag(ThreadFlag::PendingFlipFunction, Ordering::Release);
    }

    /// Run the installed flip function and wake anyone waiting for it.
    /// `current` is the executing thread (`self` or a helper).
    fn run_flip_function(&self, list: &ThreadList, current: &Thread) {
        let closure = self
            .flip_function
            .borrow_mut()
            .take()
            .expect("running flip function without one installed");
        closure.run(self);
        let _guard = list.suspend_count_lock().lock(current);
        self.atomic_clear_flag(ThreadFlag::RunningFlipFunction, Ordering::Release);
        list.resume_cond().notify_all();
    }

    /// Try to claim and run our own flip function as part of becoming
    /// Runnable. On success the thread *is* Runnable afterwards (the CAS
    /// that claims the flip also enters Runnable, logically acquiring the
    /// mutator-lock share). Returns false if somebody else claimed it.
    fn try_start_flip_for_self(&self, list: &ThreadList) -> bool {
        loop {
            let old = self.state_and_flags(Ordering::Acquire);
            if !old.is_flag_set(ThreadFlag::PendingFlipFunction) {
                return false;
            }
            if old.is_flag_set(ThreadFlag::SuspendRequest) {
                // Re-suspended in the meantime; the outer transition loop
                // must block first. A helper will run the flip.
                return false;
            }
            let new = old
                .without_flag(ThreadFlag::PendingFlipFunction)
                .with_flag(ThreadFlag::RunningFlipFunction)
                .with_state(ThreadState::Runnable);
            if self.compare_and_set_weak(old, new, Ordering::Acquire) {
                list.mutator_lock().transition_from_suspended_to_runnable(self);
                self.run_flip_function(list, self);
                return true;
            }
        }
    }

    /// Ensure the target's flip function has at least started, running it
    /// on the target's behalf if we win the claim. Returns true when the
    /// flip is known finished (or moot because the target exited); false
    /// means another thread is still running it.
    pub(crate) fn ensure_flip_function_started(
        list: &ThreadList,
        current: &Thread,
        target: &Thread,
        exit_flag: Option<&ThreadExitFlag>,
    ) -> bool {
        loop {
            if let Some(tef) = exit_flag {
                if tef.has_exited() {
                    return true;
                }
            }
            let old = target.state_and_flags(Ordering::Acquire);
            if !old.is_flag_set(ThreadFlag::PendingFlipFunction) {
                return !old.is_flag_set(ThreadFlag::RunningFlipFunction);
            }
            debug_assert_ne!(old.state(), ThreadState::Runnable);
            let new = old
                .without_flag(ThreadFlag::PendingFlipFunction)
                .with_flag(ThreadFlag::RunningFlipFunction);
            if target.compare_and_set_weak(old, new, Ordering::Acquire) {
                target.run_flip_function(list, current);
                return true;
            }
        }
    }

    /// Block until our flip function, being run by a helper, finishes.
    fn wait_for_flip_function(&self, list: &ThreadList) {
        let mut guard = list.suspend_count_lock().lock(self);
        loop {
            if !self.read_flag(ThreadFlag::RunningFlipFunction, Ordering::Acquire) {
                return;
            }
            guard.wait(list.resume_cond());
        }
    }

    /// Like `wait_for_flip_function`, for a helper waiting on another
    /// thread's flip; also returns if the target exits.
    pub(crate) fn wait_for_flip_function_testing_exited(
        &self,
        list: &ThreadList,
        current: &Thread,
        exit_flag: &ThreadExitFlag,
    ) {
        let mut guard = list.suspend_count_lock().lock(current);
        loop {
            if exit_flag.has_exited() {
                return;
            }
            if !self.read_flag(ThreadFlag::RunningFlipFunction, Ordering::Acquire) {
                return;
            }
            guard.wait(list.resume_cond());
        }
    }

    // ------------------------------------------------------------------
    // Exit flags. Registration requires the thread list lock.
    // ------------------------------------------------------------------

    pub(crate) fn notify_on_thread_exit(&self, exit_flag: &Arc<ThreadExitFlag>) {
        debug_assert!(!exit_flag.has_exited());
        let mut flags = self
            .exit_flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        assert!(
            !flags.iter().any(|f| Arc::ptr_eq(f, exit_flag)),
            "double registration of a thread exit flag"
        );
        flags.insert(0, exit_flag.clone());
    }

    pub(crate) fn unregister_thread_exit_flag(&self, exit_flag: &Arc<ThreadExitFlag>) {
        if exit_flag.has_exited() {
            // The registry was already dismantled; nothing to unlink.
            return;
        }
        let mut flags = self
            .exit_flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let index = flags
            .iter()
            .position(|f| Arc::ptr_eq(f, exit_flag))
            .expect("unregistering an exit flag that was never registered");
        flags.remove(index);
    }

    pub(crate) fn signal_exit_flags(&self) {
        let mut flags = self
            .exit_flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for flag in flags.drain(..) {
            flag.signal();
        }
    }

    pub(crate) fn debug_is_exit_flag_registered(&self, exit_flag: &Arc<ThreadExitFlag>) -> bool {
        self.exit_flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|f| Arc::ptr_eq(f, exit_flag))
    }

    // ------------------------------------------------------------------
    // Held-lock discipline.
    // ------------------------------------------------------------------

    pub(crate) fn set_lock_held(&self, level: LockLevel, held: bool) {
        self.held_locks[level].store(held, Ordering::Relaxed);
    }

    pub(crate) fn is_lock_held(&self, level: LockLevel) -> bool {
        self.held_locks[level].load(Ordering::Relaxed)
    }

    pub(crate) fn assert_can_acquire(&self, level: LockLevel, name: &str) {
        if cfg!(debug_assertions) {
            for (held_level, held) in self.held_locks.iter() {
                if held.load(Ordering::Relaxed) && held_level >= level {
                    panic!(
                        "{} acquiring \"{}\" ({:?}) while holding {:?}",
                        self, name, level, held_level
                    );
                }
            }
        }
    }

    /// Pretend to hold a monitor-level lock so that a checkpoint closure
    /// acquiring the mutator lock (or anything ordered before monitors)
    /// trips the lock-order check. Debug builds only.
    pub(crate) fn disallow_pre_monitor_mutexes(&self) {
        if cfg!(debug_assertions) {
            assert!(!self.is_lock_held(LockLevel::MonitorPlaceholder));
            self.set_lock_held(LockLevel::MonitorPlaceholder, true);
        }
    }

    /// Undo the effect of the previous call. Again only invoked by the thread itself.
    pub(crate) fn allow_pre_monitor_mutexes(&self) {
        if cfg!(debug_assertions) {
            assert!(self.is_lock_held(LockLevel::MonitorPlaceholder));
            self.set_lock_held(LockLevel::MonitorPlaceholder, false);
        }
    }

    fn is_thread_suspension_allowable(&self) -> bool {
        for (level, held) in self.held_locks.iter() {
            if level == LockLevel::Mutator || level == LockLevel::UserCodeSuspension {
                continue;
            }
            if held.load(Ordering::Relaxed) {
                return false;
            }
        }
        // Suspending for user code while holding the user-code suspension
        // lock would sleep forever: nobody could resume us.
        if self.is_lock_held(LockLevel::UserCodeSuspension) && self.user_code_suspend_count() != 0 {
            return false;
        }
        true
    }

    pub(crate) fn assert_thread_suspension_is_allowable(&self, check_locks: bool) {
        if cfg!(debug_assertions) && check_locks {
            assert!(
                self.is_thread_suspension_allowable(),
                "{} holding a lock at a point where thread suspension is expected",
                self
            );
        }
    }

    // ------------------------------------------------------------------
    // Diagnostics.
    // ------------------------------------------------------------------

    /// Abort the process from inside this thread, so the reported stack is
    /// the unresponsive thread's own.
    pub(crate) fn abort_in_this(&self, message: String) -> ! {
        error!("{}", message);
        #[cfg(target_os = "linux")]
        unsafe {
            libc::syscall(libc::SYS_tgkill, libc::getpid(), self.tid, libc::SIGABRT);
        }
        // Either we are not on Linux or the signal raced the thread's
        // exit; fail here instead.
        panic!("{}", message);
    }
}
