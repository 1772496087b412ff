//! The per-thread atomic coordinator word: thread state plus pending
//! request flags, packed into one `u32`.
//!
//! Keeping state and flags in a single word is load-bearing: a target that
//! transitions to a suspended state *after* a requester set
//! `SuspendRequest` + `ActiveSuspendBarrier` is guaranteed to observe the
//! barrier bit in the same CAS loop, because both live in the word the
//! transition operates on. Splitting them would reintroduce the
//! suspend-vs-transition races the single word exists to close.

use static_assertions::const_assert;
use strum_macros::{Display, EnumIter};

/// Bits [0, 8) of the state-and-flags word.
const STATE_MASK: u32 = 0xff;

/// The state of a thread. `Runnable` must be zero so that "runnable with
/// no pending requests" is a plain zero check on the whole word.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumIter)]
pub enum ThreadState {
    /// Executing user code; holds a share of the mutator lock.
    Runnable = 0,
    /// Suspended by a suspend request.
    Suspended,
    /// Executing native code that cannot touch managed references.
    Native,
    /// Blocked in a managed wait.
    Waiting,
    /// Blocked in a managed timed wait.
    TimedWaiting,
    /// Blocked acquiring a managed monitor.
    Blocked,
    /// Waiting for checkpoints to run on other threads.
    WaitingForCheckpointsToRun,
}

const_assert!(ThreadState::Runnable as u32 == 0);

impl ThreadState {
    fn from_bits(bits: u8) -> ThreadState {
        match bits {
            0 => ThreadState::Runnable,
            1 => ThreadState::Suspended,
            2 => ThreadState::Native,
            3 => ThreadState::Waiting,
            4 => ThreadState::TimedWaiting,
            5 => ThreadState::Blocked,
            6 => ThreadState::WaitingForCheckpointsToRun,
            _ => panic!("corrupted thread state: {:#x}", bits),
        }
    }

    /// Any state other than `Runnable` counts as suspended: the thread
    /// does not hold a mutator-lock share and cannot touch managed
    /// references without a transition.
    pub fn is_suspended(self) -> bool {
        self != ThreadState::Runnable
    }
}

/// Pending-request flags, each a single bit above the state byte.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadFlag {
    /// The thread's suspend count is non-zero; it must not become
    /// Runnable.
    SuspendRequest = 1 << 8,
    /// A checkpoint closure is queued for the thread.
    CheckpointRequest = 1 << 9,
    /// The thread must pass the process-wide empty-checkpoint barrier.
    EmptyCheckpointRequest = 1 << 10,
    /// One or more suspend barriers are waiting for this thread's
    /// acknowledgement.
    ActiveSuspendBarrier = 1 << 11,
    /// A flip function is installed and nobody has started it yet.
    PendingFlipFunction = 1 << 12,
    /// Somebody is running the thread's flip function right now.
    RunningFlipFunction = 1 << 13,
    /// Exempts the SuspendAll requester from its own pause.
    SuspensionImmune = 1 << 14,
}

/// Flags that force the slow path when entering or leaving Runnable.
pub(crate) const SUSPEND_OR_CHECKPOINT_REQUEST_FLAGS: u32 = ThreadFlag::SuspendRequest as u32
    | ThreadFlag::CheckpointRequest as u32
    | ThreadFlag::EmptyCheckpointRequest as u32;

/// Both phases of the flip-function protocol.
pub(crate) const FLIP_FUNCTION_FLAGS: u32 =
    ThreadFlag::PendingFlipFunction as u32 | ThreadFlag::RunningFlipFunction as u32;

/// A decoded snapshot of the atomic word.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct StateAndFlags(u32);

impl StateAndFlags {
    pub(crate) fn from_value(value: u32) -> Self {
        StateAndFlags(value)
    }

    pub(crate) fn value(self) -> u32 {
        self.0
    }

    pub fn state(self) -> ThreadState {
        ThreadState::from_bits((self.0 & STATE_MASK) as u8)
    }

    #[must_use]
    pub(crate) fn with_state(self, state: ThreadState) -> Self {
        StateAndFlags((self.0 & !STATE_MASK) | state as u32)
    }

    pub fn is_flag_set(self, flag: ThreadFlag) -> bool {
        self.0 & flag as u32 != 0
    }

    pub(crate) fn is_any_flag_set(self, mask: u32) -> bool {
        self.0 & mask != 0
    }

    #[must_use]
    pub(crate) fn with_flag(self, flag: ThreadFlag) -> Self {
        StateAndFlags(self.0 | flag as u32)
    }

    #[must_use]
    pub(crate) fn without_flag(self, flag: ThreadFlag) -> Self {
        StateAndFlags(self.0 & !(flag as u32))
    }
}

impl std::fmt::Debug for StateAndFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{:#x}]", self.state(), self.0)
    }
}
