//! Quiesce is a cooperative suspension core for mutator threads.
//!
//! Given any number of threads executing user code, it provides the
//! machinery to bring any subset of them to a quiescent state where no
//! managed references are being mutated, run checkpoint closures on or on
//! behalf of each thread, flip per-thread state exactly once during a
//! pause, and release everything again with bounded latency and precise
//! diagnostics when a thread fails to respond.
//!
//! Threads attach with [`ThreadList::register`] and drive themselves
//! through [`ThreadList::transition_from_runnable_to_suspended`] /
//! [`ThreadList::transition_from_suspended_to_runnable`] around any code
//! that may touch managed references, polling
//! [`ThreadList::check_suspend`] inside long-running work. Requesters use
//! [`ThreadList::suspend_all`] (or [`ScopedSuspendAll`]),
//! [`ThreadList::run_checkpoint`], [`ThreadList::run_empty_checkpoint`]
//! and [`ThreadList::flip_thread_roots`].

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod build_info;
mod closure;
pub mod sync;
pub mod thread;
pub mod thread_list;
pub mod util;

pub use crate::closure::{Closure, GcPauseListener, RootVisitor, VisitRootFlags};
pub use crate::thread::{
    StateAndFlags, SuspendReason, Thread, ThreadExitFlag, ThreadFlag, ThreadState,
};
pub use crate::thread_list::{ScopedSuspendAll, SuspendAllStats, ThreadList};
pub use crate::util::options::Options;
pub use crate::util::OpaquePointer;
