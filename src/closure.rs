//! Caller-provided work items.
//!
//! The suspension core never inspects the work it runs on behalf of its
//! callers; everything is funnelled through these object-safe traits.

use crate::thread::Thread;

/// A piece of work to run in the context of a target thread.
///
/// Checkpoint closures are installed on many threads at once and may be run
/// either by the target itself or by the requester on the target's behalf,
/// so implementations must be `Send + Sync`.
///
/// A closure must not acquire the mutator lock or anything ordered before
/// it (debug builds assert this while a checkpoint runs, see
/// [`Thread::disallow_pre_monitor_mutexes`]).
pub trait Closure: Send + Sync {
    /// Run the closure. `thread` is the thread this invocation is on behalf
    /// of, which is not necessarily the thread executing `run`.
    fn run(&self, thread: &Thread);
}

impl<F: Fn(&Thread) + Send + Sync> Closure for F {
    fn run(&self, thread: &Thread) {
        self(thread)
    }
}

/// Which roots a [`RootVisitor`] pass should cover. Forwarded verbatim to
/// the visitor; the suspension core attaches no meaning to it beyond the
/// default used for suspended-thread sweeps.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VisitRootFlags {
    /// Visit every root of the thread.
    AllRoots,
    /// Visit only roots created since the last logged visit.
    NewRoots,
}

/// Visitor for the stack roots of a thread. The embedder knows how to find
/// the roots for a given [`Thread`] (usually via [`Thread::peer`]); the
/// suspension core only guarantees *when* it is safe to walk them.
pub trait RootVisitor {
    /// Visit the roots of `thread`.
    fn visit_thread_roots(&mut self, thread: &Thread, flags: VisitRootFlags);
}

/// Callbacks bracketing a stop-the-world pause, so the embedder can time
/// the pause or log it.
pub trait GcPauseListener: Send + Sync {
    fn start_pause(&self);
    fn end_pause(&self);
}
