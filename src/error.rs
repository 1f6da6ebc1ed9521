//! Error types for fibers and the scheduler.

use crate::fiber::State;
use thiserror::Error;

/// Errors reported by the scheduler and its configuration layer.
#[derive(Error, Debug)]
pub enum Error {
    /// The scheduler has shut down its queue and rejects new tasks.
    #[error("scheduler `{name}` is stopped and no longer accepts tasks")]
    Stopped {
        /// Name of the scheduler
        name: String,
    },

    /// A started fiber was scheduled onto a thread other than the one it is bound to.
    #[error("fiber {fiber} is bound to thread {bound} and cannot be scheduled on thread {requested}")]
    AffinityConflict {
        /// Fiber id
        fiber: u64,
        /// Thread the fiber is bound to
        bound: u64,
        /// Thread requested by the caller
        requested: u64,
    },

    /// The requested thread is not one of the scheduler's workers.
    #[error("scheduler `{name}` has no worker on thread {thread}")]
    UnknownThread {
        /// Name of the scheduler
        name: String,
        /// Requested thread id
        thread: u64,
    },

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// Worker threads panicked while running the dispatch loop.
    #[error("{count} worker thread(s) panicked")]
    WorkerPanicked {
        /// Number of workers whose join reported a panic
        count: usize,
    },

    /// Queued tasks were dropped without running: the scheduler stopped
    /// before it ever ran, or the tasks were pinned to a thread that is not
    /// one of its workers.
    #[error("scheduler `{name}` abandoned {count} task(s) it could never run")]
    Abandoned {
        /// Name of the scheduler
        name: String,
        /// Number of tasks that never ran
        count: usize,
    },

    /// The configuration document could not be parsed.
    #[error("invalid scheduler configuration: {0}")]
    Config(#[from] serde_json::Error),
}

/// Convenient result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Misuse of the fiber state machine.
///
/// The panicking fiber operations (`swap_in`, `reset`) raise these as panic
/// messages; the `try_` variants hand them back to the caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberError {
    /// The fiber is running or finished and cannot be entered.
    #[error("fiber {id} cannot be swapped in from state {state:?}")]
    NotResumable { id: u64, state: State },

    /// The fiber was started on another thread.
    #[error("fiber {id} is bound to thread {bound} and cannot be resumed on thread {current}")]
    WrongThread { id: u64, bound: u64, current: u64 },

    /// The fiber has not terminated and still owns live frames on its stack.
    #[error("fiber {id} cannot be reset from state {state:?}")]
    NotResettable { id: u64, state: State },

    /// Thread main fibers have no stack of their own.
    #[error("fiber {id} is a thread main fiber")]
    MainFiber { id: u64 },
}
