//! Units of work accepted by the scheduler.
//!
//! A task is either a closure, which a worker wraps in a fiber when it is
//! dispatched, or a fiber built by the caller. Either may carry a thread
//! affinity restricting which worker may run it.

use crate::fiber::{Entry, Fiber};
use std::fmt;
use std::sync::Arc;

pub(crate) enum TaskKind {
    Call(Entry),
    Fiber(Arc<Fiber>),
}

/// A unit of work for the [`Scheduler`](crate::Scheduler).
pub struct Task {
    pub(crate) kind: TaskKind,
    /// Worker thread the task must run on, if any.
    pub(crate) thread: Option<u64>,
}

impl Task {
    /// Creates a task that runs `work` in a fresh (or recycled) fiber.
    pub fn call<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            kind: TaskKind::Call(Box::new(work)),
            thread: None,
        }
    }

    /// Creates a task that resumes `fiber`.
    pub fn fiber(fiber: Arc<Fiber>) -> Self {
        Task {
            kind: TaskKind::Fiber(fiber),
            thread: None,
        }
    }

    /// Restricts the task to the worker running on thread `thread`.
    pub fn on_thread(mut self, thread: u64) -> Self {
        self.thread = Some(thread);
        self
    }

    /// Thread affinity of the task.
    pub fn thread(&self) -> Option<u64> {
        self.thread
    }

    /// Whether the worker on `thread` may run this task.
    pub(crate) fn runs_on(&self, thread: u64) -> bool {
        self.thread.is_none_or(|t| t == thread)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Task");
        match &self.kind {
            TaskKind::Call(_) => s.field("kind", &"call"),
            TaskKind::Fiber(fiber) => s.field("fiber", &fiber.id()),
        };
        s.field("thread", &self.thread).finish()
    }
}
