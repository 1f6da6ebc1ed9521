//! Worker threads and the dispatch loop.
//!
//! Every worker thread, and the caller in use-caller mode, runs [`run`]: pop
//! the oldest task it may run, switch into its fiber, and decide from the
//! fiber's state what happens next. With nothing to run it switches into its
//! idle fiber, which parks until work shows up or the scheduler closes.

use crate::config::PinningStrategy;
use crate::diag;
use crate::fiber::{Entry, Fiber, State};
use crate::scheduler::{self, Shared, Wake};
use crate::task::{Task, TaskKind};
use crate::thread;
use crossbeam::sync::WaitGroup;
use log::{debug, error, trace, warn};
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Spawns worker `index`. The thread registers its id and drops `ready`
/// before entering the dispatch loop.
pub(crate) fn spawn(
    index: usize,
    shared: Arc<Shared>,
    ready: WaitGroup,
) -> io::Result<JoinHandle<()>> {
    let name = format!("{}_{}", shared.name(), index);
    thread::spawn(name, move || {
        // Pin worker to its core for better cache locality
        if shared.config.pinning == PinningStrategy::Linear {
            pin_to_core(index);
        }
        shared.register_thread(thread::current_thread_id());
        drop(ready);

        run(&shared);
    })
}

fn pin_to_core(index: usize) {
    let Some(core_ids) = core_affinity::get_core_ids() else {
        warn!("worker {index}: core ids unavailable, running unpinned");
        return;
    };
    if core_ids.is_empty() {
        return;
    }
    let core = core_ids[index % core_ids.len()];
    if !core_affinity::set_for_current(core) {
        warn!("worker {index}: failed to pin to core {}", core.id);
    }
}

/// The dispatch loop. Returns once the scheduler has stopped and drained.
pub(crate) fn run(shared: &Arc<Shared>) {
    let _current = scheduler::enter(shared);
    let thread_id = thread::current_thread_id();
    let stack_size = shared.config.stack_size;
    debug!(
        "scheduler `{}` dispatching on thread {}",
        shared.name(),
        thread_id
    );

    let idle = {
        let shared = Arc::clone(shared);
        Fiber::with_stack_size(move || idle_loop(&shared, thread_id), stack_size)
    };
    // Terminated closure fiber kept for the next closure task.
    let mut spare: Option<Arc<Fiber>> = None;

    loop {
        let Some(task) = shared.pop(thread_id) else {
            if idle.state() == State::Term {
                break;
            }
            shared.enter_idle();
            idle.swap_in();
            shared.leave_idle();
            continue;
        };

        let fiber = match task.kind {
            TaskKind::Fiber(fiber) => fiber,
            TaskKind::Call(entry) => materialize(&mut spare, entry, stack_size),
        };
        dispatch(shared, fiber, thread_id, &mut spare);
        shared.finish_task();
    }

    debug!(
        "scheduler `{}` dispatch loop on thread {} exited",
        shared.name(),
        thread_id
    );
}

/// Wraps a closure in a fiber, recycling the spare fiber's stack if there is one.
fn materialize(spare: &mut Option<Arc<Fiber>>, entry: Entry, stack_size: usize) -> Arc<Fiber> {
    match spare.take() {
        Some(fiber) => {
            if let Err(err) = fiber.reset_entry(entry) {
                diag::fatal(format_args!("recycled fiber rejected reset: {err}"));
            }
            fiber
        }
        None => Fiber::from_entry(entry, stack_size),
    }
}

fn dispatch(shared: &Shared, fiber: Arc<Fiber>, thread_id: u64, spare: &mut Option<Arc<Fiber>>) {
    if fiber.state().is_terminal() {
        debug!("skipping finished fiber {}", fiber.id());
        return;
    }
    if let Err(err) = fiber.try_swap_in() {
        error!("scheduler `{}` cannot run task: {}", shared.name(), err);
        return;
    }

    match fiber.state() {
        State::Ready => shared.requeue(Task::fiber(fiber).on_thread(thread_id)),
        State::Term | State::Except => {
            // Recycle only if nobody else kept a reference.
            if Arc::strong_count(&fiber) == 1 {
                *spare = Some(fiber);
            }
        }
        State::Hold => trace!("fiber {} parked", fiber.id()),
        state => error!(
            "fiber {} returned to scheduler `{}` in state {:?}",
            fiber.id(),
            shared.name(),
            state
        ),
    }
}

/// Body of a worker's idle fiber.
fn idle_loop(shared: &Shared, thread_id: u64) {
    loop {
        if let Wake::Closed = shared.wait_for_work(thread_id) {
            debug!("idle fiber on thread {thread_id} sees scheduler `{}` closed", shared.name());
            return;
        }
        Fiber::yield_to_hold();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Scheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_closure_fibers_are_recycled() {
        let scheduler = Scheduler::new(1, false, "recycle");
        let stacks = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let stacks = stacks.clone();
            let done = done.clone();
            scheduler
                .schedule(move || {
                    stacks.lock().push(Fiber::get_this().stack_base());
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        scheduler.start().unwrap();
        scheduler.stop().expect("Shutdown failed");

        assert_eq!(done.load(Ordering::SeqCst), 20);
        let stacks = stacks.lock();
        // Every closure ran on a stack; with one worker and no parked fibers
        // they share very few of them.
        let mut distinct = stacks.clone();
        distinct.sort();
        distinct.dedup();
        assert!(distinct.len() < stacks.len());
    }
}
