//! The M:N fiber scheduler.
//!
//! A [`Scheduler`] runs a fixed set of worker threads, each draining a shared
//! FIFO ready queue. Tasks may be pinned to one worker thread; a pinned task
//! waits for its thread and is never taken by another worker. Workers that
//! find nothing to do park in their idle fiber until work arrives or the
//! scheduler stops.

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::fiber::Fiber;
use crate::task::{Task, TaskKind};
use crate::thread;
use crate::worker;
use crossbeam::sync::WaitGroup;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Weak<Shared>>> = const { RefCell::new(None) };
}

pub(crate) struct Queue {
    tasks: VecDeque<Task>,
    /// Set once the scheduler has drained during shutdown; no task is accepted afterwards.
    closed: bool,
}

/// Outcome of an idle wait.
pub(crate) enum Wake {
    Work,
    Closed,
}

/// State shared by the scheduler, its handles and its worker threads.
pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    queue: Mutex<Queue>,
    wakeup: Condvar,
    stopping: AtomicBool,
    /// Tasks popped and not yet finished.
    active: AtomicUsize,
    /// Workers currently inside their idle fiber.
    idle: AtomicUsize,
    threads: Mutex<Vec<u64>>,
    /// Set, under the queue lock, once every worker has registered its thread id.
    threads_known: AtomicBool,
    /// Tasks dropped because no worker could ever run them.
    abandoned: AtomicUsize,
}

impl Shared {
    fn new(config: SchedulerConfig) -> Self {
        Shared {
            config,
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                closed: false,
            }),
            wakeup: Condvar::new(),
            stopping: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            threads_known: AtomicBool::new(false),
            abandoned: AtomicUsize::new(0),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    fn stopped_error(&self) -> Error {
        Error::Stopped {
            name: self.config.name.clone(),
        }
    }

    pub(crate) fn register_thread(&self, thread: u64) {
        self.threads.lock().push(thread);
    }

    /// Applies a started fiber's thread binding to the task's affinity.
    fn prepare(&self, mut task: Task) -> Result<Task> {
        if let TaskKind::Fiber(fiber) = &task.kind {
            if let Some(bound) = fiber.bound_thread() {
                match task.thread {
                    None => task.thread = Some(bound),
                    Some(requested) if requested != bound => {
                        return Err(Error::AffinityConflict {
                            fiber: fiber.id(),
                            bound,
                            requested,
                        });
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(task)
    }

    /// Rejects affinity to a thread that is not a worker. Only meaningful
    /// once the worker set is sealed; the caller holds the queue lock.
    fn check_threads(&self, tasks: &[Task]) -> Result<()> {
        if !self.threads_known.load(Ordering::Acquire) {
            return Ok(());
        }
        let threads = self.threads.lock();
        match tasks
            .iter()
            .filter_map(|task| task.thread)
            .find(|thread| !threads.contains(thread))
        {
            Some(thread) => Err(Error::UnknownThread {
                name: self.config.name.clone(),
                thread,
            }),
            None => Ok(()),
        }
    }

    pub(crate) fn push_all<I>(&self, tasks: I) -> Result<()>
    where
        I: IntoIterator<Item = Task>,
    {
        let tasks = tasks
            .into_iter()
            .map(|task| self.prepare(task))
            .collect::<Result<Vec<_>>>()?;
        if tasks.is_empty() {
            return Ok(());
        }
        let pinned = tasks.iter().any(|task| task.thread.is_some());
        let count = tasks.len();

        {
            let mut queue = self.queue.lock();
            if queue.closed {
                return Err(self.stopped_error());
            }
            self.check_threads(&tasks)?;
            queue.tasks.extend(tasks);
        }

        if self.idle.load(Ordering::SeqCst) > 0 {
            // A pinned task needs its own thread awake, not just any worker.
            if pinned || count > 1 {
                self.wakeup.notify_all();
            } else {
                self.wakeup.notify_one();
            }
        }
        Ok(())
    }

    /// Pops the oldest task this thread may run, leaving tasks pinned to
    /// other threads in place. A popped task counts as active until
    /// [`finish_task`](Self::finish_task).
    pub(crate) fn pop(&self, thread: u64) -> Option<Task> {
        let mut queue = self.queue.lock();
        let index = queue.tasks.iter().position(|task| task.runs_on(thread))?;
        let task = queue.tasks.remove(index)?;
        self.active.fetch_add(1, Ordering::SeqCst);
        Some(task)
    }

    /// Puts a yielded fiber back. Only called while its task is still active,
    /// so the queue cannot have closed.
    pub(crate) fn requeue(&self, task: Task) {
        self.queue.lock().tasks.push_back(task);
    }

    pub(crate) fn finish_task(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 && self.is_stopping() {
            self.wakeup.notify_all();
        }
    }

    pub(crate) fn enter_idle(&self) {
        self.idle.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn leave_idle(&self) {
        self.idle.fetch_sub(1, Ordering::SeqCst);
    }

    /// Blocks an idle worker until there may be work for `thread` or the
    /// queue closes. Closes the queue itself once a stopping scheduler has
    /// nothing queued and nothing in flight.
    pub(crate) fn wait_for_work(&self, thread: u64) -> Wake {
        let mut queue = self.queue.lock();
        if !queue.closed
            && self.is_stopping()
            && queue.tasks.is_empty()
            && self.active.load(Ordering::SeqCst) == 0
        {
            queue.closed = true;
            debug!("scheduler `{}` drained, closing its queue", self.name());
            self.wakeup.notify_all();
        }
        if queue.closed {
            return Wake::Closed;
        }
        if queue.tasks.iter().any(|task| task.runs_on(thread)) {
            return Wake::Work;
        }
        self.wakeup.wait_for(&mut queue, self.config.idle_timeout());
        if queue.closed { Wake::Closed } else { Wake::Work }
    }

    fn begin_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        // Take the lock so no worker is between its checks and its wait.
        drop(self.queue.lock());
        self.wakeup.notify_all();
    }

    /// Fixes the worker set: from now on affinity to any other thread is
    /// rejected, and queued tasks pinned to such threads are dropped since
    /// nothing would ever pop them. Returns how many were dropped.
    fn seal_threads(&self) -> usize {
        let mut queue = self.queue.lock();
        self.threads_known.store(true, Ordering::Release);
        let threads = self.threads.lock();
        let before = queue.tasks.len();
        queue
            .tasks
            .retain(|task| task.thread.is_none_or(|t| threads.contains(&t)));
        let stranded = before - queue.tasks.len();
        if stranded > 0 {
            self.abandoned.fetch_add(stranded, Ordering::SeqCst);
            warn!(
                "scheduler `{}` dropped {} task(s) pinned to threads it does not run",
                self.name(),
                stranded
            );
        }
        stranded
    }

    /// Closes the queue without running anything; returns how many tasks were dropped.
    fn abandon(&self) -> usize {
        let mut queue = self.queue.lock();
        queue.closed = true;
        let count = queue.tasks.len();
        queue.tasks.clear();
        count
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

/// Makes `shared` the calling thread's current scheduler until the guard drops.
pub(crate) fn enter(shared: &Arc<Shared>) -> EnterGuard {
    let prev = CURRENT_SCHEDULER.with(|c| c.replace(Some(Arc::downgrade(shared))));
    EnterGuard { prev }
}

pub(crate) struct EnterGuard {
    prev: Option<Weak<Shared>>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        let _ = CURRENT_SCHEDULER.try_with(|c| *c.borrow_mut() = prev);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// A cloneable handle for submitting work to a scheduler.
///
/// Obtained from [`Scheduler::handle`] or, inside a task,
/// [`Scheduler::current`]. Handles do not keep worker threads alive.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// See [`Scheduler::schedule`].
    pub fn schedule<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.push_all([Task::call(work)])
    }

    /// See [`Scheduler::schedule_on`].
    pub fn schedule_on<F>(&self, work: F, thread: u64) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.push_all([Task::call(work).on_thread(thread)])
    }

    /// See [`Scheduler::schedule_fiber`].
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) -> Result<()> {
        self.shared.push_all([Task::fiber(fiber)])
    }

    /// See [`Scheduler::schedule_fiber_on`].
    pub fn schedule_fiber_on(&self, fiber: Arc<Fiber>, thread: u64) -> Result<()> {
        self.shared.push_all([Task::fiber(fiber).on_thread(thread)])
    }

    /// See [`Scheduler::schedule_task`].
    pub fn schedule_task(&self, task: Task) -> Result<()> {
        self.shared.push_all([task])
    }

    /// See [`Scheduler::schedule_batch`].
    pub fn schedule_batch<I>(&self, tasks: I) -> Result<()>
    where
        I: IntoIterator<Item = Task>,
    {
        self.shared.push_all(tasks)
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Thread ids of the workers registered so far.
    pub fn worker_thread_ids(&self) -> Vec<u64> {
        self.shared.threads.lock().clone()
    }

    /// Whether `stop()` has been called on the owning scheduler.
    pub fn is_stopping(&self) -> bool {
        self.shared.is_stopping()
    }
}

/// The fiber scheduler managing worker threads and the ready queue.
///
/// # Example
///
/// ```no_run
/// use corofiber::Scheduler;
///
/// let scheduler = Scheduler::new(4, false, "pool");
/// scheduler.start().unwrap();
/// scheduler.schedule(|| println!("Hello from a fiber!")).unwrap();
/// scheduler.stop().unwrap();
/// ```
pub struct Scheduler {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Fiber running the dispatch loop on the constructing thread (use-caller mode).
    root: Option<Arc<Fiber>>,
    root_thread: Option<u64>,
    /// Current scheduler of the constructing thread before this one (use-caller mode).
    prev_current: Option<Weak<Shared>>,
}

impl Scheduler {
    /// Creates a scheduler with `threads` workers.
    ///
    /// With `use_caller`, the calling thread is one of those workers: it runs
    /// its share of the work inside [`stop`](Self::stop), and must be the
    /// thread that calls it. The new scheduler also becomes that thread's
    /// [`current`](Self::current) scheduler; a use-caller scheduler created
    /// earlier on the same thread becomes current again once this one drops.
    /// `threads == 0` means one worker per CPU.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Self {
        Self::with_config(SchedulerConfig {
            threads,
            use_caller,
            name: name.into(),
            ..SchedulerConfig::default()
        })
    }

    /// Creates a scheduler from a full configuration.
    pub fn with_config(mut config: SchedulerConfig) -> Self {
        config.threads = config.worker_count();
        let use_caller = config.use_caller;
        let stack_size = config.stack_size;
        let shared = Arc::new(Shared::new(config));

        let mut prev_current = None;
        let (root, root_thread) = if use_caller {
            Fiber::get_this();
            let here = thread::current_thread_id();
            shared.register_thread(here);
            prev_current = CURRENT_SCHEDULER.with(|c| c.replace(Some(Arc::downgrade(&shared))));

            let loop_shared = Arc::clone(&shared);
            let root = Fiber::with_stack_size(move || worker::run(&loop_shared), stack_size);
            (Some(root), Some(here))
        } else {
            (None, None)
        };

        debug!(
            "scheduler `{}` created: {} worker(s), use_caller={}",
            shared.name(),
            shared.config.threads,
            use_caller
        );

        Scheduler {
            shared,
            lifecycle: Mutex::new(Lifecycle::Created),
            workers: Mutex::new(Vec::new()),
            root,
            root_thread,
            prev_current,
        }
    }

    /// Returns a handle to the scheduler whose worker is running on the
    /// calling thread, if any.
    pub fn current() -> Option<SchedulerHandle> {
        CURRENT_SCHEDULER
            .with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
            .map(|shared| SchedulerHandle { shared })
    }

    /// Spawns the worker threads. Calling it again while running is a no-op.
    ///
    /// Returns once every worker has registered its thread id, so
    /// [`worker_thread_ids`](Self::worker_thread_ids) is complete afterwards.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running | Lifecycle::Stopping => return Ok(()),
            Lifecycle::Stopped => return Err(self.shared.stopped_error()),
            Lifecycle::Created => {}
        }

        let ready = WaitGroup::new();
        for index in 0..self.spawned_workers() {
            let spawned = worker::spawn(index, Arc::clone(&self.shared), ready.clone());
            match spawned {
                Ok(handle) => self.workers.lock().push(handle),
                Err(err) => {
                    error!(
                        "scheduler `{}` failed to spawn worker {}: {}",
                        self.shared.name(),
                        index,
                        err
                    );
                    drop(ready);
                    *lifecycle = Lifecycle::Stopping;
                    self.drain_and_join();
                    *lifecycle = Lifecycle::Stopped;
                    return Err(Error::Spawn(err));
                }
            }
        }
        ready.wait();
        self.shared.seal_threads();

        *lifecycle = Lifecycle::Running;
        info!(
            "scheduler `{}` started with {} worker(s)",
            self.shared.name(),
            self.shared.config.threads
        );
        Ok(())
    }

    /// Submits a closure to run in a fiber on any worker.
    ///
    /// Accepted until the scheduler has finished draining during
    /// [`stop`](Self::stop); afterwards returns [`Error::Stopped`].
    pub fn schedule<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.push_all([Task::call(work)])
    }

    /// Submits a closure that may only run on the worker with thread id `thread`.
    pub fn schedule_on<F>(&self, work: F, thread: u64) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.push_all([Task::call(work).on_thread(thread)])
    }

    /// Submits a fiber. A fiber that has already run is pinned to its thread.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) -> Result<()> {
        self.shared.push_all([Task::fiber(fiber)])
    }

    /// Submits a fiber pinned to the worker with thread id `thread`.
    pub fn schedule_fiber_on(&self, fiber: Arc<Fiber>, thread: u64) -> Result<()> {
        self.shared.push_all([Task::fiber(fiber).on_thread(thread)])
    }

    /// Submits a prepared [`Task`].
    pub fn schedule_task(&self, task: Task) -> Result<()> {
        self.shared.push_all([task])
    }

    /// Submits several tasks under one lock acquisition. Either all are
    /// queued, in order, or none is.
    pub fn schedule_batch<I>(&self, tasks: I) -> Result<()>
    where
        I: IntoIterator<Item = Task>,
    {
        self.shared.push_all(tasks)
    }

    /// Stops the scheduler: wakes idle workers, lets them drain every queued
    /// and in-flight task, and joins them. In use-caller mode the calling
    /// thread runs its share of the work here.
    ///
    /// Stopping an already stopped scheduler is a no-op. A scheduler that was
    /// never started and has no caller worker cannot run anything; its queued
    /// tasks are reported as [`Error::Abandoned`]. So are tasks that were
    /// queued before the worker set was known and turned out to be pinned to
    /// a thread that is not a worker; they are dropped when the workers
    /// register, and everything else still drains.
    ///
    /// # Panics
    ///
    /// Panics in use-caller mode when called from a thread other than the
    /// one that created the scheduler.
    pub fn stop(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Stopping | Lifecycle::Stopped => return Ok(()),
                Lifecycle::Created if self.root.is_none() => {
                    *lifecycle = Lifecycle::Stopped;
                    self.shared.begin_stop();
                    let count = self.shared.abandon();
                    if count == 0 {
                        return Ok(());
                    }
                    warn!(
                        "scheduler `{}` stopped before starting, {} task(s) abandoned",
                        self.shared.name(),
                        count
                    );
                    return Err(Error::Abandoned {
                        name: self.shared.config.name.clone(),
                        count,
                    });
                }
                _ => {
                    if let Some(root_thread) = self.root_thread {
                        assert_eq!(
                            thread::current_thread_id(),
                            root_thread,
                            "scheduler `{}` must be stopped on the thread that created it",
                            self.shared.name()
                        );
                    }
                    *lifecycle = Lifecycle::Stopping;
                }
            }
        }

        info!("scheduler `{}` stopping", self.shared.name());
        let panicked = self.drain_and_join();
        *self.lifecycle.lock() = Lifecycle::Stopped;
        info!("scheduler `{}` stopped", self.shared.name());

        let abandoned = self.shared.abandoned.load(Ordering::SeqCst);
        if panicked > 0 {
            Err(Error::WorkerPanicked { count: panicked })
        } else if abandoned > 0 {
            Err(Error::Abandoned {
                name: self.shared.config.name.clone(),
                count: abandoned,
            })
        } else {
            Ok(())
        }
    }

    /// Signals shutdown, runs the caller's dispatch loop if there is one,
    /// and joins the spawned workers. Returns how many of them panicked.
    fn drain_and_join(&self) -> usize {
        // A use-caller scheduler may stop without ever starting.
        self.shared.seal_threads();
        self.shared.begin_stop();

        if let Some(root) = &self.root {
            if root.state().is_resumable() {
                root.swap_in();
            }
        }

        let mut panicked = 0;
        for (index, handle) in self.workers.lock().drain(..).enumerate() {
            if handle.join().is_err() {
                panicked += 1;
                error!(
                    "scheduler `{}` worker {} panicked",
                    self.shared.name(),
                    index
                );
            }
        }
        panicked
    }

    fn spawned_workers(&self) -> usize {
        self.shared.config.threads - usize::from(self.root.is_some())
    }

    /// Returns a cloneable submission handle.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Total number of workers, the caller included in use-caller mode.
    pub fn thread_count(&self) -> usize {
        self.shared.config.threads
    }

    /// Thread ids of the workers, usable as task affinity targets.
    pub fn worker_thread_ids(&self) -> Vec<u64> {
        self.shared.threads.lock().clone()
    }

    /// Number of tasks currently being run by workers.
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Number of workers currently idle.
    pub fn idle_count(&self) -> usize {
        self.shared.idle.load(Ordering::SeqCst)
    }

    /// Number of queued tasks.
    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    pub fn is_running(&self) -> bool {
        *self.lifecycle.lock() == Lifecycle::Running
    }

    pub fn is_stopped(&self) -> bool {
        *self.lifecycle.lock() == Lifecycle::Stopped
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let lifecycle = *self.lifecycle.lock();
        let foreign = self
            .root_thread
            .is_some_and(|root| root != thread::current_thread_id());
        match lifecycle {
            Lifecycle::Running | Lifecycle::Created if foreign => {
                // The caller's share of the work can only run on its own thread.
                *self.lifecycle.lock() = Lifecycle::Stopped;
                self.shared.begin_stop();
                let count = self.shared.abandon();
                error!(
                    "scheduler `{}` dropped away from its creating thread; {} task(s) abandoned, workers detached",
                    self.shared.name(),
                    count
                );
            }
            Lifecycle::Running => {
                error!(
                    "scheduler `{}` dropped while running; stopping it",
                    self.shared.name()
                );
                if let Err(err) = self.stop() {
                    error!("scheduler `{}` stop failed: {}", self.shared.name(), err);
                }
            }
            Lifecycle::Created => {
                let count = self.shared.abandon();
                if count > 0 {
                    warn!(
                        "scheduler `{}` dropped without running, {} task(s) abandoned",
                        self.shared.name(),
                        count
                    );
                }
            }
            Lifecycle::Stopping | Lifecycle::Stopped => {}
        }

        let ours = Arc::downgrade(&self.shared);
        let prev = self.prev_current.take();
        let _ = CURRENT_SCHEDULER.try_with(|c| {
            let mut current = c.borrow_mut();
            if current.as_ref().is_some_and(|w| w.ptr_eq(&ours)) {
                *current = prev;
            }
        });
    }
}
