//! Stackful fibers.
//!
//! A [`Fiber`] owns a stack and a suspended execution context built on
//! `corosensei`. Switching is asymmetric: [`Fiber::swap_in`] runs the fiber
//! until it swaps itself out (or finishes), and control always returns to
//! whoever swapped it in.
//!
//! Each OS thread lazily gets a stack-less "main fiber" representing its
//! native stack; [`Fiber::get_this`] returns it when no other fiber is
//! running. The first `swap_in` binds a fiber to the calling thread and it can
//! never be resumed anywhere else.

use crate::config;
use crate::diag;
use crate::error::FiberError;
use crate::thread;
use corosensei::stack::{DefaultStack, Stack};
use corosensei::{Coroutine, CoroutineResult, Yielder};
use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use std::cell::{RefCell, UnsafeCell};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Entry function of a fiber.
pub(crate) type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Fiber handed to the trampoline on the first resume.
#[derive(Clone, Copy)]
struct FiberPtr(*const Fiber);

type FiberCoroutine = Coroutine<FiberPtr, (), (), &'static mut DefaultStack>;
type FiberYielder = Yielder<FiberPtr, ()>;

/// Lifecycle state of a fiber.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Constructed or reset, never entered.
    Init = 0,
    /// Suspended; only resumed when someone explicitly swaps it in or reschedules it.
    Hold = 1,
    /// Running on some thread.
    Exec = 2,
    /// Entry function returned.
    Term = 3,
    /// Suspended and eligible for rescheduling.
    Ready = 4,
    /// Entry function panicked.
    Except = 5,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Init,
            1 => State::Hold,
            2 => State::Exec,
            3 => State::Term,
            4 => State::Ready,
            5 => State::Except,
            other => diag::fatal(format_args!("corrupt fiber state byte {other}")),
        }
    }

    /// `Term` or `Except`.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Term | State::Except)
    }

    /// States from which `swap_in` is legal.
    pub fn is_resumable(self) -> bool {
        matches!(self, State::Init | State::Hold | State::Ready)
    }
}

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Fiber currently running on this thread. Holds a strong reference for as
    /// long as the fiber is on the thread's stack of resumers.
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    /// The thread's main fiber, kept until thread exit.
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// A stackful cooperative coroutine.
pub struct Fiber {
    id: u64,
    stack_size: usize,
    /// Null for thread main fibers. Released in `Drop` after the coroutine.
    stack: *mut DefaultStack,
    stack_base: usize,
    state: AtomicU8,
    /// Thread the fiber was entered on; 0 while unbound.
    thread: AtomicU64,
    coroutine: UnsafeCell<Option<FiberCoroutine>>,
    entry: UnsafeCell<Option<Entry>>,
    /// Valid only while the fiber is running.
    yielder: UnsafeCell<*const FiberYielder>,
    failure: Mutex<Option<String>>,
}

// SAFETY: the UnsafeCell fields are only touched by the thread that moved the
// fiber into EXEC (swap_in and reset both claim it that way) or by the fiber's
// own code while it runs. A started fiber is bound to one thread and refuses
// to be resumed from any other, so the coroutine never changes threads.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a fiber running `entry` on a stack of the default size.
    pub fn new<F>(entry: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(entry, 0)
    }

    /// Creates a fiber with an explicit stack size in bytes (0 = default).
    ///
    /// The size is rounded up to whole pages with a 16 KiB floor. Failing to
    /// allocate the stack aborts the process.
    pub fn with_stack_size<F>(entry: F, stack_size: usize) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_entry(Box::new(entry), stack_size)
    }

    pub(crate) fn from_entry(entry: Entry, stack_size: usize) -> Arc<Fiber> {
        let stack_size = config::resolve_stack_size(stack_size);
        let stack = match DefaultStack::new(stack_size) {
            Ok(stack) => Box::into_raw(Box::new(stack)),
            Err(err) => diag::fatal(format_args!(
                "failed to allocate a {stack_size}-byte fiber stack: {err}"
            )),
        };
        // SAFETY: freshly allocated and not shared yet.
        let stack_base = unsafe { (*stack).base().get() };
        // SAFETY: the stack lives until Drop, which drops the coroutine first.
        let coroutine = unsafe { Self::coroutine_on(stack) };

        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        trace!("fiber {id} created with a {stack_size}-byte stack");

        Arc::new(Fiber {
            id,
            stack_size,
            stack,
            stack_base,
            state: AtomicU8::new(State::Init as u8),
            thread: AtomicU64::new(0),
            coroutine: UnsafeCell::new(Some(coroutine)),
            entry: UnsafeCell::new(Some(entry)),
            yielder: UnsafeCell::new(ptr::null()),
            failure: Mutex::new(None),
        })
    }

    /// The fiber standing for a thread's native stack. It is always EXEC and
    /// can be neither swapped in nor out.
    fn thread_main() -> Arc<Fiber> {
        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        debug!(
            "main fiber {id} created for thread {}",
            thread::current_thread_id()
        );

        Arc::new(Fiber {
            id,
            stack_size: 0,
            stack: ptr::null_mut(),
            stack_base: 0,
            state: AtomicU8::new(State::Exec as u8),
            thread: AtomicU64::new(thread::current_thread_id()),
            coroutine: UnsafeCell::new(None),
            entry: UnsafeCell::new(None),
            yielder: UnsafeCell::new(ptr::null()),
            failure: Mutex::new(None),
        })
    }

    /// # Safety
    ///
    /// `stack` must stay allocated for the life of the returned coroutine and
    /// must not be in use by another coroutine.
    unsafe fn coroutine_on(stack: *mut DefaultStack) -> FiberCoroutine {
        let stack: &'static mut DefaultStack = unsafe { &mut *stack };
        Coroutine::with_stack(stack, |yielder: &FiberYielder, fiber: FiberPtr| {
            // SAFETY: swap_in passes the fiber it holds an Arc to.
            let fiber = unsafe { &*fiber.0 };
            fiber.trampoline(yielder);
        })
    }

    /// Body of every fiber: run the entry function, record how it ended, and
    /// return to the resumer.
    fn trampoline(&self, yielder: &FiberYielder) {
        // SAFETY: only the fiber's own code touches these while it runs.
        let entry = unsafe {
            *self.yielder.get() = yielder as *const FiberYielder;
            (*self.entry.get()).take()
        };
        let Some(entry) = entry else {
            diag::fatal(format_args!(
                "fiber {} entered without an entry function",
                self.id
            ));
        };

        match catch_unwind(AssertUnwindSafe(move || entry())) {
            Ok(()) => self.set_state(State::Term),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!("fiber {} panicked: {}", self.id, msg);
                *self.failure.lock() = Some(msg);
                self.set_state(State::Except);
            }
        }

        // SAFETY: as above.
        unsafe { *self.yielder.get() = ptr::null() };
    }

    /// Switches into this fiber and runs it until it swaps out or finishes.
    ///
    /// # Panics
    ///
    /// Panics if the fiber is running, finished, or bound to another thread.
    pub fn swap_in(self: &Arc<Self>) {
        if let Err(err) = self.try_swap_in() {
            panic!("{err}");
        }
    }

    /// Like [`swap_in`](Self::swap_in), but reports misuse instead of panicking.
    pub fn try_swap_in(self: &Arc<Self>) -> Result<(), FiberError> {
        let here = thread::current_thread_id();
        let bound = self.thread.load(Ordering::Acquire);
        if bound != 0 && bound != here {
            return Err(FiberError::WrongThread {
                id: self.id,
                bound,
                current: here,
            });
        }
        self.transition(State::is_resumable, State::Exec)
            .map_err(|state| FiberError::NotResumable { id: self.id, state })?;
        self.thread.store(here, Ordering::Release);

        // Make sure the thread has its main fiber before leaving it.
        Fiber::get_this();
        let caller = CURRENT_FIBER.with(|c| c.replace(Some(Arc::clone(self))));

        // SAFETY: winning the transition to EXEC gives this thread exclusive
        // use of the coroutine until the fiber swaps out.
        let coroutine = unsafe { &mut *self.coroutine.get() };
        let Some(coroutine) = coroutine.as_mut() else {
            diag::fatal(format_args!("fiber {} has no execution context", self.id));
        };
        let result = coroutine.resume(FiberPtr(Arc::as_ptr(self)));

        CURRENT_FIBER.with(|c| *c.borrow_mut() = caller);

        if let CoroutineResult::Return(()) = result {
            let state = self.state();
            if !state.is_terminal() {
                diag::fatal(format_args!(
                    "fiber {} left its trampoline in state {:?}",
                    self.id, state
                ));
            }
        }
        Ok(())
    }

    /// Suspends this fiber in `HOLD` and returns to whoever swapped it in.
    ///
    /// # Panics
    ///
    /// Panics unless called from the fiber's own code.
    pub fn swap_out(&self) {
        self.suspend(State::Hold);
    }

    fn suspend(&self, next: State) {
        let running = CURRENT_FIBER.with(|c| c.borrow().as_ref().map(Arc::as_ptr));
        if running != Some(self as *const Fiber) {
            panic!("fiber {} can only be swapped out by its own code", self.id);
        }
        // SAFETY: this fiber is running, so the yielder is set and alive.
        let yielder = unsafe { *self.yielder.get() };
        if yielder.is_null() {
            panic!("fiber {} is a thread main fiber and cannot be swapped out", self.id);
        }
        self.set_state(next);
        // SAFETY: as above.
        unsafe { &*yielder }.suspend(());
    }

    /// Replaces the entry function of a finished (or never started) fiber,
    /// reusing its stack. The fiber returns to `INIT` and is unbound.
    ///
    /// # Panics
    ///
    /// Panics if the fiber is suspended or running, or is a main fiber.
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(err) = self.try_reset(entry) {
            panic!("{err}");
        }
    }

    /// Like [`reset`](Self::reset), but reports misuse instead of panicking.
    pub fn try_reset<F>(&self, entry: F) -> Result<(), FiberError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_entry(Box::new(entry))
    }

    pub(crate) fn reset_entry(&self, entry: Entry) -> Result<(), FiberError> {
        if self.is_main() {
            return Err(FiberError::MainFiber { id: self.id });
        }
        // Claim the fiber the way swap_in does so nothing enters it mid-reset.
        self.transition(
            |state| matches!(state, State::Init | State::Term | State::Except),
            State::Exec,
        )
        .map_err(|state| FiberError::NotResettable { id: self.id, state })?;

        // SAFETY: claimed above. The old coroutine is unstarted or finished,
        // so dropping it releases the stack without touching live frames.
        unsafe {
            let slot = &mut *self.coroutine.get();
            drop(slot.take());
            *slot = Some(Self::coroutine_on(self.stack));
            *self.entry.get() = Some(entry);
            *self.yielder.get() = ptr::null();
        }
        *self.failure.lock() = None;
        self.thread.store(0, Ordering::Release);
        self.set_state(State::Init);
        Ok(())
    }

    /// Returns the fiber running on the calling thread, creating the thread's
    /// main fiber on first use.
    pub fn get_this() -> Arc<Fiber> {
        if let Some(fiber) = CURRENT_FIBER.with(|c| c.borrow().clone()) {
            return fiber;
        }
        let main = Fiber::thread_main();
        THREAD_FIBER.with(|t| *t.borrow_mut() = Some(Arc::clone(&main)));
        CURRENT_FIBER.with(|c| *c.borrow_mut() = Some(Arc::clone(&main)));
        main
    }

    /// Moves the running fiber to `READY` and swaps it out.
    ///
    /// # Panics
    ///
    /// Panics when called outside a fiber.
    pub fn yield_to_ready() {
        Self::yield_current(State::Ready);
    }

    /// Moves the running fiber to `HOLD` and swaps it out.
    ///
    /// # Panics
    ///
    /// Panics when called outside a fiber.
    pub fn yield_to_hold() {
        Self::yield_current(State::Hold);
    }

    fn yield_current(next: State) {
        // Keep no Arc on the fiber's own stack while it is suspended.
        let running = CURRENT_FIBER.with(|c| c.borrow().as_ref().map(Arc::as_ptr));
        match running {
            // SAFETY: CURRENT_FIBER keeps the fiber alive until it switches
            // out, and whoever resumes it holds an Arc.
            Some(fiber) => unsafe { (*fiber).suspend(next) },
            None => panic!(
                "yield called on thread {} with no running fiber",
                thread::current_thread_id()
            ),
        }
    }

    /// Number of live fibers in the process, main fibers included.
    pub fn total_fibers() -> u64 {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }

    /// Id of the fiber running on the calling thread, or 0 if there is none.
    pub fn current_id() -> u64 {
        CURRENT_FIBER
            .try_with(|c| {
                c.try_borrow()
                    .ok()
                    .and_then(|fiber| fiber.as_ref().map(|f| f.id))
            })
            .ok()
            .flatten()
            .unwrap_or(0)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Usable stack size in bytes; 0 for main fibers.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Highest address of the fiber's stack; `None` for main fibers.
    pub fn stack_base(&self) -> Option<usize> {
        (!self.is_main()).then_some(self.stack_base)
    }

    /// Panic message of the last run if it ended in `EXCEPT`.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Thread the fiber is bound to, if it has been entered since its last reset.
    pub fn bound_thread(&self) -> Option<u64> {
        match self.thread.load(Ordering::Acquire) {
            0 => None,
            thread => Some(thread),
        }
    }

    /// Whether this is a thread main fiber.
    pub fn is_main(&self) -> bool {
        self.stack.is_null()
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, allowed: impl Fn(State) -> bool, to: State) -> Result<State, State> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = State::from_u8(current);
            if !allowed(state) {
                return Err(state);
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(state),
                Err(actual) => current = actual,
            }
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size)
            .field("thread", &self.bound_thread())
            .finish()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if let Some(coroutine) = self.coroutine.get_mut().take() {
            if coroutine.started() && !coroutine.done() {
                warn!(
                    "fiber {} dropped while suspended in {:?}; its frames are discarded",
                    self.id,
                    self.state()
                );
                // Never unwind a suspended stack from here.
                std::mem::forget(coroutine);
            }
        }
        if !self.stack.is_null() {
            // SAFETY: allocated by Box in from_entry; the coroutine using it is gone.
            drop(unsafe { Box::from_raw(self.stack) });
        }
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
