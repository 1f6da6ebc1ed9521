//! # corofiber - Stackful Fibers and a Cooperative M:N Scheduler
//!
//! Fibers are user-space execution contexts with their own stacks. They run
//! until they voluntarily swap themselves out and can later be resumed at
//! exactly that point. A [`Scheduler`] multiplexes fibers onto a small pool of
//! worker threads.
//!
//! ## Architecture
//!
//! - **Fibers**: stackful coroutines (`corosensei`) with an explicit state
//!   machine (`INIT`, `HOLD`, `EXEC`, `READY`, `TERM`, `EXCEPT`). A fiber is
//!   bound to the thread that first runs it and never migrates.
//! - **Ready queue**: one FIFO queue shared by every worker. Tasks can be
//!   pinned to a worker thread; pinned tasks wait for that thread and are
//!   never stolen.
//! - **Worker threads**: each runs the dispatch loop plus one idle fiber that
//!   parks until work arrives or the scheduler stops.
//!
//! Scheduling is cooperative: nothing preempts a running fiber.
//!
//! ## Example
//!
//! ```no_run
//! use corofiber::{Fiber, Scheduler};
//!
//! // Direct use: no scheduler involved.
//! let fiber = Fiber::new(|| {
//!     println!("first half");
//!     Fiber::yield_to_hold();
//!     println!("second half");
//! });
//! fiber.swap_in();
//! fiber.swap_in();
//!
//! // Scheduled use.
//! let scheduler = Scheduler::new(4, false, "pool");
//! scheduler.start().unwrap();
//! scheduler.schedule(|| println!("Hello from a fiber job!")).unwrap();
//! scheduler.stop().unwrap();
//! ```

pub mod config;
pub mod diag;
pub mod error;
pub mod fiber;
pub mod logging;
pub mod scheduler;
pub mod task;
pub mod thread;
mod worker;

pub use config::{PinningStrategy, SchedulerConfig};
pub use error::{Error, FiberError, Result};
pub use fiber::{Fiber, State};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use task::Task;
