//! Thin OS thread helpers: named spawning and small integer thread ids.
//!
//! Thread ids are what task affinity is expressed in. They are assigned on
//! first use per thread, are unique for the life of the process, and are
//! never 0.

use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{Builder, JoinHandle};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    static THREAD_NAME: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Returns the id of the calling thread.
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// Records a name for the calling thread, used in log lines.
pub fn set_current_thread_name(name: &str) {
    THREAD_NAME.with(|n| *n.borrow_mut() = Some(name.to_string()));
}

/// Returns the recorded name of the calling thread, falling back to the
/// standard library's name and then to `"UNKNOWN"`.
pub fn current_thread_name() -> String {
    THREAD_NAME
        .try_with(|n| n.borrow().clone())
        .ok()
        .flatten()
        .or_else(|| std::thread::current().name().map(str::to_string))
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

/// Spawns a named OS thread running `f`.
pub fn spawn<F>(name: String, f: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    Builder::new().name(name.clone()).spawn(move || {
        set_current_thread_name(&name);
        f();
    })
}
