//! Configuration for fibers and schedulers.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Stack size used when a fiber is created without an explicit size.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Smallest stack a fiber will be given.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

const PAGE_SIZE: usize = 4096;

static STACK_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_STACK_SIZE);

/// Returns the process-wide default fiber stack size in bytes.
pub fn default_stack_size() -> usize {
    STACK_SIZE.load(Ordering::Relaxed)
}

/// Sets the process-wide default fiber stack size.
///
/// Passing 0 restores [`DEFAULT_STACK_SIZE`]. Only fibers created afterwards
/// are affected.
pub fn set_default_stack_size(bytes: usize) {
    let bytes = if bytes == 0 {
        DEFAULT_STACK_SIZE
    } else {
        round_stack_size(bytes)
    };
    STACK_SIZE.store(bytes, Ordering::Relaxed);
}

/// Resolves a requested stack size: 0 means the default, everything is
/// rounded up to whole pages and clamped to [`MIN_STACK_SIZE`].
pub(crate) fn resolve_stack_size(requested: usize) -> usize {
    if requested == 0 {
        default_stack_size()
    } else {
        round_stack_size(requested)
    }
}

fn round_stack_size(bytes: usize) -> usize {
    bytes.max(MIN_STACK_SIZE).div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i, wrapping).
    Linear,
}

/// Configuration for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Total number of workers, including the caller when `use_caller` is set.
    /// 0 means one worker per available CPU.
    pub threads: usize,
    /// Whether the constructing thread participates as a worker.
    pub use_caller: bool,
    /// Name used for worker threads and diagnostics.
    pub name: String,
    /// Stack size for fibers created by the workers. 0 uses the process default.
    pub stack_size: usize,
    /// How long an idle worker parks before re-checking the queue.
    pub idle_timeout_ms: u64,
    /// CPU pinning applied to spawned worker threads.
    pub pinning: PinningStrategy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            use_caller: false,
            name: "scheduler".to_string(),
            stack_size: 0,
            idle_timeout_ms: 10,
            pinning: PinningStrategy::None,
        }
    }
}

impl SchedulerConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    ///
    /// ```
    /// use corofiber::config::SchedulerConfig;
    ///
    /// let config = SchedulerConfig::from_json(r#"{ "threads": 2, "name": "io" }"#).unwrap();
    /// assert_eq!(config.threads, 2);
    /// assert!(!config.use_caller);
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Number of workers after resolving `threads == 0`.
    pub fn worker_count(&self) -> usize {
        if self.threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.threads
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.max(1))
    }
}
