//! Minimal line logger for the `log` facade.
//!
//! Every record becomes one tab-separated line on stderr carrying the
//! timestamp, thread id, thread name and running fiber id:
//!
//! ```text
//! 2026-10-18 09:12:44.031	3	pool_0	17	[ERROR]	[corofiber::fiber]	src/fiber.rs:301	fiber 17 panicked: boom
//! ```

use crate::fiber::Fiber;
use crate::thread;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::io::Write;

/// Environment variable read by [`init_from_env`].
pub const LOG_ENV: &str = "COROFIBER_LOG";

/// The stderr sink installed by [`init`].
pub struct FiberLogger;

static LOGGER: FiberLogger = FiberLogger;

impl Log for FiberLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_record(record);
        let mut stderr = std::io::stderr().lock();
        // A failing stderr has nowhere else to report to.
        let _ = stderr.write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Renders a record as a single newline-terminated log line.
pub fn format_record(record: &Record) -> String {
    format!(
        "{}\t{}\t{}\t{}\t[{}]\t[{}]\t{}:{}\t{}\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        thread::current_thread_id(),
        thread::current_thread_name(),
        Fiber::current_id(),
        record.level(),
        record.target(),
        record.file().unwrap_or("?"),
        record.line().unwrap_or(0),
        record.args()
    )
}

/// Installs [`FiberLogger`] as the global logger at `level`.
///
/// Fails if another logger was installed first.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

/// Installs [`FiberLogger`] with the level named by `COROFIBER_LOG`
/// (`error`, `warn`, `info`, `debug`, `trace`, `off`), defaulting to `info`.
pub fn init_from_env() -> Result<(), SetLoggerError> {
    let level = std::env::var(LOG_ENV)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(LevelFilter::Info);
    init(level)
}
