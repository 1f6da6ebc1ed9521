//! Fatal-fault reporting.
//!
//! A broken fiber invariant means a suspended stack may be corrupt, so these
//! faults never unwind: they log what they can and abort the process.

use std::backtrace::Backtrace;
use std::fmt::Display;

/// Captures the calling thread's backtrace, one frame per line, each line
/// prefixed with `prefix`.
pub fn backtrace_string(prefix: &str) -> String {
    Backtrace::force_capture()
        .to_string()
        .lines()
        .map(|line| format!("{prefix}{line}\n"))
        .collect()
}

/// Reports an unrecoverable fault and aborts the process.
#[cold]
#[inline(never)]
pub fn fatal(message: impl Display) -> ! {
    let backtrace = backtrace_string("    ");
    if log::log_enabled!(log::Level::Error) {
        log::error!("fatal: {message}\nbacktrace:\n{backtrace}");
        log::logger().flush();
    } else {
        eprintln!("fatal: {message}\nbacktrace:\n{backtrace}");
    }
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backtrace_lines_are_prefixed() {
        let bt = backtrace_string(">> ");
        assert!(!bt.is_empty());
        assert!(bt.lines().all(|line| line.starts_with(">> ")));
    }
}
