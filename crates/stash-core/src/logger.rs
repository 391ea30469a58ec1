//! Injected logging handle.
//!
//! Stores log through an `Arc<dyn Logger>` instead of a process-global, so
//! tests can silence a store and embedders can route its output.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Leveled logger used by every store.
pub trait Logger: Send + Sync + fmt::Debug {
    fn debug(&self, args: fmt::Arguments<'_>);
    fn info(&self, args: fmt::Arguments<'_>);
    fn warn(&self, args: fmt::Arguments<'_>);
    fn error(&self, args: fmt::Arguments<'_>);

    /// Log at error level and terminate the process.
    fn fatal(&self, args: fmt::Arguments<'_>) -> ! {
        self.error(args);
        std::process::exit(1)
    }
}

/// Forwards to `tracing` under the `stash` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, args: fmt::Arguments<'_>) {
        tracing::debug!(target: "stash", "{args}");
    }

    fn info(&self, args: fmt::Arguments<'_>) {
        tracing::info!(target: "stash", "{args}");
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        tracing::warn!(target: "stash", "{args}");
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        tracing::error!(target: "stash", "{args}");
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn debug(&self, _: fmt::Arguments<'_>) {}
    fn info(&self, _: fmt::Arguments<'_>) {}
    fn warn(&self, _: fmt::Arguments<'_>) {}
    fn error(&self, _: fmt::Arguments<'_>) {}
}

/// Keeps every line in memory, prefixed with its level. Useful in tests.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    lines: Mutex<Vec<String>>,
}

impl MemoryLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Whether any line starts with `level` and contains `needle`.
    pub fn contains(&self, level: &str, needle: &str) -> bool {
        self.lines()
            .iter()
            .any(|l| l.starts_with(level) && l.contains(needle))
    }

    fn push(&self, level: &str, args: fmt::Arguments<'_>) {
        self.lines.lock().push(format!("{level} {args}"));
    }
}

impl Logger for MemoryLogger {
    fn debug(&self, args: fmt::Arguments<'_>) {
        self.push("DEBUG", args);
    }

    fn info(&self, args: fmt::Arguments<'_>) {
        self.push("INFO", args);
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        self.push("WARN", args);
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        self.push("ERROR", args);
    }
}

/// The default logger handle.
pub fn default_logger() -> Arc<dyn Logger> {
    Arc::new(TracingLogger)
}
