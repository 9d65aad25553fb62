//! Logging plumbing shared by the engine and the daemon. Components hold a
//! child `Logger` and log with key-value context.

pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Level, Logger};

use slog::{OwnedKVList, Record};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Handle to the runtime log level. The control loop adjusts it on
/// `loglevel=<int>` commands while the worker threads keep logging through
/// their existing `Logger` clones.
#[derive(Clone)]
pub struct LevelHandle {
    level: Arc<AtomicUsize>,
}

impl LevelHandle {
    pub fn new(level: Level) -> LevelHandle {
        LevelHandle {
            level: Arc::new(AtomicUsize::new(level.as_usize())),
        }
    }

    #[inline]
    pub fn get(&self) -> Level {
        Level::from_usize(self.level.load(Ordering::Relaxed)).unwrap_or(Level::Info)
    }

    pub fn set(&self, level: Level) {
        self.level.store(level.as_usize(), Ordering::Relaxed);
    }

    /// Maps the syslog-style integers of the `loglevel=` command (0 emergency
    /// through 7 debug) onto a level.
    pub fn set_syslog(&self, value: u32) {
        let level = match value {
            0..=2 => Level::Critical,
            3 => Level::Error,
            4 => Level::Warning,
            5 | 6 => Level::Info,
            _ => Level::Debug,
        };
        self.set(level);
    }
}

/// Drain adapter consulting a `LevelHandle` on every record.
pub struct RuntimeLevel<D: Drain> {
    drain: D,
    handle: LevelHandle,
}

impl<D: Drain> RuntimeLevel<D> {
    pub fn new(drain: D, handle: LevelHandle) -> RuntimeLevel<D> {
        RuntimeLevel { drain, handle }
    }
}

impl<D: Drain> Drain for RuntimeLevel<D> {
    type Ok = Option<D::Ok>;
    type Err = D::Err;

    fn log(&self, record: &Record, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.handle.get()) {
            self.drain.log(record, values).map(Some)
        } else {
            Ok(None)
        }
    }
}

/// Builds the root terminal logger. The underlying drain is built wide open
/// and filtered through the returned `LevelHandle`.
pub fn terminal(initial: Level) -> (Logger, LevelHandle) {
    let inner = TerminalLoggerBuilder::new()
        .level(Severity::Trace)
        .destination(Destination::Stderr)
        .build()
        .unwrap_or_else(|_| Logger::root(Discard, o!()));

    let handle = LevelHandle::new(initial);
    let log = Logger::root(
        RuntimeLevel::new(inner, handle.clone()).ignore_res(),
        o!(),
    );

    (log, handle)
}

/// Logger for tests and for components constructed without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syslog_mapping() {
        let handle = LevelHandle::new(Level::Info);

        handle.set_syslog(7);
        assert_eq!(handle.get(), Level::Debug);

        handle.set_syslog(4);
        assert_eq!(handle.get(), Level::Warning);

        handle.set_syslog(0);
        assert_eq!(handle.get(), Level::Critical);

        handle.set_syslog(6);
        assert_eq!(handle.get(), Level::Info);
    }

    #[test]
    fn test_runtime_level_filters() {
        use std::sync::Mutex;

        struct Counter(Mutex<usize>);

        impl Drain for Counter {
            type Ok = ();
            type Err = slog::Never;

            fn log(&self, _: &Record, _: &OwnedKVList) -> Result<(), slog::Never> {
                *self.0.lock().unwrap() += 1;
                Ok(())
            }
        }

        let counter = Arc::new(Counter(Mutex::new(0)));
        let handle = LevelHandle::new(Level::Warning);
        let log = Logger::root(
            RuntimeLevel::new(Arc::clone(&counter), handle.clone()).ignore_res(),
            o!(),
        );

        debug!(log, "filtered");
        assert_eq!(*counter.0.lock().unwrap(), 0);

        warn!(log, "passes");
        assert_eq!(*counter.0.lock().unwrap(), 1);

        handle.set(Level::Debug);
        debug!(log, "now passes");
        assert_eq!(*counter.0.lock().unwrap(), 2);
    }
}
