//! A [`log`] backend that writes every record into a [`fmt::Write`] sink.

use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

/// Writes log records in the form `[ LEVEL ] [module::path] message`.
pub struct Logger<W> {
    sink: Mutex<W>,
    level: LevelFilter,
}

impl<W: Write> Logger<W> {
    /// Create a logger that writes every record up to `level` into `sink`.
    pub const fn new(sink: W, level: LevelFilter) -> Self {
        Self {
            sink: Mutex::new(sink),
            level,
        }
    }

    /// Run `f` with exclusive access to the sink.
    pub fn with_sink<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
        f(&mut self.sink.lock())
    }
}

impl<W: Write + Send> Log for Logger<W> {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mod_path = record
            .module_path_static()
            .or_else(|| record.module_path())
            .unwrap_or("<n/a>");

        // nothing sensible can be done if the sink fails
        let _ = writeln!(
            self.sink.lock(),
            "[ {:>5} ] [{}] {}",
            record.level(),
            mod_path,
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install `logger` as the global logger.
pub fn init<W: Write + Send>(logger: &'static Logger<W>) -> Result<(), SetLoggerError> {
    log::set_logger(logger)?;
    log::set_max_level(logger.level);
    Ok(())
}
