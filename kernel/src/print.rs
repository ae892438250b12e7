use core::fmt::Write as _;
use core::sync::atomic::{AtomicBool, Ordering};
use std::io::Write as _;

use lazy_static::lazy_static;
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Where console output ends up.
pub trait Console: Send {
    fn write_str(&mut self, s: &str);
}

/// The default console: the host's stderr plays the serial line
pub struct SerialConsole;

impl Console for SerialConsole {
    fn write_str(&mut self, s: &str) {
        let _ = std::io::stderr().write_all(s.as_bytes());
    }
}

pub struct KernelLogger {
    // serialises whole lines so output of different cores does not interleave
    console: Mutex<Box<dyn Console>>,
    color: AtomicBool,
}

lazy_static! {
    static ref LOGGER: KernelLogger = KernelLogger {
        console: Mutex::new(Box::new(SerialConsole)),
        color: AtomicBool::new(false),
    };
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = crate::arch::time();
        let timestamp_subsec_us = timestamp.subsec_micros();
        let thread = std::thread::current();
        let flow = thread.name().unwrap_or("host");

        let mut line = String::new();
        let stamp = format!(
            "[  {:>3}.{:03}{:03}]",
            timestamp.as_secs(),
            timestamp_subsec_us / 1_000,
            timestamp_subsec_us % 1_000
        );
        let _ = if self.color.load(Ordering::Relaxed) {
            write!(line, "\x1b[0;36m{}\x1b[0m ", stamp)
        } else {
            write!(line, "{} ", stamp)
        };
        let _ = writeln!(line, "{:<5} {}: {}", record.level(), flow, record.args());

        self.console.lock().write_str(&line);
    }

    fn flush(&self) {}
}

/// Installs the console logger. Only the first call installs it, later calls
/// just adjust the level and colour.
pub fn init(level: LevelFilter, color: bool) {
    LOGGER.color.store(color, Ordering::Relaxed);
    log::set_max_level(level);
    if log::set_logger(&*LOGGER).is_err() {
        log::trace!("print::init: logger already installed");
    }
}

/// Redirects console output, e.g. into a buffer
pub fn set_console(console: Box<dyn Console>) {
    *LOGGER.console.lock() = console;
}
