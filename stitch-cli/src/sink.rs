use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};

use stitch_core::{Event, EventSink, Level, LogEventSink};

const DIM: &str = "\x1b[2m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Prints notices to stderr and mirrors every event into the log.
pub struct StderrSink {
    min_level: Level,
    color: bool,
    errors: AtomicUsize,
}

impl StderrSink {
    pub fn new(verbose: bool, color: bool) -> Self {
        Self {
            min_level: if verbose { Level::Debug } else { Level::Info },
            color,
            errors: AtomicUsize::new(0),
        }
    }

    /// Number of error notices seen so far.
    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }

    fn paint(&self, level: Level) -> (&'static str, &'static str) {
        if !self.color {
            return ("", "");
        }
        match level {
            Level::Debug => (DIM, RESET),
            Level::Info => ("", ""),
            Level::Warn => (YELLOW, RESET),
            Level::Error => (RED, RESET),
        }
    }
}

impl EventSink for StderrSink {
    fn emit(&self, event: Event) {
        LogEventSink.emit(event.clone());
        let line = match event {
            Event::Notice { level, message } => {
                if level == Level::Error {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                }
                if level < self.min_level {
                    return;
                }
                let (start, end) = self.paint(level);
                format!("{start}{level}: {message}{end}")
            }
            Event::ProgressStart { location } => {
                let (start, end) = self.paint(Level::Debug);
                format!("{start}working on line {}...{end}", location.line)
            }
            Event::ProgressStop { .. } => return,
        };
        let _ = writeln!(std::io::stderr().lock(), "{line}");
    }
}
