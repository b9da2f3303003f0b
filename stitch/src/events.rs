use std::fmt;

use crate::buffer::Location;

/// Severity of a user-facing notice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        })
    }
}

/// Everything the core reports back to the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Notice { level: Level, message: String },
    /// Show a progress indicator at a location.
    ProgressStart { location: Location },
    ProgressStop { location: Location },
}

impl Event {
    pub fn notice(level: Level, message: impl Into<String>) -> Self {
        Event::Notice {
            level,
            message: message.into(),
        }
    }
}

/// Host event sink. Called synchronously from the orchestrator; implementations
/// should hand off anything slow.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Drops every event.
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: Event) {}
}

/// Forwards notices to `tracing`. Progress events are logged at trace level.
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: Event) {
        match event {
            Event::Notice { level, message } => match level {
                Level::Debug => tracing::debug!("{message}"),
                Level::Info => tracing::info!("{message}"),
                Level::Warn => tracing::warn!("{message}"),
                Level::Error => tracing::error!("{message}"),
            },
            Event::ProgressStart { location } => tracing::trace!("progress start at {location}"),
            Event::ProgressStop { location } => tracing::trace!("progress stop at {location}"),
        }
    }
}
