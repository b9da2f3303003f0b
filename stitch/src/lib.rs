pub mod buffer;
pub mod client;
pub mod comment;
pub mod config;
pub mod directive;
pub mod events;
pub mod locator;
pub mod orchestrator;
pub mod prompt;
pub mod protocol;
pub mod response;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use buffer::{BufferHost, BufferId, EditError, Location, MemoryBuffers};
pub use client::{ClientError, ClientOptions, HealthStatus, SessionClient};
pub use comment::{CommentDelimiters, detect_comment_delimiters};
pub use config::{ConfigError, StitchConfig, TransportKind};
pub use directive::{Directive, DirectiveLocator};
pub use events::{Event, EventSink, Level, LogEventSink, NoopEventSink};
pub use locator::{Endpoint, LocatorError, LocatorOptions, LsofProbe, ProcessProbe, ServiceLocator};
pub use orchestrator::{
    CancelOutcome, CancelSummary, Orchestrator, RejectReason, RequestSnapshot, RequestState,
    RunOutcome, StatusEntry,
};
pub use response::{ParseError, ParsedEdit, ParsedResponse, parse_response};
pub use transport::{CurlTransport, HttpRequest, Transport, TransportError};
