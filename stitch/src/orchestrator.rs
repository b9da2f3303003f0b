//! Request lifecycle: one directive in, one buffer edit (or one message) out.
//!
//! Per buffer at most one location is in flight; further requests for that
//! buffer wait in a FIFO queue. Each in-flight request runs as a task that
//! walks health -> session -> message and re-checks, after every await, that
//! its entry still exists. Cancellation removes the entry, so a late result is
//! dropped on the floor. Before the buffer is touched, the anchor line is
//! compared with its text at snapshot time; any difference discards the result.
//!
//! While a result is being applied its entry stays in flight, marked as
//! committing, so the buffer counts as busy and new triggers queue behind it.
//! The entry is removed and the queue drained under a single lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, RwLock};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::buffer::{BufferHost, BufferId, Location, clamp_range};
use crate::client::{ClientError, SessionClient};
use crate::comment::{CommentDelimiters, detect_comment_delimiters};
use crate::config::StitchConfig;
use crate::directive::DirectiveLocator;
use crate::events::{Event, EventSink, Level};
use crate::prompt::{self, PromptContext};
use crate::response::{ParseError, parse_response, strip_fences_text};

/// Maps a filetype to its comment delimiters.
pub type CommentDetector = Arc<dyn Fn(&str) -> CommentDelimiters + Send + Sync>;

/// Buffer state captured for one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestSnapshot {
    pub location: Location,
    pub instruction: String,
    /// Anchor line text; must be unchanged when the result arrives.
    pub original_line_text: String,
    pub numbered_buffer_text: String,
    pub filename: String,
    pub filetype: String,
    pub agent_name: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    UnknownBuffer,
    NoDirective,
    EmptyInstruction,
    AlreadyProcessing,
    AlreadyQueued,
    InvalidGrammar,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Dispatched(Location),
    /// 1-based position in the buffer's queue.
    Queued { location: Location, position: usize },
    Rejected(RejectReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    Active,
    Queued,
    /// The result is already being written into the buffer.
    Committing,
    NotFound,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CancelSummary {
    pub active: usize,
    pub queued: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Active,
    /// 1-based queue position.
    Queued(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusEntry {
    pub location: Location,
    pub instruction: String,
    pub state: RequestState,
}

struct InFlightEntry {
    id: u64,
    cancel: CancellationToken,
    instruction: String,
    committing: bool,
}

#[derive(Default)]
struct State {
    in_flight: HashMap<Location, InFlightEntry>,
    queues: HashMap<BufferId, VecDeque<RequestSnapshot>>,
}

impl State {
    fn busy(&self, buffer: BufferId) -> bool {
        self.in_flight.keys().any(|l| l.buffer == buffer)
    }

    fn queued(&self, location: Location) -> bool {
        self.queues
            .get(&location.buffer)
            .is_some_and(|q| q.iter().any(|s| s.location == location))
    }

    fn idle(&self) -> bool {
        self.in_flight.is_empty() && self.queues.values().all(VecDeque::is_empty)
    }
}

/// Events collected under the state lock and emitted after it is released.
#[derive(Default)]
struct Outbox(Vec<Event>);

impl Outbox {
    fn notice(&mut self, level: Level, message: impl Into<String>) {
        self.0.push(Event::notice(level, message));
    }

    fn push(&mut self, event: Event) {
        self.0.push(event);
    }

    fn flush(self, sink: &dyn EventSink) {
        for event in self.0 {
            sink.emit(event);
        }
    }
}

/// Why a request task stopped before committing.
enum Abort {
    /// Entry was cancelled or replaced; the task must not report anything.
    Superseded,
    Failed(String),
}

struct Inner {
    client: SessionClient,
    buffers: Arc<dyn BufferHost>,
    events: Arc<dyn EventSink>,
    config: StitchConfig,
    detect: RwLock<CommentDetector>,
    state: StdMutex<State>,
    idle: watch::Sender<bool>,
    next_id: AtomicU64,
}

/// Owns all request state. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        client: SessionClient,
        buffers: Arc<dyn BufferHost>,
        events: Arc<dyn EventSink>,
        config: StitchConfig,
    ) -> Self {
        // Reported, not fatal: the user can fix the file and retry.
        for err in config.validate() {
            events.emit(Event::notice(Level::Warn, format!("invalid config: {err}")));
        }
        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                client,
                buffers,
                events,
                config,
                detect: RwLock::new(Arc::new(detect_comment_delimiters)),
                state: StdMutex::new(State::default()),
                idle,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Replace the filetype -> comment delimiter lookup.
    pub fn with_comment_detector(self, detect: CommentDetector) -> Self {
        self.set_comment_detector(detect);
        self
    }

    /// Replace the filetype -> comment delimiter lookup for every clone.
    /// Requests already dispatched keep their snapshot.
    pub fn set_comment_detector(&self, detect: CommentDetector) {
        *self
            .inner
            .detect
            .write()
            .unwrap_or_else(|e| e.into_inner()) = detect;
    }

    /// Handle a user trigger at `line` (1-indexed) of `buffer`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run(&self, buffer: BufferId, line: usize) -> RunOutcome {
        let mut out = Outbox::default();
        let outcome = self.inner.run(buffer, line, &mut out);
        out.flush(self.inner.events.as_ref());
        outcome
    }

    /// Cancel the request at `line`: first as an exact location, then as the
    /// directive found at or above it.
    pub fn cancel(&self, buffer: BufferId, line: usize) -> CancelOutcome {
        let mut location = Location { buffer, line };
        {
            let state = self.inner.lock();
            if !state.in_flight.contains_key(&location)
                && !state.queued(location)
                && let Some(anchor) = self.inner.directive_anchor(buffer, line)
            {
                location.line = anchor;
            }
        }

        let mut out = Outbox::default();
        let outcome = {
            let mut state = self.inner.lock();
            let outcome = if state
                .in_flight
                .get(&location)
                .is_some_and(|e| e.committing)
            {
                out.notice(
                    Level::Info,
                    format!("line {}: result is already being applied", location.line),
                );
                CancelOutcome::Committing
            } else if let Some(entry) = state.in_flight.remove(&location) {
                entry.cancel.cancel();
                out.push(Event::ProgressStop { location });
                out.notice(Level::Info, format!("line {}: cancelled", location.line));
                self.inner.drain(&mut state, buffer, &mut out);
                CancelOutcome::Active
            } else if let Some(queue) = state.queues.get_mut(&buffer)
                && let Some(pos) = queue.iter().position(|s| s.location == location)
            {
                queue.remove(pos);
                out.notice(
                    Level::Info,
                    format!("line {}: removed from queue", location.line),
                );
                CancelOutcome::Queued
            } else {
                out.notice(
                    Level::Info,
                    format!("line {}: nothing to cancel", location.line),
                );
                CancelOutcome::NotFound
            };
            self.inner.update_idle(&state);
            outcome
        };
        out.flush(self.inner.events.as_ref());
        outcome
    }

    /// Cancel everything in every buffer. Results already being applied
    /// are left to finish.
    pub fn cancel_all(&self) -> CancelSummary {
        let mut out = Outbox::default();
        let summary = {
            let mut state = self.inner.lock();
            let mut active = 0;
            state.in_flight.retain(|location, entry| {
                if entry.committing {
                    return true;
                }
                entry.cancel.cancel();
                out.push(Event::ProgressStop {
                    location: *location,
                });
                active += 1;
                false
            });
            let queued = state.queues.values().map(VecDeque::len).sum();
            state.queues.clear();
            self.inner.update_idle(&state);
            CancelSummary { active, queued }
        };
        out.notice(
            Level::Info,
            format!(
                "cancelled {} active, {} queued",
                summary.active, summary.queued
            ),
        );
        out.flush(self.inner.events.as_ref());
        summary
    }

    /// Active and queued requests, ordered by buffer then queue position.
    pub fn status(&self) -> Vec<StatusEntry> {
        let state = self.inner.lock();
        let mut entries: Vec<StatusEntry> = state
            .in_flight
            .iter()
            .map(|(location, entry)| StatusEntry {
                location: *location,
                instruction: entry.instruction.clone(),
                state: RequestState::Active,
            })
            .collect();
        for queue in state.queues.values() {
            entries.extend(queue.iter().enumerate().map(|(i, s)| StatusEntry {
                location: s.location,
                instruction: s.instruction.clone(),
                state: RequestState::Queued(i + 1),
            }));
        }
        entries.sort_by_key(|e| {
            let rank = match e.state {
                RequestState::Active => 0,
                RequestState::Queued(n) => n,
            };
            (e.location.buffer, rank)
        });
        entries
    }

    /// Resolves once nothing is in flight or queued.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.idle.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    /// Forget the discovered backend port.
    pub fn clear_endpoint_cache(&self) {
        self.inner.client.locator().clear_cache();
    }

    pub fn client(&self) -> &SessionClient {
        &self.inner.client
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update_idle(&self, state: &State) {
        let idle = state.idle();
        self.idle.send_if_modified(|current| {
            let changed = *current != idle;
            *current = idle;
            changed
        });
    }

    fn directive_locator(&self, buffer: BufferId) -> Result<DirectiveLocator, regex::Error> {
        let filetype = self.buffers.filetype(buffer).unwrap_or_default();
        let detect = self
            .detect
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let delimiters = detect(&filetype);
        DirectiveLocator::new(&delimiters, &self.config.directive_tag)
    }

    fn directive_anchor(&self, buffer: BufferId, line: usize) -> Option<usize> {
        let lines = self.buffers.lines(buffer)?;
        let locator = self.directive_locator(buffer).ok()?;
        locator.find(&lines, line).map(|d| d.anchor_line)
    }

    fn run(self: &Arc<Self>, buffer: BufferId, line: usize, out: &mut Outbox) -> RunOutcome {
        let Some(lines) = self.buffers.lines(buffer) else {
            out.notice(Level::Error, format!("{buffer} does not exist"));
            return RunOutcome::Rejected(RejectReason::UnknownBuffer);
        };
        let locator = match self.directive_locator(buffer) {
            Ok(locator) => locator,
            Err(e) => {
                out.notice(Level::Error, format!("invalid directive grammar: {e}"));
                return RunOutcome::Rejected(RejectReason::InvalidGrammar);
            }
        };
        let Some(directive) = locator.find(&lines, line) else {
            out.notice(
                Level::Warn,
                format!(
                    "no {} directive found at or above line {line}",
                    self.config.directive_tag
                ),
            );
            return RunOutcome::Rejected(RejectReason::NoDirective);
        };
        if directive.instruction.is_empty() {
            out.notice(
                Level::Warn,
                format!("line {}: directive has no instruction", directive.anchor_line),
            );
            return RunOutcome::Rejected(RejectReason::EmptyInstruction);
        }

        let location = Location {
            buffer,
            line: directive.anchor_line,
        };
        let filetype = self.buffers.filetype(buffer).unwrap_or_default();
        let snapshot = RequestSnapshot {
            location,
            original_line_text: lines[directive.anchor_line - 1].clone(),
            numbered_buffer_text: prompt::numbered_buffer_text(&lines),
            filename: self.buffers.filename(buffer).unwrap_or_default(),
            agent_name: self.config.agent_for(&filetype),
            filetype,
            instruction: directive.instruction,
        };

        let mut state = self.lock();
        if state.in_flight.contains_key(&location) {
            out.notice(
                Level::Warn,
                format!("line {}: already processing", location.line),
            );
            return RunOutcome::Rejected(RejectReason::AlreadyProcessing);
        }
        if state.queued(location) {
            out.notice(
                Level::Warn,
                format!("line {}: already queued", location.line),
            );
            return RunOutcome::Rejected(RejectReason::AlreadyQueued);
        }

        if state.busy(buffer) {
            let queue = state.queues.entry(buffer).or_default();
            queue.push_back(snapshot);
            let position = queue.len();
            self.update_idle(&state);
            out.notice(
                Level::Info,
                format!("line {}: queued (position {position})", location.line),
            );
            return RunOutcome::Queued { location, position };
        }

        self.dispatch(&mut state, snapshot, out);
        RunOutcome::Dispatched(location)
    }

    /// Register the in-flight entry and start the request task. Caller holds the lock.
    fn dispatch(self: &Arc<Self>, state: &mut State, snapshot: RequestSnapshot, out: &mut Outbox) {
        let location = snapshot.location;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        state.in_flight.insert(
            location,
            InFlightEntry {
                id,
                cancel: cancel.clone(),
                instruction: snapshot.instruction.clone(),
                committing: false,
            },
        );
        self.update_idle(state);
        out.push(Event::ProgressStart { location });
        tracing::info!(
            "dispatching {location} (request {id}): {}",
            snapshot.instruction
        );

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.execute(snapshot, id, cancel).await });
    }

    fn is_current(&self, location: Location, id: u64) -> bool {
        self.lock()
            .in_flight
            .get(&location)
            .is_some_and(|e| e.id == id)
    }

    /// Mark our entry as committing so cancel leaves it alone. False if it
    /// was already gone.
    fn begin_commit(&self, location: Location, id: u64) -> bool {
        let mut state = self.lock();
        match state.in_flight.get_mut(&location) {
            Some(entry) if entry.id == id => {
                entry.committing = true;
                true
            }
            _ => false,
        }
    }

    /// Remove our in-flight entry. False if it was already gone.
    fn finish(&self, state: &mut State, location: Location, id: u64, out: &mut Outbox) -> bool {
        if state.in_flight.get(&location).is_some_and(|e| e.id == id) {
            state.in_flight.remove(&location);
            self.update_idle(state);
            out.push(Event::ProgressStop { location });
            true
        } else {
            false
        }
    }

    async fn execute(self: Arc<Self>, snapshot: RequestSnapshot, id: u64, cancel: CancellationToken) {
        let location = snapshot.location;
        let result = self.request(&snapshot, id, &cancel).await;

        let mut out = Outbox::default();
        match result {
            Err(Abort::Superseded) => {
                tracing::debug!("request {id} at {location} superseded");
            }
            Err(Abort::Failed(message)) => {
                let mut state = self.lock();
                if self.finish(&mut state, location, id, &mut out) {
                    out.notice(Level::Error, format!("line {}: {message}", location.line));
                    self.drain(&mut state, location.buffer, &mut out);
                }
            }
            Ok(response) => {
                if self.begin_commit(location, id) {
                    self.commit(&snapshot, &response, &mut out);
                    let mut state = self.lock();
                    self.finish(&mut state, location, id, &mut out);
                    self.drain(&mut state, location.buffer, &mut out);
                }
            }
        }
        out.flush(self.events.as_ref());
    }

    fn gate(&self, location: Location, id: u64) -> Result<(), Abort> {
        if self.is_current(location, id) {
            Ok(())
        } else {
            Err(Abort::Superseded)
        }
    }

    fn client_failure(stage: &str, err: ClientError) -> Abort {
        match err {
            ClientError::Cancelled => Abort::Superseded,
            err => Abort::Failed(format!("{stage}: {err}")),
        }
    }

    async fn request(
        &self,
        snapshot: &RequestSnapshot,
        id: u64,
        cancel: &CancellationToken,
    ) -> Result<String, Abort> {
        let location = snapshot.location;
        let template = prompt::load_template(self.config.prompt_template.as_deref())
            .await
            .map_err(|e| Abort::Failed(e.to_string()))?;
        let text = prompt::render(
            &template,
            &PromptContext {
                instruction: &snapshot.instruction,
                filename: &snapshot.filename,
                filetype: &snapshot.filetype,
                line: location.line,
                line_text: &snapshot.original_line_text,
                numbered_buffer: &snapshot.numbered_buffer_text,
            },
        );

        self.gate(location, id)?;
        let health = self.client.check_health(cancel).await;
        self.gate(location, id)?;
        let health = health.map_err(|e| Self::client_failure("health check", e))?;
        if !health.healthy {
            return Err(Abort::Failed(format!(
                "backend is not healthy: {}",
                health.detail
            )));
        }

        let session = self.client.create_session(cancel).await;
        self.gate(location, id)?;
        let session = session.map_err(|e| Self::client_failure("create session", e))?;

        let response = self
            .client
            .send_message(&session, &text, snapshot.agent_name.as_deref(), cancel)
            .await;
        self.gate(location, id)?;
        response.map_err(|e| Self::client_failure("send message", e))
    }

    /// Apply a response, unless the anchor line changed in the meantime.
    fn commit(&self, snapshot: &RequestSnapshot, response: &str, out: &mut Outbox) {
        let location = snapshot.location;
        let buffer = location.buffer;
        let current = self.buffers.line(buffer, location.line);
        if current.as_deref() != Some(snapshot.original_line_text.as_str()) {
            tracing::warn!("{location} changed during request; discarding result");
            out.notice(
                Level::Warn,
                format!("line {}: modified during request, result discarded", location.line),
            );
            return;
        }

        match parse_response(response) {
            Ok(parsed) => {
                if parsed.preamble_lines > 0 {
                    out.notice(
                        Level::Debug,
                        format!(
                            "skipped {} preamble line(s) before REPLACE header",
                            parsed.preamble_lines
                        ),
                    );
                }
                let edit = parsed.edit;
                let len = self.buffers.lines(buffer).map(|l| l.len()).unwrap_or(0);
                let applied = clamp_range(edit.start_line, edit.end_line, len).and_then(
                    |(start, end)| {
                        if (start, end) != (edit.start_line, edit.end_line) {
                            tracing::debug!(
                                "clamped range {}-{} to {start}-{end} ({len} lines)",
                                edit.start_line,
                                edit.end_line
                            );
                        }
                        self.buffers
                            .replace_lines(buffer, start, end, edit.replacement_lines)
                            .map(|()| (start, end))
                    },
                );
                match applied {
                    Ok((start, end)) => {
                        tracing::info!("applied edit to {buffer} lines {start}-{end}");
                        out.notice(
                            Level::Info,
                            format!("line {}: replaced lines {start}-{end}", location.line),
                        );
                    }
                    Err(e) => out.notice(
                        Level::Error,
                        format!("line {}: could not apply edit: {e}", location.line),
                    ),
                }
            }
            Err(ParseError::Empty) => {
                out.notice(
                    Level::Error,
                    format!("line {}: {}", location.line, ParseError::Empty),
                );
            }
            Err(e) => {
                let replacement: Vec<String> = strip_fences_text(response)
                    .split('\n')
                    .map(str::to_string)
                    .collect();
                match self
                    .buffers
                    .replace_lines(buffer, location.line, location.line, replacement)
                {
                    Ok(()) => out.notice(
                        Level::Warn,
                        format!(
                            "line {}: {e}; replaced the directive line with the raw response",
                            location.line
                        ),
                    ),
                    Err(edit_err) => out.notice(
                        Level::Error,
                        format!("line {}: could not apply edit: {edit_err}", location.line),
                    ),
                }
            }
        }
    }

    /// Dispatch the next valid queued request for `buffer`, if it is free.
    /// Caller holds the lock.
    fn drain(self: &Arc<Self>, state: &mut State, buffer: BufferId, out: &mut Outbox) {
        if state.busy(buffer) {
            return;
        }
        loop {
            let Some(mut snapshot) = state.queues.get_mut(&buffer).and_then(VecDeque::pop_front)
            else {
                state.queues.remove(&buffer);
                self.update_idle(state);
                return;
            };
            let location = snapshot.location;
            let lines = self.buffers.lines(buffer).unwrap_or_default();
            let current = location
                .line
                .checked_sub(1)
                .and_then(|i| lines.get(i));
            if current != Some(&snapshot.original_line_text) {
                out.notice(
                    Level::Warn,
                    format!(
                        "line {}: modified while queued, request discarded",
                        location.line
                    ),
                );
                continue;
            }
            snapshot.numbered_buffer_text = prompt::numbered_buffer_text(&lines);
            self.dispatch(state, snapshot, out);
            return;
        }
    }
}
