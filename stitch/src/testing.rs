//! Scripted collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::events::{Event, EventSink, Level};
use crate::locator::{LocatorOptions, ProcessProbe, ServiceLocator};
use crate::transport::{HttpRequest, Method, Transport, TransportError};

/// Lets a test hold a scripted reply until it decides to release it.
pub(crate) struct Gate {
    reached: Semaphore,
    release: Semaphore,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            reached: Semaphore::new(0),
            release: Semaphore::new(0),
        })
    }

    /// Wait until a request is parked on this gate.
    pub(crate) async fn reached(&self) {
        if let Ok(permit) = self.reached.acquire().await {
            permit.forget();
        }
    }

    pub(crate) fn release(&self) {
        self.release.add_permits(1);
    }
}

#[derive(Clone)]
struct Reply {
    result: Result<String, TransportError>,
    gate: Option<Arc<Gate>>,
}

struct Route {
    method: Method,
    suffix: String,
    queued: VecDeque<Reply>,
    sticky: Option<Reply>,
}

/// Transport that answers from a script keyed by `"METHOD url-suffix"`.
///
/// Queued replies are used first, then the sticky reply. Unscripted requests
/// fail as unreachable. The longest matching suffix wins.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    routes: StdMutex<Vec<Route>>,
    calls: StdMutex<Vec<HttpRequest>>,
}

fn parse_key(key: &str) -> (Method, String) {
    let (method, suffix) = key.split_once(' ').unwrap_or(("GET", key));
    let method = match method {
        "POST" => Method::Post,
        _ => Method::Get,
    };
    (method, suffix.to_string())
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn route_mut<'a>(routes: &'a mut Vec<Route>, key: &str) -> &'a mut Route {
        let (method, suffix) = parse_key(key);
        let index = match routes
            .iter()
            .position(|r| r.method == method && r.suffix == suffix)
        {
            Some(i) => i,
            None => {
                routes.push(Route {
                    method,
                    suffix,
                    queued: VecDeque::new(),
                    sticky: None,
                });
                routes.len() - 1
            }
        };
        &mut routes[index]
    }

    /// Answer every matching request with `body`.
    pub(crate) fn respond(&self, key: &str, body: &str) {
        let mut routes = self.routes.lock().unwrap();
        Self::route_mut(&mut routes, key).sticky = Some(Reply {
            result: Ok(body.to_string()),
            gate: None,
        });
    }

    /// Fail every matching request with `err`.
    pub(crate) fn fail(&self, key: &str, err: TransportError) {
        let mut routes = self.routes.lock().unwrap();
        Self::route_mut(&mut routes, key).sticky = Some(Reply {
            result: Err(err),
            gate: None,
        });
    }

    /// Answer the next matching request with `body`.
    pub(crate) fn push(&self, key: &str, body: &str) {
        let mut routes = self.routes.lock().unwrap();
        Self::route_mut(&mut routes, key).queued.push_back(Reply {
            result: Ok(body.to_string()),
            gate: None,
        });
    }

    /// Answer the next matching request with `body`, but only once the gate is released.
    pub(crate) fn hold(&self, key: &str, body: &str) -> Arc<Gate> {
        let gate = Gate::new();
        let mut routes = self.routes.lock().unwrap();
        Self::route_mut(&mut routes, key).queued.push_back(Reply {
            result: Ok(body.to_string()),
            gate: Some(gate.clone()),
        });
        gate
    }

    pub(crate) fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Requests whose URL ends with `suffix`.
    pub(crate) fn calls_to(&self, suffix: &str) -> Vec<HttpRequest> {
        self.calls()
            .into_iter()
            .filter(|c| c.url.ends_with(suffix))
            .collect()
    }

    fn next_reply(&self, request: &HttpRequest) -> Option<Reply> {
        let mut routes = self.routes.lock().unwrap();
        let route = routes
            .iter_mut()
            .filter(|r| r.method == request.method && request.url.ends_with(&r.suffix))
            .max_by_key(|r| r.suffix.len())?;
        route.queued.pop_front().or_else(|| route.sticky.clone())
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn execute(
        &self,
        request: HttpRequest,
        cancel: CancellationToken,
    ) -> Result<String, TransportError> {
        self.calls.lock().unwrap().push(request.clone());
        let Some(reply) = self.next_reply(&request) else {
            return Err(TransportError::Unreachable(format!(
                "no script for {} {}",
                request.method, request.url
            )));
        };
        if let Some(gate) = reply.gate {
            gate.reached.add_permits(1);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                permit = gate.release.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        // Yield so callers never observe a synchronous completion.
        tokio::task::yield_now().await;
        reply.result
    }
}

/// Process probe with canned `lsof` output and working directories.
pub(crate) struct FakeProbe {
    listing: Result<String, String>,
    cwds: HashMap<u32, String>,
    listing_calls: Arc<AtomicUsize>,
}

impl FakeProbe {
    pub(crate) fn new(listing: &str) -> Self {
        Self {
            listing: Ok(listing.to_string()),
            cwds: HashMap::new(),
            listing_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn failing(message: &str) -> Self {
        Self {
            listing: Err(message.to_string()),
            ..Self::new("")
        }
    }

    pub(crate) fn with_cwd(mut self, pid: u32, cwd: &str) -> Self {
        self.cwds.insert(pid, cwd.to_string());
        self
    }

    pub(crate) fn listing_calls(&self) -> Arc<AtomicUsize> {
        self.listing_calls.clone()
    }
}

#[async_trait::async_trait]
impl ProcessProbe for FakeProbe {
    async fn listening(&self, _process_name: &str) -> Result<String, String> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        self.listing.clone()
    }

    async fn working_dir(&self, pid: u32) -> Option<String> {
        self.cwds.get(&pid).cloned()
    }
}

/// Sink that keeps every event.
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: StdMutex<Vec<Event>>,
}

impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn notices(&self) -> Vec<(Level, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Notice { level, message } => Some((level, message)),
                _ => None,
            })
            .collect()
    }

    /// True if some notice at `level` contains `needle`.
    pub(crate) fn has_notice(&self, level: Level, needle: &str) -> bool {
        self.notices()
            .iter()
            .any(|(l, m)| *l == level && m.contains(needle))
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

/// Locator pinned to 127.0.0.1:4096.
pub(crate) fn fixed_locator(transport: Arc<dyn Transport>) -> Arc<ServiceLocator> {
    Arc::new(ServiceLocator::new(
        LocatorOptions {
            host: "127.0.0.1".into(),
            fixed_port: Some(4096),
            process_name: "opencode".into(),
            project_dir: "/project".into(),
            health_timeout: Duration::from_secs(1),
        },
        Arc::new(FakeProbe::new("")),
        transport,
        Arc::new(RecordingSink::default()),
    ))
}
