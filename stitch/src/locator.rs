//! Finding the backend's `host:port`.
//!
//! A configured port is used as-is. Otherwise running backend processes are
//! enumerated and the one whose working directory equals the project
//! directory wins; failing that, the first instance that answers a health
//! probe is used and the user is told which project it belongs to. A
//! discovered port is cached until [`ServiceLocator::clear_cache`].

use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::events::{Event, EventSink, Level};
use crate::protocol::{HEALTH_PATH, HealthResponse};
use crate::transport::{HttpRequest, Transport};

/// Where the backend listens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum LocatorError {
    #[error("no running {0} backend found")]
    NoBackend(String),
    #[error("no responsive {0} instance found")]
    NoResponsive(String),
    #[error("could not enumerate listening processes: {0}")]
    Probe(String),
    #[error("discovery cancelled")]
    Cancelled,
}

/// A process listening on a TCP port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Listener {
    pub pid: u32,
    pub port: u16,
}

/// OS queries used for discovery.
#[async_trait::async_trait]
pub trait ProcessProbe: Send + Sync + 'static {
    /// Raw `lsof`-style listing of TCP listeners owned by `process_name`.
    async fn listening(&self, process_name: &str) -> Result<String, String>;

    /// Working directory of a process, if it can be read.
    async fn working_dir(&self, pid: u32) -> Option<String>;
}

/// Extract listeners from `lsof -nP -iTCP -sTCP:LISTEN` output.
///
/// Lines without both a numeric pid and a numeric port are skipped. Ports are
/// deduplicated (IPv4 and IPv6 sockets of the same process) keeping first-seen order.
pub fn parse_listeners(text: &str) -> Vec<Listener> {
    let mut listeners: Vec<Listener> = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(pid) = fields.get(1).and_then(|f| f.parse::<u32>().ok()) else {
            continue;
        };
        let Some(port) = fields.iter().rev().find_map(|f| {
            f.rsplit_once(':')
                .and_then(|(_, port)| port.parse::<u16>().ok())
        }) else {
            continue;
        };
        if !listeners.iter().any(|l| l.port == port) {
            listeners.push(Listener { pid, port });
        }
    }
    listeners
}

/// Discovery through `lsof` and `/proc`.
#[derive(Default)]
pub struct LsofProbe;

#[async_trait::async_trait]
impl ProcessProbe for LsofProbe {
    async fn listening(&self, process_name: &str) -> Result<String, String> {
        let output = Command::new("lsof")
            .args(["-nP", "-iTCP", "-sTCP:LISTEN", "-a", "-c", process_name])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| format!("failed to run lsof: {e}"))?;
        // lsof exits 1 when nothing matches; stdout is simply empty then.
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn working_dir(&self, pid: u32) -> Option<String> {
        if let Ok(path) = tokio::fs::read_link(format!("/proc/{pid}/cwd")).await {
            return Some(path.to_string_lossy().into_owned());
        }
        let output = Command::new("lsof")
            .args(["-a", "-p", &pid.to_string(), "-d", "cwd", "-Fn"])
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .find_map(|l| l.strip_prefix('n'))
            .map(|p| p.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct LocatorOptions {
    pub host: String,
    /// Skips discovery entirely when set.
    pub fixed_port: Option<u16>,
    pub process_name: String,
    /// Compared byte-for-byte against candidate working directories.
    pub project_dir: String,
    pub health_timeout: Duration,
}

pub struct ServiceLocator {
    options: LocatorOptions,
    probe: Arc<dyn ProcessProbe>,
    transport: Arc<dyn Transport>,
    events: Arc<dyn EventSink>,
    cached_port: StdMutex<Option<u16>>,
    // Serializes discovery so concurrent resolves share one result.
    discovery: tokio::sync::Mutex<()>,
}

impl ServiceLocator {
    pub fn new(
        options: LocatorOptions,
        probe: Arc<dyn ProcessProbe>,
        transport: Arc<dyn Transport>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            options,
            probe,
            transport,
            events,
            cached_port: StdMutex::new(None),
            discovery: tokio::sync::Mutex::new(()),
        }
    }

    pub fn options(&self) -> &LocatorOptions {
        &self.options
    }

    /// Discovered port currently cached, if any.
    pub fn cached_port(&self) -> Option<u16> {
        *self.cached_port.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forget the discovered port; the next resolve discovers again.
    pub fn clear_cache(&self) {
        *self.cached_port.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn endpoint(&self, port: u16) -> Endpoint {
        Endpoint {
            host: self.options.host.clone(),
            port,
        }
    }

    pub async fn resolve(&self, cancel: &CancellationToken) -> Result<Endpoint, LocatorError> {
        if let Some(port) = self.options.fixed_port {
            return Ok(self.endpoint(port));
        }
        if let Some(port) = self.cached_port() {
            return Ok(self.endpoint(port));
        }

        let _guard = self.discovery.lock().await;
        if let Some(port) = self.cached_port() {
            return Ok(self.endpoint(port));
        }
        let port = self.discover(cancel).await?;
        *self.cached_port.lock().unwrap_or_else(|e| e.into_inner()) = Some(port);
        Ok(self.endpoint(port))
    }

    async fn discover(&self, cancel: &CancellationToken) -> Result<u16, LocatorError> {
        let name = &self.options.process_name;
        let listing = self
            .probe
            .listening(name)
            .await
            .map_err(LocatorError::Probe)?;
        let listeners = parse_listeners(&listing);
        if listeners.is_empty() {
            return Err(LocatorError::NoBackend(name.clone()));
        }

        let mut cwds = Vec::with_capacity(listeners.len());
        for listener in &listeners {
            let cwd = self.probe.working_dir(listener.pid).await;
            tracing::debug!(
                "candidate {name} pid {} port {} cwd {:?}",
                listener.pid,
                listener.port,
                cwd
            );
            if cwd.as_deref() == Some(self.options.project_dir.as_str()) {
                tracing::info!("using {name} on port {} (matches project)", listener.port);
                return Ok(listener.port);
            }
            cwds.push(cwd);
        }

        for (listener, cwd) in listeners.iter().zip(cwds) {
            if cancel.is_cancelled() {
                return Err(LocatorError::Cancelled);
            }
            if self.probe_health(listener.port, cancel).await {
                let cwd = cwd.unwrap_or_else(|| "unknown directory".to_string());
                self.events.emit(Event::notice(
                    Level::Warn,
                    format!(
                        "no {name} instance runs in {}; using port {} from {cwd}",
                        self.options.project_dir, listener.port
                    ),
                ));
                return Ok(listener.port);
            }
        }
        Err(LocatorError::NoResponsive(name.clone()))
    }

    async fn probe_health(&self, port: u16, cancel: &CancellationToken) -> bool {
        let url = self.endpoint(port).url(HEALTH_PATH);
        let request = HttpRequest::get(url, self.options.health_timeout);
        match self.transport.execute(request, cancel.clone()).await {
            Ok(body) => serde_json::from_str::<HealthResponse>(&body)
                .map(|h| h.healthy)
                .unwrap_or(false),
            Err(e) => {
                tracing::debug!("health probe on port {port} failed: {e}");
                false
            }
        }
    }
}
