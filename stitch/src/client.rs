use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{StitchConfig, TransportKind};
use crate::events::EventSink;
use crate::locator::{Endpoint, LocatorError, LocatorOptions, LsofProbe, ServiceLocator};
use crate::protocol::{
    CreateSessionRequest, HEALTH_PATH, HealthResponse, MessageRequest, MessageResponse, Part,
    SESSION_PATH, SessionResponse, message_path,
};
use crate::transport::{CurlTransport, HttpRequest, Transport, TransportError};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error(transparent)]
    Discovery(LocatorError),
    #[error("request timed out after {0}s")]
    Timeout(u64),
    #[error("cannot reach backend at {endpoint}: {detail}")]
    Unreachable { endpoint: String, detail: String },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("malformed response from backend: {0}")]
    Protocol(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("backend returned no session id")]
    MissingSessionId,
    #[error("backend returned no content")]
    NoContent,
    #[error("request cancelled")]
    Cancelled,
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout(_))
    }
}

impl From<LocatorError> for ClientError {
    fn from(err: LocatorError) -> Self {
        match err {
            LocatorError::Cancelled => ClientError::Cancelled,
            other => ClientError::Discovery(other),
        }
    }
}

/// Result of a health check that reached a verdict.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthStatus {
    pub healthy: bool,
    /// Backend version when healthy, otherwise the cause.
    pub detail: String,
}

impl HealthStatus {
    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: detail.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub request_timeout: Duration,
}

/// Backend API calls. Every call resolves the endpoint first.
pub struct SessionClient {
    transport: Arc<dyn Transport>,
    locator: Arc<ServiceLocator>,
    options: ClientOptions,
}

impl SessionClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        locator: Arc<ServiceLocator>,
        options: ClientOptions,
    ) -> Self {
        Self {
            transport,
            locator,
            options,
        }
    }

    /// Wire up the configured transport and a locator for `project_dir`.
    pub fn from_config(
        config: &StitchConfig,
        project_dir: impl Into<String>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let transport = transport_for(config.transport);
        let locator = Arc::new(ServiceLocator::new(
            LocatorOptions {
                host: config.host.clone(),
                fixed_port: config.fixed_port(),
                process_name: config.process_name.clone(),
                project_dir: project_dir.into(),
                health_timeout: config.health_timeout(),
            },
            Arc::new(LsofProbe),
            transport.clone(),
            events,
        ));
        Self::new(
            transport,
            locator,
            ClientOptions {
                provider: config.provider.clone(),
                model: config.model.clone(),
                request_timeout: config.request_timeout(),
            },
        )
    }

    pub fn locator(&self) -> &Arc<ServiceLocator> {
        &self.locator
    }

    async fn call(
        &self,
        build: impl FnOnce(&Endpoint) -> HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<(Endpoint, Result<String, TransportError>), ClientError> {
        let endpoint = self.locator.resolve(cancel).await?;
        let request = build(&endpoint);
        let result = self.transport.execute(request, cancel.clone()).await;
        Ok((endpoint, result))
    }

    fn transport_error(&self, endpoint: &Endpoint, err: TransportError) -> ClientError {
        match err {
            TransportError::Timeout(detail) => {
                tracing::debug!("timeout talking to {endpoint}: {detail}");
                ClientError::Timeout(self.options.request_timeout.as_secs())
            }
            TransportError::Unreachable(detail) => ClientError::Unreachable {
                endpoint: endpoint.to_string(),
                detail,
            },
            TransportError::Failed(detail) => ClientError::Transport(detail),
            TransportError::Cancelled => ClientError::Cancelled,
        }
    }

    /// `GET /global/health`.
    ///
    /// Only discovery failures, timeouts and cancellation are errors. Every
    /// other failure is a verdict of "unhealthy" with a readable cause.
    pub async fn check_health(
        &self,
        cancel: &CancellationToken,
    ) -> Result<HealthStatus, ClientError> {
        let timeout = self.options.request_timeout;
        let (endpoint, result) = self
            .call(|ep| HttpRequest::get(ep.url(HEALTH_PATH), timeout), cancel)
            .await?;
        let body = match result {
            Ok(body) => body,
            Err(TransportError::Unreachable(_)) => {
                return Ok(HealthStatus::unhealthy(format!(
                    "connection refused at {endpoint}"
                )));
            }
            Err(TransportError::Failed(detail)) => {
                return Ok(HealthStatus::unhealthy(format!(
                    "health check failed: {detail}"
                )));
            }
            Err(err) => return Err(self.transport_error(&endpoint, err)),
        };
        match serde_json::from_str::<HealthResponse>(&body) {
            Ok(HealthResponse { healthy: true, version }) => Ok(HealthStatus {
                healthy: true,
                detail: version.unwrap_or_else(|| "unknown version".to_string()),
            }),
            Ok(_) => Ok(HealthStatus::unhealthy("backend reports unhealthy")),
            Err(e) => Ok(HealthStatus::unhealthy(format!(
                "malformed health response: {e}"
            ))),
        }
    }

    /// `POST /session`. Provider and model are sent only when configured.
    pub async fn create_session(&self, cancel: &CancellationToken) -> Result<String, ClientError> {
        let body = serde_json::to_value(CreateSessionRequest {
            provider: self.options.provider.clone().filter(|p| !p.is_empty()),
            model: self.options.model.clone().filter(|m| !m.is_empty()),
        })
        .map_err(|e| ClientError::Protocol(e.to_string()))?;
        let timeout = self.options.request_timeout;
        let (endpoint, result) = self
            .call(|ep| HttpRequest::post(ep.url(SESSION_PATH), body, timeout), cancel)
            .await?;
        let text = result.map_err(|e| self.transport_error(&endpoint, e))?;
        let response: SessionResponse =
            serde_json::from_str(&text).map_err(|e| ClientError::Protocol(e.to_string()))?;
        if let Some(error) = response.error {
            return Err(ClientError::Backend(error.message()));
        }
        response
            .id
            .filter(|id| !id.is_empty())
            .ok_or(ClientError::MissingSessionId)
    }

    /// `POST /session/{id}/message`. Returns the text parts joined by newlines.
    pub async fn send_message(
        &self,
        session_id: &str,
        text: &str,
        agent: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, ClientError> {
        let body = serde_json::to_value(MessageRequest {
            parts: vec![Part::text(text)],
            agent: agent.filter(|a| !a.is_empty()).map(str::to_string),
        })
        .map_err(|e| ClientError::Protocol(e.to_string()))?;
        let timeout = self.options.request_timeout;
        let path = message_path(session_id);
        let (endpoint, result) = self
            .call(|ep| HttpRequest::post(ep.url(&path), body, timeout), cancel)
            .await?;
        let text = result.map_err(|e| self.transport_error(&endpoint, e))?;
        let response: MessageResponse =
            serde_json::from_str(&text).map_err(|e| ClientError::Protocol(e.to_string()))?;
        if let Some(error) = response.error {
            return Err(ClientError::Backend(error.message()));
        }
        response.text().ok_or(ClientError::NoContent)
    }
}

fn transport_for(kind: TransportKind) -> Arc<dyn Transport> {
    match kind {
        TransportKind::Curl => Arc::new(CurlTransport::new()),
        #[cfg(feature = "http-transport")]
        TransportKind::Http => Arc::new(crate::transport::HttpTransport::new()),
        #[cfg(not(feature = "http-transport"))]
        TransportKind::Http => {
            tracing::warn!("built without http-transport; falling back to curl");
            Arc::new(CurlTransport::new())
        }
    }
}
