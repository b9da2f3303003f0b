mod curl;
#[cfg(feature = "http-transport")]
mod http;

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use curl::{CurlTransport, classify_failure};
#[cfg(feature = "http-transport")]
pub use http::HttpTransport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
        })
    }
}

/// One HTTP call. The body, if any, is sent as JSON.
#[derive(Clone, Debug, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<serde_json::Value>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            body: None,
            timeout,
        }
    }

    pub fn post(url: impl Into<String>, body: serde_json::Value, timeout: Duration) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            body: Some(body),
            timeout,
        }
    }

    /// Full `curl` argument vector for this request, program name included.
    pub fn curl_argv(&self) -> Vec<String> {
        let mut argv = vec![
            "curl".to_string(),
            "--silent".to_string(),
            "--show-error".to_string(),
            "--max-time".to_string(),
            self.timeout.as_secs().max(1).to_string(),
            "-X".to_string(),
            self.method.to_string(),
        ];
        // The body goes through stdin: a single argv entry is capped at
        // 128 KiB on Linux and would also show up in `ps`.
        if self.body.is_some() {
            argv.extend([
                "-H".to_string(),
                "Content-Type: application/json".to_string(),
                "-H".to_string(),
                "Expect:".to_string(),
                "--data-binary".to_string(),
                "@-".to_string(),
            ]);
        }
        argv.push(self.url.clone());
        argv
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection refused: {0}")]
    Unreachable(String),
    #[error("request failed: {0}")]
    Failed(String),
    #[error("request cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// Executes HTTP calls without blocking the caller.
///
/// Each call resolves exactly once. Cancelling `cancel` makes the call return
/// [`TransportError::Cancelled`]; the underlying request is stopped on a
/// best-effort basis and may still reach the server.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn execute(
        &self,
        request: HttpRequest,
        cancel: CancellationToken,
    ) -> Result<String, TransportError>;
}
