use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{HttpRequest, Transport, TransportError};

/// curl: "Operation timeout".
const EXIT_TIMEOUT: i32 = 28;
/// curl: "Failed to connect to host".
const EXIT_CONNECT: i32 = 7;

/// Extra time the process gets beyond `--max-time` before we give up on it.
const PROCESS_GRACE: Duration = Duration::from_secs(5);

/// Stderr cap kept in error messages.
const MAX_STDERR: usize = 2_000;

/// Runs each request as a `curl` child process.
pub struct CurlTransport {
    program: String,
}

impl CurlTransport {
    pub fn new() -> Self {
        Self {
            program: "curl".into(),
        }
    }

    /// Use a different curl binary (e.g. an absolute path).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

impl Default for CurlTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a failed curl exit onto a transport error.
///
/// The exit code is authoritative; stderr is checked for timeout wording as
/// a fallback for servers and proxies that report their own timeouts.
pub fn classify_failure(code: Option<i32>, stderr: &str) -> TransportError {
    let stderr = stderr.trim();
    let mut message = if stderr.is_empty() {
        match code {
            Some(code) => format!("curl exited with code {code}"),
            None => "curl terminated by signal".to_string(),
        }
    } else {
        stderr.to_string()
    };
    if message.len() > MAX_STDERR {
        let mut cut = MAX_STDERR;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }

    match code {
        Some(EXIT_TIMEOUT) => TransportError::Timeout(message),
        Some(EXIT_CONNECT) => TransportError::Unreachable(message),
        _ => {
            let lower = message.to_lowercase();
            if lower.contains("timed out") || lower.contains("timeout") {
                TransportError::Timeout(message)
            } else if lower.contains("connection refused") {
                TransportError::Unreachable(message)
            } else {
                TransportError::Failed(message)
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for CurlTransport {
    async fn execute(
        &self,
        request: HttpRequest,
        cancel: CancellationToken,
    ) -> Result<String, TransportError> {
        let argv = request.curl_argv();
        let body = request.body.as_ref().map(|b| b.to_string());
        let mut cmd = Command::new(&self.program);
        cmd.args(&argv[1..])
            .stdin(if body.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future on cancel or timeout kills curl.
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            TransportError::Failed(format!("failed to spawn {}: {e}", self.program))
        })?;
        tracing::debug!(
            "{} {} (pid {:?})",
            request.method,
            request.url,
            child.id()
        );

        let stdin = child.stdin.take();
        let exchange = async move {
            if let (Some(mut stdin), Some(body)) = (stdin, body) {
                // curl may exit before reading it all (e.g. connection
                // refused); its exit status reports that.
                if let Err(e) = stdin.write_all(body.as_bytes()).await {
                    tracing::debug!("writing request body to curl: {e}");
                }
                // Dropping stdin closes it, ending the body.
            }
            child.wait_with_output().await
        };

        let deadline = request.timeout + PROCESS_GRACE;
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = tokio::time::timeout(deadline, exchange) => match result {
                Err(_) => {
                    return Err(TransportError::Timeout(format!(
                        "no response within {}s",
                        deadline.as_secs()
                    )));
                }
                Ok(Err(e)) => return Err(TransportError::Failed(format!("curl I/O error: {e}"))),
                Ok(Ok(output)) => output,
            },
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_failure(output.status.code(), &stderr))
        }
    }
}
