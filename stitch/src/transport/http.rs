use tokio_util::sync::CancellationToken;

use super::{HttpRequest, Method, Transport, TransportError};

/// In-process transport backed by reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                // Localhost backend; never route through a proxy.
                .no_proxy()
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Unreachable(err.to_string())
    } else {
        TransportError::Failed(err.to_string())
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        request: HttpRequest,
        cancel: CancellationToken,
    ) -> Result<String, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        }
        .timeout(request.timeout);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        tracing::debug!("{} {}", request.method, request.url);

        let call = async {
            let resp = builder.send().await.map_err(classify)?;
            let status = resp.status();
            let text = resp.text().await.map_err(classify)?;
            if !status.is_success() {
                tracing::debug!("{} {} -> HTTP {status}", request.method, request.url);
            }
            // Error statuses still carry a JSON `error` body the client reports.
            Ok(text)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = call => result,
        }
    }
}
