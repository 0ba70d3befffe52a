//! Vendor HTTP transport.
//!
//! Providers build an [`HttpRequest`] and hand it to a [`Transport`]; the reqwest-backed
//! [`HttpTransport`] is the production implementation, tests swap in scripted doubles.

use crate::error::{LlmError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
    /// Keep the body as a byte stream instead of buffering it.
    pub stream: bool,
}

pub enum ResponseBody {
    Full(Bytes),
    Stream(ByteStream),
}

pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
    pub body: ResponseBody,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Buffer the whole body, draining a stream if necessary.
    pub async fn into_bytes(self) -> Result<Bytes> {
        match self.body {
            ResponseBody::Full(bytes) => Ok(bytes),
            ResponseBody::Stream(mut stream) => {
                let mut buf = Vec::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(buf))
            }
        }
    }

    /// View the body as a byte stream regardless of how it was received.
    pub fn into_byte_stream(self) -> ByteStream {
        match self.body {
            ResponseBody::Stream(stream) => stream,
            ResponseBody::Full(bytes) => Box::pin(futures_util::stream::once(async move { Ok(bytes) })),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest, cancel: &CancellationToken) -> Result<HttpResponse>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[tracing::instrument(level = "debug", skip_all, fields(stream = request.stream))]
    async fn send(&self, request: HttpRequest, cancel: &CancellationToken) -> Result<HttpResponse> {
        let mut builder = self.client.post(&request.url).json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            r = builder.send() => r?,
        };

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let success = response.status().is_success();
        let body = if request.stream && success {
            ResponseBody::Stream(Box::pin(
                response.bytes_stream().map(|r| r.map_err(LlmError::from)),
            ))
        } else {
            let bytes = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                b = response.bytes() => b?,
            };
            ResponseBody::Full(bytes)
        };

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Build an [`LlmError::Api`] from a non-success response body.
///
/// Both vendors wrap failures as `{"error": {"message": ...}}`; anything else is surfaced raw.
pub fn api_error(provider: &str, status: u16, body: &[u8]) -> LlmError {
    let text = String::from_utf8_lossy(body);
    let message = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| text.trim().to_string());
    LlmError::api(provider, status, message)
}
