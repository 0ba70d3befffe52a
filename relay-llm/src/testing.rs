//! Scripted transport double shared by the provider and facade tests.

use crate::error::{LlmError, Result};
use crate::transport::{HttpRequest, HttpResponse, ResponseBody, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub enum Scripted {
    /// Fail before any response is received.
    Fail(LlmError),
    Respond {
        status: u16,
        headers: HashMap<String, String>,
        chunks: Vec<Result<Bytes>>,
    },
}

impl Scripted {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self::Respond {
            status,
            headers: HashMap::new(),
            chunks: vec![Ok(Bytes::from(body.to_string()))],
        }
    }

    /// One SSE frame per value, each `data:` line carrying the JSON.
    pub fn sse(events: Vec<serde_json::Value>) -> Self {
        Self::Respond {
            status: 200,
            headers: HashMap::new(),
            chunks: events
                .into_iter()
                .map(|e| Ok(Bytes::from(format!("data: {e}\n\n"))))
                .collect(),
        }
    }

    /// Like [`Scripted::sse`] but the byte stream fails after the given frames.
    pub fn sse_then_fail(events: Vec<serde_json::Value>, error: LlmError) -> Self {
        let mut scripted = Self::sse(events);
        if let Self::Respond { chunks, .. } = &mut scripted {
            chunks.push(Err(error));
        }
        scripted
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let Self::Respond { headers, .. } = &mut self {
            headers.insert(name.to_ascii_lowercase(), value.to_string());
        }
        self
    }
}

#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("lock").clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("lock").len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest, cancel: &CancellationToken) -> Result<HttpResponse> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        let stream = request.stream;
        self.requests.lock().expect("lock").push(request);
        let next = self
            .script
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Scripted::Fail(LlmError::Network("script exhausted".to_string())));

        match next {
            Scripted::Fail(e) => Err(e),
            Scripted::Respond {
                status,
                headers,
                chunks,
            } => {
                let success = (200..300).contains(&status);
                let body = if stream && success {
                    ResponseBody::Stream(Box::pin(futures_util::stream::iter(chunks)))
                } else {
                    let mut buf = Vec::new();
                    for chunk in chunks {
                        buf.extend_from_slice(&chunk?);
                    }
                    ResponseBody::Full(Bytes::from(buf))
                };
                Ok(HttpResponse {
                    status,
                    headers,
                    body,
                })
            }
        }
    }
}
