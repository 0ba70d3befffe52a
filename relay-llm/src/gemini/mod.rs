//! Google Gemini (Generative Language API and Vertex AI).

mod request;
mod response;

pub use request::{
    FunctionCall, FunctionDeclaration, FunctionResponse, GeminiContent, GeminiRequest,
    GeminiRequestOptions, GeminiTool, GenerateConfig, Part, SYNTHETIC_THOUGHT_SIGNATURE,
    SignaturePolicy, ThinkingConfig,
};
pub use response::{Candidate, GenerateContentResponse, UsageMetadata, map_unit, parse_unit};

use crate::auth::ClientVariant;
use crate::client::{ChunkStream, ProviderResponse};
use crate::error::Result;
use crate::ratelimit::RateLimitSnapshot;
use crate::sse::decode_sse;
use crate::tools::ResponseContext;
use crate::transport::{ByteStream, HttpRequest, Transport, api_error};
use crate::types::{NormalizedContent, UsageInfo};
use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const PROVIDER: &str = "gemini";

#[derive(Clone)]
pub struct GeminiClient {
    transport: Arc<dyn Transport>,
    variant: ClientVariant,
    base_url: Option<String>,
}

impl GeminiClient {
    pub fn new(transport: Arc<dyn Transport>, variant: ClientVariant, base_url: Option<&str>) -> Self {
        Self {
            transport,
            variant,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    fn endpoint(&self, model: &str, stream: bool) -> String {
        let method = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        match &self.variant {
            ClientVariant::Vertex {
                project, location, ..
            } => {
                let base = self
                    .base_url
                    .clone()
                    .unwrap_or_else(|| format!("https://{location}-aiplatform.googleapis.com"));
                format!(
                    "{base}/v1/projects/{project}/locations/{location}/publishers/google/models/{model}:{method}"
                )
            }
            ClientVariant::ApiKey { .. } | ClientVariant::OAuth { .. } => {
                let base = self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
                format!("{base}/v1beta/models/{model}:{method}")
            }
        }
    }

    fn http_request(&self, request: &GeminiRequest, stream: bool) -> HttpRequest {
        let mut headers = request.config.headers.clone();
        match &self.variant {
            ClientVariant::ApiKey { key } => headers.push(("x-goog-api-key".to_string(), key.clone())),
            ClientVariant::Vertex { access_token, .. } => {
                headers.push(("Authorization".to_string(), format!("Bearer {access_token}")))
            }
            ClientVariant::OAuth { token } => {
                headers.push(("Authorization".to_string(), format!("Bearer {token}")))
            }
        }
        HttpRequest {
            url: self.endpoint(&request.model, stream),
            headers,
            body: request.rest_body(),
            stream,
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(model = %request.model, contents = request.contents.len(), stream)
    )]
    pub async fn send(
        &self,
        request: &GeminiRequest,
        stream: bool,
        ctx: ResponseContext,
        cancel: &CancellationToken,
    ) -> Result<ProviderResponse> {
        let http = self.http_request(request, stream);
        let response = self.transport.send(http, cancel).await?;

        if !response.is_success() {
            let status = response.status;
            let body = response.into_bytes().await?;
            let err = api_error(PROVIDER, status, &body);
            tracing::warn!(status, error = %err, "gemini request failed");
            return Err(err);
        }

        let snapshot = RateLimitSnapshot::from_headers(&response.headers, PROVIDER);
        let chunks: ChunkStream = if stream {
            Box::pin(stream_chunks(response.into_byte_stream(), ctx))
        } else {
            let body = response.into_bytes().await?;
            let unit = parse_unit(&String::from_utf8_lossy(&body))?;
            let usage = unit.usage_metadata.as_ref().map(UsageMetadata::to_usage_info);
            let chunks = map_unit(unit, usage, &ctx);
            Box::pin(futures_util::stream::iter(chunks.into_iter().map(Ok)))
        };
        Ok(ProviderResponse { snapshot, chunks })
    }
}

fn stream_chunks(
    bytes: ByteStream,
    ctx: ResponseContext,
) -> impl Stream<Item = Result<NormalizedContent>> + Send {
    async_stream::try_stream! {
        let mut events = Box::pin(decode_sse(bytes));
        // Gemini repeats cumulative usage on every unit; only surface it when it changes.
        let mut last_usage: Option<UsageInfo> = None;
        while let Some(event) = events.next().await {
            let event = event?;
            let data = event.data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            let unit = parse_unit(data)?;
            let usage = unit
                .usage_metadata
                .as_ref()
                .map(UsageMetadata::to_usage_info)
                .filter(|u| last_usage.as_ref() != Some(u));
            if usage.is_some() {
                last_usage.clone_from(&usage);
            }
            for chunk in map_unit(unit, usage, &ctx) {
                yield chunk;
            }
        }
    }
}
