//! Anthropic Messages API.

mod request;
mod response;
mod stream;

pub use request::{
    AnthropicContentBlock, AnthropicMessage, AnthropicRequest, AnthropicRequestOptions,
    AnthropicRole, AnthropicTool, CacheControl, ThinkingParam,
};
pub use response::{AnthropicResponse, AnthropicUsage, map_response};
pub use stream::{StreamEvent, StreamReducer, parse_event};

use crate::auth::ClientVariant;
use crate::client::{ChunkStream, ProviderResponse};
use crate::error::{LlmError, Result};
use crate::ratelimit::RateLimitSnapshot;
use crate::settings::EffectiveSettings;
use crate::sse::decode_sse;
use crate::tools::{OAUTH_TOOL_PREFIX, ResponseContext};
use crate::transport::{ByteStream, HttpRequest, Transport, api_error};
use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const PROVIDER: &str = "anthropic";

/// Lifetime of prompt-cache breakpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTtl {
    FiveMinutes,
    OneHour,
}

impl CacheTtl {
    /// `prompt-caching`: `off`, `5m` (default) or `1h`.
    pub fn from_settings(settings: &EffectiveSettings) -> Option<Self> {
        match settings.get_str("prompt-caching") {
            Some("off") | Some("false") | Some("none") => None,
            Some("1h") => Some(Self::OneHour),
            _ => Some(Self::FiveMinutes),
        }
    }
}

#[derive(Clone)]
pub struct AnthropicClient {
    transport: Arc<dyn Transport>,
    variant: ClientVariant,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        variant: ClientVariant,
        base_url: Option<&str>,
    ) -> Result<Self> {
        if matches!(variant, ClientVariant::Vertex { .. }) {
            return Err(LlmError::InvalidInput(
                "vertex credentials cannot be used with the anthropic provider".to_string(),
            ));
        }
        Ok(Self {
            transport,
            variant,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    pub fn uses_oauth(&self) -> bool {
        matches!(self.variant, ClientVariant::OAuth { .. })
    }

    /// OAuth sessions only accept tool names carrying the client prefix.
    pub fn tool_prefix(&self) -> Option<&'static str> {
        self.uses_oauth().then_some(OAUTH_TOOL_PREFIX)
    }

    fn http_request(&self, request: &AnthropicRequest) -> Result<HttpRequest> {
        let mut headers = request.headers.clone();
        match &self.variant {
            ClientVariant::ApiKey { key } => headers.push(("x-api-key".to_string(), key.clone())),
            ClientVariant::OAuth { token } => {
                headers.push(("Authorization".to_string(), format!("Bearer {token}")))
            }
            ClientVariant::Vertex { .. } => {
                return Err(LlmError::InvalidInput(
                    "vertex credentials cannot be used with the anthropic provider".to_string(),
                ));
            }
        }
        Ok(HttpRequest {
            url: format!("{}/v1/messages", self.base_url),
            headers,
            body: serde_json::to_value(request)?,
            stream: request.stream.unwrap_or(false),
        })
    }

    /// Send one request. The request is never mutated, so retries can resend it as-is.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(model = %request.model, messages = request.messages.len(), stream = request.stream.unwrap_or(false))
    )]
    pub async fn send(
        &self,
        request: &AnthropicRequest,
        ctx: ResponseContext,
        cancel: &CancellationToken,
    ) -> Result<ProviderResponse> {
        let http = self.http_request(request)?;
        let streaming = http.stream;
        let response = self.transport.send(http, cancel).await?;

        if !response.is_success() {
            let status = response.status;
            let body = response.into_bytes().await?;
            let err = api_error(PROVIDER, status, &body);
            tracing::warn!(status, error = %err, "anthropic request failed");
            return Err(err);
        }

        let snapshot = RateLimitSnapshot::from_headers(&response.headers, PROVIDER);
        let chunks: ChunkStream = if streaming {
            Box::pin(stream_chunks(response.into_byte_stream(), ctx))
        } else {
            let body = response.into_bytes().await?;
            let parsed: AnthropicResponse = serde_json::from_slice(&body)?;
            let content = map_response(parsed, &ctx);
            Box::pin(futures_util::stream::once(async move { Ok(content) }))
        };
        Ok(ProviderResponse { snapshot, chunks })
    }
}

fn stream_chunks(
    bytes: ByteStream,
    ctx: ResponseContext,
) -> impl Stream<Item = Result<crate::types::NormalizedContent>> + Send {
    async_stream::try_stream! {
        let mut events = Box::pin(decode_sse(bytes));
        let mut reducer = StreamReducer::new(ctx);
        while let Some(event) = events.next().await {
            let Some(event) = parse_event(&event?)? else {
                continue;
            };
            for chunk in reducer.handle(event)? {
                yield chunk;
            }
            if reducer.is_stopped() {
                break;
            }
        }
        reducer.finish()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::StripPolicy;
    use crate::settings::ReasoningSettings;
    use crate::testing::{Scripted, ScriptedTransport};
    use crate::tools::ToolNameMap;
    use crate::types::NormalizedContent;
    use serde_json::json;

    fn request(stream: bool) -> AnthropicRequest {
        let options = AnthropicRequestOptions {
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 1024,
            stream,
            system_prompt: None,
            cache: None,
            tool_output_max_tokens: 50_000,
            reasoning: ReasoningSettings {
                enabled: false,
                budget_tokens: 10_000,
                include_in_response: true,
            },
            strip: StripPolicy::None,
            oauth: false,
            custom_headers: Vec::new(),
        };
        AnthropicRequest::new(
            &[NormalizedContent::human("hi")],
            &[],
            &ToolNameMap::default(),
            &options,
        )
        .expect("request")
    }

    fn client(transport: Arc<ScriptedTransport>, variant: ClientVariant) -> AnthropicClient {
        AnthropicClient::new(transport, variant, Some("https://example.test/")).expect("client")
    }

    #[test]
    fn cache_ttl_setting() {
        assert_eq!(
            CacheTtl::from_settings(&EffectiveSettings::default()),
            Some(CacheTtl::FiveMinutes)
        );
        let off = EffectiveSettings::default().with("prompt-caching", "off");
        assert_eq!(CacheTtl::from_settings(&off), None);
        let hour = EffectiveSettings::default().with("prompt-caching", "1h");
        assert_eq!(CacheTtl::from_settings(&hour), Some(CacheTtl::OneHour));
    }

    #[test]
    fn vertex_credentials_are_rejected() {
        let transport = Arc::new(ScriptedTransport::default());
        let variant = ClientVariant::Vertex {
            project: "p".to_string(),
            location: "l".to_string(),
            access_token: "t".to_string(),
        };
        assert!(AnthropicClient::new(transport, variant, None).is_err());
    }

    #[tokio::test]
    async fn streams_chunks_and_records_rate_limits() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Scripted::sse(vec![
                json!({"type": "message_start", "message": {"usage": {"input_tokens": 3, "output_tokens": 1}}}),
                json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hello"}}),
                json!({"type": "content_block_stop", "index": 0}),
                json!({"type": "message_stop"}),
            ])
            .with_header("anthropic-ratelimit-requests-remaining", "49"),
        ]));
        let c = client(
            Arc::clone(&transport),
            ClientVariant::ApiKey {
                key: "sk-test".to_string(),
            },
        );
        let response = c
            .send(&request(true), ResponseContext::default(), &CancellationToken::new())
            .await
            .expect("send");
        assert_eq!(response.snapshot.requests_remaining, Some(49));
        let chunks: Vec<NormalizedContent> = response
            .chunks
            .map(|c| c.expect("chunk"))
            .collect()
            .await;
        assert_eq!(chunks[0].text(), "Hello");

        let sent = &transport.requests()[0];
        assert_eq!(sent.url, "https://example.test/v1/messages");
        assert!(sent.headers.contains(&("x-api-key".to_string(), "sk-test".to_string())));
        assert_eq!(sent.body["stream"], json!(true));
    }

    #[tokio::test]
    async fn oauth_uses_bearer_and_prefix() {
        let transport = Arc::new(ScriptedTransport::new(vec![Scripted::json(
            200,
            json!({"content": [{"type": "text", "text": "ok"}], "usage": {"input_tokens": 1, "output_tokens": 1}}),
        )]));
        let c = client(
            Arc::clone(&transport),
            ClientVariant::OAuth {
                token: "tok".to_string(),
            },
        );
        assert_eq!(c.tool_prefix(), Some(OAUTH_TOOL_PREFIX));
        let response = c
            .send(&request(false), ResponseContext::default(), &CancellationToken::new())
            .await
            .expect("send");
        let chunks: Vec<_> = response.chunks.collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(transport.requests()[0]
            .headers
            .contains(&("Authorization".to_string(), "Bearer tok".to_string())));
    }

    #[tokio::test]
    async fn error_status_surfaces_vendor_message() {
        let transport = Arc::new(ScriptedTransport::new(vec![Scripted::json(
            429,
            json!({"type": "error", "error": {"type": "rate_limit_error", "message": "slow down"}}),
        )]));
        let c = client(
            transport,
            ClientVariant::ApiKey {
                key: "k".to_string(),
            },
        );
        let err = c
            .send(&request(true), ResponseContext::default(), &CancellationToken::new())
            .await
            .err()
            .expect("error");
        assert_eq!(err.status(), Some(429));
        assert!(err.to_string().contains("slow down"));
    }
}
