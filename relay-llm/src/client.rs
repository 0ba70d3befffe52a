use crate::anthropic::{AnthropicClient, AnthropicRequest, AnthropicRequestOptions, CacheTtl};
use crate::auth::{AuthSources, TokenProvider, resolve_auth};
use crate::error::{LlmError, Result};
use crate::gemini::{GeminiClient, GeminiRequest, GeminiRequestOptions, SignaturePolicy};
use crate::history::StripPolicy;
use crate::ratelimit::{RateLimitRegistry, RateLimitSnapshot, ThrottleConfig};
use crate::retry::{RetryPolicy, retry_stream};
use crate::settings::{EffectiveSettings, SettingsOverrides, SettingsSource};
use crate::tools::{ResponseContext, ToolNameMap, validate_tool_name_all_providers};
use crate::transport::{HttpTransport, Transport};
use crate::types::{NormalizedContent, ToolDefinition};
use futures_util::{Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runtime key used when the caller does not isolate rate-limit state.
pub const DEFAULT_RUNTIME: &str = "default";

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<NormalizedContent>> + Send>>;

/// One opened vendor call: rate-limit telemetry from the response headers plus the chunks.
pub struct ProviderResponse {
    pub snapshot: RateLimitSnapshot,
    pub chunks: ChunkStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Anthropic,
    Gemini,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-5",
            Self::Gemini => "gemini-2.5-pro",
        }
    }

    /// Guess the provider from a model id.
    pub fn detect(model: &str) -> Option<Self> {
        let m = model.to_ascii_lowercase();
        let m = m.strip_prefix("models/").unwrap_or(&m);
        if m.starts_with("claude-") {
            Some(Self::Anthropic)
        } else if m.starts_with("gemini-") {
            Some(Self::Gemini)
        } else {
            None
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "gemini" | "google" => Ok(Self::Gemini),
            other => Err(LlmError::InvalidInput(format!("unknown provider: {other}"))),
        }
    }
}

/// Everything one call needs besides the client's own configuration.
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    pub conversation: Vec<NormalizedContent>,
    pub tools: Vec<ToolDefinition>,
    pub system_prompt: Option<String>,
    /// Per-call overrides; win over provider-level and global settings.
    pub settings: SettingsOverrides,
    /// Isolation key for rate-limit state. Defaults to [`DEFAULT_RUNTIME`].
    pub runtime: Option<String>,
    pub cancel: CancellationToken,
}

impl CompletionOptions {
    pub fn new(conversation: Vec<NormalizedContent>) -> Self {
        Self {
            conversation,
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    transport: Arc<dyn Transport>,
    settings: Arc<dyn SettingsSource>,
    auth: Option<AuthSources>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    rate_limits: Arc<RateLimitRegistry>,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all, fields(provider = provider.as_str()))]
    pub fn new(provider: Provider, settings: impl SettingsSource + 'static) -> Self {
        Self {
            provider,
            transport: Arc::new(HttpTransport::default()),
            settings: Arc::new(settings),
            auth: None,
            token_provider: None,
            rate_limits: Arc::new(RateLimitRegistry::new()),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Read settings from a source shared with other clients.
    pub fn with_settings(mut self, settings: Arc<dyn SettingsSource>) -> Self {
        self.settings = settings;
        self
    }

    /// Use a fixed credential snapshot instead of reading the environment per call.
    pub fn with_auth_sources(mut self, sources: AuthSources) -> Self {
        self.auth = Some(sources);
        self
    }

    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Share rate-limit state with other clients.
    pub fn with_rate_limits(mut self, registry: Arc<RateLimitRegistry>) -> Self {
        self.rate_limits = registry;
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn rate_limits(&self) -> &Arc<RateLimitRegistry> {
        &self.rate_limits
    }

    pub fn settings(&self, ephemeral: &SettingsOverrides) -> EffectiveSettings {
        self.settings.effective(self.provider.as_str(), ephemeral)
    }

    /// Stream one chat completion.
    ///
    /// The vendor request is built once from the unmodified conversation and resent as-is on
    /// every retry. Chunks already yielded are never repeated; errors end the stream.
    pub fn generate_chat_completion(&self, options: CompletionOptions) -> ChunkStream {
        let this = self.clone();
        Box::pin(async_stream::try_stream! {
            let call = Arc::new(this.prepare(&options).await?);
            let runtime = options
                .runtime
                .clone()
                .unwrap_or_else(|| DEFAULT_RUNTIME.to_string());
            let registry = Arc::clone(&this.rate_limits);
            let cancel = options.cancel.clone();

            let attempt_call = Arc::clone(&call);
            let mut chunks = Box::pin(retry_stream(
                call.policy.clone(),
                options.cancel.clone(),
                this.provider.as_str(),
                move |attempt| {
                    let call = Arc::clone(&attempt_call);
                    let registry = Arc::clone(&registry);
                    let runtime = runtime.clone();
                    let cancel = cancel.clone();
                    async move {
                        registry.throttle(&runtime, &call.throttle, &cancel).await?;
                        tracing::debug!(attempt, model = %call.model, "sending request");
                        let response = call.send(&cancel).await?;
                        // Overwritten on every response; no headers means the quota is unknown.
                        registry.record(&runtime, response.snapshot);
                        Ok(response.chunks)
                    }
                },
            ));
            while let Some(chunk) = chunks.next().await {
                yield chunk?;
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all, fields(provider = self.provider.as_str()))]
    async fn prepare(&self, options: &CompletionOptions) -> Result<PreparedCall> {
        if options.conversation.is_empty() {
            return Err(LlmError::InvalidInput("conversation is empty".to_string()));
        }
        for tool in &options.tools {
            validate_tool_name_all_providers(&tool.name)?;
        }

        let settings = self.settings(&options.settings);
        let model = settings
            .model()
            .unwrap_or(self.provider.default_model())
            .to_string();

        let mut sources = match &self.auth {
            Some(sources) => sources.clone(),
            None => AuthSources::from_env(&settings),
        };
        if let Some(provider) = &self.token_provider {
            sources = sources.with_oauth(Arc::clone(provider));
        }
        let variant = resolve_auth(self.provider, &sources).await?;
        tracing::info!(model = %model, auth_mode = ?variant.mode(), "credentials resolved");

        let reasoning = settings.reasoning();
        let strip = StripPolicy::from_settings(&settings);
        let transport = Arc::clone(&self.transport);

        let (vendor, tool_names) = match self.provider {
            Provider::Anthropic => {
                let client = AnthropicClient::new(transport, variant, settings.base_url())?;
                let tool_names = ToolNameMap::build(&options.tools, client.tool_prefix());
                let request = AnthropicRequest::new(
                    &options.conversation,
                    &options.tools,
                    &tool_names,
                    &AnthropicRequestOptions {
                        model: model.clone(),
                        max_tokens: settings.max_tokens(),
                        stream: settings.streaming_enabled(),
                        system_prompt: options.system_prompt.clone(),
                        cache: CacheTtl::from_settings(&settings),
                        tool_output_max_tokens: settings.tool_output_max_tokens(),
                        reasoning,
                        strip,
                        oauth: client.uses_oauth(),
                        custom_headers: settings.custom_headers(),
                    },
                )?;
                (VendorCall::Anthropic { client, request }, tool_names)
            }
            Provider::Gemini => {
                let client = GeminiClient::new(transport, variant, settings.base_url());
                let tool_names = ToolNameMap::build(&options.tools, None);
                let request = GeminiRequest::new(
                    &options.conversation,
                    &options.tools,
                    &tool_names,
                    &GeminiRequestOptions {
                        model: model.clone(),
                        max_tokens: settings.max_tokens(),
                        system_prompt: options.system_prompt.clone(),
                        tool_output_max_tokens: settings.tool_output_max_tokens(),
                        reasoning,
                        strip,
                        signatures: SignaturePolicy::from_settings(&settings),
                        custom_headers: settings.custom_headers(),
                    },
                )?;
                (
                    VendorCall::Gemini {
                        client,
                        request,
                        stream: settings.streaming_enabled(),
                    },
                    tool_names,
                )
            }
        };

        Ok(PreparedCall {
            model,
            vendor,
            ctx: ResponseContext {
                tool_names,
                include_thinking: reasoning.include_in_response,
            },
            policy: RetryPolicy::from_settings(&settings),
            throttle: ThrottleConfig::from_settings(&settings),
        })
    }
}

enum VendorCall {
    Anthropic {
        client: AnthropicClient,
        request: AnthropicRequest,
    },
    Gemini {
        client: GeminiClient,
        request: GeminiRequest,
        stream: bool,
    },
}

/// A fully translated call, shared read-only by every attempt.
struct PreparedCall {
    model: String,
    vendor: VendorCall,
    ctx: ResponseContext,
    policy: RetryPolicy,
    throttle: ThrottleConfig,
}

impl PreparedCall {
    async fn send(&self, cancel: &CancellationToken) -> Result<ProviderResponse> {
        match &self.vendor {
            VendorCall::Anthropic { client, request } => {
                client.send(request, self.ctx.clone(), cancel).await
            }
            VendorCall::Gemini {
                client,
                request,
                stream,
            } => client.send(request, *stream, self.ctx.clone(), cancel).await,
        }
    }
}
