//! Provider-neutral LLM chat completions.
//!
//! Callers hand [`LlmClient::generate_chat_completion`] a vendor-neutral conversation and get
//! back one stream of [`NormalizedContent`] chunks, whichever vendor served the call. Anthropic
//! and Gemini are supported. Transient failures are retried without repeating output already
//! yielded, and rate-limit headers feed a per-runtime pre-request throttle.

pub mod anthropic;
pub mod auth;
mod client;
mod error;
pub mod gemini;
pub mod history;
pub mod ratelimit;
pub mod retry;
pub mod schema;
pub mod settings;
pub mod sse;
#[cfg(test)]
mod testing;
pub mod tools;
pub mod transport;
mod types;

pub use auth::{AuthMode, AuthSources, ClientVariant, TokenProvider, resolve_auth};
pub use client::{
    ChunkStream, CompletionOptions, DEFAULT_RUNTIME, LlmClient, Provider, ProviderResponse,
};
pub use error::{LlmError, Result};
pub use ratelimit::{RateLimitRegistry, RateLimitSnapshot, ThrottleConfig};
pub use retry::RetryPolicy;
pub use settings::{EffectiveSettings, SettingsOverrides, SettingsSource, SettingsStore};
pub use tools::validate_tool_name_all_providers;
pub use transport::{HttpTransport, Transport};
pub use types::{Block, ContentMetadata, NormalizedContent, Speaker, ToolDefinition, UsageInfo};
