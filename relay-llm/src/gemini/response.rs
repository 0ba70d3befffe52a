use super::request::{GeminiContent, Part, THOUGHT_SIGNATURE_FIELD};
use crate::error::{LlmError, Result};
use crate::tools::{ResponseContext, generate_history_id, normalize_to_history_id};
use crate::types::{Block, NormalizedContent, UsageInfo};
use serde::Deserialize;

const THOUGHT_FIELD: &str = "thought";

/// One `generateContent` response, or one streamed unit of it.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<GeminiContent>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: Option<u64>,
    #[serde(default)]
    pub candidates_token_count: Option<u64>,
    #[serde(default)]
    pub thoughts_token_count: Option<u64>,
    #[serde(default)]
    pub total_token_count: Option<u64>,
    #[serde(default)]
    pub cached_content_token_count: Option<u64>,
}

impl UsageMetadata {
    /// `promptTokenCount` includes cached tokens; they are split out so the cache hit rate
    /// divides cached by cached-plus-uncached.
    pub fn to_usage_info(&self) -> UsageInfo {
        let cached = self.cached_content_token_count;
        let prompt = self
            .prompt_token_count
            .unwrap_or(0)
            .saturating_sub(cached.unwrap_or(0));
        let completion =
            self.candidates_token_count.unwrap_or(0) + self.thoughts_token_count.unwrap_or(0);
        UsageInfo {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: self
                .total_token_count
                .unwrap_or(prompt + cached.unwrap_or(0) + completion),
            cache_read_input_tokens: cached,
            cache_creation_input_tokens: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

/// Parse one unit, surfacing an in-band `{"error": ...}` payload as an API error.
pub fn parse_unit(data: &str) -> Result<GenerateContentResponse> {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(data) {
        let status = envelope.error.code.unwrap_or(match envelope.error.status.as_deref() {
            Some("RESOURCE_EXHAUSTED") => 429,
            Some("UNAVAILABLE") => 503,
            Some("INTERNAL") => 500,
            _ => 400,
        });
        return Err(LlmError::api("gemini", status, envelope.error.message));
    }
    serde_json::from_str(data).map_err(|e| LlmError::StreamParse(format!("gemini unit json error={e}")))
}

/// Map one response unit to normalized chunks.
///
/// Each content part becomes its own chunk. Usage rides on the last chunk; a unit without
/// content yields a usage-only chunk, and a unit with neither yields an empty chunk.
pub fn map_unit(
    unit: GenerateContentResponse,
    usage: Option<UsageInfo>,
    ctx: &ResponseContext,
) -> Vec<NormalizedContent> {
    let parts = unit
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts)
        .unwrap_or_default();

    let mut chunks: Vec<NormalizedContent> = parts
        .into_iter()
        .map(|p| map_part(p, ctx))
        .filter(|blocks| !blocks.is_empty())
        .map(NormalizedContent::ai)
        .collect();

    if chunks.is_empty() {
        chunks.push(NormalizedContent::usage_only(usage));
    } else if let Some(usage) = usage {
        if let Some(last) = chunks.pop() {
            chunks.push(last.with_usage(usage));
        }
    }
    chunks
}

fn map_part(part: Part, ctx: &ResponseContext) -> Vec<Block> {
    let mut blocks = Vec::new();
    let signature = part.thought_signature.filter(|s| !s.is_empty());

    if part.thought == Some(true) {
        let text = part.text.unwrap_or_default();
        if ctx.include_thinking && !text.is_empty() {
            blocks.push(Block::Thinking {
                thought: text,
                source_field: THOUGHT_FIELD.to_string(),
                is_hidden: false,
                signature,
            });
        } else if let Some(sig) = signature {
            blocks.push(signature_block(sig));
        }
        return blocks;
    }

    // Signatures must survive into history even when reasoning text is not surfaced.
    if let Some(sig) = signature {
        blocks.push(signature_block(sig));
    }
    if let Some(text) = part.text.filter(|t| !t.is_empty()) {
        blocks.push(Block::text(text));
    }
    if let Some(call) = part.function_call {
        let id = match call.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => normalize_to_history_id(id),
            _ => generate_history_id(),
        };
        let args = if call.args.is_null() {
            serde_json::json!({})
        } else {
            call.args
        };
        blocks.push(Block::tool_call(id, ctx.tool_names.inbound(&call.name), args));
    }
    blocks
}

fn signature_block(signature: String) -> Block {
    Block::Thinking {
        thought: String::new(),
        source_field: THOUGHT_SIGNATURE_FIELD.to_string(),
        is_hidden: true,
        signature: Some(signature),
    }
}
