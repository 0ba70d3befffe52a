use crate::tools::{ResponseContext, normalize_to_history_id};
use crate::types::{Block, NormalizedContent, UsageInfo};
use serde::Deserialize;

pub(crate) const THINKING_FIELD: &str = "thinking";
pub(crate) const REDACTED_THINKING_FIELD: &str = "redacted_thinking";

#[derive(Debug, Deserialize)]
pub struct AnthropicResponse {
    #[serde(default)]
    pub content: Vec<ResponseBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<AnthropicUsage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
        #[serde(default)]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
    #[serde(other)]
    Unknown,
}

/// Usage as reported on `message_start`, `message_delta` and full responses. Every field is
/// optional because deltas only carry what changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AnthropicUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
}

impl AnthropicUsage {
    /// Fields present in `newer` win.
    pub fn merge(&mut self, newer: &AnthropicUsage) {
        if newer.input_tokens.is_some() {
            self.input_tokens = newer.input_tokens;
        }
        if newer.output_tokens.is_some() {
            self.output_tokens = newer.output_tokens;
        }
        if newer.cache_read_input_tokens.is_some() {
            self.cache_read_input_tokens = newer.cache_read_input_tokens;
        }
        if newer.cache_creation_input_tokens.is_some() {
            self.cache_creation_input_tokens = newer.cache_creation_input_tokens;
        }
    }

    pub fn to_usage_info(&self) -> UsageInfo {
        let prompt = self.input_tokens.unwrap_or(0);
        let completion = self.output_tokens.unwrap_or(0);
        UsageInfo {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
            cache_read_input_tokens: self.cache_read_input_tokens,
            cache_creation_input_tokens: self.cache_creation_input_tokens,
        }
    }
}

pub(crate) fn thinking_block(thought: String, signature: Option<String>) -> Block {
    Block::Thinking {
        thought,
        source_field: THINKING_FIELD.to_string(),
        is_hidden: false,
        signature: signature.filter(|s| !s.is_empty()),
    }
}

pub(crate) fn redacted_thinking_block(data: String) -> Block {
    Block::Thinking {
        thought: String::new(),
        source_field: REDACTED_THINKING_FIELD.to_string(),
        is_hidden: true,
        signature: Some(data),
    }
}

/// Map a buffered (non-streaming) Messages API response to a single `ai` chunk.
pub fn map_response(response: AnthropicResponse, ctx: &ResponseContext) -> NormalizedContent {
    let mut blocks = Vec::with_capacity(response.content.len());
    for block in response.content {
        match block {
            ResponseBlock::Text { text } if !text.is_empty() => blocks.push(Block::text(text)),
            ResponseBlock::ToolUse { id, name, input } => blocks.push(Block::tool_call(
                normalize_to_history_id(&id),
                ctx.tool_names.inbound(&name),
                if input.is_null() {
                    serde_json::json!({})
                } else {
                    input
                },
            )),
            ResponseBlock::Thinking {
                thinking,
                signature,
            } if ctx.include_thinking => blocks.push(thinking_block(thinking, signature)),
            ResponseBlock::RedactedThinking { data } if ctx.include_thinking => {
                blocks.push(redacted_thinking_block(data))
            }
            _ => {}
        }
    }

    tracing::debug!(
        stop_reason = response.stop_reason.as_deref().unwrap_or(""),
        blocks = blocks.len(),
        "anthropic response mapped"
    );

    let content = NormalizedContent::ai(blocks);
    match response.usage {
        Some(usage) => content.with_usage(usage.to_usage_info()),
        None => content,
    }
}
