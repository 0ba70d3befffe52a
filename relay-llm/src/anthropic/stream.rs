//! Streaming event reducer for the Messages API.
//!
//! Content blocks arrive interleaved by index. Text deltas are surfaced as they arrive; tool
//! calls and thinking are accumulated per index and surfaced once the block stops.

use super::response::{AnthropicUsage, redacted_thinking_block, thinking_block};
use crate::error::{LlmError, Result};
use crate::sse::SseEvent;
use crate::tools::{ResponseContext, normalize_to_history_id};
use crate::types::{Block, NormalizedContent, UsageInfo};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessageStartBody,
    },
    ContentBlockStart {
        index: u32,
        content_block: StartBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: Delta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: StreamErrorBody,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct MessageStartBody {
    #[serde(default)]
    pub usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StartBlock {
    Text {
        #[serde(default)]
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

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct StreamErrorBody {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

impl StreamErrorBody {
    /// HTTP-equivalent status so mid-stream errors classify like response errors.
    pub fn status(&self) -> u16 {
        match self.kind.as_str() {
            "overloaded_error" => 529,
            "rate_limit_error" => 429,
            "api_error" => 500,
            _ => 400,
        }
    }
}

/// Parse one SSE frame. Frames without data carry nothing to reduce.
pub fn parse_event(event: &SseEvent) -> Result<Option<StreamEvent>> {
    let data = event.data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }
    serde_json::from_str(data).map(Some).map_err(|e| {
        LlmError::StreamParse(format!(
            "anthropic event {} json error={e} data={data}",
            event.event
        ))
    })
}

#[derive(Debug)]
enum BlockBuilder {
    Text,
    ToolUse {
        id: String,
        name: String,
        initial: serde_json::Value,
        json: String,
    },
    Thinking {
        thought: String,
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
    Ignored,
}

#[derive(Debug)]
pub struct StreamReducer {
    ctx: ResponseContext,
    blocks: HashMap<u32, BlockBuilder>,
    usage: AnthropicUsage,
    usage_seen: bool,
    last_emitted: Option<UsageInfo>,
    stopped: bool,
}

impl StreamReducer {
    pub fn new(ctx: ResponseContext) -> Self {
        Self {
            ctx,
            blocks: HashMap::new(),
            usage: AnthropicUsage::default(),
            usage_seen: false,
            last_emitted: None,
            stopped: false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Feed one event; returns chunks ready to surface.
    pub fn handle(&mut self, event: StreamEvent) -> Result<Vec<NormalizedContent>> {
        let mut out = Vec::new();
        match event {
            StreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.merge_usage(&usage);
                }
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let builder = match content_block {
                    StartBlock::Text { text } => {
                        if !text.is_empty() {
                            out.push(self.chunk(vec![Block::text(text)]));
                        }
                        BlockBuilder::Text
                    }
                    StartBlock::ToolUse { id, name, input } => BlockBuilder::ToolUse {
                        id,
                        name,
                        initial: input,
                        json: String::new(),
                    },
                    StartBlock::Thinking {
                        thinking,
                        signature,
                    } => BlockBuilder::Thinking {
                        thought: thinking,
                        signature,
                    },
                    StartBlock::RedactedThinking { data } => BlockBuilder::RedactedThinking { data },
                    StartBlock::Unknown => BlockBuilder::Ignored,
                };
                self.blocks.insert(index, builder);
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                if let Some(text) = self.apply_delta(index, delta) {
                    out.push(self.chunk(vec![Block::text(text)]));
                }
            }
            StreamEvent::ContentBlockStop { index } => {
                if let Some(block) = self.finish_block(index)? {
                    out.push(self.chunk(vec![block]));
                }
            }
            StreamEvent::MessageDelta { usage } => {
                if let Some(usage) = usage {
                    self.merge_usage(&usage);
                }
            }
            StreamEvent::MessageStop => {
                self.stopped = true;
                out.extend(self.flush_usage());
            }
            StreamEvent::Ping | StreamEvent::Unknown => {}
            StreamEvent::Error { error } => {
                return Err(LlmError::api("anthropic", error.status(), error.message));
            }
        }
        Ok(out)
    }

    /// Called when the byte stream ends.
    pub fn finish(&self) -> Result<()> {
        if !self.stopped {
            return Err(LlmError::Network(
                "anthropic stream terminated before message_stop".to_string(),
            ));
        }
        Ok(())
    }

    /// Accumulate a delta; returns text that should be surfaced immediately.
    fn apply_delta(&mut self, index: u32, delta: Delta) -> Option<String> {
        let builder = self.blocks.entry(index).or_insert(match &delta {
            Delta::TextDelta { .. } => BlockBuilder::Text,
            _ => BlockBuilder::Ignored,
        });
        match (builder, delta) {
            (BlockBuilder::Text, Delta::TextDelta { text }) => {
                return (!text.is_empty()).then_some(text);
            }
            (BlockBuilder::ToolUse { json, .. }, Delta::InputJsonDelta { partial_json }) => {
                json.push_str(&partial_json)
            }
            (BlockBuilder::Thinking { thought, .. }, Delta::ThinkingDelta { thinking }) => {
                thought.push_str(&thinking)
            }
            (BlockBuilder::Thinking { signature, .. }, Delta::SignatureDelta { signature: s }) => {
                signature.get_or_insert_with(String::new).push_str(&s)
            }
            (_, delta) => tracing::trace!(index, ?delta, "ignoring anthropic delta"),
        }
        None
    }

    fn finish_block(&mut self, index: u32) -> Result<Option<Block>> {
        let Some(builder) = self.blocks.remove(&index) else {
            return Ok(None);
        };
        let block = match builder {
            BlockBuilder::ToolUse {
                id,
                name,
                initial,
                json,
            } => {
                let parameters = if json.trim().is_empty() {
                    match initial {
                        serde_json::Value::Null => serde_json::json!({}),
                        other => other,
                    }
                } else {
                    serde_json::from_str(&json).map_err(|e| {
                        LlmError::StreamParse(format!(
                            "tool_use {id} input is not valid json: {e}"
                        ))
                    })?
                };
                Some(Block::tool_call(
                    normalize_to_history_id(&id),
                    self.ctx.tool_names.inbound(&name),
                    parameters,
                ))
            }
            BlockBuilder::Thinking { thought, signature } if self.ctx.include_thinking => {
                (!thought.is_empty() || signature.is_some())
                    .then(|| thinking_block(thought, signature))
            }
            BlockBuilder::RedactedThinking { data } if self.ctx.include_thinking => {
                Some(redacted_thinking_block(data))
            }
            _ => None,
        };
        Ok(block)
    }

    fn merge_usage(&mut self, usage: &AnthropicUsage) {
        self.usage.merge(usage);
        self.usage_seen = true;
    }

    /// The merged usage, when it has changed since last surfaced.
    fn pending_usage(&mut self) -> Option<UsageInfo> {
        if !self.usage_seen {
            return None;
        }
        let current = self.usage.to_usage_info();
        if self.last_emitted.as_ref() == Some(&current) {
            return None;
        }
        self.last_emitted = Some(current.clone());
        Some(current)
    }

    fn chunk(&mut self, blocks: Vec<Block>) -> NormalizedContent {
        let content = NormalizedContent::ai(blocks);
        match self.pending_usage() {
            Some(usage) => content.with_usage(usage),
            None => content,
        }
    }

    fn flush_usage(&mut self) -> Option<NormalizedContent> {
        self.pending_usage()
            .map(|usage| NormalizedContent::usage_only(Some(usage)))
    }
}
