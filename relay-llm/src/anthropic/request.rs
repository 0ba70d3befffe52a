use super::CacheTtl;
use super::response::REDACTED_THINKING_FIELD;
use crate::error::{LlmError, Result};
use crate::history::{
    EMPTY_AI_PLACEHOLDER, EMPTY_HUMAN_PLACEHOLDER, StripPolicy, pair_tool_calls, strip_thinking,
    tool_result_text, truncate_tool_output,
};
use crate::schema::{SchemaDialect, clean_schema};
use crate::settings::ReasoningSettings;
use crate::tools::{ToolNameMap, to_anthropic_tool_id};
use crate::types::{Block, NormalizedContent, Speaker, ToolDefinition};
use serde::Serialize;
use std::collections::HashSet;

pub(crate) const ANTHROPIC_VERSION: &str = "2023-06-01";
const BETA_OAUTH: &str = "oauth-2025-04-20";
const BETA_EXTENDED_CACHE_TTL: &str = "extended-cache-ttl-2025-04-11";
const BETA_INTERLEAVED_THINKING: &str = "interleaved-thinking-2025-05-14";

/// Everything the translator needs besides the conversation itself.
#[derive(Debug, Clone)]
pub struct AnthropicRequestOptions {
    pub model: String,
    pub max_tokens: u32,
    pub stream: bool,
    pub system_prompt: Option<String>,
    pub cache: Option<CacheTtl>,
    pub tool_output_max_tokens: usize,
    pub reasoning: ReasoningSettings,
    pub strip: StripPolicy,
    pub oauth: bool,
    pub custom_headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnthropicRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub system: Vec<AnthropicContentBlock>,
    pub messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<AnthropicTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingParam>,
    /// Non-credential headers sent with the body.
    #[serde(skip)]
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThinkingParam {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub budget_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnthropicTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnthropicRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnthropicMessage {
    pub role: AnthropicRole,
    pub content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<&'static str>,
}

impl CacheControl {
    fn for_ttl(ttl: CacheTtl) -> Self {
        Self {
            kind: "ephemeral",
            ttl: match ttl {
                CacheTtl::FiveMinutes => None,
                CacheTtl::OneHour => Some("1h"),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicContentBlock {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Thinking {
        thinking: String,
        signature: String,
    },
    RedactedThinking {
        data: String,
    },
}

impl AnthropicContentBlock {
    fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            cache_control: None,
        }
    }

    fn is_blank(&self) -> bool {
        matches!(self, Self::Text { text, .. } if text.trim().is_empty())
    }

    /// Blocks that can carry a cache breakpoint and have non-whitespace content.
    fn is_cacheable(&self) -> bool {
        match self {
            Self::Text { text, .. } => !text.trim().is_empty(),
            Self::ToolResult { content, .. } => !content.trim().is_empty(),
            Self::ToolUse { .. } => true,
            Self::Thinking { .. } | Self::RedactedThinking { .. } => false,
        }
    }

    fn set_cache_control(&mut self, control: CacheControl) {
        match self {
            Self::Text { cache_control, .. }
            | Self::ToolUse { cache_control, .. }
            | Self::ToolResult { cache_control, .. } => *cache_control = Some(control),
            Self::Thinking { .. } | Self::RedactedThinking { .. } => {}
        }
    }

    pub fn cache_control(&self) -> Option<&CacheControl> {
        match self {
            Self::Text { cache_control, .. }
            | Self::ToolUse { cache_control, .. }
            | Self::ToolResult { cache_control, .. } => cache_control.as_ref(),
            Self::Thinking { .. } | Self::RedactedThinking { .. } => None,
        }
    }
}

impl AnthropicRequest {
    /// Translate the normalized conversation into a Messages API request.
    pub fn new(
        conversation: &[NormalizedContent],
        tools: &[ToolDefinition],
        tool_names: &ToolNameMap,
        options: &AnthropicRequestOptions,
    ) -> Result<Self> {
        let history = pair_tool_calls(&strip_thinking(conversation, options.strip));

        let mut turns: Vec<(AnthropicRole, Vec<AnthropicContentBlock>)> = Vec::new();
        for content in &history {
            let (role, blocks) = translate_turn(content, tool_names, options);
            match turns.last_mut() {
                Some((last_role, last_blocks)) if *last_role == role => {
                    last_blocks.extend(blocks)
                }
                _ => turns.push((role, blocks)),
            }
        }

        let last = turns.len().saturating_sub(1);
        let mut messages: Vec<AnthropicMessage> = turns
            .into_iter()
            .enumerate()
            .map(|(i, (role, blocks))| AnthropicMessage {
                role,
                content: sanitize_blocks(role, blocks, i == last),
            })
            .collect();

        validate_tool_pairing(&messages)?;

        let mut system = match options.system_prompt.as_deref().map(str::trim) {
            Some(prompt) if !prompt.is_empty() => vec![AnthropicContentBlock::text(prompt)],
            _ => Vec::new(),
        };

        if let Some(ttl) = options.cache {
            if let Some(block) = system.last_mut() {
                block.set_cache_control(CacheControl::for_ttl(ttl));
            }
            if let Some(block) = messages
                .last_mut()
                .and_then(|m| m.content.last_mut())
                .filter(|b| b.is_cacheable())
            {
                block.set_cache_control(CacheControl::for_ttl(ttl));
            }
        }

        let thinking = options.reasoning.enabled.then_some(ThinkingParam {
            kind: "enabled",
            budget_tokens: options.reasoning.budget_tokens,
        });
        let max_tokens = match &thinking {
            Some(t) if options.max_tokens <= t.budget_tokens => t.budget_tokens + options.max_tokens,
            _ => options.max_tokens,
        };

        Ok(Self {
            model: options.model.clone(),
            max_tokens,
            system,
            messages,
            tools: tools
                .iter()
                .map(|t| AnthropicTool {
                    name: tool_names.outbound(&t.name),
                    description: t.description.clone(),
                    input_schema: clean_schema(&t.parameters, SchemaDialect::Anthropic),
                })
                .collect(),
            stream: options.stream.then_some(true),
            thinking,
            headers: request_headers(options),
        })
    }
}

fn request_headers(options: &AnthropicRequestOptions) -> Vec<(String, String)> {
    let mut betas = Vec::new();
    if options.oauth {
        betas.push(BETA_OAUTH);
    }
    if options.cache == Some(CacheTtl::OneHour) {
        betas.push(BETA_EXTENDED_CACHE_TTL);
    }
    if options.reasoning.enabled {
        betas.push(BETA_INTERLEAVED_THINKING);
    }

    let mut headers = vec![
        ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
        (
            "User-Agent".to_string(),
            format!("relay/{}", env!("CARGO_PKG_VERSION")),
        ),
    ];
    if !betas.is_empty() {
        headers.push(("anthropic-beta".to_string(), betas.join(",")));
    }
    headers.extend(options.custom_headers.iter().cloned());
    headers
}

fn translate_turn(
    content: &NormalizedContent,
    tool_names: &ToolNameMap,
    options: &AnthropicRequestOptions,
) -> (AnthropicRole, Vec<AnthropicContentBlock>) {
    let role = match content.speaker {
        Speaker::Ai => AnthropicRole::Assistant,
        Speaker::Human | Speaker::Tool => AnthropicRole::User,
    };

    let mut blocks = Vec::with_capacity(content.blocks.len());
    for block in &content.blocks {
        match block {
            Block::Text { text } => blocks.push(AnthropicContentBlock::text(text.clone())),
            Block::ToolCall {
                id,
                name,
                parameters,
            } if role == AnthropicRole::Assistant => {
                let input = match parameters {
                    serde_json::Value::Object(_) => parameters.clone(),
                    _ => serde_json::json!({}),
                };
                blocks.push(AnthropicContentBlock::ToolUse {
                    id: to_anthropic_tool_id(id),
                    name: tool_names.outbound(name),
                    input,
                    cache_control: None,
                });
            }
            Block::ToolResponse {
                call_id,
                result,
                error,
                ..
            } => blocks.push(tool_result_block(
                call_id,
                result,
                error.as_deref(),
                options.tool_output_max_tokens,
            )),
            Block::Thinking {
                thought,
                source_field,
                signature,
                ..
            } if role == AnthropicRole::Assistant && options.reasoning.enabled => {
                let Some(signature) = signature.as_deref().filter(|s| !s.is_empty()) else {
                    continue;
                };
                if source_field == REDACTED_THINKING_FIELD {
                    blocks.push(AnthropicContentBlock::RedactedThinking {
                        data: signature.to_string(),
                    });
                } else {
                    blocks.push(AnthropicContentBlock::Thinking {
                        thinking: thought.clone(),
                        signature: signature.to_string(),
                    });
                }
            }
            _ => {}
        }
    }

    if role == AnthropicRole::Assistant {
        // Thinking must lead the assistant turn.
        blocks.sort_by_key(|b| {
            !matches!(
                b,
                AnthropicContentBlock::Thinking { .. } | AnthropicContentBlock::RedactedThinking { .. }
            )
        });
    }
    (role, blocks)
}

fn tool_result_block(
    call_id: &str,
    result: &serde_json::Value,
    error: Option<&str>,
    max_tokens: usize,
) -> AnthropicContentBlock {
    let mut content = tool_result_text(result);
    let mut is_error = error.is_some();
    if let Some(err) = error {
        if content.trim().is_empty() {
            content = err.to_string();
        }
    }
    if let Some(truncated) = truncate_tool_output(&content, max_tokens) {
        content = truncated;
        is_error = true;
    }
    AnthropicContentBlock::ToolResult {
        tool_use_id: to_anthropic_tool_id(call_id),
        content,
        is_error,
        cache_control: None,
    }
}

/// Drop blank text blocks and substitute placeholders for turns left empty. The final turn is
/// exempt from substitution: if it is entirely blank it is kept as sent.
fn sanitize_blocks(
    role: AnthropicRole,
    blocks: Vec<AnthropicContentBlock>,
    is_last: bool,
) -> Vec<AnthropicContentBlock> {
    let filtered: Vec<AnthropicContentBlock> =
        blocks.iter().filter(|b| !b.is_blank()).cloned().collect();

    let mut out = if !filtered.is_empty() {
        filtered
    } else if is_last {
        if blocks.is_empty() {
            vec![AnthropicContentBlock::text("")]
        } else {
            blocks
        }
    } else {
        let placeholder = match role {
            AnthropicRole::Assistant => EMPTY_AI_PLACEHOLDER,
            AnthropicRole::User => EMPTY_HUMAN_PLACEHOLDER,
        };
        vec![AnthropicContentBlock::text(placeholder)]
    };

    if role == AnthropicRole::User {
        // Tool results must lead the user turn that answers a tool_use.
        out.sort_by_key(|b| !matches!(b, AnthropicContentBlock::ToolResult { .. }));
    }
    out
}

fn validate_tool_pairing(messages: &[AnthropicMessage]) -> Result<()> {
    for (i, message) in messages.iter().enumerate() {
        if message.role != AnthropicRole::Assistant {
            continue;
        }
        let calls: Vec<&str> = message
            .content
            .iter()
            .filter_map(|b| match b {
                AnthropicContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        if calls.is_empty() {
            continue;
        }
        let answered: HashSet<&str> = messages
            .get(i + 1)
            .map(|next| {
                next.content
                    .iter()
                    .filter_map(|b| match b {
                        AnthropicContentBlock::ToolResult { tool_use_id, .. } => {
                            Some(tool_use_id.as_str())
                        }
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        if let Some(missing) = calls.iter().find(|id| !answered.contains(*id)) {
            return Err(LlmError::ToolPairing(format!(
                "tool_use {missing} is not answered by the following message"
            )));
        }
    }
    Ok(())
}
