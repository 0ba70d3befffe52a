use serde::{Deserialize, Serialize};

/// Who produced a turn of the normalized conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Human,
    Ai,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        parameters: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResponse {
        call_id: String,
        tool_name: String,
        result: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Thinking {
        thought: String,
        source_field: String,
        #[serde(default)]
        is_hidden: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

impl Block {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self::ToolCall {
            id: id.into(),
            name: name.into(),
            parameters,
        }
    }

    pub fn tool_response(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        result: serde_json::Value,
    ) -> Self {
        Self::ToolResponse {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            result,
            error: None,
        }
    }

    /// True when the block would render as nothing: blank text, or a thinking block with
    /// neither thought text nor signature.
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Text { text } => text.trim().is_empty(),
            Self::Thinking {
                thought, signature, ..
            } => thought.trim().is_empty() && signature.as_deref().unwrap_or("").is_empty(),
            Self::ToolCall { .. } | Self::ToolResponse { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    #[serde(rename = "promptTokens")]
    pub prompt_tokens: u64,
    #[serde(rename = "completionTokens")]
    pub completion_tokens: u64,
    #[serde(rename = "totalTokens")]
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
}

impl UsageInfo {
    /// Percentage of prompt tokens served from the vendor's prompt cache.
    ///
    /// Derived on demand; returns `None` when nothing was read or sent.
    pub fn cache_hit_rate(&self) -> Option<f64> {
        let read = self.cache_read_input_tokens.unwrap_or(0);
        let denominator = read + self.prompt_tokens;
        if denominator == 0 {
            return None;
        }
        Some(read as f64 / denominator as f64 * 100.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
}

/// One turn of the conversation, or one chunk of a streamed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedContent {
    pub speaker: Speaker,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ContentMetadata>,
}

impl NormalizedContent {
    pub fn new(speaker: Speaker, blocks: Vec<Block>) -> Self {
        Self {
            speaker,
            blocks,
            metadata: None,
        }
    }

    pub fn human(text: impl Into<String>) -> Self {
        Self::new(Speaker::Human, vec![Block::text(text)])
    }

    pub fn ai(blocks: Vec<Block>) -> Self {
        Self::new(Speaker::Ai, blocks)
    }

    pub fn tool(blocks: Vec<Block>) -> Self {
        Self::new(Speaker::Tool, blocks)
    }

    /// An `ai` chunk with no blocks, optionally carrying usage.
    pub fn usage_only(usage: Option<UsageInfo>) -> Self {
        Self {
            speaker: Speaker::Ai,
            blocks: Vec::new(),
            metadata: usage.map(|usage| ContentMetadata { usage: Some(usage) }),
        }
    }

    pub fn with_usage(mut self, usage: UsageInfo) -> Self {
        self.metadata = Some(ContentMetadata { usage: Some(usage) });
        self
    }

    pub fn usage(&self) -> Option<&UsageInfo> {
        self.metadata.as_ref().and_then(|m| m.usage.as_ref())
    }

    /// Concatenation of all text blocks.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_text(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b, Block::Text { text } if !text.trim().is_empty()))
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.blocks.iter().filter_map(|b| match b {
            Block::ToolCall {
                id,
                name,
                parameters,
            } => Some((id.as_str(), name.as_str(), parameters)),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema.
    pub parameters: serde_json::Value,
}
