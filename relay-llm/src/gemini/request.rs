use crate::error::Result;
use crate::history::{
    EMPTY_AI_PLACEHOLDER, EMPTY_HUMAN_PLACEHOLDER, StripPolicy, active_loop_start,
    pair_tool_calls, strip_thinking, tool_result_text, truncate_tool_output,
};
use crate::schema::{SchemaDialect, clean_schema};
use crate::settings::{EffectiveSettings, ReasoningSettings};
use crate::tools::{ToolNameMap, normalize_to_history_id};
use crate::types::{Block, NormalizedContent, Speaker, ToolDefinition};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Stand-in signature accepted by validators that require one on active-loop tool calls.
pub const SYNTHETIC_THOUGHT_SIGNATURE: &str = "skip_thought_signature_validator";
pub(crate) const THOUGHT_SIGNATURE_FIELD: &str = "thoughtSignature";
const DEFAULT_SIGNATURE_MODELS: &[&str] = &["gemini-3"];

/// When a missing thought signature is replaced by [`SYNTHETIC_THOUGHT_SIGNATURE`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignaturePolicy {
    Always,
    Never,
    /// Required when the model id contains any of these substrings.
    Auto(Vec<String>),
}

impl Default for SignaturePolicy {
    fn default() -> Self {
        Self::Auto(DEFAULT_SIGNATURE_MODELS.iter().map(|m| m.to_string()).collect())
    }
}

impl SignaturePolicy {
    pub fn from_settings(settings: &EffectiveSettings) -> Self {
        match settings.get_str("thought-signatures") {
            Some("always") => Self::Always,
            Some("never") => Self::Never,
            _ => settings
                .get_string_list("thought-signature-models")
                .map(Self::Auto)
                .unwrap_or_default(),
        }
    }

    pub fn requires_signature(&self, model: &str) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Auto(models) => models.iter().any(|m| model.contains(m.as_str())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeminiRequestOptions {
    pub model: String,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    pub tool_output_max_tokens: usize,
    pub reasoning: ReasoningSettings,
    pub strip: StripPolicy,
    pub signatures: SignaturePolicy,
    pub custom_headers: Vec<(String, String)>,
}

/// SDK-shaped request. [`GeminiRequest::rest_body`] produces the REST payload.
#[derive(Debug, Clone, PartialEq)]
pub struct GeminiRequest {
    pub model: String,
    pub contents: Vec<GeminiContent>,
    pub system_instruction: Option<GeminiContent>,
    pub config: GenerateConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateConfig {
    pub tools: Vec<GeminiTool>,
    pub thinking_config: Option<ThinkingConfig>,
    pub max_output_tokens: u32,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// A content part. Gemini puts `thoughtSignature` beside the payload field, so this is a flat
/// struct rather than an enum.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    fn is_blank_text(&self) -> bool {
        self.function_call.is_none()
            && self.function_response.is_none()
            && self.text.as_deref().is_none_or(|t| t.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiTool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    pub thinking_budget: u32,
    pub include_thoughts: bool,
}

const USER: &str = "user";
const MODEL: &str = "model";

impl GeminiRequest {
    pub fn new(
        conversation: &[NormalizedContent],
        tools: &[ToolDefinition],
        tool_names: &ToolNameMap,
        options: &GeminiRequestOptions,
    ) -> Result<Self> {
        let history = pair_tool_calls(&strip_thinking(conversation, options.strip));
        let active_from = active_loop_start(&history);
        let needs_signature = options.signatures.requires_signature(&options.model);

        let mut turns: Vec<(&'static str, Vec<Part>)> = Vec::new();
        for (i, content) in history.iter().enumerate() {
            let (role, parts) = match content.speaker {
                Speaker::Ai => (
                    MODEL,
                    model_parts(content, tool_names, i >= active_from && needs_signature),
                ),
                Speaker::Human | Speaker::Tool => (
                    USER,
                    user_parts(content, tool_names, options.tool_output_max_tokens),
                ),
            };
            match turns.last_mut() {
                Some((last_role, last_parts)) if *last_role == role => last_parts.extend(parts),
                _ => turns.push((role, parts)),
            }
        }

        let last = turns.len().saturating_sub(1);
        let contents = turns
            .into_iter()
            .enumerate()
            .map(|(i, (role, parts))| GeminiContent {
                role: Some(role.to_string()),
                parts: sanitize_parts(role, parts, i == last),
            })
            .collect();

        let system_instruction = options
            .system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| GeminiContent {
                role: None,
                parts: vec![Part::text(p)],
            });

        let declarations: Vec<FunctionDeclaration> = tools
            .iter()
            .map(|t| FunctionDeclaration {
                name: tool_names.outbound(&t.name),
                description: t.description.clone(),
                parameters: clean_schema(&t.parameters, SchemaDialect::Gemini),
            })
            .collect();

        let mut headers = vec![(
            "User-Agent".to_string(),
            format!("relay/{}", env!("CARGO_PKG_VERSION")),
        )];
        headers.extend(options.custom_headers.iter().cloned());

        Ok(Self {
            model: options
                .model
                .strip_prefix("models/")
                .unwrap_or(&options.model)
                .to_string(),
            contents,
            system_instruction,
            config: GenerateConfig {
                tools: if declarations.is_empty() {
                    Vec::new()
                } else {
                    vec![GeminiTool {
                        function_declarations: declarations,
                    }]
                },
                thinking_config: options.reasoning.enabled.then_some(ThinkingConfig {
                    thinking_budget: options.reasoning.budget_tokens,
                    include_thoughts: options.reasoning.include_in_response,
                }),
                max_output_tokens: options.max_tokens,
                headers,
            },
        })
    }

    /// The `generateContent` REST body.
    pub fn rest_body(&self) -> serde_json::Value {
        let mut generation_config = json!({ "maxOutputTokens": self.config.max_output_tokens });
        if let Some(thinking) = &self.config.thinking_config {
            generation_config["thinkingConfig"] = json!(thinking);
        }
        let mut body = json!({
            "contents": self.contents,
            "generationConfig": generation_config,
        });
        if let Some(system) = &self.system_instruction {
            body["systemInstruction"] = json!(system);
        }
        if !self.config.tools.is_empty() {
            body["tools"] = json!(self.config.tools);
        }
        body
    }
}

fn model_parts(content: &NormalizedContent, tool_names: &ToolNameMap, require_signature: bool) -> Vec<Part> {
    let signature = content.blocks.iter().find_map(|b| match b {
        Block::Thinking { signature, .. } => signature.clone().filter(|s| !s.is_empty()),
        _ => None,
    });

    let mut parts: Vec<Part> = content
        .blocks
        .iter()
        .filter_map(|b| match b {
            Block::Text { text } => Some(Part::text(text.clone())),
            Block::ToolCall {
                id,
                name,
                parameters,
            } => Some(Part {
                function_call: Some(FunctionCall {
                    id: Some(normalize_to_history_id(id)),
                    name: tool_names.outbound(name),
                    args: if parameters.is_object() {
                        parameters.clone()
                    } else {
                        json!({})
                    },
                }),
                ..Part::default()
            }),
            _ => None,
        })
        .collect();

    let first_call = parts.iter().position(|p| p.function_call.is_some());
    match (first_call, signature) {
        (Some(i), Some(sig)) => parts[i].thought_signature = Some(sig),
        (Some(i), None) if require_signature => {
            parts[i].thought_signature = Some(SYNTHETIC_THOUGHT_SIGNATURE.to_string())
        }
        (None, Some(sig)) => {
            if let Some(part) = parts.last_mut() {
                part.thought_signature = Some(sig);
            }
        }
        _ => {}
    }
    parts
}

fn user_parts(content: &NormalizedContent, tool_names: &ToolNameMap, max_tokens: usize) -> Vec<Part> {
    content
        .blocks
        .iter()
        .filter_map(|b| match b {
            Block::Text { text } => Some(Part::text(text.clone())),
            Block::ToolResponse {
                call_id,
                tool_name,
                result,
                error,
            } => {
                let mut text = tool_result_text(result);
                let mut is_error = error.is_some();
                if let Some(err) = error {
                    if text.trim().is_empty() {
                        text = err.clone();
                    }
                }
                if let Some(truncated) = truncate_tool_output(&text, max_tokens) {
                    text = truncated;
                    is_error = true;
                }
                let response = if is_error {
                    json!({ "error": text })
                } else {
                    match result {
                        serde_json::Value::Object(_) => result.clone(),
                        _ => json!({ "output": text }),
                    }
                };
                Some(Part {
                    function_response: Some(FunctionResponse {
                        id: Some(normalize_to_history_id(call_id)),
                        name: tool_names.outbound(tool_name),
                        response,
                    }),
                    ..Part::default()
                })
            }
            _ => None,
        })
        .collect()
}

fn sanitize_parts(role: &str, parts: Vec<Part>, is_last: bool) -> Vec<Part> {
    // Signature-carrying parts are kept even when their text is blank.
    let filtered: Vec<Part> = parts
        .iter()
        .filter(|p| !p.is_blank_text() || p.thought_signature.is_some())
        .cloned()
        .collect();
    if !filtered.is_empty() {
        return filtered;
    }
    if is_last {
        return if parts.is_empty() {
            vec![Part::text("")]
        } else {
            parts
        };
    }
    let placeholder = if role == MODEL {
        EMPTY_AI_PLACEHOLDER
    } else {
        EMPTY_HUMAN_PLACEHOLDER
    };
    vec![Part::text(placeholder)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::CANCELLED_TOOL_RESULT;

    fn options(model: &str) -> GeminiRequestOptions {
        GeminiRequestOptions {
            model: model.to_string(),
            max_tokens: 2048,
            system_prompt: Some("Be brief.".to_string()),
            tool_output_max_tokens: 50_000,
            reasoning: ReasoningSettings {
                enabled: false,
                budget_tokens: 10_000,
                include_in_response: true,
            },
            strip: StripPolicy::None,
            signatures: SignaturePolicy::default(),
            custom_headers: Vec::new(),
        }
    }

    fn signature_block(sig: &str) -> Block {
        Block::Thinking {
            thought: String::new(),
            source_field: THOUGHT_SIGNATURE_FIELD.to_string(),
            is_hidden: true,
            signature: Some(sig.to_string()),
        }
    }

    fn tool_loop(call_blocks: Vec<Block>) -> Vec<NormalizedContent> {
        vec![
            NormalizedContent::human("weather in SF?"),
            NormalizedContent::ai(call_blocks),
            NormalizedContent::tool(vec![Block::tool_response(
                "hist_tool_1",
                "get_weather",
                json!({"temp": 60}),
            )]),
        ]
    }

    fn build(conversation: &[NormalizedContent], options: &GeminiRequestOptions) -> GeminiRequest {
        GeminiRequest::new(conversation, &[], &ToolNameMap::default(), options).expect("translate")
    }

    #[test]
    fn roles_merge_and_system_instruction_is_separate() {
        let conversation = vec![
            NormalizedContent::human("one"),
            NormalizedContent::human(" "),
            NormalizedContent::human("two"),
            NormalizedContent::ai(vec![Block::text("ok")]),
        ];
        let req = build(&conversation, &options("gemini-2.5-flash"));
        assert_eq!(req.contents.len(), 2);
        assert_eq!(req.contents[0].role.as_deref(), Some("user"));
        assert_eq!(req.contents[0].parts, vec![Part::text("one"), Part::text("two")]);
        let body = req.rest_body();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], json!("Be brief."));
        assert_eq!(body["generationConfig"]["maxOutputTokens"], json!(2048));
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn function_call_and_response_share_ids() {
        let req = build(
            &tool_loop(vec![Block::tool_call("hist_tool_1", "get_weather", json!({"location": "SF"}))]),
            &options("gemini-2.5-pro"),
        );
        let call = req.contents[1].parts[0].function_call.as_ref().expect("call");
        let response = req.contents[2].parts[0]
            .function_response
            .as_ref()
            .expect("response");
        assert_eq!(call.id, response.id);
        assert_eq!(call.args, json!({"location": "SF"}));
        assert_eq!(response.response, json!({"temp": 60}));
        assert_eq!(req.contents[1].parts[0].thought_signature, None);
    }

    #[test]
    fn late_function_response_after_intervening_turns_is_replaced() {
        let conversation = vec![
            NormalizedContent::human("go"),
            NormalizedContent::ai(vec![Block::tool_call("hist_tool_a", "ls", json!({}))]),
            NormalizedContent::human("never mind, say hi"),
            NormalizedContent::ai(vec![Block::text("hi")]),
            NormalizedContent::tool(vec![Block::tool_response("hist_tool_a", "ls", json!("late"))]),
            NormalizedContent::human("thanks"),
        ];
        let req = build(&conversation, &options("gemini-2.5-pro"));
        let roles: Vec<Option<&str>> = req.contents.iter().map(|c| c.role.as_deref()).collect();
        assert_eq!(
            roles,
            vec![Some("user"), Some("model"), Some("user"), Some("model"), Some("user")]
        );

        let call = req.contents[1].parts[0].function_call.as_ref().expect("call");
        let response = req.contents[2].parts[0]
            .function_response
            .as_ref()
            .expect("placeholder response");
        assert_eq!(call.id, response.id);
        assert_eq!(response.response, json!({"error": CANCELLED_TOOL_RESULT}));
        assert_eq!(req.contents[2].parts[1], Part::text("never mind, say hi"));
        assert_eq!(req.contents[4].parts, vec![Part::text("thanks")]);
    }

    #[test]
    fn synthetic_signature_only_inside_active_loop_when_required() {
        let mut conversation = vec![
            NormalizedContent::human("earlier"),
            NormalizedContent::ai(vec![Block::tool_call("hist_tool_0", "ls", json!({}))]),
            NormalizedContent::tool(vec![Block::tool_response("hist_tool_0", "ls", json!("a"))]),
        ];
        conversation.extend(tool_loop(vec![Block::tool_call(
            "hist_tool_1",
            "get_weather",
            json!({}),
        )]));

        let req = build(&conversation, &options("gemini-3-pro-preview"));
        let body = req.rest_body();
        assert!(body["contents"][1]["parts"][0].get("thoughtSignature").is_none());
        // The tool turn and the following human turn merge into one user message.
        assert_eq!(req.contents.len(), 5);
        assert_eq!(
            body["contents"][3]["parts"][0]["thoughtSignature"],
            json!(SYNTHETIC_THOUGHT_SIGNATURE)
        );

        let req = build(&conversation, &options("gemini-2.5-pro"));
        assert_eq!(req.contents[3].parts[0].thought_signature, None);

        let mut never = options("gemini-3-pro-preview");
        never.signatures = SignaturePolicy::Never;
        assert_eq!(build(&conversation, &never).contents[3].parts[0].thought_signature, None);
    }

    #[test]
    fn recorded_signature_moves_to_first_function_call() {
        let req = build(
            &tool_loop(vec![
                signature_block("real-sig"),
                Block::text("Checking."),
                Block::tool_call("hist_tool_1", "get_weather", json!({})),
                Block::tool_call("hist_tool_2", "get_time", json!({})),
            ]),
            &options("gemini-3-pro-preview"),
        );
        let parts = &req.contents[1].parts;
        assert_eq!(parts[0].thought_signature, None);
        assert_eq!(parts[1].thought_signature.as_deref(), Some("real-sig"));
        assert_eq!(parts[2].thought_signature, None);
    }

    #[test]
    fn truncated_tool_output_is_reported_as_error() {
        let mut opts = options("gemini-2.5-flash");
        opts.tool_output_max_tokens = 4;
        let conversation = vec![
            NormalizedContent::human("read"),
            NormalizedContent::ai(vec![Block::tool_call("hist_tool_1", "read", json!({}))]),
            NormalizedContent::tool(vec![Block::tool_response("hist_tool_1", "read", json!("z".repeat(100)))]),
        ];
        let req = build(&conversation, &opts);
        let response = &req.contents[2].parts[0]
            .function_response
            .as_ref()
            .expect("response")
            .response;
        let text = response["error"].as_str().expect("error text");
        assert!(text.ends_with(crate::history::TRUNCATION_MARKER));
    }

    #[test]
    fn tools_and_thinking_config_in_rest_body() {
        let tools = vec![ToolDefinition {
            name: "get_weather".to_string(),
            description: "weather".to_string(),
            parameters: json!({"type": "object", "properties": {"city": {"type": ["string", "null"]}}, "$schema": "x"}),
        }];
        let mut opts = options("models/gemini-2.5-pro");
        opts.reasoning.enabled = true;
        let req = GeminiRequest::new(
            &[NormalizedContent::human("hi")],
            &tools,
            &ToolNameMap::build(&tools, None),
            &opts,
        )
        .expect("translate");
        assert_eq!(req.model, "gemini-2.5-pro");
        let body = req.rest_body();
        let decl = &body["tools"][0]["functionDeclarations"][0];
        assert_eq!(decl["name"], json!("get_weather"));
        assert!(decl["parameters"].get("$schema").is_none());
        assert_eq!(decl["parameters"]["properties"]["city"]["nullable"], json!(true));
        assert_eq!(
            body["generationConfig"]["thinkingConfig"],
            json!({"thinkingBudget": 10000, "includeThoughts": true})
        );
    }

    #[test]
    fn signature_policy_from_settings() {
        let settings = EffectiveSettings::default();
        assert!(SignaturePolicy::from_settings(&settings).requires_signature("gemini-3-flash"));
        let always = EffectiveSettings::default().with("thought-signatures", "always");
        assert!(SignaturePolicy::from_settings(&always).requires_signature("gemini-2.0"));
        let custom = EffectiveSettings::default().with("thought-signature-models", json!(["gemini-2.5"]));
        let policy = SignaturePolicy::from_settings(&custom);
        assert!(policy.requires_signature("gemini-2.5-pro"));
        assert!(!policy.requires_signature("gemini-3-pro"));
    }
}
