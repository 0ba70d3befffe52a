//! Vendor-neutral history preparation shared by both translators.

use crate::settings::EffectiveSettings;
use crate::tools::normalize_to_history_id;
use crate::types::{Block, NormalizedContent, Speaker};
use std::collections::HashSet;

pub const EMPTY_AI_PLACEHOLDER: &str = "[No content generated]";
pub const EMPTY_HUMAN_PLACEHOLDER: &str = "[Empty message]";
pub const CANCELLED_TOOL_RESULT: &str = "Tool call was cancelled or did not complete.";
pub const TRUNCATION_MARKER: &str =
    "\n\n[Output truncated: tool result exceeded the configured token limit]";

/// Which prior thinking blocks are removed from history before translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StripPolicy {
    All,
    AllButLast,
    #[default]
    None,
}

impl StripPolicy {
    pub fn from_settings(settings: &EffectiveSettings) -> Self {
        match settings.get_str("reasoning.stripFromContext") {
            Some("all") => Self::All,
            Some("allButLast") => Self::AllButLast,
            _ => Self::None,
        }
    }
}

pub fn strip_thinking(history: &[NormalizedContent], policy: StripPolicy) -> Vec<NormalizedContent> {
    let keep_index = match policy {
        StripPolicy::None => return history.to_vec(),
        StripPolicy::All => None,
        StripPolicy::AllButLast => history.iter().rposition(|c| {
            c.speaker == Speaker::Ai && c.blocks.iter().any(|b| matches!(b, Block::Thinking { .. }))
        }),
    };

    history
        .iter()
        .enumerate()
        .map(|(i, content)| {
            if Some(i) == keep_index || content.speaker != Speaker::Ai {
                return content.clone();
            }
            let mut stripped = content.clone();
            stripped
                .blocks
                .retain(|b| !matches!(b, Block::Thinking { .. }));
            stripped
        })
        .collect()
}

/// Index of the first turn of the active loop: the last human turn containing text.
pub fn active_loop_start(history: &[NormalizedContent]) -> usize {
    history
        .iter()
        .rposition(|c| c.speaker == Speaker::Human && c.has_text())
        .unwrap_or(0)
}

/// Make every tool call pair with exactly one tool response.
///
/// A response only answers a call if it arrives before the next AI turn. Calls left without
/// one get a synthesized error response inserted right after the calling turn. Responses that
/// answer no open call (orphans, duplicates and late arrivals) are dropped.
pub fn pair_tool_calls(history: &[NormalizedContent]) -> Vec<NormalizedContent> {
    let mut open: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(history.len());

    for (i, content) in history.iter().enumerate() {
        let mut content = content.clone();
        content.blocks.retain(|b| match b {
            Block::ToolResponse { call_id, .. } => {
                if open.remove(&normalize_to_history_id(call_id)) {
                    return true;
                }
                tracing::warn!(call_id = %call_id, "dropping tool response without an open call");
                false
            }
            _ => true,
        });
        if content.speaker == Speaker::Tool && content.blocks.is_empty() {
            continue;
        }

        let mut missing = Vec::new();
        if content.speaker == Speaker::Ai {
            let answered = responses_before_next_ai(&history[i + 1..]);
            open.clear();
            for (id, name, _) in content.tool_calls() {
                let normalized = normalize_to_history_id(id);
                if answered.contains(&normalized) {
                    open.insert(normalized);
                } else {
                    missing.push(Block::ToolResponse {
                        call_id: id.to_string(),
                        tool_name: name.to_string(),
                        result: serde_json::Value::String(CANCELLED_TOOL_RESULT.to_string()),
                        error: Some(CANCELLED_TOOL_RESULT.to_string()),
                    });
                }
            }
        }

        out.push(content);
        if !missing.is_empty() {
            tracing::debug!(count = missing.len(), "synthesizing responses for unanswered tool calls");
            out.push(NormalizedContent::tool(missing));
        }
    }
    out
}

fn responses_before_next_ai(rest: &[NormalizedContent]) -> HashSet<String> {
    rest.iter()
        .take_while(|c| c.speaker != Speaker::Ai)
        .flat_map(|c| c.blocks.iter())
        .filter_map(|b| match b {
            Block::ToolResponse { call_id, .. } => Some(normalize_to_history_id(call_id)),
            _ => None,
        })
        .collect()
}

/// Rough token estimate: four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Truncate `text` to fit `max_tokens`, appending [`TRUNCATION_MARKER`]. `None` when it fits.
pub fn truncate_tool_output(text: &str, max_tokens: usize) -> Option<String> {
    if estimate_tokens(text) <= max_tokens {
        return None;
    }
    let keep_chars = max_tokens.saturating_mul(4);
    let mut truncated: String = text.chars().take(keep_chars).collect();
    truncated.push_str(TRUNCATION_MARKER);
    Some(truncated)
}

/// Render a tool result payload as text.
pub fn tool_result_text(result: &serde_json::Value) -> String {
    match result {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn thinking(text: &str) -> Block {
        Block::Thinking {
            thought: text.to_string(),
            source_field: "thinking".to_string(),
            is_hidden: false,
            signature: Some("sig".to_string()),
        }
    }

    #[test]
    fn strip_policies() {
        let history = vec![
            NormalizedContent::human("q1"),
            NormalizedContent::ai(vec![thinking("t1"), Block::text("a1")]),
            NormalizedContent::human("q2"),
            NormalizedContent::ai(vec![thinking("t2"), Block::text("a2")]),
        ];

        let all = strip_thinking(&history, StripPolicy::All);
        assert_eq!(all[1].blocks.len(), 1);
        assert_eq!(all[3].blocks.len(), 1);

        let but_last = strip_thinking(&history, StripPolicy::AllButLast);
        assert_eq!(but_last[1].blocks.len(), 1);
        assert_eq!(but_last[3].blocks.len(), 2);

        assert_eq!(strip_thinking(&history, StripPolicy::None), history);
    }

    #[test]
    fn active_loop_starts_at_last_human_text() {
        let history = vec![
            NormalizedContent::human("first"),
            NormalizedContent::ai(vec![Block::text("ok")]),
            NormalizedContent::human("second"),
            NormalizedContent::ai(vec![Block::tool_call("hist_tool_1", "ls", json!({}))]),
            NormalizedContent::tool(vec![Block::tool_response("hist_tool_1", "ls", json!("a"))]),
        ];
        assert_eq!(active_loop_start(&history), 2);
        assert_eq!(active_loop_start(&[]), 0);
    }

    #[test]
    fn unanswered_calls_get_placeholder_responses() {
        let history = vec![
            NormalizedContent::human("go"),
            NormalizedContent::ai(vec![
                Block::tool_call("hist_tool_a", "ls", json!({})),
                Block::tool_call("hist_tool_b", "cat", json!({})),
            ]),
            NormalizedContent::tool(vec![Block::tool_response("hist_tool_a", "ls", json!("x"))]),
        ];
        let paired = pair_tool_calls(&history);
        assert_eq!(paired.len(), 4);
        assert_eq!(paired[2].speaker, Speaker::Tool);
        match &paired[2].blocks[0] {
            Block::ToolResponse { call_id, error, .. } => {
                assert_eq!(call_id, "hist_tool_b");
                assert_eq!(error.as_deref(), Some(CANCELLED_TOOL_RESULT));
            }
            other => panic!("unexpected block {other:?}"),
        }
    }

    #[test]
    fn orphan_and_duplicate_responses_are_dropped() {
        let history = vec![
            NormalizedContent::tool(vec![Block::tool_response("hist_tool_z", "ls", json!("x"))]),
            NormalizedContent::ai(vec![Block::tool_call("toolu_a", "ls", json!({}))]),
            NormalizedContent::tool(vec![
                Block::tool_response("hist_tool_a", "ls", json!("1")),
                Block::tool_response("hist_tool_a", "ls", json!("2")),
            ]),
        ];
        let paired = pair_tool_calls(&history);
        assert_eq!(paired.len(), 2);
        assert_eq!(paired[1].blocks.len(), 1);
    }

    #[test]
    fn late_response_after_next_ai_turn_is_replaced_by_placeholder() {
        let history = vec![
            NormalizedContent::human("go"),
            NormalizedContent::ai(vec![Block::tool_call("hist_tool_a", "ls", json!({}))]),
            NormalizedContent::human("never mind, say hi"),
            NormalizedContent::ai(vec![Block::text("hi")]),
            NormalizedContent::tool(vec![Block::tool_response("hist_tool_a", "ls", json!("x"))]),
            NormalizedContent::human("thanks"),
        ];
        let paired = pair_tool_calls(&history);

        let speakers: Vec<Speaker> = paired.iter().map(|c| c.speaker).collect();
        assert_eq!(
            speakers,
            vec![
                Speaker::Human,
                Speaker::Ai,
                Speaker::Tool,
                Speaker::Human,
                Speaker::Ai,
                Speaker::Human,
            ]
        );
        match &paired[2].blocks[..] {
            [Block::ToolResponse { call_id, error, .. }] => {
                assert_eq!(call_id, "hist_tool_a");
                assert_eq!(error.as_deref(), Some(CANCELLED_TOOL_RESULT));
            }
            other => panic!("unexpected blocks {other:?}"),
        }
    }

    #[test]
    fn response_after_intervening_human_turn_still_answers() {
        let history = vec![
            NormalizedContent::ai(vec![Block::tool_call("hist_tool_a", "ls", json!({}))]),
            NormalizedContent::human("still there?"),
            NormalizedContent::tool(vec![Block::tool_response("hist_tool_a", "ls", json!("x"))]),
        ];
        let paired = pair_tool_calls(&history);
        assert_eq!(paired.len(), 3);
        assert_eq!(paired[2].blocks, vec![Block::tool_response("hist_tool_a", "ls", json!("x"))]);
    }

    #[test]
    fn truncation_appends_marker() {
        assert_eq!(truncate_tool_output("short", 10), None);
        let long = "x".repeat(100);
        let truncated = truncate_tool_output(&long, 5).expect("truncated");
        assert!(truncated.starts_with(&"x".repeat(20)));
        assert!(truncated.ends_with(TRUNCATION_MARKER));
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
