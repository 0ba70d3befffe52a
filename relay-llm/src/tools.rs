//! Tool id and tool name rewriting at the vendor boundary.
//!
//! Conversation history uses `hist_tool_<suffix>` ids. Each vendor gets its own prefix on the
//! way out and the suffix is carried through unchanged, so a call and its response always pair
//! up again after a round trip.

use crate::error::{LlmError, Result};
use crate::types::ToolDefinition;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub const HISTORY_TOOL_ID_PREFIX: &str = "hist_tool_";
pub const ANTHROPIC_TOOL_ID_PREFIX: &str = "toolu_";
/// Prefix applied to tool names when Anthropic is reached through OAuth.
pub const OAUTH_TOOL_PREFIX: &str = "relay_";

const KNOWN_ID_PREFIXES: &[&str] = &[HISTORY_TOOL_ID_PREFIX, ANTHROPIC_TOOL_ID_PREFIX, "call_"];
const MAX_TOOL_NAME_LEN: usize = 64;

pub fn generate_history_id() -> String {
    format!("{HISTORY_TOOL_ID_PREFIX}{}", uuid::Uuid::new_v4().simple())
}

/// Rewrite any vendor id into the history scheme.
pub fn normalize_to_history_id(id: &str) -> String {
    if id.trim().is_empty() {
        return generate_history_id();
    }
    format!("{HISTORY_TOOL_ID_PREFIX}{}", id_suffix(id))
}

/// Rewrite a history id into Anthropic's `toolu_` scheme.
pub fn to_anthropic_tool_id(id: &str) -> String {
    format!("{ANTHROPIC_TOOL_ID_PREFIX}{}", id_suffix(id))
}

/// Deterministic: the same input always yields the same suffix.
fn id_suffix(id: &str) -> String {
    let mut rest = id.trim();
    for prefix in KNOWN_ID_PREFIXES {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    if rest.is_empty() {
        return short_hash(id);
    }
    if rest.chars().all(is_id_char) {
        return rest.to_string();
    }
    // Replaced characters would let distinct ids collide, so the original is hashed in.
    let sanitized: String = rest
        .chars()
        .map(|ch| if is_id_char(ch) { ch } else { '_' })
        .collect();
    format!("{sanitized}_{}", short_hash(rest))
}

fn is_id_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'
}

fn short_hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

pub fn sanitize_tool_name(name: &str) -> String {
    // Both vendors accept ^[a-zA-Z0-9_-]{1,64}$. Invalid characters become underscores.
    let mut out: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(MAX_TOOL_NAME_LEN);
    if out.is_empty() {
        "tool".to_string()
    } else {
        out
    }
}

pub fn validate_tool_name_all_providers(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_TOOL_NAME_LEN {
        return Err(LlmError::InvalidInput(format!(
            "tool name must be 1-{MAX_TOOL_NAME_LEN} characters: {name:?}"
        )));
    }
    if !name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    {
        return Err(LlmError::InvalidInput(format!(
            "tool name may only contain [a-zA-Z0-9_-]: {name:?}"
        )));
    }
    if name.starts_with(|ch: char| ch.is_ascii_digit() || ch == '-') {
        return Err(LlmError::InvalidInput(format!(
            "tool name must start with a letter or underscore: {name:?}"
        )));
    }
    Ok(())
}

/// Reversible mapping between caller tool names and the names sent to a vendor.
#[derive(Debug, Clone, Default)]
pub struct ToolNameMap {
    prefix: Option<String>,
    forward: HashMap<String, String>, // original -> wire
    reverse: HashMap<String, String>, // wire -> original
}

impl ToolNameMap {
    pub fn build(tools: &[ToolDefinition], prefix: Option<&str>) -> Self {
        let mut map = Self {
            prefix: prefix.map(str::to_string),
            ..Self::default()
        };
        let mut used: HashMap<String, usize> = HashMap::new();

        for t in tools {
            let mut name = map.wire_name(&t.name);
            if let Some(n) = used.get_mut(&name) {
                *n += 1;
                name = format!("{name}_{}", *n);
            } else {
                used.insert(name.clone(), 0);
            }
            map.forward.insert(t.name.clone(), name.clone());
            map.reverse.insert(name, t.name.clone());
        }
        map
    }

    fn wire_name(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => sanitize_tool_name(&format!("{prefix}{name}")),
            None => sanitize_tool_name(name),
        }
    }

    pub fn outbound(&self, name: &str) -> String {
        self.forward
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.wire_name(name))
    }

    pub fn inbound(&self, name: &str) -> String {
        if let Some(original) = self.reverse.get(name) {
            return original.clone();
        }
        match &self.prefix {
            Some(prefix) => name.strip_prefix(prefix.as_str()).unwrap_or(name).to_string(),
            None => name.to_string(),
        }
    }
}

/// What a response mapper needs to turn vendor output back into history form.
#[derive(Debug, Clone, Default)]
pub struct ResponseContext {
    pub tool_names: ToolNameMap,
    /// Surface visible reasoning as thinking blocks.
    pub include_thinking: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: String::new(),
            parameters: json!({}),
        }
    }

    #[test]
    fn ids_round_trip_between_history_and_anthropic() {
        let history = normalize_to_history_id("toolu_01ABC");
        assert_eq!(history, "hist_tool_01ABC");
        assert_eq!(to_anthropic_tool_id(&history), "toolu_01ABC");
        let dotted = to_anthropic_tool_id("call_x.y");
        assert!(dotted.starts_with("toolu_x_y_"));
        assert_eq!(to_anthropic_tool_id(&normalize_to_history_id("call_x.y")), dotted);
    }

    #[test]
    fn ids_differing_only_in_replaced_characters_stay_distinct() {
        let dotted = to_anthropic_tool_id("a.b");
        let underscored = to_anthropic_tool_id("a_b");
        assert_eq!(underscored, "toolu_a_b");
        assert_ne!(dotted, underscored);
        assert_ne!(normalize_to_history_id("a.b"), normalize_to_history_id("a_b"));
        assert_eq!(dotted, to_anthropic_tool_id("a.b"));
    }

    #[test]
    fn degenerate_ids_map_deterministically() {
        let a = to_anthropic_tool_id("hist_tool_");
        let b = to_anthropic_tool_id("hist_tool_");
        assert_eq!(a, b);
        assert!(a.len() > ANTHROPIC_TOOL_ID_PREFIX.len());
        assert!(normalize_to_history_id("").starts_with(HISTORY_TOOL_ID_PREFIX));
    }

    #[test]
    fn tool_names_are_sanitized_and_unique() {
        let map = ToolNameMap::build(&[tool("shell.execute"), tool("shell_execute")], None);
        let a = map.outbound("shell.execute");
        let b = map.outbound("shell_execute");
        assert_ne!(a, b);
        assert_eq!(map.inbound(&a), "shell.execute");
        assert_eq!(map.inbound(&b), "shell_execute");
    }

    #[test]
    fn oauth_prefix_is_added_and_stripped() {
        let map = ToolNameMap::build(&[tool("read_file")], Some(OAUTH_TOOL_PREFIX));
        assert_eq!(map.outbound("read_file"), "relay_read_file");
        assert_eq!(map.inbound("relay_read_file"), "read_file");
        // Names from history that are not in the current tool list still round-trip.
        assert_eq!(map.outbound("write_file"), "relay_write_file");
        assert_eq!(map.inbound("relay_write_file"), "write_file");
    }

    #[test]
    fn validates_names() {
        assert!(validate_tool_name_all_providers("get_weather").is_ok());
        assert!(validate_tool_name_all_providers("1tool").is_err());
        assert!(validate_tool_name_all_providers("").is_err());
        assert!(validate_tool_name_all_providers(&"a".repeat(65)).is_err());
    }
}
