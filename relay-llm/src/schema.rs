//! Tool parameter schema cleaning.
//!
//! Vendors reject schema keywords they do not understand, so each schema is filtered to a
//! per-vendor whitelist. Output objects are built with sorted keys so identical tool sets
//! serialize identically and keep prompt-cache prefixes stable.

use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaDialect {
    Anthropic,
    Gemini,
}

const ANTHROPIC_KEYWORDS: &[&str] = &[
    "additionalProperties",
    "anyOf",
    "const",
    "default",
    "description",
    "enum",
    "format",
    "items",
    "maxItems",
    "maxLength",
    "maximum",
    "minItems",
    "minLength",
    "minimum",
    "oneOf",
    "pattern",
    "properties",
    "required",
    "title",
    "type",
];

const GEMINI_KEYWORDS: &[&str] = &[
    "anyOf",
    "description",
    "enum",
    "format",
    "items",
    "maxItems",
    "maximum",
    "minItems",
    "minimum",
    "nullable",
    "properties",
    "required",
    "title",
    "type",
];

impl SchemaDialect {
    fn allows(self, keyword: &str) -> bool {
        match self {
            Self::Anthropic => ANTHROPIC_KEYWORDS.contains(&keyword),
            Self::Gemini => GEMINI_KEYWORDS.contains(&keyword),
        }
    }
}

/// Clean a tool's parameter schema for `dialect`. A missing or non-object schema becomes an
/// empty object schema.
pub fn clean_schema(schema: &Value, dialect: SchemaDialect) -> Value {
    match schema {
        Value::Object(_) => {
            let mut cleaned = clean_node(schema, dialect);
            if let Value::Object(map) = &mut cleaned {
                if !map.contains_key("type") {
                    map.insert("type".to_string(), Value::String("object".to_string()));
                }
                if !map.contains_key("properties")
                    && map.get("type").and_then(Value::as_str) == Some("object")
                {
                    map.insert("properties".to_string(), Value::Object(Map::new()));
                }
            }
            sort_keys(cleaned)
        }
        _ => serde_json::json!({"type": "object", "properties": {}}),
    }
}

fn clean_node(node: &Value, dialect: SchemaDialect) -> Value {
    let Value::Object(map) = node else {
        return node.clone();
    };

    let mut out = Map::new();
    for (key, value) in map {
        if !dialect.allows(key) {
            continue;
        }
        let cleaned = match key.as_str() {
            // Property names are user data, not keywords: recurse into each value only.
            "properties" => match value {
                Value::Object(props) => Value::Object(
                    props
                        .iter()
                        .map(|(name, schema)| (name.clone(), clean_node(schema, dialect)))
                        .collect(),
                ),
                other => other.clone(),
            },
            "items" => match value {
                Value::Array(items) => {
                    Value::Array(items.iter().map(|s| clean_node(s, dialect)).collect())
                }
                other => clean_node(other, dialect),
            },
            "anyOf" | "oneOf" => match value {
                Value::Array(items) => {
                    Value::Array(items.iter().map(|s| clean_node(s, dialect)).collect())
                }
                other => other.clone(),
            },
            "additionalProperties" => match value {
                Value::Object(_) => clean_node(value, dialect),
                other => other.clone(),
            },
            "type" if dialect == SchemaDialect::Gemini => gemini_type(value),
            _ => value.clone(),
        };
        out.insert(key.clone(), cleaned);
    }

    if out.contains_key("properties") && !out.contains_key("type") {
        out.insert("type".to_string(), Value::String("object".to_string()));
    }
    if dialect == SchemaDialect::Gemini {
        if let Some(Value::Array(types)) = map.get("type") {
            if types.iter().any(|t| t.as_str() == Some("null")) {
                out.insert("nullable".to_string(), Value::Bool(true));
            }
        }
    }
    Value::Object(out)
}

/// Gemini only accepts a single type string; `["string", "null"]` becomes `string`.
fn gemini_type(value: &Value) -> Value {
    match value {
        Value::Array(types) => types
            .iter()
            .find(|t| t.as_str().is_some_and(|s| s != "null"))
            .cloned()
            .unwrap_or_else(|| Value::String("string".to_string())),
        other => other.clone(),
    }
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
