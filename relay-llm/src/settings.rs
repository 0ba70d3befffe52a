//! Settings provider contract and effective per-call settings.
//!
//! Values are JSON so the same store can hold numbers, flags, strings and header maps.
//! Precedence when merging: global < provider-level < per-call ephemeral overrides.

use serde_json::Value;
use std::collections::HashMap;

/// Per-call overrides, e.g. `{"retries": 2, "retrywait": 500}`.
pub type SettingsOverrides = HashMap<String, Value>;

/// Where the client reads settings from. Shared across calls, so implementations must be
/// safe to read concurrently.
pub trait SettingsSource: Send + Sync {
    /// Global value for `key`.
    fn get(&self, key: &str) -> Option<Value>;

    /// Merged view for one call: global < provider-level < `ephemeral`.
    fn effective(&self, provider: &str, ephemeral: &SettingsOverrides) -> EffectiveSettings;
}

#[derive(Debug, Clone, Default)]
pub struct SettingsStore {
    global: HashMap<String, Value>,
    providers: HashMap<String, HashMap<String, Value>>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.global.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.global.remove(key)
    }

    pub fn set_provider(
        &mut self,
        provider: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) {
        self.providers
            .entry(provider.into())
            .or_default()
            .insert(key.into(), value.into());
    }

    pub fn get_provider(&self, provider: &str, key: &str) -> Option<Value> {
        self.providers
            .get(provider)
            .and_then(|section| section.get(key))
            .cloned()
    }

    pub fn effective(&self, provider: &str, ephemeral: &SettingsOverrides) -> EffectiveSettings {
        let mut values = self.global.clone();
        if let Some(section) = self.providers.get(provider) {
            values.extend(section.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        values.extend(ephemeral.iter().map(|(k, v)| (k.clone(), v.clone())));
        EffectiveSettings { values }
    }
}

impl SettingsSource for SettingsStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.global.get(key).cloned()
    }

    fn effective(&self, provider: &str, ephemeral: &SettingsOverrides) -> EffectiveSettings {
        SettingsStore::effective(self, provider, ephemeral)
    }
}

/// The merged view consulted by one call.
#[derive(Debug, Clone, Default)]
pub struct EffectiveSettings {
    values: HashMap<String, Value>,
}

impl EffectiveSettings {
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Numbers may be stored as JSON numbers or numeric strings.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.values.get(key)? {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.values.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().trim_end_matches('%').parse().ok(),
            _ => None,
        }
    }

    /// Flags accept booleans and the strings on/off, true/false, enabled/disabled, yes/no.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "on" | "true" | "enabled" | "yes" | "1" => Some(true),
                "off" | "false" | "disabled" | "no" | "0" => Some(false),
                _ => None,
            },
            Value::Number(n) => n.as_u64().map(|n| n != 0),
            _ => None,
        }
    }

    pub fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        match self.values.get(key)? {
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
            ),
            Value::String(s) => Some(
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            _ => None,
        }
    }

    pub fn model(&self) -> Option<&str> {
        self.get_str("model")
    }

    pub fn max_tokens(&self) -> u32 {
        self.get_u64("max_tokens")
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(4096)
    }

    pub fn streaming_enabled(&self) -> bool {
        self.get_bool("streaming").unwrap_or(true)
    }

    pub fn tool_output_max_tokens(&self) -> usize {
        self.get_u64("tool-output-max-tokens")
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(50_000)
    }

    pub fn base_url(&self) -> Option<&str> {
        self.get_str("base-url")
    }

    /// `custom-headers` as an object of string values, in key order.
    pub fn custom_headers(&self) -> Vec<(String, String)> {
        let Some(Value::Object(map)) = self.values.get("custom-headers") else {
            return Vec::new();
        };
        let mut out: Vec<(String, String)> = map
            .iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some((k.clone(), s.clone())),
                Value::Number(n) => Some((k.clone(), n.to_string())),
                Value::Bool(b) => Some((k.clone(), b.to_string())),
                _ => None,
            })
            .collect();
        out.sort();
        out
    }

    pub fn reasoning(&self) -> ReasoningSettings {
        ReasoningSettings {
            enabled: self.get_bool("reasoning.enabled").unwrap_or(false),
            budget_tokens: self
                .get_u64("reasoning.budgetTokens")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(10_000),
            include_in_response: self.get_bool("reasoning.includeInResponse").unwrap_or(true),
        }
    }
}

/// A fixed set of values with no provider sections.
impl SettingsSource for EffectiveSettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn effective(&self, _provider: &str, ephemeral: &SettingsOverrides) -> EffectiveSettings {
        let mut values = self.values.clone();
        values.extend(ephemeral.iter().map(|(k, v)| (k.clone(), v.clone())));
        EffectiveSettings { values }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReasoningSettings {
    pub enabled: bool,
    pub budget_tokens: u32,
    /// Surface thinking blocks to the caller.
    pub include_in_response: bool,
}
