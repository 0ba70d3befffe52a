//! Relay configuration loader.
//!
//! The TOML file carries a `[settings]` table of global settings and one `[providers.<name>]`
//! table per vendor. Nested tables flatten to dotted keys, so `[settings.reasoning]` with
//! `enabled = true` becomes `reasoning.enabled`.

use relay_llm::{Provider, SettingsStore};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Keys whose table value is consumed whole rather than flattened.
const OBJECT_KEYS: &[&str] = &["custom-headers"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub settings: HashMap<String, Value>,
    #[serde(default)]
    pub providers: HashMap<String, HashMap<String, Value>>,
}

impl RelayConfig {
    /// Load from `path`, or from the default location. A missing default file is not an error.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RELAY_MODEL") {
            if !v.trim().is_empty() {
                self.settings.insert("model".to_string(), Value::String(v));
            }
        }
        if let Ok(v) = std::env::var("RELAY_PROVIDER") {
            if !v.trim().is_empty() {
                self.provider = Some(v);
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if let Some(provider) = &self.provider {
            provider.parse::<Provider>()?;
        }
        for name in self.providers.keys() {
            name.parse::<Provider>()
                .map_err(|e| anyhow::anyhow!("providers.{name}: {e}"))?;
        }
        if let Some(model) = self.settings.get("model") {
            if model.as_str().is_none_or(|m| m.trim().is_empty()) {
                return Err(anyhow::anyhow!("settings.model must be a non-empty string"));
            }
        }
        Ok(())
    }

    /// Provider chosen by `--provider`, then config, then the configured model's family.
    pub fn provider(&self, cli: Option<&str>) -> anyhow::Result<Provider> {
        if let Some(name) = cli.or(self.provider.as_deref()) {
            return Ok(name.parse()?);
        }
        Ok(self
            .settings
            .get("model")
            .and_then(Value::as_str)
            .and_then(Provider::detect)
            .unwrap_or(Provider::Anthropic))
    }

    pub fn settings_store(&self) -> SettingsStore {
        let mut store = SettingsStore::new();
        for (key, value) in flatten(&self.settings) {
            store.set(key, value);
        }
        for (provider, section) in &self.providers {
            let provider = provider.to_ascii_lowercase();
            for (key, value) in flatten(section) {
                store.set_provider(provider.clone(), key, value);
            }
        }
        store
    }
}

fn flatten(table: &HashMap<String, Value>) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    for (key, value) in table {
        flatten_into(key.clone(), value, &mut out);
    }
    out
}

fn flatten_into(key: String, value: &Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) if !OBJECT_KEYS.contains(&key.as_str()) => {
            for (child, v) in map {
                flatten_into(format!("{key}.{child}"), v, out);
            }
        }
        other => out.push((key, other.clone())),
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".relay").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_llm::SettingsOverrides;
    use serde_json::json;

    const SAMPLE: &str = r#"
provider = "gemini"

[settings]
max_tokens = 2048
prompt-caching = "1h"

[settings.reasoning]
enabled = true
budgetTokens = 2000

[settings.custom-headers]
x-team = "core"

[providers.gemini]
model = "gemini-2.5-flash"
thought-signatures = "always"
"#;

    #[test]
    fn flattens_nested_tables_into_dotted_keys() {
        let cfg = RelayConfig::parse(SAMPLE).expect("parse");
        cfg.validate().expect("valid");
        let store = cfg.settings_store();
        let settings = store.effective("gemini", &SettingsOverrides::new());

        assert_eq!(settings.model(), Some("gemini-2.5-flash"));
        assert_eq!(settings.max_tokens(), 2048);
        assert!(settings.reasoning().enabled);
        assert_eq!(settings.reasoning().budget_tokens, 2000);
        assert_eq!(
            settings.custom_headers(),
            vec![("x-team".to_string(), "core".to_string())]
        );
        assert_eq!(store.get_provider("gemini", "thought-signatures"), Some(json!("always")));

        let anthropic = store.effective("anthropic", &SettingsOverrides::new());
        assert_eq!(anthropic.model(), None);
    }

    #[test]
    fn provider_falls_back_to_model_family() {
        let cfg = RelayConfig::parse(SAMPLE).expect("parse");
        assert_eq!(cfg.provider(None).expect("provider"), Provider::Gemini);
        assert_eq!(cfg.provider(Some("anthropic")).expect("provider"), Provider::Anthropic);

        let cfg = RelayConfig::parse("[settings]\nmodel = \"claude-opus-4-1\"\n").expect("parse");
        assert_eq!(cfg.provider(None).expect("provider"), Provider::Anthropic);
        let cfg = RelayConfig::parse("[settings]\nmodel = \"gemini-2.5-pro\"\n").expect("parse");
        assert_eq!(cfg.provider(None).expect("provider"), Provider::Gemini);
    }

    #[test]
    fn rejects_unknown_providers() {
        let cfg = RelayConfig::parse("[providers.openai]\nmodel = \"gpt-4o\"\n").expect("parse");
        assert!(cfg.validate().is_err());
        let cfg = RelayConfig::parse("provider = \"mistral\"\n").expect("parse");
        assert!(cfg.validate().is_err());
    }
}
