//! Credential resolution.
//!
//! Resolution is a pure function over an [`AuthSources`] snapshot; the result is the closed
//! [`ClientVariant`] that decides endpoint and auth headers for the call.

use crate::client::Provider;
use crate::error::{LlmError, Result};
use crate::settings::EffectiveSettings;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

const ENV_KEYS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "GEMINI_API_KEY",
    "GOOGLE_API_KEY",
    "GOOGLE_CLOUD_PROJECT",
    "GOOGLE_CLOUD_LOCATION",
    "GOOGLE_CLOUD_ACCESS_TOKEN",
];

/// Supplies OAuth bearer tokens. `Ok(None)` means no token is available without running the
/// interactive login flow.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self, provider: Provider) -> Result<Option<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    ApiKey,
    Vertex,
    OAuth,
}

#[derive(Clone, PartialEq, Eq)]
pub enum ClientVariant {
    ApiKey {
        key: String,
    },
    Vertex {
        project: String,
        location: String,
        access_token: String,
    },
    OAuth {
        token: String,
    },
}

impl ClientVariant {
    pub fn mode(&self) -> AuthMode {
        match self {
            Self::ApiKey { .. } => AuthMode::ApiKey,
            Self::Vertex { .. } => AuthMode::Vertex,
            Self::OAuth { .. } => AuthMode::OAuth,
        }
    }
}

impl fmt::Debug for ClientVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey { .. } => f.write_str("ApiKey { .. }"),
            Self::Vertex {
                project, location, ..
            } => f
                .debug_struct("Vertex")
                .field("project", project)
                .field("location", location)
                .finish_non_exhaustive(),
            Self::OAuth { .. } => f.write_str("OAuth { .. }"),
        }
    }
}

#[derive(Clone, Default)]
pub struct AuthSources {
    pub explicit_key: Option<String>,
    pub key_file: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub oauth: Option<Arc<dyn TokenProvider>>,
}

impl AuthSources {
    /// Snapshot of the process environment plus the `auth-key`/`auth-keyfile` settings.
    pub fn from_env(settings: &EffectiveSettings) -> Self {
        let env = ENV_KEYS
            .iter()
            .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
            .collect();
        Self {
            explicit_key: settings.get_str("auth-key").map(str::to_string),
            key_file: settings.get_str("auth-keyfile").map(PathBuf::from),
            env,
            oauth: None,
        }
    }

    pub fn with_oauth(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.oauth = Some(provider);
        self
    }

    fn env_value(&self, key: &str) -> Option<String> {
        self.env
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

#[tracing::instrument(level = "debug", skip_all, fields(provider = provider.as_str()))]
pub async fn resolve_auth(provider: Provider, sources: &AuthSources) -> Result<ClientVariant> {
    let mut checked = Vec::new();

    checked.push("auth-key".to_string());
    if let Some(key) = sources
        .explicit_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
    {
        return Ok(ClientVariant::ApiKey {
            key: key.to_string(),
        });
    }

    if let Some(path) = &sources.key_file {
        checked.push(format!("auth-keyfile ({})", path.display()));
        match tokio::fs::read_to_string(path).await {
            Ok(contents) if !contents.trim().is_empty() => {
                return Ok(ClientVariant::ApiKey {
                    key: contents.trim().to_string(),
                });
            }
            Ok(_) => tracing::warn!(path = %path.display(), "auth keyfile is empty"),
            Err(e) => tracing::warn!(path = %path.display(), %e, "auth keyfile unreadable"),
        }
    }

    let env_keys: &[&str] = match provider {
        Provider::Anthropic => &["ANTHROPIC_API_KEY"],
        Provider::Gemini => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
    };
    for key in env_keys {
        checked.push((*key).to_string());
        if let Some(value) = sources.env_value(key) {
            return Ok(ClientVariant::ApiKey { key: value });
        }
    }

    if provider == Provider::Gemini {
        checked.push("vertex (GOOGLE_CLOUD_PROJECT + GOOGLE_CLOUD_LOCATION)".to_string());
        if let (Some(project), Some(location)) = (
            sources.env_value("GOOGLE_CLOUD_PROJECT"),
            sources.env_value("GOOGLE_CLOUD_LOCATION"),
        ) {
            let token = match sources.env_value("GOOGLE_CLOUD_ACCESS_TOKEN") {
                Some(token) => Some(token),
                None => match &sources.oauth {
                    Some(oauth) => oauth.token(provider).await?,
                    None => None,
                },
            };
            if let Some(access_token) = token {
                return Ok(ClientVariant::Vertex {
                    project,
                    location,
                    access_token,
                });
            }
        }
    }

    if let Some(oauth) = &sources.oauth {
        checked.push("oauth".to_string());
        if let Some(token) = oauth.token(provider).await? {
            return Ok(ClientVariant::OAuth { token });
        }
    }

    Err(LlmError::Authentication {
        provider: provider.as_str().to_string(),
        checked,
    })
}
