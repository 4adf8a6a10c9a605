//! Configuration system (layered: defaults < TOML file < env < code).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::agent_loop::PermissionTimeoutPolicy;
use crate::error::{AgentError, Result};

const CONFIG_FILE_NAME: &str = "convoy.toml";

/// Connection settings for one provider, keyed by provider name
/// (`openai`, `anthropic`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Model used for sessions created from config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Request field carrying the continuation token back to this provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_field: Option<String>,
}

/// `[retry]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            max_retries: 2,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter: false,
        }
    }
}

/// `[agent_loop]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopSettings {
    pub max_iterations: usize,
    pub permission_timeout_ms: u64,
    pub permission_timeout_policy: PermissionTimeoutPolicy,
    /// Longest gap allowed between two chunks of one model stream.
    pub stream_idle_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            permission_timeout_ms: 60_000,
            permission_timeout_policy: PermissionTimeoutPolicy::Deny,
            stream_idle_timeout_ms: 120_000,
            max_tokens: None,
        }
    }
}

/// Layered configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub agent_loop: LoopSettings,
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document. Missing sections and keys take their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Load a TOML file. A missing file yields the defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw).map_err(|err| {
                AgentError::Configuration(format!("{}: {err}", path.display()))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(AgentError::Io(err)),
        }
    }

    /// `convoy.toml` in the platform config directory.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "convoy", "convoy")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Defaults, then the default config file, then the environment (`.env` included).
    pub fn load() -> Result<Self> {
        let mut config = match Self::default_path() {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        config.apply_env_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults plus environment only.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        config.apply_env_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from an environment lookup.
    ///
    /// Malformed numeric or policy values are configuration errors rather
    /// than silently ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let key_mappings = [("OPENAI_API_KEY", "openai"), ("ANTHROPIC_API_KEY", "anthropic")];
        for (env_var, provider) in key_mappings {
            if let Some(key) = lookup(env_var).filter(|v| !v.trim().is_empty()) {
                self.set_api_key(provider, key);
            }
        }

        let url_mappings = [("OPENAI_BASE_URL", "openai"), ("ANTHROPIC_BASE_URL", "anthropic")];
        for (env_var, provider) in url_mappings {
            if let Some(url) = lookup(env_var).filter(|v| !v.trim().is_empty()) {
                self.set_base_url(provider, url);
            }
        }

        if let Some(raw) = lookup("CONVOY_MAX_ITERATIONS") {
            self.agent_loop.max_iterations = parse_positive("CONVOY_MAX_ITERATIONS", &raw)?;
        }
        if let Some(raw) = lookup("CONVOY_PERMISSION_TIMEOUT_MS") {
            self.agent_loop.permission_timeout_ms =
                parse_positive("CONVOY_PERMISSION_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("CONVOY_PERMISSION_TIMEOUT_POLICY") {
            self.agent_loop.permission_timeout_policy = raw.trim().parse().map_err(|_| {
                AgentError::Configuration(format!(
                    "CONVOY_PERMISSION_TIMEOUT_POLICY must be 'deny' or 'approve', got '{raw}'"
                ))
            })?;
        }
        Ok(())
    }

    pub fn set_api_key(&mut self, provider: &str, key: impl Into<String>) {
        self.providers.entry(provider.to_string()).or_default().api_key = Some(key.into());
    }

    pub fn get_api_key(&self, provider: &str) -> Option<String> {
        self.providers.get(provider)?.api_key.clone()
    }

    pub fn set_base_url(&mut self, provider: &str, url: impl Into<String>) {
        self.providers.entry(provider.to_string()).or_default().base_url = Some(url.into());
    }

    pub fn get_base_url(&self, provider: &str) -> Option<String> {
        self.providers.get(provider)?.base_url.clone()
    }

    pub fn has_credentials(&self, provider: &str) -> bool {
        self.get_api_key(provider).is_some()
    }
}

fn parse_positive<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(AgentError::Configuration(format!(
            "{name} must be a positive integer, got '{raw}'"
        ))),
    }
}
