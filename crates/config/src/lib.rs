//! Process-level configuration: storage backend selection, default turn
//! limits, and LLM provider credential resolution.
//!
//! Mirrors the load/save/env-override pattern used throughout the rest of
//! the workspace: a TOML file provides defaults, environment variables
//! override specific fields at process start.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    File,
    Sqlite,
}

impl Default for StorageBackend {
    fn default() -> Self {
        StorageBackend::File
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            data_path: "./.agent-world".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Default `turnLimit` applied to newly created worlds that don't specify one.
    pub default_turn_limit: u32,
    /// Default wall-clock budget (seconds) for one LLM pipeline attempt.
    pub llm_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_turn_limit: 5,
            llm_timeout_secs: 30,
        }
    }
}

/// Credentials and connection details for each supported LLM provider.
///
/// Populated from environment variables at process start; individual
/// agents select a provider by name and the pipeline looks up the
/// matching entry here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderCredentials {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub xai_api_key: Option<String>,
    pub azure_openai_api_key: Option<String>,
    pub azure_resource_name: Option<String>,
    pub azure_deployment: Option<String>,
    pub azure_api_version: Option<String>,
    pub openai_compatible_api_key: Option<String>,
    pub openai_compatible_base_url: Option<String>,
    pub ollama_base_url: Option<String>,
}

impl ProviderCredentials {
    /// Resolve credentials from the environment variables documented in
    /// the external interfaces section: `OPENAI_API_KEY`,
    /// `ANTHROPIC_API_KEY`, `GOOGLE_API_KEY`, `XAI_API_KEY`,
    /// `AZURE_OPENAI_API_KEY`, `AZURE_RESOURCE_NAME`, `AZURE_DEPLOYMENT`,
    /// `AZURE_API_VERSION`, `OPENAI_COMPATIBLE_API_KEY`,
    /// `OPENAI_COMPATIBLE_BASE_URL`, `OLLAMA_BASE_URL`.
    pub fn from_env() -> Self {
        Self {
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            anthropic_api_key: non_empty_env("ANTHROPIC_API_KEY"),
            google_api_key: non_empty_env("GOOGLE_API_KEY"),
            xai_api_key: non_empty_env("XAI_API_KEY"),
            azure_openai_api_key: non_empty_env("AZURE_OPENAI_API_KEY"),
            azure_resource_name: non_empty_env("AZURE_RESOURCE_NAME"),
            azure_deployment: non_empty_env("AZURE_DEPLOYMENT"),
            azure_api_version: non_empty_env("AZURE_API_VERSION"),
            openai_compatible_api_key: non_empty_env("OPENAI_COMPATIBLE_API_KEY"),
            openai_compatible_base_url: non_empty_env("OPENAI_COMPATIBLE_BASE_URL"),
            ollama_base_url: non_empty_env("OLLAMA_BASE_URL"),
        }
    }

    /// Merge `other` over `self`, keeping `self`'s values where `other` has none.
    /// Used so environment overrides win over a loaded TOML file.
    pub fn merge_env_over(mut self, env: ProviderCredentials) -> Self {
        macro_rules! take {
            ($field:ident) => {
                if env.$field.is_some() {
                    self.$field = env.$field;
                }
            };
        }
        take!(openai_api_key);
        take!(anthropic_api_key);
        take!(google_api_key);
        take!(xai_api_key);
        take!(azure_openai_api_key);
        take!(azure_resource_name);
        take!(azure_deployment);
        take!(azure_api_version);
        take!(openai_compatible_api_key);
        take!(openai_compatible_base_url);
        take!(ollama_base_url);
        self
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub runtime: RuntimeConfig,
    #[serde(skip)]
    pub providers: ProviderCredentials,
}

impl AppConfig {
    /// Load from a TOML file if present (falling back to defaults), then
    /// apply `AGENT_WORLD_STORAGE_TYPE` / `AGENT_WORLD_DATA_PATH` and all
    /// provider credential environment variables on top.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("AGENT_WORLD_STORAGE_TYPE") {
            config.storage.backend = match value.to_lowercase().as_str() {
                "sqlite" => StorageBackend::Sqlite,
                _ => StorageBackend::File,
            };
        }
        if let Ok(value) = env::var("AGENT_WORLD_DATA_PATH") {
            if !value.trim().is_empty() {
                config.storage.data_path = value;
            }
        }

        config.providers = ProviderCredentials::default().merge_env_over(ProviderCredentials::from_env());
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_file_backend() {
        let config = AppConfig::default();
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert_eq!(config.runtime.default_turn_limit, 5);
    }

    #[test]
    fn load_from_missing_path_returns_defaults() {
        let config = AppConfig::load_from("/nonexistent/agent-world.toml").unwrap();
        assert_eq!(config.storage.backend, StorageBackend::File);
    }

    #[test]
    fn save_then_load_round_trips_storage_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.storage.data_path = "/tmp/custom-data".to_string();
        config.runtime.default_turn_limit = 9;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.storage.data_path, "/tmp/custom-data");
        assert_eq!(loaded.runtime.default_turn_limit, 9);
    }

    #[test]
    fn storage_type_env_var_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        AppConfig::default().save_to(&path).unwrap();

        unsafe {
            env::set_var("AGENT_WORLD_STORAGE_TYPE", "sqlite");
        }
        let loaded = AppConfig::load_from(&path).unwrap();
        unsafe {
            env::remove_var("AGENT_WORLD_STORAGE_TYPE");
        }
        assert_eq!(loaded.storage.backend, StorageBackend::Sqlite);
    }

    #[test]
    fn provider_credentials_from_env_reads_all_documented_vars() {
        unsafe {
            env::set_var("OPENAI_API_KEY", "sk-test");
            env::set_var("OLLAMA_BASE_URL", "http://localhost:11434");
        }
        let creds = ProviderCredentials::from_env();
        unsafe {
            env::remove_var("OPENAI_API_KEY");
            env::remove_var("OLLAMA_BASE_URL");
        }
        assert_eq!(creds.openai_api_key.as_deref(), Some("sk-test"));
        assert_eq!(creds.ollama_base_url.as_deref(), Some("http://localhost:11434"));
    }
}
