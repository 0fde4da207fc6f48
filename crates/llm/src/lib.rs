//! Provider-agnostic streaming LLM pipeline: wire types, the
//! [`ProviderAdapter`] trait and its seven concrete adapters plus the
//! network-free [`EchoAdapter`], and the [`Pipeline`] that drives prompt
//! assembly, streaming, the tool-call loop, and the outer timeout
//! (`spec.md` §4.4).

mod anthropic;
mod echo;
mod error;
mod google;
mod ollama;
mod openai_compat;
mod pipeline;
mod provider;
mod sse;
pub mod wire;

use std::sync::Arc;

use agentworld_config::ProviderCredentials;
use serde::{Deserialize, Serialize};

pub use echo::EchoAdapter;
pub use error::LlmError;
pub use pipeline::{build_system_prompt, Pipeline, PipelineRequest, PipelineOutcome, ToolExecutor};
pub use provider::{ProviderAdapter, ProviderEventStream};
pub use wire::{ChatMessage, ChatRole, PipelineOptions, ProviderEvent, TokenUsage, ToolCallRequest, ToolDefinition};

use anthropic::AnthropicAdapter;
use google::GoogleAdapter;
use ollama::OllamaAdapter;
use openai_compat::{AuthStyle, OpenAiCompatAdapter};

/// The seven provider backends named in `spec.md` §4.4, plus `Echo`, a
/// network-free stub used by tests and the `aw-cli` smoke-test binary
/// (`spec.md` §10.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Google,
    XAi,
    AzureOpenAi,
    OpenAiCompatible,
    Ollama,
    Echo,
}

impl Provider {
    /// Parses an `Agent.provider` field, matching case-insensitively and
    /// accepting the handful of spellings seen across the corpus
    /// (`azure-openai`, `azure_openai`, `openai-compatible`, ...).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().replace('_', "-").as_str() {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            "google" | "gemini" => Some(Self::Google),
            "xai" | "grok" => Some(Self::XAi),
            "azure-openai" | "azure" => Some(Self::AzureOpenAi),
            "openai-compatible" | "compatible" => Some(Self::OpenAiCompatible),
            "ollama" => Some(Self::Ollama),
            "echo" => Some(Self::Echo),
            _ => None,
        }
    }
}

const XAI_BASE_URL: &str = "https://api.x.ai/v1/chat/completions";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Builds the concrete [`ProviderAdapter`] for `provider`, wiring up
/// credentials resolved by `agentworld-config`. Returns
/// [`LlmError::MissingCredentials`] up front for providers that need a key
/// which isn't configured, rather than failing on the first request.
pub fn build_adapter(provider: Provider, credentials: &ProviderCredentials) -> Result<Arc<dyn ProviderAdapter>, LlmError> {
    let adapter: Arc<dyn ProviderAdapter> = match provider {
        Provider::OpenAi => Arc::new(OpenAiCompatAdapter::new(
            "openai",
            OPENAI_BASE_URL,
            Some(require(credentials.openai_api_key.clone(), "openai")?),
            AuthStyle::Bearer,
            Vec::new(),
        )),
        Provider::XAi => Arc::new(OpenAiCompatAdapter::new(
            "xai",
            XAI_BASE_URL,
            Some(require(credentials.xai_api_key.clone(), "xai")?),
            AuthStyle::Bearer,
            Vec::new(),
        )),
        Provider::AzureOpenAi => {
            let resource = require(credentials.azure_resource_name.clone(), "azure-openai")?;
            let deployment = require(credentials.azure_deployment.clone(), "azure-openai")?;
            let api_version = credentials.azure_api_version.clone().unwrap_or_else(|| "2024-06-01".to_string());
            let chat_url = format!(
                "https://{resource}.openai.azure.com/openai/deployments/{deployment}/chat/completions?api-version={api_version}"
            );
            Arc::new(OpenAiCompatAdapter::new(
                "azure-openai",
                chat_url,
                Some(require(credentials.azure_openai_api_key.clone(), "azure-openai")?),
                AuthStyle::ApiKeyHeader,
                Vec::new(),
            ))
        }
        Provider::OpenAiCompatible => {
            let base_url = require(credentials.openai_compatible_base_url.clone(), "openai-compatible")?;
            let chat_url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
            Arc::new(OpenAiCompatAdapter::new(
                "openai-compatible",
                chat_url,
                credentials.openai_compatible_api_key.clone(),
                AuthStyle::Bearer,
                Vec::new(),
            ))
        }
        Provider::Anthropic => Arc::new(AnthropicAdapter::new(credentials.anthropic_api_key.clone())),
        Provider::Google => Arc::new(GoogleAdapter::new(credentials.google_api_key.clone())),
        Provider::Ollama => Arc::new(OllamaAdapter::new(credentials.ollama_base_url.clone())),
        Provider::Echo => Arc::new(EchoAdapter),
    };
    Ok(adapter)
}

fn require(value: Option<String>, provider: &'static str) -> Result<String, LlmError> {
    value.ok_or(LlmError::MissingCredentials(provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_spellings() {
        assert_eq!(Provider::parse("OpenAI"), Some(Provider::OpenAi));
        assert_eq!(Provider::parse("azure_openai"), Some(Provider::AzureOpenAi));
        assert_eq!(Provider::parse("gemini"), Some(Provider::Google));
        assert_eq!(Provider::parse("grok"), Some(Provider::XAi));
        assert_eq!(Provider::parse("nonsense"), None);
    }

    #[test]
    fn build_adapter_reports_missing_credentials_up_front() {
        let creds = ProviderCredentials::default();
        let err = build_adapter(Provider::OpenAi, &creds).unwrap_err();
        assert!(matches!(err, LlmError::MissingCredentials("openai")));
    }

    #[test]
    fn ollama_never_requires_credentials() {
        let creds = ProviderCredentials::default();
        assert!(build_adapter(Provider::Ollama, &creds).is_ok());
    }

    #[test]
    fn echo_never_requires_credentials() {
        let creds = ProviderCredentials::default();
        assert!(build_adapter(Provider::Echo, &creds).is_ok());
    }
}
