use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::LlmError;
use crate::wire::{ChatMessage, PipelineOptions, ProviderEvent, ToolDefinition};

pub type ProviderEventStream = Pin<Box<dyn Stream<Item = Result<ProviderEvent, LlmError>> + Send>>;

/// One LLM backend. Every variant in `spec.md` §4.4 maps to exactly one
/// `ProviderAdapter` implementation; agents select a provider by name and
/// the pipeline looks up the matching adapter via [`crate::build_adapter`].
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a streaming chat completion. The returned stream yields deltas
    /// in provider-arrival order and terminates after exactly one
    /// `ProviderEvent::Finished`, a transport error, or cancellation of the
    /// returned stream (dropping it releases the adapter's network handle).
    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        opts: &PipelineOptions,
    ) -> Result<ProviderEventStream, LlmError>;
}
