//! A stub [`ProviderAdapter`] that streams its input back, word by word,
//! with no network I/O. Used by runtime/pipeline tests that need a real
//! adapter (not a mock) to drive end to end, and by `aw-cli`'s smoke-test
//! binary (`spec.md` §10.5 "test tooling").

use async_trait::async_trait;
use futures::stream;

use crate::error::LlmError;
use crate::provider::{ProviderAdapter, ProviderEventStream};
use crate::wire::{ChatMessage, ChatRole, PipelineOptions, ProviderEvent, TokenUsage, ToolDefinition};

/// Echoes the content of the last `user` message in `messages`, split into
/// whitespace-delimited chunks so callers can observe multiple
/// `sse{chunk}` events per turn the way a real streaming provider would.
#[derive(Debug, Default)]
pub struct EchoAdapter;

#[async_trait]
impl ProviderAdapter for EchoAdapter {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn stream(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
        _opts: &PipelineOptions,
    ) -> Result<ProviderEventStream, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, ChatRole::User))
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let words: Vec<String> = last_user.split_whitespace().map(str::to_string).collect();
        let input_tokens = words.len() as u64;

        let mut events: Vec<Result<ProviderEvent, LlmError>> = Vec::with_capacity(words.len() + 1);
        for (index, word) in words.iter().enumerate() {
            let delta = if index == 0 { word.clone() } else { format!(" {word}") };
            events.push(Ok(ProviderEvent::TextDelta(delta)));
        }
        events.push(Ok(ProviderEvent::Finished {
            usage: Some(TokenUsage { input_tokens, output_tokens: input_tokens, total_tokens: input_tokens * 2 }),
        }));

        Ok(Box::pin(stream::iter(events)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn echoes_last_user_message_word_by_word() {
        let adapter = EchoAdapter;
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi there")];
        let mut stream = adapter.stream("any-model", &messages, &[], &PipelineOptions::default()).await.unwrap();

        let mut chunks = Vec::new();
        while let Some(event) = stream.next().await {
            if let ProviderEvent::TextDelta(delta) = event.unwrap() {
                chunks.push(delta);
            }
        }
        assert_eq!(chunks.join(""), "hi there");
    }
}
