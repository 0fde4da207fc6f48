use thiserror::Error;

/// Failure surfaced by a provider adapter or the pipeline wrapped around it.
/// The pipeline reports every variant to callers as `sse{error}`; `Timeout`
/// carries a distinct reason code so subscribers can tell the two apart.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider {provider} returned {status}: {body}")]
    Provider {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("failed to decode provider response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("missing credentials for provider {0}")]
    MissingCredentials(&'static str),

    #[error("pipeline timed out after {0}s")]
    Timeout(u64),

    #[error("pipeline cancelled")]
    Cancelled,
}
