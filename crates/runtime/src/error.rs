use thiserror::Error;

use agentworld_llm::LlmError;
use agentworld_storage::StorageError;

/// Typed runtime errors (`spec.md` §7). `NotFound` lookups are represented
/// as `Option<T>`/`bool` on the operations that can tolerate absence
/// (`restore_chat`, `get_world`) rather than as a variant here; operations
/// that must throw on absence (`delete_chat`) use [`RuntimeError::NotFound`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {kind} {id} already exists")]
    Conflict { kind: &'static str, id: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Provider(#[from] LlmError),

    #[error("subscription setup cancelled before listener attachment")]
    Cancelled,
}
