mod error;
pub mod file;
mod model;
pub mod sqlite;

pub use error::StorageError;
pub use model::{AgentMessage, AgentRecord, AgentStatus, ChatRecord, MessageRole, TokenUsage, WorldRecord};

use async_trait::async_trait;
use uuid::Uuid;

/// Pluggable persistence for worlds, agents, chats, and per-agent memory.
/// `FileStorage` and `SqliteStorage` both implement this with identical
/// observable semantics; a process picks exactly one at startup and never
/// mixes backends.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn save_world(&self, world: &WorldRecord) -> Result<(), StorageError>;
    async fn load_world(&self, world_id: Uuid) -> Result<Option<WorldRecord>, StorageError>;
    async fn delete_world(&self, world_id: Uuid) -> Result<(), StorageError>;
    async fn list_worlds(&self) -> Result<Vec<WorldRecord>, StorageError>;

    async fn save_agent(&self, agent: &AgentRecord) -> Result<(), StorageError>;
    async fn load_agent(
        &self,
        world_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Option<AgentRecord>, StorageError>;
    async fn delete_agent(&self, world_id: Uuid, agent_id: Uuid) -> Result<(), StorageError>;
    async fn list_agents(&self, world_id: Uuid) -> Result<Vec<AgentRecord>, StorageError>;

    async fn load_agent_memory(
        &self,
        world_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Vec<AgentMessage>, StorageError>;

    /// Full replacement of an agent's memory, archiving the prior contents
    /// first. Atomic: a crash mid-write must never leave a half-written
    /// memory file or a partially-committed transaction.
    async fn save_agent_memory(
        &self,
        world_id: Uuid,
        agent_id: Uuid,
        messages: &[AgentMessage],
    ) -> Result<(), StorageError>;

    async fn save_chat(&self, chat: &ChatRecord) -> Result<(), StorageError>;
    async fn load_chat_data(
        &self,
        world_id: Uuid,
        chat_id: Uuid,
    ) -> Result<Option<ChatRecord>, StorageError>;
    async fn load_chats(&self, world_id: Uuid) -> Result<Vec<ChatRecord>, StorageError>;
    async fn delete_chat(&self, world_id: Uuid, chat_id: Uuid) -> Result<(), StorageError>;
}
