//! Chat Manager (`spec.md` §4.5): creating, restoring, deleting, and
//! listing a world's chats. `messageCount` is always derived from persisted
//! memory at read time, never cached on the `ChatRecord`.

use std::collections::HashSet;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use agentworld_storage::{ChatRecord, Storage, WorldRecord};

use crate::error::RuntimeError;

#[derive(Debug, Clone, Serialize)]
pub struct ChatSummary {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
    pub message_count: u64,
}

async fn require_world(storage: &dyn Storage, world_id: Uuid) -> Result<WorldRecord, RuntimeError> {
    storage
        .load_world(world_id)
        .await?
        .ok_or(RuntimeError::NotFound { kind: "world", id: world_id.to_string() })
}

/// Creates a new chat and makes it `World.currentChatId`.
pub async fn new_chat(storage: &dyn Storage, world_id: Uuid, name: Option<String>) -> Result<(WorldRecord, ChatRecord), RuntimeError> {
    let mut world = require_world(storage, world_id).await?;
    let now = Utc::now();
    let chat = ChatRecord {
        id: Uuid::new_v4(),
        world_id,
        name: name.unwrap_or_else(|| format!("Chat {}", now.format("%Y-%m-%d %H:%M:%S"))),
        description: None,
        created_at: now,
        updated_at: now,
    };
    storage.save_chat(&chat).await?;

    world.current_chat_id = Some(chat.id);
    world.last_updated = now;
    storage.save_world(&world).await?;

    Ok((world, chat))
}

/// Restores a previously created chat as the current one. Returns `None`
/// when either the world or the chat doesn't exist, rather than throwing,
/// since "restore a chat that no longer exists" is an expected race in a
/// multi-client setting.
pub async fn restore_chat(storage: &dyn Storage, world_id: Uuid, chat_id: Uuid) -> Result<Option<WorldRecord>, RuntimeError> {
    let Some(mut world) = storage.load_world(world_id).await? else {
        return Ok(None);
    };
    if storage.load_chat_data(world_id, chat_id).await?.is_none() {
        return Ok(None);
    }
    world.current_chat_id = Some(chat_id);
    world.last_updated = Utc::now();
    storage.save_world(&world).await?;
    Ok(Some(world))
}

/// Deletes a chat and scrubs it from every agent's private memory,
/// preserving all other chats untouched. Throws [`RuntimeError::NotFound`]
/// if the world doesn't exist; deleting an already-absent chat id is a
/// no-op that still succeeds.
pub async fn delete_chat(storage: &dyn Storage, world_id: Uuid, chat_id: Uuid) -> Result<(), RuntimeError> {
    let mut world = require_world(storage, world_id).await?;

    for agent in storage.list_agents(world_id).await? {
        let memory = storage.load_agent_memory(world_id, agent.id).await?;
        let filtered: Vec<_> = memory.into_iter().filter(|m| m.chat_id != chat_id).collect();
        storage.save_agent_memory(world_id, agent.id, &filtered).await?;
    }

    storage.delete_chat(world_id, chat_id).await?;

    if world.current_chat_id == Some(chat_id) {
        world.current_chat_id = None;
    }
    world.last_updated = Utc::now();
    storage.save_world(&world).await?;
    Ok(())
}

/// Lists every chat in the world with a derived `messageCount`: the number
/// of distinct message ids tagged with that chat across all agent memories.
pub async fn list_chats(storage: &dyn Storage, world_id: Uuid) -> Result<Vec<ChatSummary>, RuntimeError> {
    require_world(storage, world_id).await?;
    let chats = storage.load_chats(world_id).await?;
    let agents = storage.list_agents(world_id).await?;

    let mut seen_per_chat: std::collections::HashMap<Uuid, HashSet<Uuid>> = std::collections::HashMap::new();
    for agent in &agents {
        for message in storage.load_agent_memory(world_id, agent.id).await? {
            seen_per_chat.entry(message.chat_id).or_default().insert(message.message_id);
        }
    }

    Ok(chats
        .into_iter()
        .map(|chat| {
            let message_count = seen_per_chat.get(&chat.id).map(|set| set.len() as u64).unwrap_or(0);
            ChatSummary {
                id: chat.id,
                name: chat.name,
                description: chat.description,
                created_at: chat.created_at,
                updated_at: chat.updated_at,
                message_count,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentworld_storage::file::FileStorage;
    use agentworld_storage::AgentRecord;

    async fn seeded_world(dir: &tempfile::TempDir) -> (FileStorage, Uuid) {
        let storage = FileStorage::new(dir.path());
        let world_id = Uuid::new_v4();
        let now = Utc::now();
        storage
            .save_world(&WorldRecord {
                id: world_id,
                name: "w".to_string(),
                description: String::new(),
                turn_limit: 5,
                current_chat_id: None,
                chat_llm_provider: None,
                chat_llm_model: None,
                mcp_config: None,
                variables: Default::default(),
                agents: Default::default(),
                created_at: now,
                last_updated: now,
            })
            .await
            .unwrap();
        (storage, world_id)
    }

    #[tokio::test]
    async fn new_chat_becomes_current() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, world_id) = seeded_world(&dir).await;
        let (world, chat) = new_chat(&storage, world_id, None).await.unwrap();
        assert_eq!(world.current_chat_id, Some(chat.id));
    }

    #[tokio::test]
    async fn delete_chat_preserves_other_chats_in_agent_memory() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, world_id) = seeded_world(&dir).await;
        let (_, chat_a) = new_chat(&storage, world_id, None).await.unwrap();
        let (_, chat_b) = new_chat(&storage, world_id, None).await.unwrap();

        let agent_id = Uuid::new_v4();
        let now = Utc::now();
        storage
            .save_agent(&AgentRecord {
                id: agent_id,
                world_id,
                name: "echo".to_string(),
                agent_type: "assistant".to_string(),
                provider: "ollama".to_string(),
                model: "llama3".to_string(),
                system_prompt: String::new(),
                temperature: None,
                max_tokens: None,
                auto_reply: false,
                status: agentworld_storage::AgentStatus::Inactive,
                llm_call_count: 0,
                last_llm_call: None,
                created_at: now,
                last_active: now,
            })
            .await
            .unwrap();

        let memory = vec![
            agentworld_storage::AgentMessage {
                message_id: Uuid::new_v4(),
                chat_id: chat_a.id,
                role: agentworld_storage::MessageRole::User,
                sender: "human".to_string(),
                content: "in A".to_string(),
                created_at: now,
                reply_to_message_id: None,
                tool_call_id: None,
                usage: None,
            },
            agentworld_storage::AgentMessage {
                message_id: Uuid::new_v4(),
                chat_id: chat_b.id,
                role: agentworld_storage::MessageRole::User,
                sender: "human".to_string(),
                content: "in B".to_string(),
                created_at: now,
                reply_to_message_id: None,
                tool_call_id: None,
                usage: None,
            },
        ];
        storage.save_agent_memory(world_id, agent_id, &memory).await.unwrap();

        delete_chat(&storage, world_id, chat_a.id).await.unwrap();

        let remaining = storage.load_agent_memory(world_id, agent_id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].chat_id, chat_b.id);
    }

    #[tokio::test]
    async fn restore_chat_returns_none_for_unknown_chat() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, world_id) = seeded_world(&dir).await;
        let result = restore_chat(&storage, world_id, Uuid::new_v4()).await.unwrap();
        assert!(result.is_none());
    }
}
