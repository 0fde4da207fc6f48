//! Message Mutation (`spec.md` §4.6): `removeMessagesFrom` deletes a
//! message and everything after it *within one chat*, per agent, leaving
//! every other chat's history untouched.

use serde::Serialize;
use uuid::Uuid;

use agentworld_storage::{Storage, StorageError};

#[derive(Debug, Clone, Serialize)]
pub struct RemovalResult {
    pub success: bool,
    pub processed_agents: Vec<Uuid>,
    pub failed_agents: Vec<FailedAgent>,
    pub messages_removed_total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedAgent {
    pub agent_id: Uuid,
    pub reason: String,
}

/// Removes `message_id` and every later message in `chat_id` from each
/// agent's memory independently. An agent missing the target message
/// contributes zero removals rather than failing the whole operation; only
/// a storage error on a given agent counts as a per-agent failure, and one
/// agent's failure never stops the others from being processed.
pub async fn remove_messages_from(
    storage: &dyn Storage,
    world_id: Uuid,
    chat_id: Uuid,
    message_id: Uuid,
) -> Result<RemovalResult, agentworld_storage::StorageError> {
    let agents = storage.list_agents(world_id).await?;

    let mut processed = Vec::new();
    let mut failed = Vec::new();
    let mut total_removed = 0u64;

    for agent in agents {
        match remove_for_agent(storage, world_id, agent.id, chat_id, message_id).await {
            Ok(removed) => {
                processed.push(agent.id);
                total_removed += removed;
            }
            Err(err) => failed.push(FailedAgent { agent_id: agent.id, reason: err.to_string() }),
        }
    }

    Ok(RemovalResult {
        success: failed.is_empty(),
        processed_agents: processed,
        failed_agents: failed,
        messages_removed_total: total_removed,
    })
}

async fn remove_for_agent(
    storage: &dyn Storage,
    world_id: Uuid,
    agent_id: Uuid,
    chat_id: Uuid,
    message_id: Uuid,
) -> Result<u64, StorageError> {
    let memory = storage.load_agent_memory(world_id, agent_id).await?;
    let Some(target) = memory.iter().find(|m| m.message_id == message_id && m.chat_id == chat_id) else {
        return Ok(0);
    };
    let cutoff = target.created_at;

    let before = memory.len();
    let kept: Vec<_> = memory.into_iter().filter(|m| m.chat_id != chat_id || m.created_at < cutoff).collect();
    let removed = (before - kept.len()) as u64;

    storage.save_agent_memory(world_id, agent_id, &kept).await?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentworld_storage::file::FileStorage;
    use agentworld_storage::{AgentMessage, AgentRecord, AgentStatus, MessageRole};
    use chrono::{Duration, Utc};

    async fn agent_with_memory(storage: &FileStorage, world_id: Uuid, messages: Vec<AgentMessage>) -> Uuid {
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
                status: AgentStatus::Inactive,
                llm_call_count: 0,
                last_llm_call: None,
                created_at: now,
                last_active: now,
            })
            .await
            .unwrap();
        storage.save_agent_memory(world_id, agent_id, &messages).await.unwrap();
        agent_id
    }

    fn msg(chat_id: Uuid, content: &str, created_at: chrono::DateTime<Utc>) -> AgentMessage {
        AgentMessage {
            message_id: Uuid::new_v4(),
            chat_id,
            role: MessageRole::User,
            sender: "human".to_string(),
            content: content.to_string(),
            created_at,
            reply_to_message_id: None,
            tool_call_id: None,
            usage: None,
        }
    }

    #[tokio::test]
    async fn removes_target_and_everything_after_in_same_chat_only() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let world_id = Uuid::new_v4();
        let chat_a = Uuid::new_v4();
        let chat_b = Uuid::new_v4();
        let t0 = Utc::now();

        let m1 = msg(chat_a, "first", t0);
        let m2 = msg(chat_a, "second", t0 + Duration::seconds(1));
        let m3 = msg(chat_a, "third", t0 + Duration::seconds(2));
        let other_chat = msg(chat_b, "unrelated", t0 + Duration::seconds(1));

        let target_id = m2.message_id;
        let agent_id = agent_with_memory(&storage, world_id, vec![m1.clone(), m2, m3, other_chat.clone()]).await;

        let result = remove_messages_from(&storage, world_id, chat_a, target_id).await.unwrap();
        assert!(result.success);
        assert_eq!(result.messages_removed_total, 2);

        let remaining = storage.load_agent_memory(world_id, agent_id).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().any(|m| m.message_id == m1.message_id));
        assert!(remaining.iter().any(|m| m.message_id == other_chat.message_id));
    }

    #[tokio::test]
    async fn repeated_call_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let world_id = Uuid::new_v4();
        let chat_id = Uuid::new_v4();
        let t0 = Utc::now();
        let target = msg(chat_id, "target", t0);
        let target_id = target.message_id;
        agent_with_memory(&storage, world_id, vec![target]).await;

        let first = remove_messages_from(&storage, world_id, chat_id, target_id).await.unwrap();
        assert_eq!(first.messages_removed_total, 1);

        let second = remove_messages_from(&storage, world_id, chat_id, target_id).await.unwrap();
        assert_eq!(second.messages_removed_total, 0);
    }
}
