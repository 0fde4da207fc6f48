//! Shared message-recording path: every persisted chat message — whether it
//! originates from `publishMessage`, an agent's reply, or a turn-limit
//! notice — goes through the same persist-then-publish sequence so the
//! Event Bus never announces a message that isn't durably in every agent's
//! memory yet.

use uuid::Uuid;

use agentworld_eventbus::{MessageEvent, WorldEventBus};
use agentworld_storage::{AgentMessage, Storage};

use crate::error::RuntimeError;
use crate::respond::storage_role_for;

pub async fn record_message(
    storage: &dyn Storage,
    bus: &WorldEventBus,
    agent_ids: impl IntoIterator<Item = Uuid>,
    event: MessageEvent,
) -> Result<(), RuntimeError> {
    let world_id = bus.world_id();
    let agent_message = AgentMessage {
        message_id: event.message_id,
        chat_id: event.chat_id,
        role: storage_role_for(&event.role),
        sender: event.sender.clone(),
        content: event.content.clone(),
        created_at: event.created_at,
        reply_to_message_id: event.reply_to_message_id,
        tool_call_id: None,
        usage: None,
    };

    for agent_id in agent_ids {
        let mut memory = storage.load_agent_memory(world_id, agent_id).await?;
        memory.push(agent_message.clone());
        storage.save_agent_memory(world_id, agent_id, &memory).await?;
    }

    bus.publish_message(event).await;
    Ok(())
}
