//! The Agent Runtime actor (`spec.md` §4.2): one dedicated task per agent,
//! draining its message-topic mailbox serially, so a slow LLM call never
//! blocks another agent's turn and two messages for the same agent are
//! never processed out of order or concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, instrument, warn};
use uuid::Uuid;

use agentworld_config::ProviderCredentials;
use agentworld_eventbus::{
    ActivityEvent, ActivityEventType, MessageEvent, MessageRole as BusRole, WorldEventBus,
};
use agentworld_llm::{build_adapter, ChatMessage, Pipeline, PipelineOptions, PipelineRequest, Provider};
use agentworld_storage::{AgentRecord, AgentStatus, Storage};

use crate::mention::{ensure_mention_if_prompted_by_agent, strip_self_mentions, turn_limit_message};
use crate::message::record_message;
use crate::respond::{self, Decision};

/// A handle to a spawned agent actor. Dropping the owning [`crate::world::WorldHandle`]
/// aborts it via [`Self::shutdown`].
pub struct AgentActor {
    agent_id: Uuid,
    handle: JoinHandle<()>,
}

impl AgentActor {
    pub fn spawn(
        storage: Arc<dyn Storage>,
        credentials: ProviderCredentials,
        timeout_secs: u64,
        bus: Arc<WorldEventBus>,
        turn_limit: u32,
        world_agent_ids: Arc<Vec<Uuid>>,
        world_variables: Arc<HashMap<String, String>>,
        record: AgentRecord,
    ) -> Self {
        let agent_id = record.id;
        let handle = tokio::spawn(run_actor(storage, credentials, timeout_secs, bus, turn_limit, world_agent_ids, world_variables, record));
        Self { agent_id, handle }
    }

    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    pub fn shutdown(self) {
        self.handle.abort();
    }
}

async fn run_actor(
    storage: Arc<dyn Storage>,
    credentials: ProviderCredentials,
    timeout_secs: u64,
    bus: Arc<WorldEventBus>,
    turn_limit: u32,
    world_agent_ids: Arc<Vec<Uuid>>,
    world_variables: Arc<HashMap<String, String>>,
    mut agent: AgentRecord,
) {
    let (listener_id, mut rx) = bus.subscribe_message().await;
    // Tracks whether the one-time turn-limit notice has already fired since
    // the last reset, so a flood of messages past the limit doesn't spam it.
    let mut turn_limit_notified = false;

    while let Some(message) = rx.recv().await {
        let pre_reset_count = agent.llm_call_count;
        let decision = respond::evaluate(&mut agent, turn_limit, &message);
        if agent.llm_call_count != pre_reset_count {
            turn_limit_notified = false;
        }

        match decision {
            Decision::Ignore => {
                if agent.llm_call_count != pre_reset_count {
                    persist_agent(&storage, &agent).await;
                }
            }
            Decision::TurnLimitReached => {
                if !turn_limit_notified {
                    turn_limit_notified = true;
                    let notice = MessageEvent {
                        message_id: Uuid::new_v4(),
                        chat_id: message.chat_id,
                        role: BusRole::System,
                        sender: "world".to_string(),
                        content: turn_limit_message(&agent.name, turn_limit),
                        reply_to_message_id: Some(message.message_id),
                        created_at: Utc::now(),
                    };
                    if let Err(err) = record_message(storage.as_ref(), &bus, world_agent_ids.iter().copied(), notice).await {
                        warn!(agent = %agent.name, error = %err, "failed to record turn-limit notice");
                    }
                }
            }
            Decision::Respond => {
                respond_once(
                    &storage,
                    &credentials,
                    timeout_secs,
                    &bus,
                    turn_limit,
                    &world_agent_ids,
                    &world_variables,
                    &mut agent,
                    &message,
                )
                .await;
            }
        }
    }

    bus.unsubscribe_message(listener_id).await;
}

#[instrument(skip_all, fields(agent = %agent.name, message_id = %incoming.message_id))]
#[allow(clippy::too_many_arguments)]
async fn respond_once(
    storage: &Arc<dyn Storage>,
    credentials: &ProviderCredentials,
    timeout_secs: u64,
    bus: &Arc<WorldEventBus>,
    turn_limit: u32,
    world_agent_ids: &Arc<Vec<Uuid>>,
    world_variables: &Arc<HashMap<String, String>>,
    agent: &mut AgentRecord,
    incoming: &MessageEvent,
) {
    let _ = turn_limit;
    agent.status = AgentStatus::Active;
    agent.llm_call_count += 1;
    agent.last_llm_call = Some(Utc::now());
    agent.last_active = Utc::now();
    persist_agent(storage, agent).await;

    bus.publish_activity(ActivityEvent {
        event_type: ActivityEventType::ResponseStart,
        pending_operations: 1,
        activity_id: incoming.message_id.to_string(),
        source: agent.name.clone(),
        active_sources: vec![agent.name.clone()],
        chat_id: Some(incoming.chat_id),
    });

    let outcome = run_pipeline(storage, credentials, timeout_secs, bus, world_variables, agent, incoming).await;

    bus.publish_activity(ActivityEvent {
        event_type: ActivityEventType::ResponseEnd,
        pending_operations: 0,
        activity_id: incoming.message_id.to_string(),
        source: agent.name.clone(),
        active_sources: Vec::new(),
        chat_id: Some(incoming.chat_id),
    });

    match outcome {
        Ok(reply_content) if !reply_content.trim().is_empty() => {
            let original_sender_is_agent = !incoming.sender.eq_ignore_ascii_case("human") && !matches!(incoming.role, BusRole::System);
            let cleaned = strip_self_mentions(&reply_content, &agent.name);
            let content = ensure_mention_if_prompted_by_agent(&cleaned, &incoming.sender, original_sender_is_agent);

            let reply = MessageEvent {
                message_id: Uuid::new_v4(),
                chat_id: incoming.chat_id,
                role: BusRole::Assistant,
                sender: agent.name.clone(),
                content,
                reply_to_message_id: Some(incoming.message_id),
                created_at: Utc::now(),
            };
            if let Err(err) = record_message(storage.as_ref(), bus, world_agent_ids.iter().copied(), reply).await {
                error!(agent = %agent.name, error = %err, "failed to record agent reply");
                agent.status = AgentStatus::Error;
            } else {
                agent.status = AgentStatus::Inactive;
            }
        }
        Ok(_) => {
            agent.status = AgentStatus::Inactive;
        }
        Err(err) => {
            warn!(agent = %agent.name, error = %err, "llm pipeline failed");
            agent.status = AgentStatus::Error;
        }
    }
    agent.last_active = Utc::now();
    persist_agent(storage, agent).await;
}

async fn run_pipeline(
    storage: &Arc<dyn Storage>,
    credentials: &ProviderCredentials,
    timeout_secs: u64,
    bus: &Arc<WorldEventBus>,
    world_variables: &Arc<HashMap<String, String>>,
    agent: &AgentRecord,
    incoming: &MessageEvent,
) -> Result<String, agentworld_llm::LlmError> {
    let provider = Provider::parse(&agent.provider).ok_or(agentworld_llm::LlmError::MissingCredentials("unknown-provider"))?;
    let adapter = build_adapter(provider, credentials)?;
    let pipeline = Pipeline::with_timeout(adapter, timeout_secs);

    // `incoming` is already persisted to every agent's memory by `record_message`
    // before this actor dequeues it, so it must be excluded here: the pipeline
    // appends it itself as the triggering user message (`PipelineRequest::user_message`).
    let memory = storage
        .load_agent_memory(bus.world_id(), agent.id)
        .await
        .map(|messages| {
            messages
                .into_iter()
                .filter(|m| m.chat_id == incoming.chat_id && m.message_id != incoming.message_id)
                .map(to_chat_message)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let no_tools: Vec<agentworld_llm::ToolDefinition> = Vec::new();
    let request = PipelineRequest {
        message_id: incoming.message_id,
        chat_id: incoming.chat_id,
        agent_name: &agent.name,
        system_prompt: &agent.system_prompt,
        variables: world_variables.as_ref(),
        working_directory: None,
        memory: &memory,
        user_message: &incoming.content,
        tools: &no_tools,
        options: PipelineOptions { temperature: agent.temperature, max_tokens: agent.max_tokens },
    };

    let outcome = pipeline.run(&agent.model, bus.as_ref(), None, request).await?;
    Ok(outcome.content)
}

fn to_chat_message(message: agentworld_storage::AgentMessage) -> ChatMessage {
    use agentworld_storage::MessageRole;
    match message.role {
        MessageRole::System => ChatMessage::system(message.content),
        MessageRole::User => ChatMessage::user(message.content),
        MessageRole::Assistant => ChatMessage::assistant(message.content),
        MessageRole::Tool => ChatMessage::tool_result(message.tool_call_id.unwrap_or_default(), message.content),
    }
}

async fn persist_agent(storage: &Arc<dyn Storage>, agent: &AgentRecord) {
    if let Err(err) = storage.save_agent(agent).await {
        warn!(agent = %agent.name, error = %err, "failed to persist agent state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_every_storage_role() {
        let base = agentworld_storage::AgentMessage {
            message_id: Uuid::new_v4(),
            chat_id: Uuid::new_v4(),
            role: agentworld_storage::MessageRole::Tool,
            sender: "calc".to_string(),
            content: "42".to_string(),
            created_at: Utc::now(),
            reply_to_message_id: None,
            tool_call_id: Some("call-1".to_string()),
            usage: None,
        };
        let converted = to_chat_message(base);
        assert!(matches!(converted.role, agentworld_llm::ChatRole::Tool));
        assert_eq!(converted.tool_call_id.as_deref(), Some("call-1"));
    }
}
