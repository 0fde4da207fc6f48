//! The programmatic API surface (`spec.md` §6): the one entry point a host
//! process (CLI, HTTP server, desktop shell) drives. Every operation here is
//! a thin wrapper over `storage`/`chat`/`mutation`/`subscription` — this
//! module exists to give external callers one object to hold instead of
//! wiring the pieces together themselves.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use agentworld_config::ProviderCredentials;
use agentworld_eventbus::MessageEvent;
use agentworld_storage::{AgentRecord, AgentStatus, Storage, WorldRecord};

use crate::chat::{self, ChatSummary};
use crate::error::RuntimeError;
use crate::message::record_message;
use crate::mutation::{self, RemovalResult};
use crate::subscription::{ClientHooks, Subscription, SubscriptionManager};
use crate::world::WorldRegistry;

/// Parameters for creating a world; unset fields take the spec's defaults.
#[derive(Debug, Clone, Default)]
pub struct NewWorld {
    pub name: String,
    pub description: String,
    pub turn_limit: Option<u32>,
    pub chat_llm_provider: Option<String>,
    pub chat_llm_model: Option<String>,
    pub variables: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewAgent {
    pub name: String,
    pub agent_type: String,
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub auto_reply: bool,
}

/// The engine: owns storage, the provider credential set, and the live
/// [`WorldRegistry`]/[`SubscriptionManager`] pair.
pub struct Engine {
    storage: Arc<dyn Storage>,
    default_turn_limit: u32,
    registry: Arc<WorldRegistry>,
    subscriptions: SubscriptionManager,
}

impl Engine {
    pub fn new(storage: Arc<dyn Storage>, credentials: ProviderCredentials, default_turn_limit: u32, llm_timeout_secs: u64) -> Self {
        let registry = Arc::new(WorldRegistry::new(storage.clone(), credentials, llm_timeout_secs));
        let subscriptions = SubscriptionManager::new(registry.clone());
        Self { storage, default_turn_limit, registry, subscriptions }
    }

    pub async fn create_world(&self, new_world: NewWorld) -> Result<WorldRecord, RuntimeError> {
        let now = Utc::now();
        let world = WorldRecord {
            id: Uuid::new_v4(),
            name: new_world.name,
            description: new_world.description,
            turn_limit: new_world.turn_limit.unwrap_or(self.default_turn_limit),
            current_chat_id: None,
            chat_llm_provider: new_world.chat_llm_provider,
            chat_llm_model: new_world.chat_llm_model,
            mcp_config: None,
            variables: new_world.variables,
            agents: Default::default(),
            created_at: now,
            last_updated: now,
        };
        self.storage.save_world(&world).await?;
        Ok(world)
    }

    pub async fn update_world(&self, mut world: WorldRecord) -> Result<WorldRecord, RuntimeError> {
        world.last_updated = Utc::now();
        self.storage.save_world(&world).await?;
        if self.registry.is_resident(world.id).await {
            self.registry.refresh(world.id).await?;
        }
        Ok(world)
    }

    pub async fn delete_world(&self, world_id: Uuid) -> Result<(), RuntimeError> {
        self.storage.delete_world(world_id).await?;
        Ok(())
    }

    pub async fn list_worlds(&self) -> Result<Vec<WorldRecord>, RuntimeError> {
        Ok(self.storage.list_worlds().await?)
    }

    pub async fn get_world(&self, world_id: Uuid) -> Result<Option<WorldRecord>, RuntimeError> {
        Ok(self.storage.load_world(world_id).await?)
    }

    pub async fn create_agent(&self, world_id: Uuid, new_agent: NewAgent) -> Result<AgentRecord, RuntimeError> {
        let mut world = self
            .storage
            .load_world(world_id)
            .await?
            .ok_or(RuntimeError::NotFound { kind: "world", id: world_id.to_string() })?;

        let now = Utc::now();
        let agent = AgentRecord {
            id: Uuid::new_v4(),
            world_id,
            name: new_agent.name,
            agent_type: new_agent.agent_type,
            provider: new_agent.provider,
            model: new_agent.model,
            system_prompt: new_agent.system_prompt,
            temperature: new_agent.temperature,
            max_tokens: new_agent.max_tokens,
            auto_reply: new_agent.auto_reply,
            status: AgentStatus::Inactive,
            llm_call_count: 0,
            last_llm_call: None,
            created_at: now,
            last_active: now,
        };
        self.storage.save_agent(&agent).await?;

        world.agents.insert(agent.id);
        world.last_updated = now;
        self.storage.save_world(&world).await?;

        if self.registry.is_resident(world_id).await {
            self.registry.refresh(world_id).await?;
        }
        Ok(agent)
    }

    pub async fn update_agent(&self, mut agent: AgentRecord) -> Result<AgentRecord, RuntimeError> {
        agent.last_active = Utc::now();
        self.storage.save_agent(&agent).await?;
        if self.registry.is_resident(agent.world_id).await {
            self.registry.refresh(agent.world_id).await?;
        }
        Ok(agent)
    }

    pub async fn delete_agent(&self, world_id: Uuid, agent_id: Uuid) -> Result<(), RuntimeError> {
        self.storage.delete_agent(world_id, agent_id).await?;
        if let Some(mut world) = self.storage.load_world(world_id).await? {
            world.agents.remove(&agent_id);
            world.last_updated = Utc::now();
            self.storage.save_world(&world).await?;
        }
        if self.registry.is_resident(world_id).await {
            self.registry.refresh(world_id).await?;
        }
        Ok(())
    }

    pub async fn new_chat(&self, world_id: Uuid, name: Option<String>) -> Result<(WorldRecord, agentworld_storage::ChatRecord), RuntimeError> {
        let result = chat::new_chat(self.storage.as_ref(), world_id, name).await?;
        if self.registry.is_resident(world_id).await {
            self.registry.refresh(world_id).await?;
        }
        Ok(result)
    }

    pub async fn restore_chat(&self, world_id: Uuid, chat_id: Uuid) -> Result<Option<WorldRecord>, RuntimeError> {
        let result = chat::restore_chat(self.storage.as_ref(), world_id, chat_id).await?;
        if result.is_some() && self.registry.is_resident(world_id).await {
            self.registry.refresh(world_id).await?;
        }
        Ok(result)
    }

    pub async fn delete_chat(&self, world_id: Uuid, chat_id: Uuid) -> Result<(), RuntimeError> {
        chat::delete_chat(self.storage.as_ref(), world_id, chat_id).await?;
        if self.registry.is_resident(world_id).await {
            self.registry.refresh(world_id).await?;
        }
        Ok(())
    }

    pub async fn list_chats(&self, world_id: Uuid) -> Result<Vec<ChatSummary>, RuntimeError> {
        chat::list_chats(self.storage.as_ref(), world_id).await
    }

    pub async fn get_memory(&self, world_id: Uuid, agent_id: Uuid, chat_id: Option<Uuid>) -> Result<Vec<agentworld_storage::AgentMessage>, RuntimeError> {
        let memory = self.storage.load_agent_memory(world_id, agent_id).await?;
        Ok(match chat_id {
            Some(chat_id) => memory.into_iter().filter(|m| m.chat_id == chat_id).collect(),
            None => memory,
        })
    }

    /// Persists `content` as a new message and publishes it on the world's
    /// event bus, fanning it into every agent's mailbox.
    pub async fn publish_message(
        &self,
        world_id: Uuid,
        sender: &str,
        role: agentworld_eventbus::MessageRole,
        content: &str,
        chat_id: Option<Uuid>,
        reply_to: Option<Uuid>,
    ) -> Result<MessageEvent, RuntimeError> {
        let mut handle = self.registry.current(world_id).await?;
        let chat_id = match chat_id.or(handle.record.current_chat_id) {
            Some(id) => id,
            None => {
                let (_, chat) = chat::new_chat(self.storage.as_ref(), world_id, None).await?;
                if self.registry.is_resident(world_id).await {
                    handle = self.registry.refresh(world_id).await?;
                }
                chat.id
            }
        };

        let event = MessageEvent {
            message_id: Uuid::new_v4(),
            chat_id,
            role,
            sender: sender.to_string(),
            content: content.to_string(),
            reply_to_message_id: reply_to,
            created_at: Utc::now(),
        };
        let agent_ids: Vec<Uuid> = handle.agent_ids().collect();
        record_message(self.storage.as_ref(), &handle.bus, agent_ids, event.clone()).await?;
        Ok(event)
    }

    pub async fn remove_messages_from(&self, world_id: Uuid, chat_id: Uuid, message_id: Uuid) -> Result<RemovalResult, RuntimeError> {
        Ok(mutation::remove_messages_from(self.storage.as_ref(), world_id, chat_id, message_id).await?)
    }

    pub async fn subscribe_world(
        &self,
        subscription_id: Option<Uuid>,
        world_id: Uuid,
        chat_id: Option<Uuid>,
        hooks: ClientHooks,
        cancelled: &std::sync::atomic::AtomicBool,
    ) -> Result<Arc<Subscription>, RuntimeError> {
        self.subscriptions.subscribe(subscription_id, world_id, chat_id, hooks, cancelled).await
    }

    pub async fn refresh_subscription(&self, subscription_id: Uuid) -> Result<Option<String>, RuntimeError> {
        self.subscriptions.refresh(subscription_id).await
    }

    pub async fn destroy_subscription(&self, subscription_id: Uuid) {
        self.subscriptions.destroy(subscription_id).await;
    }

    pub fn add_log_stream_callback(&self, callback: impl Fn(agentworld_eventbus::LogRecord) + Send + Sync + 'static) -> agentworld_eventbus::LogStreamSubscription {
        agentworld_eventbus::LogStream::global().add_callback(callback)
    }

    /// `configureLLMProvider` (`spec.md` §6): overwrites the process-wide
    /// provider credential set used to build adapters. Resident worlds keep
    /// running on their already-spawned agent actors' credentials until
    /// their next `refresh`; new adapter builds (including on worlds loaded
    /// for the first time after this call) see the new credentials.
    pub async fn configure_llm_provider(&self, credentials: ProviderCredentials) {
        self.registry.configure_credentials(credentials).await;
    }
}
