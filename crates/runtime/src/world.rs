//! In-memory world state: the live [`WorldEventBus`] and the set of running
//! agent actors for one world, plus the [`WorldRegistry`] that owns a
//! ref-counted [`WorldHandle`] per world id so the actors are spawned once
//! and released when the last subscription goes away (`spec.md` §5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, instrument};
use uuid::Uuid;

use agentworld_config::ProviderCredentials;
use agentworld_eventbus::WorldEventBus;
use agentworld_storage::{Storage, WorldRecord};

use crate::agent::AgentActor;
use crate::error::RuntimeError;

/// One world's live state: its current record snapshot, its event bus, and
/// the running agent actors. Replaced wholesale (never mutated in place) by
/// [`WorldRegistry::refresh`], so subscribers rebinding after a refresh are
/// guaranteed a consistent view.
pub struct WorldHandle {
    pub record: WorldRecord,
    pub bus: Arc<WorldEventBus>,
    agents: HashMap<Uuid, AgentActor>,
}

impl WorldHandle {
    async fn load(
        storage: &Arc<dyn Storage>,
        credentials: &ProviderCredentials,
        timeout_secs: u64,
        record: WorldRecord,
    ) -> Result<Arc<Self>, RuntimeError> {
        let bus = WorldEventBus::new(record.id);
        let agent_records = storage.list_agents(record.id).await?;
        let world_agent_ids = Arc::new(agent_records.iter().map(|a| a.id).collect::<Vec<_>>());
        let world_variables = Arc::new(record.variables.clone());
        let mut agents = HashMap::with_capacity(agent_records.len());
        for agent_record in agent_records {
            let actor = AgentActor::spawn(
                storage.clone(),
                credentials.clone(),
                timeout_secs,
                bus.clone(),
                record.turn_limit,
                world_agent_ids.clone(),
                world_variables.clone(),
                agent_record,
            );
            agents.insert(actor.agent_id(), actor);
        }
        Ok(Arc::new(Self { record, bus, agents }))
    }

    pub fn agent_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.agents.keys().copied()
    }
}

impl Drop for WorldHandle {
    fn drop(&mut self) {
        for (_, actor) in self.agents.drain() {
            actor.shutdown();
        }
    }
}

struct WorldSlot {
    handle: RwLock<Arc<WorldHandle>>,
    ref_count: AtomicUsize,
}

/// Owns every live [`WorldHandle`], keyed by world id. `acquire`/`release`
/// implement the ref-counted lifetime described in `spec.md` §5: the last
/// subscription to release a world tears its agent actors down; the next
/// `acquire` reloads it from storage.
pub struct WorldRegistry {
    storage: Arc<dyn Storage>,
    credentials: RwLock<ProviderCredentials>,
    timeout_secs: u64,
    worlds: RwLock<HashMap<Uuid, Arc<WorldSlot>>>,
}

impl WorldRegistry {
    pub fn new(storage: Arc<dyn Storage>, credentials: ProviderCredentials, timeout_secs: u64) -> Self {
        Self {
            storage,
            credentials: RwLock::new(credentials),
            timeout_secs,
            worlds: RwLock::new(HashMap::new()),
        }
    }

    async fn load_record(&self, world_id: Uuid) -> Result<WorldRecord, RuntimeError> {
        self.storage
            .load_world(world_id)
            .await?
            .ok_or(RuntimeError::NotFound { kind: "world", id: world_id.to_string() })
    }

    /// Returns the currently live handle for `world_id`, loading it from
    /// storage if it isn't already resident. Does not affect the ref count.
    pub async fn current(&self, world_id: Uuid) -> Result<Arc<WorldHandle>, RuntimeError> {
        if let Some(slot) = self.worlds.read().await.get(&world_id) {
            return Ok(slot.handle.read().await.clone());
        }
        let record = self.load_record(world_id).await?;
        let credentials = self.credentials.read().await.clone();
        let handle = WorldHandle::load(&self.storage, &credentials, self.timeout_secs, record).await?;
        let slot = Arc::new(WorldSlot { handle: RwLock::new(handle.clone()), ref_count: AtomicUsize::new(0) });
        self.worlds.write().await.entry(world_id).or_insert(slot);
        Ok(handle)
    }

    /// Loads the world if needed and increments its ref count; pairs with
    /// [`Self::release`].
    #[instrument(skip(self))]
    pub async fn acquire(&self, world_id: Uuid) -> Result<Arc<WorldHandle>, RuntimeError> {
        let handle = self.current(world_id).await?;
        if let Some(slot) = self.worlds.read().await.get(&world_id) {
            slot.ref_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(handle)
    }

    /// Decrements the ref count for `world_id`; tears the world down (and
    /// aborts its agent actors) once it reaches zero.
    #[instrument(skip(self))]
    pub async fn release(&self, world_id: Uuid) {
        let mut worlds = self.worlds.write().await;
        let drop_it = if let Some(slot) = worlds.get(&world_id) {
            slot.ref_count.fetch_sub(1, Ordering::SeqCst) <= 1
        } else {
            false
        };
        if drop_it {
            info!(%world_id, "last subscription released; tearing down world actors");
            worlds.remove(&world_id);
        }
    }

    /// Rebuilds the world from storage and atomically swaps it into the
    /// registry under the same ref count, tearing down the previous agent
    /// actors. Used by the Subscription Manager's `refresh` (`spec.md` §4.2).
    #[instrument(skip(self))]
    pub async fn refresh(&self, world_id: Uuid) -> Result<Arc<WorldHandle>, RuntimeError> {
        let record = self.load_record(world_id).await?;
        let credentials = self.credentials.read().await.clone();
        let fresh = WorldHandle::load(&self.storage, &credentials, self.timeout_secs, record).await?;

        let worlds = self.worlds.read().await;
        if let Some(slot) = worlds.get(&world_id) {
            let mut current = slot.handle.write().await;
            current.bus.detach_all().await;
            *current = fresh.clone();
        }
        Ok(fresh)
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub async fn credentials(&self) -> ProviderCredentials {
        self.credentials.read().await.clone()
    }

    /// Overwrites the live credential set used for any subsequent adapter
    /// build (`spec.md` §6 `configureLLMProvider`). Agents already mid-stream
    /// on an adapter built from the old credentials are unaffected; the new
    /// credentials take effect on each agent's next LLM call, since a fresh
    /// adapter is built from `self.credentials` on every turn.
    pub async fn configure_credentials(&self, credentials: ProviderCredentials) {
        *self.credentials.write().await = credentials;
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    /// True if `world_id` currently has a resident handle (regardless of
    /// ref count). Used by callers deciding whether a roster change
    /// (createAgent/deleteAgent) needs to rebuild a live world via
    /// [`Self::refresh`] or can rely on the next `acquire` to load fresh.
    pub async fn is_resident(&self, world_id: Uuid) -> bool {
        self.worlds.read().await.contains_key(&world_id)
    }
}
