//! Subscription Manager (`spec.md` §4.2 "Subscription lifecycle"): hands a
//! client a stable `subscriptionId` bound to a world's live event streams,
//! and lets that binding survive a `refresh()` that swaps the underlying
//! [`WorldHandle`] out from under it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::instrument;
use uuid::Uuid;

use agentworld_eventbus::{recv_lossy, ActivityEvent, ListenerId, MessageEvent, SseEvent, SystemEvent, ToolEvent};

use crate::error::RuntimeError;
use crate::world::{WorldHandle, WorldRegistry};

/// Callbacks a client supplies when subscribing. Any field left `None` just
/// means that topic's forwarder task is never spawned.
#[derive(Clone, Default)]
pub struct ClientHooks {
    pub on_message: Option<Arc<dyn Fn(MessageEvent) + Send + Sync>>,
    pub on_sse: Option<Arc<dyn Fn(SseEvent) + Send + Sync>>,
    pub on_tool: Option<Arc<dyn Fn(ToolEvent) + Send + Sync>>,
    pub on_activity: Option<Arc<dyn Fn(ActivityEvent) + Send + Sync>>,
    pub on_system: Option<Arc<dyn Fn(SystemEvent) + Send + Sync>>,
}

struct Binding {
    message_listener: ListenerId,
    tasks: Vec<JoinHandle<()>>,
}

/// One client's live view of a world. `refresh`/`destroy` are the only
/// mutating operations; `subscription_id` never changes across a refresh.
pub struct Subscription {
    pub subscription_id: Uuid,
    pub world_id: Uuid,
    chat_id: Mutex<Option<Uuid>>,
    hooks: ClientHooks,
    registry: Arc<WorldRegistry>,
    binding: Mutex<Option<Binding>>,
}

impl Subscription {
    pub async fn chat_id(&self) -> Option<Uuid> {
        *self.chat_id.lock().await
    }

    async fn bind(&self, handle: &Arc<WorldHandle>) {
        let (listener_id, mut message_rx) = handle.bus.subscribe_message().await;
        let mut tasks = Vec::new();

        if let Some(on_message) = self.hooks.on_message.clone() {
            let chat_filter = self.chat_id.lock().await.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = message_rx.recv().await {
                    if chat_filter.map_or(true, |id| id == event.chat_id) {
                        on_message(event);
                    }
                }
            }));
        } else {
            tasks.push(tokio::spawn(async move { while message_rx.recv().await.is_some() {} }));
        }

        if let Some(on_sse) = self.hooks.on_sse.clone() {
            let mut rx = handle.bus.subscribe_sse();
            let chat_filter = self.chat_id.lock().await.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = recv_lossy(&mut rx, "sse").await {
                    if chat_filter.map_or(true, |id| Some(id) == event.chat_id) {
                        on_sse(event);
                    }
                }
            }));
        }

        if let Some(on_tool) = self.hooks.on_tool.clone() {
            let mut rx = handle.bus.subscribe_tool();
            let chat_filter = self.chat_id.lock().await.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = recv_lossy(&mut rx, "tool").await {
                    if chat_filter.map_or(true, |id| Some(id) == event.chat_id) {
                        on_tool(event);
                    }
                }
            }));
        }

        if let Some(on_activity) = self.hooks.on_activity.clone() {
            let mut rx = handle.bus.subscribe_activity();
            let chat_filter = self.chat_id.lock().await.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = recv_lossy(&mut rx, "activity").await {
                    if chat_filter.map_or(true, |id| Some(id) == event.chat_id) {
                        on_activity(event);
                    }
                }
            }));
        }

        if let Some(on_system) = self.hooks.on_system.clone() {
            let mut rx = handle.bus.subscribe_system();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = recv_lossy(&mut rx, "system").await {
                    on_system(event);
                }
            }));
        }

        *self.binding.lock().await = Some(Binding { message_listener: listener_id, tasks });
    }

    async fn unbind(&self, handle: &Arc<WorldHandle>) {
        if let Some(binding) = self.binding.lock().await.take() {
            for task in binding.tasks {
                task.abort();
            }
            handle.bus.unsubscribe_message(binding.message_listener).await;
        }
    }

    /// Detaches listeners from the current world instance, reloads it from
    /// storage, and rebinds under the same `subscription_id`. Returns
    /// `Some(warning)` on a best-effort rebind problem instead of failing
    /// the whole operation (`spec.md` §4.2 "refresh never throws").
    #[instrument(skip(self), fields(subscription_id = %self.subscription_id))]
    pub async fn refresh(&self) -> Option<String> {
        let old = match self.registry.current(self.world_id).await {
            Ok(handle) => handle,
            Err(err) => return Some(format!("could not resolve current world instance: {err}")),
        };
        self.unbind(&old).await;

        let fresh = match self.registry.refresh(self.world_id).await {
            Ok(handle) => handle,
            Err(err) => return Some(format!("refresh failed, leaving subscription detached: {err}")),
        };

        *self.chat_id.lock().await = fresh.record.current_chat_id;
        self.bind(&fresh).await;
        None
    }

    pub async fn destroy(&self) {
        if let Ok(handle) = self.registry.current(self.world_id).await {
            self.unbind(&handle).await;
        }
        self.registry.release(self.world_id).await;
    }
}

/// Owns every active [`Subscription`], keyed by `subscriptionId`.
pub struct SubscriptionManager {
    registry: Arc<WorldRegistry>,
    subscriptions: Mutex<std::collections::HashMap<Uuid, Arc<Subscription>>>,
}

impl SubscriptionManager {
    pub fn new(registry: Arc<WorldRegistry>) -> Self {
        Self { registry, subscriptions: Mutex::new(std::collections::HashMap::new()) }
    }

    /// Subscribes to `world_id`, optionally reusing an existing
    /// `subscription_id`. Re-subscribing the same id for the same
    /// world+chat is an idempotent no-op. `cancelled` is polled once right
    /// before listeners attach; if it's already set, no listener is created
    /// and the acquired world ref is released immediately.
    pub async fn subscribe(
        &self,
        subscription_id: Option<Uuid>,
        world_id: Uuid,
        chat_id: Option<Uuid>,
        hooks: ClientHooks,
        cancelled: &AtomicBool,
    ) -> Result<Arc<Subscription>, RuntimeError> {
        if let Some(id) = subscription_id {
            if let Some(existing) = self.subscriptions.lock().await.get(&id).cloned() {
                if existing.world_id == world_id && existing.chat_id().await == chat_id {
                    return Ok(existing);
                }
            }
        }

        let handle = self.registry.acquire(world_id).await?;
        if cancelled.load(Ordering::SeqCst) {
            self.registry.release(world_id).await;
            return Err(RuntimeError::Cancelled);
        }

        let subscription = Arc::new(Subscription {
            subscription_id: subscription_id.unwrap_or_else(Uuid::new_v4),
            world_id,
            chat_id: Mutex::new(chat_id),
            hooks,
            registry: self.registry.clone(),
            binding: Mutex::new(None),
        });
        subscription.bind(&handle).await;

        self.subscriptions.lock().await.insert(subscription.subscription_id, subscription.clone());
        Ok(subscription)
    }

    pub async fn refresh(&self, subscription_id: Uuid) -> Result<Option<String>, RuntimeError> {
        let subscription = self
            .subscriptions
            .lock()
            .await
            .get(&subscription_id)
            .cloned()
            .ok_or(RuntimeError::NotFound { kind: "subscription", id: subscription_id.to_string() })?;
        Ok(subscription.refresh().await)
    }

    pub async fn destroy(&self, subscription_id: Uuid) {
        if let Some(subscription) = self.subscriptions.lock().await.remove(&subscription_id) {
            subscription.destroy().await;
        }
    }
}
