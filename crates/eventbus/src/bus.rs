use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::topics::{ActivityEvent, LogRecord, MessageEvent, SseEvent, SystemEvent, ToolEvent};

const MESSAGE_MAILBOX_CAPACITY: usize = 256;
const BROADCAST_CAPACITY: usize = 256;

pub type ListenerId = u64;

struct MessageListener {
    id: ListenerId,
    tx: mpsc::Sender<MessageEvent>,
}

/// Per-world typed emitter. `message` preserves delivery order by blocking
/// the publisher on a full listener mailbox; `sse`/`tool`/`activity`/
/// `system`/`log` are lossy broadcast channels that drop the oldest frame
/// (with a warning) under a slow consumer, since losing an intermediate
/// streaming chunk is recoverable but reordering chat history is not.
pub struct WorldEventBus {
    world_id: Uuid,
    next_listener_id: AtomicU64,
    message_listeners: RwLock<Vec<MessageListener>>,
    sse: broadcast::Sender<SseEvent>,
    tool: broadcast::Sender<ToolEvent>,
    activity: broadcast::Sender<ActivityEvent>,
    system: broadcast::Sender<SystemEvent>,
    log: broadcast::Sender<LogRecord>,
}

impl WorldEventBus {
    pub fn new(world_id: Uuid) -> Arc<Self> {
        Arc::new(Self {
            world_id,
            next_listener_id: AtomicU64::new(0),
            message_listeners: RwLock::new(Vec::new()),
            sse: broadcast::channel(BROADCAST_CAPACITY).0,
            tool: broadcast::channel(BROADCAST_CAPACITY).0,
            activity: broadcast::channel(BROADCAST_CAPACITY).0,
            system: broadcast::channel(BROADCAST_CAPACITY).0,
            log: broadcast::channel(BROADCAST_CAPACITY).0,
        })
    }

    pub fn world_id(&self) -> Uuid {
        self.world_id
    }

    /// Synchronous dispatch point for persisted chat messages. Blocks until
    /// every listener's mailbox has room, so two agents that both mailbox
    /// this message observe it in the same relative order it was published.
    pub async fn publish_message(&self, event: MessageEvent) {
        let listeners = self.message_listeners.read().await;
        for listener in listeners.iter() {
            if listener.tx.send(event.clone()).await.is_err() {
                warn!(world_id = %self.world_id, listener_id = listener.id, "message listener gone; will be pruned on next detach");
            }
        }
    }

    pub fn publish_sse(&self, event: SseEvent) {
        let _ = self.sse.send(event);
    }

    pub fn publish_tool(&self, event: ToolEvent) {
        let _ = self.tool.send(event);
    }

    pub fn publish_activity(&self, event: ActivityEvent) {
        let _ = self.activity.send(event);
    }

    pub fn publish_system(&self, event: SystemEvent) {
        let _ = self.system.send(event);
    }

    pub fn publish_log(&self, record: LogRecord) {
        let _ = self.log.send(record);
    }

    pub async fn subscribe_message(&self) -> (ListenerId, mpsc::Receiver<MessageEvent>) {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(MESSAGE_MAILBOX_CAPACITY);
        self.message_listeners
            .write()
            .await
            .push(MessageListener { id, tx });
        (id, rx)
    }

    pub async fn unsubscribe_message(&self, id: ListenerId) {
        self.message_listeners.write().await.retain(|l| l.id != id);
    }

    pub fn subscribe_sse(&self) -> broadcast::Receiver<SseEvent> {
        self.sse.subscribe()
    }

    pub fn subscribe_tool(&self) -> broadcast::Receiver<ToolEvent> {
        self.tool.subscribe()
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<ActivityEvent> {
        self.activity.subscribe()
    }

    pub fn subscribe_system(&self) -> broadcast::Receiver<SystemEvent> {
        self.system.subscribe()
    }

    pub fn subscribe_log(&self) -> broadcast::Receiver<LogRecord> {
        self.log.subscribe()
    }

    /// Detaches every listener. Used by the Subscription Manager when a
    /// refresh swaps this bus out: after this returns, no further event
    /// reaches a subscriber bound to the old bus.
    pub async fn detach_all(&self) {
        self.message_listeners.write().await.clear();
    }

    pub async fn message_listener_count(&self) -> usize {
        self.message_listeners.read().await.len()
    }
}

/// Drains a lossy broadcast receiver, logging and continuing past a lag
/// instead of surfacing it to the caller. Returns `None` once the sender
/// side is gone.
pub async fn recv_lossy<T: Clone>(
    rx: &mut broadcast::Receiver<T>,
    topic: &'static str,
) -> Option<T> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(topic, skipped, "broadcast receiver lagged; dropping oldest frames");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::{MessageRole, SseEvent, SseEventType};
    use chrono::Utc;

    fn sample_message() -> MessageEvent {
        MessageEvent {
            message_id: Uuid::new_v4(),
            chat_id: Uuid::new_v4(),
            role: MessageRole::User,
            sender: "human".to_string(),
            content: "hi".to_string(),
            reply_to_message_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn message_topic_delivers_in_order_to_all_listeners() {
        let bus = WorldEventBus::new(Uuid::new_v4());
        let (_id1, mut rx1) = bus.subscribe_message().await;
        let (_id2, mut rx2) = bus.subscribe_message().await;

        let first = sample_message();
        let second = sample_message();
        bus.publish_message(first.clone()).await;
        bus.publish_message(second.clone()).await;

        assert_eq!(rx1.recv().await.unwrap().message_id, first.message_id);
        assert_eq!(rx1.recv().await.unwrap().message_id, second.message_id);
        assert_eq!(rx2.recv().await.unwrap().message_id, first.message_id);
        assert_eq!(rx2.recv().await.unwrap().message_id, second.message_id);
    }

    #[tokio::test]
    async fn unsubscribe_stops_further_delivery() {
        let bus = WorldEventBus::new(Uuid::new_v4());
        let (id, mut rx) = bus.subscribe_message().await;
        bus.unsubscribe_message(id).await;
        bus.publish_message(sample_message()).await;

        assert_eq!(bus.message_listener_count().await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn detach_all_clears_every_message_listener() {
        let bus = WorldEventBus::new(Uuid::new_v4());
        bus.subscribe_message().await;
        bus.subscribe_message().await;
        assert_eq!(bus.message_listener_count().await, 2);

        bus.detach_all().await;
        assert_eq!(bus.message_listener_count().await, 0);
    }

    #[tokio::test]
    async fn sse_topic_is_broadcast_and_lossy() {
        let bus = WorldEventBus::new(Uuid::new_v4());
        let mut rx = bus.subscribe_sse();
        let message_id = Uuid::new_v4();
        bus.publish_sse(SseEvent {
            event_type: SseEventType::Start,
            message_id,
            agent_name: "a1".to_string(),
            content: None,
            error: None,
            chat_id: None,
            usage: None,
        });
        let received = recv_lossy(&mut rx, "sse").await.unwrap();
        assert_eq!(received.message_id, message_id);
    }
}
