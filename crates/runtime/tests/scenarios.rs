//! Cross-crate end-to-end scenarios (`spec.md` §8 "Concrete end-to-end
//! scenarios"), driven through the public [`agentworld_runtime::Engine`] API
//! against the network-free `echo` provider so these run with no outbound
//! HTTP calls.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentworld_config::ProviderCredentials;
use agentworld_eventbus::{MessageEvent, MessageRole, SseEvent, SseEventType};
use agentworld_runtime::{ClientHooks, Engine, NewAgent, NewWorld};
use agentworld_storage::file::FileStorage;
use agentworld_storage::Storage;

fn test_engine() -> (Engine, Arc<dyn Storage>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path()));
    let engine = Engine::new(storage.clone(), ProviderCredentials::default(), 5, 5);
    (engine, storage, dir)
}

fn echo_agent(name: &str, auto_reply: bool) -> NewAgent {
    NewAgent {
        name: name.to_string(),
        agent_type: "assistant".to_string(),
        provider: "echo".to_string(),
        model: "echo-1".to_string(),
        system_prompt: "repeat what you hear".to_string(),
        temperature: None,
        max_tokens: None,
        auto_reply,
    }
}

fn new_world(name: &str) -> NewWorld {
    NewWorld {
        name: name.to_string(),
        description: String::new(),
        turn_limit: Some(5),
        chat_llm_provider: None,
        chat_llm_model: None,
        variables: HashMap::new(),
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition did not become true within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Scenario 1: single-agent echo (`spec.md` §8.1).
#[tokio::test]
async fn single_agent_echo() {
    let (engine, storage, _dir) = test_engine();
    let world = engine.create_world(new_world("W1")).await.unwrap();
    let agent = engine.create_agent(world.id, echo_agent("a1", true)).await.unwrap();

    let messages: Arc<Mutex<Vec<MessageEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sse: Arc<Mutex<Vec<SseEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let messages_clone = messages.clone();
    let sse_clone = sse.clone();

    let hooks = ClientHooks {
        on_message: Some(Arc::new(move |e| messages_clone.lock().unwrap().push(e))),
        on_sse: Some(Arc::new(move |e| sse_clone.lock().unwrap().push(e))),
        on_tool: None,
        on_activity: None,
        on_system: None,
    };
    let cancelled = AtomicBool::new(false);
    let subscription = engine.subscribe_world(None, world.id, None, hooks, &cancelled).await.unwrap();

    engine.publish_message(world.id, "human", MessageRole::User, "hi", None, None).await.unwrap();

    wait_until(|| messages.lock().unwrap().iter().any(|m| m.sender == "a1"), Duration::from_secs(2)).await;

    let sse_events = sse.lock().unwrap().clone();
    assert!(matches!(sse_events.first().unwrap().event_type, SseEventType::Start));
    assert!(sse_events.iter().any(|e| matches!(e.event_type, SseEventType::Chunk)));
    assert!(matches!(sse_events.last().unwrap().event_type, SseEventType::End));

    let recorded = messages.lock().unwrap();
    let reply = recorded.iter().find(|m| m.sender == "a1").unwrap();
    assert_eq!(reply.content, "hi");
    drop(recorded);

    let memory = engine.get_memory(world.id, agent.id, None).await.unwrap();
    assert!(memory.iter().any(|m| m.content == "hi" && m.sender == "a1"));

    let stored_agent = storage.load_agent(world.id, agent.id).await.unwrap().unwrap();
    assert_eq!(stored_agent.llm_call_count, 1);

    engine.destroy_subscription(subscription.subscription_id).await;
}

/// Scenario 2: turn-limit notification (`spec.md` §8.2).
#[tokio::test]
async fn turn_limit_notification_is_sent_once() {
    let (engine, _storage, _dir) = test_engine();
    let world = engine.create_world(new_world("W2")).await.unwrap();
    let mut agent = engine.create_agent(world.id, echo_agent("a1", true)).await.unwrap();
    agent.llm_call_count = 5;
    engine.update_agent(agent.clone()).await.unwrap();

    let messages: Arc<Mutex<Vec<MessageEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let messages_clone = messages.clone();
    let hooks = ClientHooks {
        on_message: Some(Arc::new(move |e| messages_clone.lock().unwrap().push(e))),
        on_sse: None,
        on_tool: None,
        on_activity: None,
        on_system: None,
    };
    let cancelled = AtomicBool::new(false);
    let subscription = engine.subscribe_world(None, world.id, None, hooks, &cancelled).await.unwrap();

    engine.publish_message(world.id, "Other", MessageRole::Assistant, "@a1 are you there?", None, None).await.unwrap();
    wait_until(|| !messages.lock().unwrap().is_empty(), Duration::from_secs(2)).await;

    // A second, identical mention must not produce a second notice.
    engine.publish_message(world.id, "Other", MessageRole::Assistant, "@a1 hello again?", None, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let recorded = messages.lock().unwrap();
    let notices: Vec<_> = recorded.iter().filter(|m| m.content.contains("Turn limit reached (5 LLM calls)")).collect();
    assert_eq!(notices.len(), 1, "expected exactly one turn-limit notice, got {notices:?}");
    assert_eq!(notices[0].sender, "world");

    engine.destroy_subscription(subscription.subscription_id).await;
}

/// Scenario 3: reset on human (`spec.md` §8.3).
#[tokio::test]
async fn human_message_resets_call_count_before_dispatch() {
    let (engine, storage, _dir) = test_engine();
    let world = engine.create_world(new_world("W3")).await.unwrap();
    let mut agent = engine.create_agent(world.id, echo_agent("a1", true)).await.unwrap();
    agent.llm_call_count = 4;
    let agent_id = agent.id;
    engine.update_agent(agent.clone()).await.unwrap();

    let messages: Arc<Mutex<Vec<MessageEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let messages_clone = messages.clone();
    let hooks = ClientHooks {
        on_message: Some(Arc::new(move |e| messages_clone.lock().unwrap().push(e))),
        on_sse: None,
        on_tool: None,
        on_activity: None,
        on_system: None,
    };
    let cancelled = AtomicBool::new(false);
    let subscription = engine.subscribe_world(None, world.id, None, hooks, &cancelled).await.unwrap();

    engine.publish_message(world.id, "human", MessageRole::User, "hi", None, None).await.unwrap();
    wait_until(|| messages.lock().unwrap().iter().any(|m| m.sender == "a1"), Duration::from_secs(2)).await;

    let stored = engine.get_memory(world.id, agent_id, None).await.unwrap();
    assert!(stored.iter().any(|m| m.content == "hi" && m.sender == "a1"));

    let stored_agent = storage.load_agent(world.id, agent_id).await.unwrap().unwrap();
    assert_eq!(stored_agent.llm_call_count, 1);

    engine.destroy_subscription(subscription.subscription_id).await;
}

/// Scenario 5: refresh rebind (`spec.md` §8.5) — a subscription survives
/// `deleteChat` on its current chat with no warning, and keeps receiving
/// messages afterward.
#[tokio::test]
async fn subscription_survives_delete_chat_refresh() {
    let (engine, _storage, _dir) = test_engine();
    let world = engine.create_world(new_world("W5")).await.unwrap();
    engine.create_agent(world.id, echo_agent("a1", true)).await.unwrap();

    let (_, chat) = engine.new_chat(world.id, Some("c1".to_string())).await.unwrap();

    let messages: Arc<Mutex<Vec<MessageEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let messages_clone = messages.clone();
    let hooks = ClientHooks {
        on_message: Some(Arc::new(move |e| messages_clone.lock().unwrap().push(e))),
        on_sse: None,
        on_tool: None,
        on_activity: None,
        on_system: None,
    };
    let cancelled = AtomicBool::new(false);
    let subscription = engine.subscribe_world(None, world.id, Some(chat.id), hooks, &cancelled).await.unwrap();

    engine.delete_chat(world.id, chat.id).await.unwrap();

    // The subscription's refresh happens implicitly inside delete_chat (via
    // is_resident + registry.refresh); confirm it is still usable afterward.
    engine.publish_message(world.id, "human", MessageRole::User, "still there?", None, None).await.unwrap();
    wait_until(|| messages.lock().unwrap().iter().any(|m| m.sender == "a1"), Duration::from_secs(2)).await;

    engine.destroy_subscription(subscription.subscription_id).await;
}

/// Scenario 6: concurrent agents (`spec.md` §8.6) — two mentioned agents
/// both reply to one broadcast, each reply pointing back at the broadcast's
/// message id.
#[tokio::test]
async fn two_mentioned_agents_respond_independently() {
    let (engine, _storage, _dir) = test_engine();
    let world = engine.create_world(new_world("W6")).await.unwrap();
    engine.create_agent(world.id, echo_agent("a1", false)).await.unwrap();
    engine.create_agent(world.id, echo_agent("a2", false)).await.unwrap();

    let messages: Arc<Mutex<Vec<MessageEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let messages_clone = messages.clone();
    let hooks = ClientHooks {
        on_message: Some(Arc::new(move |e| messages_clone.lock().unwrap().push(e))),
        on_sse: None,
        on_tool: None,
        on_activity: None,
        on_system: None,
    };
    let cancelled = AtomicBool::new(false);
    let subscription = engine.subscribe_world(None, world.id, None, hooks, &cancelled).await.unwrap();

    let incoming = engine.publish_message(world.id, "human", MessageRole::User, "@a1 @a2 ping", None, None).await.unwrap();

    wait_until(
        || {
            let recorded = messages.lock().unwrap();
            recorded.iter().any(|m| m.sender == "a1") && recorded.iter().any(|m| m.sender == "a2")
        },
        Duration::from_secs(2),
    )
    .await;

    let recorded = messages.lock().unwrap();
    let reply_a1 = recorded.iter().find(|m| m.sender == "a1").unwrap();
    let reply_a2 = recorded.iter().find(|m| m.sender == "a2").unwrap();
    assert_eq!(reply_a1.reply_to_message_id, Some(incoming.message_id));
    assert_eq!(reply_a2.reply_to_message_id, Some(incoming.message_id));

    engine.destroy_subscription(subscription.subscription_id).await;
}
