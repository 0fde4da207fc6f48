//! Thin example binary exercising the programmatic API surface (`spec.md`
//! §6): `createWorld`, `createAgent`, `publishMessage`, `subscribeWorld`,
//! against the network-free `echo` provider. No flag parsing beyond a
//! single `demo` subcommand — the terminal UI, desktop renderer, and web
//! SPA that would normally drive this API are out of scope (`spec.md` §1).

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use agentworld_config::{AppConfig, StorageBackend};
use agentworld_eventbus::MessageRole;
use agentworld_runtime::{Engine, NewAgent, NewWorld};
use agentworld_storage::Storage;

#[derive(Debug, Parser)]
#[command(name = "agentworld", version, about = "Agent World runtime — example driver")]
struct Cli {
    /// Path to a TOML config file; falls back to built-in defaults plus
    /// environment variables when absent.
    #[arg(long, default_value = "agentworld.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a world with one auto-replying `echo` agent, publish one
    /// human message, and print every event observed on the world's
    /// subscription until the agent's reply lands.
    Demo {
        /// Message to publish as the human participant.
        #[arg(default_value = "hello, agent world")]
        message: String,
    },
    /// List every persisted world in the configured storage root.
    ListWorlds,
}

async fn build_storage(config: &AppConfig) -> Result<Arc<dyn Storage>> {
    Ok(match config.storage.backend {
        StorageBackend::File => Arc::new(agentworld_storage::file::FileStorage::new(config.storage.data_path.clone())) as Arc<dyn Storage>,
        StorageBackend::Sqlite => {
            let path = format!("sqlite://{}/agentworld.db", config.storage.data_path);
            std::fs::create_dir_all(&config.storage.data_path)?;
            Arc::new(agentworld_storage::sqlite::SqliteStorage::connect(&path, 5).await?) as Arc<dyn Storage>
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;
    let storage = build_storage(&config).await?;
    let engine = Engine::new(storage, config.providers.clone(), config.runtime.default_turn_limit, config.runtime.llm_timeout_secs);

    match cli.command.unwrap_or(Commands::Demo { message: "hello, agent world".to_string() }) {
        Commands::Demo { message } => run_demo(&engine, &message).await,
        Commands::ListWorlds => list_worlds(&engine).await,
    }
}

async fn list_worlds(engine: &Engine) -> Result<()> {
    let worlds = engine.list_worlds().await?;
    if worlds.is_empty() {
        println!("(no worlds persisted yet)");
    }
    for world in worlds {
        println!("{}  {}  (turn_limit={}, agents={})", world.id, world.name, world.turn_limit, world.agents.len());
    }
    Ok(())
}

async fn run_demo(engine: &Engine, message: &str) -> Result<()> {
    let world = engine
        .create_world(NewWorld {
            name: "demo-world".to_string(),
            description: "created by `agentworld demo`".to_string(),
            turn_limit: Some(5),
            chat_llm_provider: None,
            chat_llm_model: None,
            variables: HashMap::new(),
        })
        .await?;
    println!("created world {} ({})", world.name, world.id);

    let agent = engine
        .create_agent(
            world.id,
            NewAgent {
                name: "echo".to_string(),
                agent_type: "assistant".to_string(),
                provider: "echo".to_string(),
                model: "echo-1".to_string(),
                system_prompt: "You repeat back what you are told.".to_string(),
                temperature: None,
                max_tokens: None,
                auto_reply: true,
            },
        )
        .await?;
    println!("created agent {} ({})", agent.name, agent.id);

    let hooks = agentworld_runtime::ClientHooks {
        on_message: Some(Arc::new(|event| {
            println!("[message] {} ({:?}): {}", event.sender, event.role, event.content);
        })),
        on_sse: Some(Arc::new(|event| {
            println!("[sse] {:?} {}{}", event.event_type, event.agent_name, event.content.as_deref().unwrap_or(""));
        })),
        on_tool: None,
        on_activity: Some(Arc::new(|event| {
            println!("[activity] {:?} source={}", event.event_type, event.source);
        })),
        on_system: None,
    };
    let cancelled = AtomicBool::new(false);
    let subscription = engine.subscribe_world(None, world.id, None, hooks, &cancelled).await?;
    println!("subscribed as {}", subscription.subscription_id);

    engine.publish_message(world.id, "human", MessageRole::User, message, None, None).await?;

    // Give the agent's mailbox worker time to stream its reply; this is a
    // fixed-delay smoke test, not a production wait strategy.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let memory = engine.get_memory(world.id, agent.id, None).await?;
    println!("--- agent memory ({} messages) ---", memory.len());
    for entry in memory {
        println!("{:?} {}: {}", entry.role, entry.sender, entry.content);
    }

    engine.destroy_subscription(subscription.subscription_id).await;
    Ok(())
}
