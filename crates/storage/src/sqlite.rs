//! SQLite-backed `Storage`. Memory replacement happens inside one
//! transaction (archive, delete, re-insert) so a crash never leaves an
//! agent's memory half-written.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::StorageError;
use crate::model::{AgentMessage, AgentRecord, AgentStatus, ChatRecord, MessageRole, TokenUsage, WorldRecord};
use crate::Storage;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS worlds (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    turn_limit INTEGER NOT NULL,
    current_chat_id TEXT,
    chat_llm_provider TEXT,
    chat_llm_model TEXT,
    mcp_config TEXT,
    variables TEXT NOT NULL,
    agent_ids TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_updated TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agents (
    world_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    name TEXT NOT NULL,
    agent_type TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    system_prompt TEXT NOT NULL,
    temperature REAL,
    max_tokens INTEGER,
    auto_reply INTEGER NOT NULL,
    status TEXT NOT NULL,
    llm_call_count INTEGER NOT NULL,
    last_llm_call TEXT,
    created_at TEXT NOT NULL,
    last_active TEXT NOT NULL,
    PRIMARY KEY (world_id, agent_id)
);

CREATE TABLE IF NOT EXISTS agent_memory (
    world_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    message_id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL,
    role TEXT NOT NULL,
    sender TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    reply_to_message_id TEXT,
    tool_call_id TEXT,
    usage TEXT
);
CREATE INDEX IF NOT EXISTS idx_agent_memory_lookup ON agent_memory (world_id, agent_id);

CREATE TABLE IF NOT EXISTS agent_memory_archive (
    archive_id TEXT PRIMARY KEY,
    world_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    archived_at TEXT NOT NULL,
    payload TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chats (
    id TEXT PRIMARY KEY,
    world_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Opens (creating if absent) the database at `path` with a bounded
    /// exponential backoff against transient lock contention, mirroring the
    /// reconnect pattern already used for the daemon's Unix socket client.
    pub async fn connect(path: &str, max_attempts: usize) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(path)?.create_if_missing(true);

        let mut delay = Duration::from_millis(100);
        let pool = loop {
            match SqlitePoolOptions::new().max_connections(5).connect_with(options.clone()).await {
                Ok(pool) => break pool,
                Err(err) if max_attempts > 1 => {
                    warn!(?err, "sqlite connect failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        };

        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

fn parse_uuid(value: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(value).map_err(|e| StorageError::Parse(format!("invalid uuid {value:?}: {e}")))
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Parse(format!("invalid timestamp {value:?}: {e}")))
}

fn world_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WorldRecord, StorageError> {
    let variables: HashMap<String, String> = serde_json::from_str(row.try_get::<String, _>("variables")?.as_str())?;
    let agent_ids_raw: Vec<String> = serde_json::from_str(row.try_get::<String, _>("agent_ids")?.as_str())?;
    let agents = agent_ids_raw
        .iter()
        .map(|s| parse_uuid(s))
        .collect::<Result<HashSet<_>, _>>()?;
    let mcp_config_raw: Option<String> = row.try_get("mcp_config")?;
    let mcp_config = mcp_config_raw.map(|s| serde_json::from_str::<Value>(&s)).transpose()?;

    Ok(WorldRecord {
        id: parse_uuid(row.try_get::<String, _>("id")?.as_str())?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        turn_limit: row.try_get::<i64, _>("turn_limit")? as u32,
        current_chat_id: row
            .try_get::<Option<String>, _>("current_chat_id")?
            .map(|s| parse_uuid(&s))
            .transpose()?,
        chat_llm_provider: row.try_get("chat_llm_provider")?,
        chat_llm_model: row.try_get("chat_llm_model")?,
        mcp_config,
        variables,
        agents,
        created_at: parse_datetime(row.try_get::<String, _>("created_at")?.as_str())?,
        last_updated: parse_datetime(row.try_get::<String, _>("last_updated")?.as_str())?,
    })
}

fn agent_status_to_str(status: AgentStatus) -> &'static str {
    match status {
        AgentStatus::Active => "active",
        AgentStatus::Inactive => "inactive",
        AgentStatus::Error => "error",
    }
}

fn agent_status_from_str(value: &str) -> AgentStatus {
    match value {
        "active" => AgentStatus::Active,
        "error" => AgentStatus::Error,
        _ => AgentStatus::Inactive,
    }
}

fn agent_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AgentRecord, StorageError> {
    Ok(AgentRecord {
        id: parse_uuid(row.try_get::<String, _>("agent_id")?.as_str())?,
        world_id: parse_uuid(row.try_get::<String, _>("world_id")?.as_str())?,
        name: row.try_get("name")?,
        agent_type: row.try_get("agent_type")?,
        provider: row.try_get("provider")?,
        model: row.try_get("model")?,
        system_prompt: row.try_get("system_prompt")?,
        temperature: row.try_get::<Option<f64>, _>("temperature")?.map(|v| v as f32),
        max_tokens: row.try_get::<Option<i64>, _>("max_tokens")?.map(|v| v as u32),
        auto_reply: row.try_get::<i64, _>("auto_reply")? != 0,
        status: agent_status_from_str(row.try_get::<String, _>("status")?.as_str()),
        llm_call_count: row.try_get::<i64, _>("llm_call_count")? as u32,
        last_llm_call: row
            .try_get::<Option<String>, _>("last_llm_call")?
            .map(|s| parse_datetime(&s))
            .transpose()?,
        created_at: parse_datetime(row.try_get::<String, _>("created_at")?.as_str())?,
        last_active: parse_datetime(row.try_get::<String, _>("last_active")?.as_str())?,
    })
}

fn role_to_str(role: &MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    }
}

fn role_from_str(value: &str) -> MessageRole {
    match value {
        "system" => MessageRole::System,
        "assistant" => MessageRole::Assistant,
        "tool" => MessageRole::Tool,
        _ => MessageRole::User,
    }
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AgentMessage, StorageError> {
    let usage_raw: Option<String> = row.try_get("usage")?;
    let usage = usage_raw.map(|s| serde_json::from_str::<TokenUsage>(&s)).transpose()?;
    Ok(AgentMessage {
        message_id: parse_uuid(row.try_get::<String, _>("message_id")?.as_str())?,
        chat_id: parse_uuid(row.try_get::<String, _>("chat_id")?.as_str())?,
        role: role_from_str(row.try_get::<String, _>("role")?.as_str()),
        sender: row.try_get("sender")?,
        content: row.try_get("content")?,
        created_at: parse_datetime(row.try_get::<String, _>("created_at")?.as_str())?,
        reply_to_message_id: row
            .try_get::<Option<String>, _>("reply_to_message_id")?
            .map(|s| parse_uuid(&s))
            .transpose()?,
        tool_call_id: row.try_get("tool_call_id")?,
        usage,
    })
}

fn chat_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ChatRecord, StorageError> {
    Ok(ChatRecord {
        id: parse_uuid(row.try_get::<String, _>("id")?.as_str())?,
        world_id: parse_uuid(row.try_get::<String, _>("world_id")?.as_str())?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        created_at: parse_datetime(row.try_get::<String, _>("created_at")?.as_str())?,
        updated_at: parse_datetime(row.try_get::<String, _>("updated_at")?.as_str())?,
    })
}

#[async_trait]
impl Storage for SqliteStorage {
    #[instrument(skip(self, world), fields(world_id = %world.id))]
    async fn save_world(&self, world: &WorldRecord) -> Result<(), StorageError> {
        let variables = serde_json::to_string(&world.variables)?;
        let agent_ids: Vec<String> = world.agents.iter().map(Uuid::to_string).collect();
        let agent_ids = serde_json::to_string(&agent_ids)?;
        let mcp_config = world.mcp_config.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            "INSERT INTO worlds (id, name, description, turn_limit, current_chat_id, chat_llm_provider, chat_llm_model, mcp_config, variables, agent_ids, created_at, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET name=?2, description=?3, turn_limit=?4, current_chat_id=?5, chat_llm_provider=?6, chat_llm_model=?7, mcp_config=?8, variables=?9, agent_ids=?10, last_updated=?12",
        )
        .bind(world.id.to_string())
        .bind(&world.name)
        .bind(&world.description)
        .bind(world.turn_limit as i64)
        .bind(world.current_chat_id.map(|id| id.to_string()))
        .bind(&world.chat_llm_provider)
        .bind(&world.chat_llm_model)
        .bind(mcp_config)
        .bind(variables)
        .bind(agent_ids)
        .bind(world.created_at.to_rfc3339())
        .bind(world.last_updated.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_world(&self, world_id: Uuid) -> Result<Option<WorldRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM worlds WHERE id = ?1")
            .bind(world_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(world_from_row).transpose()
    }

    async fn delete_world(&self, world_id: Uuid) -> Result<(), StorageError> {
        let id = world_id.to_string();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM worlds WHERE id = ?1").bind(&id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM agents WHERE world_id = ?1").bind(&id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM agent_memory WHERE world_id = ?1").bind(&id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM chats WHERE world_id = ?1").bind(&id).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_worlds(&self) -> Result<Vec<WorldRecord>, StorageError> {
        let rows = sqlx::query("SELECT * FROM worlds").fetch_all(&self.pool).await?;
        rows.iter().map(world_from_row).collect()
    }

    #[instrument(skip(self, agent), fields(world_id = %agent.world_id, agent_id = %agent.id))]
    async fn save_agent(&self, agent: &AgentRecord) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO agents (world_id, agent_id, name, agent_type, provider, model, system_prompt, temperature, max_tokens, auto_reply, status, llm_call_count, last_llm_call, created_at, last_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(world_id, agent_id) DO UPDATE SET name=?3, agent_type=?4, provider=?5, model=?6, system_prompt=?7, temperature=?8, max_tokens=?9, auto_reply=?10, status=?11, llm_call_count=?12, last_llm_call=?13, last_active=?15",
        )
        .bind(agent.world_id.to_string())
        .bind(agent.id.to_string())
        .bind(&agent.name)
        .bind(&agent.agent_type)
        .bind(&agent.provider)
        .bind(&agent.model)
        .bind(&agent.system_prompt)
        .bind(agent.temperature.map(|v| v as f64))
        .bind(agent.max_tokens.map(|v| v as i64))
        .bind(agent.auto_reply as i64)
        .bind(agent_status_to_str(agent.status))
        .bind(agent.llm_call_count as i64)
        .bind(agent.last_llm_call.map(|dt| dt.to_rfc3339()))
        .bind(agent.created_at.to_rfc3339())
        .bind(agent.last_active.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_agent(
        &self,
        world_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Option<AgentRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM agents WHERE world_id = ?1 AND agent_id = ?2")
            .bind(world_id.to_string())
            .bind(agent_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn delete_agent(&self, world_id: Uuid, agent_id: Uuid) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM agents WHERE world_id = ?1 AND agent_id = ?2")
            .bind(world_id.to_string())
            .bind(agent_id.to_string())
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM agent_memory WHERE world_id = ?1 AND agent_id = ?2")
            .bind(world_id.to_string())
            .bind(agent_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_agents(&self, world_id: Uuid) -> Result<Vec<AgentRecord>, StorageError> {
        let rows = sqlx::query("SELECT * FROM agents WHERE world_id = ?1")
            .bind(world_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(agent_from_row).collect()
    }

    async fn load_agent_memory(
        &self,
        world_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Vec<AgentMessage>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM agent_memory WHERE world_id = ?1 AND agent_id = ?2 ORDER BY created_at ASC, message_id ASC",
        )
        .bind(world_id.to_string())
        .bind(agent_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    #[instrument(skip(self, messages), fields(world_id = %world_id, agent_id = %agent_id, count = messages.len()))]
    async fn save_agent_memory(
        &self,
        world_id: Uuid,
        agent_id: Uuid,
        messages: &[AgentMessage],
    ) -> Result<(), StorageError> {
        let world_id_str = world_id.to_string();
        let agent_id_str = agent_id.to_string();

        let mut tx = self.pool.begin().await?;

        // Archiving is the "clear" path (`spec.md` §4.7): only fires when the
        // caller is wiping memory, not on every append-by-replace.
        if messages.is_empty() {
            let existing_rows = sqlx::query("SELECT * FROM agent_memory WHERE world_id = ?1 AND agent_id = ?2")
                .bind(&world_id_str)
                .bind(&agent_id_str)
                .fetch_all(&mut *tx)
                .await?;
            if !existing_rows.is_empty() {
                let existing: Vec<AgentMessage> = existing_rows
                    .iter()
                    .map(message_from_row)
                    .collect::<Result<_, _>>()?;
                let payload = serde_json::to_string(&existing)?;
                sqlx::query(
                    "INSERT INTO agent_memory_archive (archive_id, world_id, agent_id, archived_at, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&world_id_str)
                .bind(&agent_id_str)
                .bind(Utc::now().to_rfc3339())
                .bind(payload)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query("DELETE FROM agent_memory WHERE world_id = ?1 AND agent_id = ?2")
            .bind(&world_id_str)
            .bind(&agent_id_str)
            .execute(&mut *tx)
            .await?;

        for message in messages {
            let usage = message.usage.as_ref().map(serde_json::to_string).transpose()?;
            sqlx::query(
                "INSERT INTO agent_memory (world_id, agent_id, message_id, chat_id, role, sender, content, created_at, reply_to_message_id, tool_call_id, usage)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )
            .bind(&world_id_str)
            .bind(&agent_id_str)
            .bind(message.message_id.to_string())
            .bind(message.chat_id.to_string())
            .bind(role_to_str(&message.role))
            .bind(&message.sender)
            .bind(&message.content)
            .bind(message.created_at.to_rfc3339())
            .bind(message.reply_to_message_id.map(|id| id.to_string()))
            .bind(&message.tool_call_id)
            .bind(usage)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn save_chat(&self, chat: &ChatRecord) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO chats (id, world_id, name, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET name=?3, description=?4, updated_at=?6",
        )
        .bind(chat.id.to_string())
        .bind(chat.world_id.to_string())
        .bind(&chat.name)
        .bind(&chat.description)
        .bind(chat.created_at.to_rfc3339())
        .bind(chat.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_chat_data(
        &self,
        world_id: Uuid,
        chat_id: Uuid,
    ) -> Result<Option<ChatRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM chats WHERE world_id = ?1 AND id = ?2")
            .bind(world_id.to_string())
            .bind(chat_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(chat_from_row).transpose()
    }

    async fn load_chats(&self, world_id: Uuid) -> Result<Vec<ChatRecord>, StorageError> {
        let rows = sqlx::query("SELECT * FROM chats WHERE world_id = ?1")
            .bind(world_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(chat_from_row).collect()
    }

    async fn delete_chat(&self, world_id: Uuid, chat_id: Uuid) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM chats WHERE world_id = ?1 AND id = ?2")
            .bind(world_id.to_string())
            .bind(chat_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageRole;
    use std::collections::{HashMap, HashSet};

    async fn memory_storage() -> SqliteStorage {
        SqliteStorage::connect(":memory:", 1).await.unwrap()
    }

    fn sample_world() -> WorldRecord {
        WorldRecord {
            id: Uuid::new_v4(),
            name: "W1".to_string(),
            description: String::new(),
            turn_limit: 5,
            current_chat_id: None,
            chat_llm_provider: None,
            chat_llm_model: None,
            mcp_config: None,
            variables: HashMap::new(),
            agents: HashSet::new(),
            created_at: Utc::now(),
            last_updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_then_load_world_round_trips() {
        let storage = memory_storage().await;
        let world = sample_world();
        storage.save_world(&world).await.unwrap();
        let loaded = storage.load_world(world.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "W1");
        assert_eq!(loaded.turn_limit, 5);
    }

    #[tokio::test]
    async fn save_agent_memory_is_transactional_and_archives() {
        let storage = memory_storage().await;
        let world_id = Uuid::new_v4();
        let agent_id = Uuid::new_v4();
        let chat_id = Uuid::new_v4();

        let first = vec![AgentMessage {
            message_id: Uuid::new_v4(),
            chat_id,
            role: MessageRole::User,
            sender: "human".to_string(),
            content: "hi".to_string(),
            created_at: Utc::now(),
            reply_to_message_id: None,
            tool_call_id: None,
            usage: None,
        }];
        storage.save_agent_memory(world_id, agent_id, &first).await.unwrap();
        let loaded = storage.load_agent_memory(world_id, agent_id).await.unwrap();
        assert_eq!(loaded.len(), 1);

        storage.save_agent_memory(world_id, agent_id, &[]).await.unwrap();
        let loaded_after = storage.load_agent_memory(world_id, agent_id).await.unwrap();
        assert!(loaded_after.is_empty());

        let archived: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM agent_memory_archive")
            .fetch_one(&storage.pool)
            .await
            .unwrap();
        assert_eq!(archived.0, 1);
    }
}
