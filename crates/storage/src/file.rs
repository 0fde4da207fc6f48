//! File-backed `Storage`: one directory tree per root, JSON per record,
//! temp-file + fsync + rename for atomic writes (the same pattern the
//! workspace already uses for its append-only event logs).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tracing::instrument;
use uuid::Uuid;

use crate::error::StorageError;
use crate::model::{AgentMessage, AgentRecord, ChatRecord, WorldRecord};
use crate::Storage;

pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn world_dir(&self, world_id: Uuid) -> PathBuf {
        self.root.join("worlds").join(world_id.to_string())
    }

    fn world_file(&self, world_id: Uuid) -> PathBuf {
        self.world_dir(world_id).join("world.json")
    }

    fn agent_dir(&self, world_id: Uuid, agent_id: Uuid) -> PathBuf {
        self.world_dir(world_id).join("agents").join(agent_id.to_string())
    }

    fn agent_config_file(&self, world_id: Uuid, agent_id: Uuid) -> PathBuf {
        self.agent_dir(world_id, agent_id).join("config.json")
    }

    fn agent_memory_file(&self, world_id: Uuid, agent_id: Uuid) -> PathBuf {
        self.agent_dir(world_id, agent_id).join("memory.json")
    }

    fn agent_archive_dir(&self, world_id: Uuid, agent_id: Uuid) -> PathBuf {
        self.agent_dir(world_id, agent_id).join("archives")
    }

    fn chat_file(&self, world_id: Uuid, chat_id: Uuid) -> PathBuf {
        self.world_dir(world_id).join("chats").join(format!("{chat_id}.json"))
    }
}

/// Write `value` to `path` as JSON without ever leaving a half-written file
/// behind: serialize to a sibling temp file, fsync it, then rename over the
/// destination (rename is atomic on the same filesystem).
async fn atomic_write_json<T: Serialize + Sync>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let rendered = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp_path).await?;
        use tokio::io::AsyncWriteExt;
        file.write_all(&rendered).await?;
        file.sync_all().await?;
    }
    fs::rename(&tmp_path, path).await?;
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn list_json_dir<T: DeserializeOwned>(dir: &Path, file_name: Option<&str>) -> Result<Vec<T>, StorageError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = match file_name {
            Some(name) => entry.path().join(name),
            None => entry.path(),
        };
        if let Some(value) = read_json::<T>(&path).await? {
            out.push(value);
        }
    }
    Ok(out)
}

#[async_trait]
impl Storage for FileStorage {
    #[instrument(skip(self, world), fields(world_id = %world.id))]
    async fn save_world(&self, world: &WorldRecord) -> Result<(), StorageError> {
        atomic_write_json(&self.world_file(world.id), world).await
    }

    async fn load_world(&self, world_id: Uuid) -> Result<Option<WorldRecord>, StorageError> {
        read_json(&self.world_file(world_id)).await
    }

    #[instrument(skip(self), fields(world_id = %world_id))]
    async fn delete_world(&self, world_id: Uuid) -> Result<(), StorageError> {
        let dir = self.world_dir(world_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_worlds(&self) -> Result<Vec<WorldRecord>, StorageError> {
        list_json_dir(&self.root.join("worlds"), Some("world.json")).await
    }

    #[instrument(skip(self, agent), fields(world_id = %agent.world_id, agent_id = %agent.id))]
    async fn save_agent(&self, agent: &AgentRecord) -> Result<(), StorageError> {
        atomic_write_json(&self.agent_config_file(agent.world_id, agent.id), agent).await
    }

    async fn load_agent(
        &self,
        world_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Option<AgentRecord>, StorageError> {
        read_json(&self.agent_config_file(world_id, agent_id)).await
    }

    async fn delete_agent(&self, world_id: Uuid, agent_id: Uuid) -> Result<(), StorageError> {
        let dir = self.agent_dir(world_id, agent_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_agents(&self, world_id: Uuid) -> Result<Vec<AgentRecord>, StorageError> {
        list_json_dir(&self.world_dir(world_id).join("agents"), Some("config.json")).await
    }

    async fn load_agent_memory(
        &self,
        world_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Vec<AgentMessage>, StorageError> {
        Ok(read_json(&self.agent_memory_file(world_id, agent_id))
            .await?
            .unwrap_or_default())
    }

    #[instrument(skip(self, messages), fields(world_id = %world_id, agent_id = %agent_id, count = messages.len()))]
    async fn save_agent_memory(
        &self,
        world_id: Uuid,
        agent_id: Uuid,
        messages: &[AgentMessage],
    ) -> Result<(), StorageError> {
        let memory_file = self.agent_memory_file(world_id, agent_id);
        // Archiving is the "clear" path (`spec.md` §4.7): only fires when the
        // caller is wiping memory, not on every append-by-replace.
        if messages.is_empty() {
            if let Some(existing) = read_json::<Vec<AgentMessage>>(&memory_file).await? {
                if !existing.is_empty() {
                    let archive_dir = self.agent_archive_dir(world_id, agent_id);
                    fs::create_dir_all(&archive_dir).await?;
                    let archive_path =
                        archive_dir.join(format!("memory_{}.json", Utc::now().to_rfc3339()));
                    atomic_write_json(&archive_path, &existing).await?;
                }
            }
        }
        atomic_write_json(&memory_file, &messages.to_vec()).await
    }

    #[instrument(skip(self, chat), fields(world_id = %chat.world_id, chat_id = %chat.id))]
    async fn save_chat(&self, chat: &ChatRecord) -> Result<(), StorageError> {
        atomic_write_json(&self.chat_file(chat.world_id, chat.id), chat).await
    }

    async fn load_chat_data(
        &self,
        world_id: Uuid,
        chat_id: Uuid,
    ) -> Result<Option<ChatRecord>, StorageError> {
        read_json(&self.chat_file(world_id, chat_id)).await
    }

    async fn load_chats(&self, world_id: Uuid) -> Result<Vec<ChatRecord>, StorageError> {
        list_json_dir(&self.world_dir(world_id).join("chats"), None).await
    }

    async fn delete_chat(&self, world_id: Uuid, chat_id: Uuid) -> Result<(), StorageError> {
        match fs::remove_file(self.chat_file(world_id, chat_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
