use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

/// Key-value persistence for execution state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or replace the state of an execution.
    async fn save_state(&self, execution_id: Uuid, state: &serde_json::Value) -> MaestroResult<()>;
    /// Load the state of an execution, `None` when never saved.
    async fn load_state(&self, execution_id: Uuid) -> MaestroResult<Option<serde_json::Value>>;
    /// Remove a stored execution; missing ids are not an error.
    async fn delete(&self, execution_id: Uuid) -> MaestroResult<()>;
    /// Ids of every stored execution.
    async fn list(&self) -> MaestroResult<Vec<Uuid>>;
}

/// File-based state store: one pretty-printed JSON file per execution.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Open a store rooted at `dir`, creating it if needed.
    pub async fn new(dir: PathBuf) -> MaestroResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn state_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save_state(&self, execution_id: Uuid, state: &serde_json::Value) -> MaestroResult<()> {
        let path = self.state_path(execution_id);
        let tmp = self.dir.join(format!("{execution_id}.json.tmp"));
        let json = serde_json::to_string_pretty(state)?;
        // Write then rename so readers never observe a half-written file.
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(execution_id = %execution_id, path = %path.display(), "State saved");
        Ok(())
    }

    async fn load_state(&self, execution_id: Uuid) -> MaestroResult<Option<serde_json::Value>> {
        let path = self.state_path(execution_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let state = serde_json::from_str(&data).map_err(|e| {
            MaestroError::Persistence(format!("Failed to parse state {execution_id}: {e}"))
        })?;
        Ok(Some(state))
    }

    async fn delete(&self, execution_id: Uuid) -> MaestroResult<()> {
        let path = self.state_path(execution_id);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn list(&self) -> MaestroResult<Vec<Uuid>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(id) = Uuid::parse_str(stem) {
                        ids.push(id);
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// In-memory state store, for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<Uuid, serde_json::Value>>,
}

impl MemoryStateStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save_state(&self, execution_id: Uuid, state: &serde_json::Value) -> MaestroResult<()> {
        self.states.write().insert(execution_id, state.clone());
        Ok(())
    }

    async fn load_state(&self, execution_id: Uuid) -> MaestroResult<Option<serde_json::Value>> {
        Ok(self.states.read().get(&execution_id).cloned())
    }

    async fn delete(&self, execution_id: Uuid) -> MaestroResult<()> {
        self.states.write().remove(&execution_id);
        Ok(())
    }

    async fn list(&self) -> MaestroResult<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.states.read().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}
