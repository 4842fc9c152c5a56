//! Per-run append-only checkpoint logs keyed by thread identifier.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt, sync::Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::{prompt::Variables, state::StateMessage};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("checkpoint store for thread '{0}' is closed")]
    Closed(String),
}

/// Conversation state after one node transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub thread_id: String,
    pub step: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default)]
    pub task: Variables,
    pub messages: Vec<StateMessage>,
    /// Nodes of the current step still to run, in order.
    #[serde(default)]
    pub pending: Vec<String>,
    /// Successors collected so far for the next step.
    #[serde(default)]
    pub next: Vec<String>,
    #[serde(default)]
    pub reached_end: bool,
    #[serde(default)]
    pub finished: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    fn thread_id(&self) -> &str;

    async fn append(&self, snapshot: &Snapshot) -> Result<(), CheckpointError>;

    async fn load_latest(&self) -> Result<Option<Snapshot>, CheckpointError>;

    async fn close(&self) -> Result<(), CheckpointError>;
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    thread_id: String,
    snapshots: Mutex<Vec<Snapshot>>,
}

impl MemoryCheckpointStore {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            snapshots: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.snapshots
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    fn thread_id(&self) -> &str {
        &self.thread_id
    }

    async fn append(&self, snapshot: &Snapshot) -> Result<(), CheckpointError> {
        if let Ok(mut guard) = self.snapshots.lock() {
            guard.push(snapshot.clone());
        }
        Ok(())
    }

    async fn load_latest(&self) -> Result<Option<Snapshot>, CheckpointError> {
        Ok(self
            .snapshots
            .lock()
            .ok()
            .and_then(|guard| guard.last().cloned()))
    }

    async fn close(&self) -> Result<(), CheckpointError> {
        Ok(())
    }
}

/// JSON-lines log at `<dir>/<thread_id>.jsonl`.
pub struct FileCheckpointStore {
    thread_id: String,
    path: PathBuf,
    file: AsyncMutex<Option<fs::File>>,
}

impl FileCheckpointStore {
    pub async fn open(dir: impl AsRef<Path>, thread_id: impl Into<String>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref();
        let thread_id = thread_id.into();
        fs::create_dir_all(dir).await.map_err(|source| CheckpointError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let path = log_path(dir, &thread_id);
        trim_torn_tail(&path).await?;
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| CheckpointError::Io {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            thread_id,
            path,
            file: AsyncMutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    fn thread_id(&self) -> &str {
        &self.thread_id
    }

    async fn append(&self, snapshot: &Snapshot) -> Result<(), CheckpointError> {
        let mut line = serde_json::to_string(snapshot)?;
        line.push('\n');

        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| CheckpointError::Closed(self.thread_id.clone()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))?;
        debug!(thread_id = %self.thread_id, step = snapshot.step, "checkpoint appended");
        Ok(())
    }

    async fn load_latest(&self) -> Result<Option<Snapshot>, CheckpointError> {
        read_latest(&self.path).await
    }

    async fn close(&self) -> Result<(), CheckpointError> {
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            file.flush().await.map_err(|e| self.io_error(e))?;
            file.sync_all().await.map_err(|e| self.io_error(e))?;
        }
        Ok(())
    }
}

pub fn log_path(dir: &Path, thread_id: &str) -> PathBuf {
    dir.join(format!("{thread_id}.jsonl"))
}

/// Cuts an unterminated last line so the next append starts on a fresh line.
async fn trim_torn_tail(path: &Path) -> Result<(), CheckpointError> {
    let io_error = |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    };
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => return Err(io_error(source)),
    };
    if bytes.last().map_or(true, |b| *b == b'\n') {
        return Ok(());
    }

    let keep = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |newline| newline + 1);
    warn!(
        log = %path.display(),
        dropped_bytes = bytes.len() - keep,
        "discarding torn checkpoint line"
    );
    let file = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(io_error)?;
    file.set_len(keep as u64).await.map_err(io_error)?;
    file.sync_all().await.map_err(io_error)?;
    Ok(())
}

/// Last complete snapshot of a log; a torn trailing line is ignored.
pub async fn read_latest(path: &Path) -> Result<Option<Snapshot>, CheckpointError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let latest = text
        .lines()
        .rev()
        .filter(|line| !line.trim().is_empty())
        .find_map(|line| serde_json::from_str::<Snapshot>(line).ok());
    Ok(latest)
}

/// Shared registry of in-memory stores, one per thread.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpoints {
    stores: Arc<Mutex<BTreeMap<String, Arc<MemoryCheckpointStore>>>>,
}

impl MemoryCheckpoints {
    pub fn store(&self, thread_id: &str) -> Arc<MemoryCheckpointStore> {
        match self.stores.lock() {
            Ok(mut stores) => Arc::clone(
                stores
                    .entry(thread_id.to_string())
                    .or_insert_with(|| Arc::new(MemoryCheckpointStore::new(thread_id))),
            ),
            Err(_) => Arc::new(MemoryCheckpointStore::new(thread_id)),
        }
    }

    pub fn thread_ids(&self) -> Vec<String> {
        self.stores
            .lock()
            .map(|stores| stores.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Where runs keep their checkpoint logs.
#[derive(Debug, Clone)]
pub enum CheckpointBackend {
    Directory(PathBuf),
    Memory(MemoryCheckpoints),
}

impl CheckpointBackend {
    pub async fn open(&self, thread_id: &str) -> Result<Arc<dyn CheckpointStore>, CheckpointError> {
        match self {
            CheckpointBackend::Directory(dir) => {
                Ok(Arc::new(FileCheckpointStore::open(dir, thread_id).await?))
            }
            CheckpointBackend::Memory(stores) => Ok(stores.store(thread_id)),
        }
    }
}
