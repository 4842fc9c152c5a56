//! Per-run transcript files: task variables plus the agent-authored dialogue.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use crate::{
    checkpoint::{read_latest, CheckpointError},
    prompt::Variables,
    state::ConversationState,
};

/// Closes a model's reasoning block inside a reply.
pub const REASONING_DELIMITER: &str = "</think>";

#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("transcript I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed transcript {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    /// Identifier of the agent that spoke.
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub reasoning: String,
}

impl TranscriptMessage {
    /// Splits `raw` at the first reasoning delimiter, if present.
    pub fn split(role: impl Into<String>, raw: &str) -> Self {
        let (reasoning, content) = match raw.split_once(REASONING_DELIMITER) {
            Some((reasoning, content)) => (reasoning.trim(), content.trim()),
            None => ("", raw.trim()),
        };
        Self {
            role: role.into(),
            content: content.to_string(),
            reasoning: reasoning.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    #[serde(default)]
    pub task: Variables,
    pub messages: Vec<TranscriptMessage>,
}

impl TranscriptRecord {
    /// The start prompt carries no speaker and is left out.
    pub fn from_state(task: &Variables, state: &ConversationState) -> Self {
        let messages = state
            .messages()
            .iter()
            .filter_map(|m| {
                m.speaker
                    .as_deref()
                    .map(|speaker| TranscriptMessage::split(speaker, &m.content))
            })
            .collect();
        Self {
            task: task.clone(),
            messages,
        }
    }

    pub fn last_message(&self) -> Option<&TranscriptMessage> {
        self.messages.last()
    }

    pub async fn read(path: impl AsRef<Path>) -> Result<Self, TranscriptError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .map_err(|source| TranscriptError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        serde_json::from_str(&text).map_err(|source| TranscriptError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub async fn write(&self, path: impl AsRef<Path>) -> Result<(), TranscriptError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(|source| TranscriptError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| TranscriptError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        fs::write(path, json)
            .await
            .map_err(|source| TranscriptError::Io {
                path: path.to_path_buf(),
                source,
            })
    }
}

pub fn transcript_path(dir: &Path, thread_id: &str) -> PathBuf {
    dir.join(format!("{thread_id}.json"))
}

/// Rebuilds `<dir>/<thread>.json` from every checkpoint log in `<dir>/checkpoints`.
pub async fn export_transcripts(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, TranscriptError> {
    let dir = dir.as_ref();
    let checkpoints = dir.join("checkpoints");
    let io_error = |source| TranscriptError::Io {
        path: checkpoints.clone(),
        source,
    };

    let mut logs = Vec::new();
    let mut entries = fs::read_dir(&checkpoints).await.map_err(io_error)?;
    while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
            logs.push(path);
        }
    }
    logs.sort();

    let mut written = Vec::new();
    for log in logs {
        let Some(snapshot) = read_latest(&log).await? else {
            warn!(log = %log.display(), "checkpoint log is empty, skipping");
            continue;
        };
        if !snapshot.finished {
            warn!(thread_id = %snapshot.thread_id, "exporting an unfinished run");
        }
        let record = TranscriptRecord::from_state(
            &snapshot.task,
            &ConversationState::with_messages(snapshot.messages),
        );
        let path = transcript_path(dir, &snapshot.thread_id);
        record.write(&path).await?;
        written.push(path);
    }

    info!(dir = %dir.display(), count = written.len(), "exported transcripts");
    Ok(written)
}
