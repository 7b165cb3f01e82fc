//! Optional checkpointing of run state.
//!
//! The coordinator saves a snapshot after each stage boundary when a sink is
//! configured; without one, runs are ephemeral. Snapshots are keyed by
//! `thread_id` so a later run can pick up the same thread.

use crate::error::RunError;
use crate::state::ResearchState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// A checkpoint store for run state snapshots.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    /// Persist a snapshot for a thread, replacing any previous one.
    async fn save(&self, thread_id: &str, state: &ResearchState) -> Result<(), RunError>;

    /// Load the latest snapshot for a thread, if any.
    async fn load(&self, thread_id: &str) -> Result<Option<ResearchState>, RunError>;
}

/// Keeps snapshots in process memory. Useful for tests and single-process
/// deployments.
#[derive(Default)]
pub struct InMemoryCheckpointSink {
    snapshots: Mutex<HashMap<String, ResearchState>>,
}

impl InMemoryCheckpointSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointSink for InMemoryCheckpointSink {
    async fn save(&self, thread_id: &str, state: &ResearchState) -> Result<(), RunError> {
        self.snapshots
            .lock()
            .await
            .insert(thread_id.to_string(), state.clone());
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<ResearchState>, RunError> {
        Ok(self.snapshots.lock().await.get(thread_id).cloned())
    }
}

/// Stores one JSON file per thread under a base directory.
pub struct FileCheckpointSink {
    base_dir: PathBuf,
}

impl FileCheckpointSink {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, thread_id: &str) -> PathBuf {
        // Thread ids may contain characters unfit for filenames.
        let safe: String = thread_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.base_dir.join("threads").join(format!("{safe}.json"))
    }
}

#[async_trait]
impl CheckpointSink for FileCheckpointSink {
    async fn save(&self, thread_id: &str, state: &ResearchState) -> Result<(), RunError> {
        let path = self.path_for(thread_id);
        let state = state.clone();
        tokio::task::spawn_blocking(move || atomic_write_json(&path, &state))
            .await
            .map_err(|e| RunError::Checkpoint {
                message: format!("checkpoint task failed: {e}"),
            })?
            .map_err(|e| RunError::Checkpoint {
                message: e.to_string(),
            })
    }

    async fn load(&self, thread_id: &str) -> Result<Option<ResearchState>, RunError> {
        let path = self.path_for(thread_id);
        tokio::task::spawn_blocking(move || load_json(&path))
            .await
            .map_err(|e| RunError::Checkpoint {
                message: format!("checkpoint task failed: {e}"),
            })?
            .map_err(|e| RunError::Checkpoint {
                message: e.to_string(),
            })
    }
}

/// Atomically write a value as pretty JSON: write to a `.tmp` sibling, then
/// rename over the target. Creates parent directories as needed.
fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON; `Ok(None)` if the file doesn't exist.
fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let sink = InMemoryCheckpointSink::new();
        let state = ResearchState::new("q", "thread-1");
        sink.save("thread-1", &state).await.unwrap();

        let loaded = sink.load("thread-1").await.unwrap().unwrap();
        assert_eq!(loaded.run_id, state.run_id);
        assert!(sink.load("thread-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileCheckpointSink::new(dir.path());
        let mut state = ResearchState::new("what is x", "t/with:odd chars");
        state.report = "report body".into();

        sink.save("t/with:odd chars", &state).await.unwrap();
        let loaded = sink.load("t/with:odd chars").await.unwrap().unwrap();
        assert_eq!(loaded.report, "report body");
        assert_eq!(loaded.query, "what is x");
    }

    #[tokio::test]
    async fn test_file_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileCheckpointSink::new(dir.path());
        assert!(sink.load("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileCheckpointSink::new(dir.path());
        let mut state = ResearchState::new("q", "t1");
        sink.save("t1", &state).await.unwrap();
        state.report = "second".into();
        sink.save("t1", &state).await.unwrap();

        let loaded = sink.load("t1").await.unwrap().unwrap();
        assert_eq!(loaded.report, "second");
    }
}
