//! Persisted log read positions
//!
//! All nodes share one JSON file keyed by node id. Every save rewrites the
//! whole file through a temp file and an atomic rename, so a crash leaves
//! either the old or the new file, never a torn one.
//!
//! Saves from different nodes can race. The in-memory map is updated first
//! and a generation counter is bumped; the writer then takes the flush lock
//! and serializes whatever the map holds at that moment. A save whose
//! generation was already covered by another flush returns without writing.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Where reading of a node's log stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    /// Log file the offset refers to
    pub path: String,
    /// Bytes consumed from the start of `path`
    pub offset: u64,
    /// When the position was last saved
    pub updated_at: DateTime<Utc>,
}

impl LogPosition {
    /// Position at `offset` in `path`, stamped now
    pub fn new(path: impl Into<String>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Default)]
struct State {
    positions: BTreeMap<String, LogPosition>,
    generation: u64,
}

/// Position store backed by a JSON file, or memory only
pub struct PositionStore {
    path: Option<PathBuf>,
    state: Mutex<State>,
    /// Highest generation written to disk
    flushed: tokio::sync::Mutex<u64>,
}

impl std::fmt::Debug for PositionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionStore")
            .field("path", &self.path)
            .field("nodes", &self.state.lock().positions.len())
            .finish()
    }
}

impl PositionStore {
    /// Store that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(State::default()),
            flushed: tokio::sync::Mutex::new(0),
        }
    }

    /// Open the store at `path`, loading existing positions.
    ///
    /// A missing file starts empty. An unreadable or corrupt file is logged
    /// and also starts empty, which re-reads logs from the beginning.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let positions = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, LogPosition>>(&bytes) {
                Ok(positions) => {
                    info!(path = %path.display(), nodes = positions.len(), "loaded log positions");
                    positions
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring corrupt log position file");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read log position file");
                BTreeMap::new()
            }
        };

        Ok(Self {
            path: Some(path),
            state: Mutex::new(State {
                positions,
                generation: 0,
            }),
            flushed: tokio::sync::Mutex::new(0),
        })
    }

    /// File backing the store, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Saved position of a node
    pub fn get(&self, node_id: &str) -> Option<LogPosition> {
        self.state.lock().positions.get(node_id).cloned()
    }

    /// All saved positions
    pub fn all(&self) -> BTreeMap<String, LogPosition> {
        self.state.lock().positions.clone()
    }

    /// Save a node's position and flush the file
    pub async fn save(&self, node_id: &str, position: LogPosition) -> Result<()> {
        let generation = {
            let mut state = self.state.lock();
            state.positions.insert(node_id.to_string(), position);
            state.generation += 1;
            state.generation
        };
        self.flush(generation).await
    }

    /// Drop a node's position and flush the file
    pub async fn remove(&self, node_id: &str) -> Result<()> {
        let generation = {
            let mut state = self.state.lock();
            if state.positions.remove(node_id).is_none() {
                return Ok(());
            }
            state.generation += 1;
            state.generation
        };
        self.flush(generation).await
    }

    async fn flush(&self, generation: u64) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut flushed = self.flushed.lock().await;
        if *flushed >= generation {
            return Ok(());
        }

        let (json, snapshot_generation) = {
            let state = self.state.lock();
            (
                serde_json::to_vec_pretty(&state.positions)?,
                state.generation,
            )
        };

        let temp_path = path.with_extension("tmp");
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await?;

        *flushed = snapshot_generation;
        debug!(path = %path.display(), generation = snapshot_generation, "flushed log positions");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = PositionStore::in_memory();
        assert!(store.get("a").is_none());

        store.save("a", LogPosition::new("/log/a.csv", 42)).await.unwrap();
        assert_eq!(store.get("a").unwrap().offset, 42);
        assert!(store.path().is_none());

        store.remove("a").await.unwrap();
        assert!(store.get("a").is_none());
    }

    #[tokio::test]
    async fn test_positions_survive_restart() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("state").join("positions.json");

        let store = PositionStore::open(&file).await.unwrap();
        store.save("a", LogPosition::new("/log/a.csv", 100)).await.unwrap();
        store.save("b", LogPosition::new("/log/b.csv", 7)).await.unwrap();

        let reopened = PositionStore::open(&file).await.unwrap();
        assert_eq!(reopened.get("a").unwrap().offset, 100);
        assert_eq!(reopened.get("b").unwrap().path, "/log/b.csv");
        assert!(!file.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_file_is_a_map_keyed_by_node() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("positions.json");
        let store = PositionStore::open(&file).await.unwrap();
        store.save("node-1", LogPosition::new("/log/x.csv", 5)).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&file).unwrap()).unwrap();
        assert_eq!(json["node-1"]["offset"], 5);
        assert_eq!(json["node-1"]["path"], "/log/x.csv");
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("positions.json");
        std::fs::write(&file, b"{not json").unwrap();

        let store = PositionStore::open(&file).await.unwrap();
        assert!(store.all().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_keep_every_node() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("positions.json");
        let store = Arc::new(PositionStore::open(&file).await.unwrap());

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .save(&format!("n{i}"), LogPosition::new("/log/x.csv", i))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let reopened = PositionStore::open(&file).await.unwrap();
        assert_eq!(reopened.all().len(), 16);
        assert_eq!(reopened.get("n9").unwrap().offset, 9);
    }
}
