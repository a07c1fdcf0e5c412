//! Checkpoints and the progress log.
//!
//! A checkpoint captures everything the builder needs to pick a run back up:
//! the tree, the pending queue, the id counter, the dedup caches and the
//! run-loop bookkeeping. Every map in it is ordered, so serializing a loaded
//! checkpoint reproduces the file byte for byte.
//!
//! The progress log is an append-only JSONL file with one `add_node` event
//! per node, flushed whenever a checkpoint is taken.

use crate::blueprint::StructuralBlueprint;
use crate::builder::BuildStats;
use crate::node::{DialogueNode, DialogueTree, NodeId};
use crate::state_manager::StateCache;
use crate::validator::{PathMetrics, Thresholds};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid checkpoint at {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

impl PersistError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        PersistError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// A node waiting to be expanded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub node_id: NodeId,
    pub depth: usize,
    /// Ask the generator for fresh choices before expanding (extension rounds).
    #[serde(default)]
    pub refresh: bool,
}

/// Where the run loop stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Expanding,
    Finished,
}

/// Run-loop bookkeeping carried across checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub phase: RunPhase,
    pub extension_round: u32,
    pub extension_attempts: u32,
    /// Consecutive passes that did not improve on `best`.
    pub plateau_rounds: u32,
    pub best: Option<PathMetrics>,
    /// Dequeues since the beam was last trimmed.
    pub dequeued_since_trim: usize,
    /// Nodes created since the last checkpoint.
    pub nodes_since_checkpoint: usize,
    pub checkpoint_seq: u64,
    pub stats: BuildStats,
}

/// A resumable snapshot of a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Format version for compatibility checking.
    pub version: u32,
    pub run_id: Uuid,
    pub saved_at: DateTime<Utc>,
    pub tree: DialogueTree,
    pub queue: Vec<QueueEntry>,
    /// Next id the allocator will hand out.
    pub node_counter: u64,
    pub cache: StateCache,
    /// Thresholds in force for the run.
    pub thresholds: Thresholds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blueprint: Option<StructuralBlueprint>,
    pub progress: RunProgress,
}

impl Checkpoint {
    /// Serialize as pretty JSON.
    pub fn to_json(&self) -> Result<String, PersistError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a checkpoint, checking the version before anything else.
    pub fn from_json(json: &str) -> Result<Self, PersistError> {
        #[derive(Deserialize)]
        struct Partial {
            version: u32,
        }

        let partial: Partial = serde_json::from_str(json)?;
        if partial.version != CHECKPOINT_VERSION {
            return Err(PersistError::VersionMismatch {
                expected: CHECKPOINT_VERSION,
                found: partial.version,
            });
        }
        Ok(serde_json::from_str(json)?)
    }

    /// Write the checkpoint through a temporary file and rename it into place.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let path = path.as_ref();
        let content = self.to_json()?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PersistError::io(parent, e))?;
        }

        let mut tmp_name = OsString::from(path.as_os_str());
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        fs::write(&tmp, content)
            .await
            .map_err(|e| PersistError::io(&tmp, e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| PersistError::io(path, e))?;
        Ok(())
    }

    /// Load a checkpoint file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| PersistError::io(path, e))?;
        Self::from_json(&content).map_err(|e| match e {
            PersistError::Json(source) => PersistError::Corrupt {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Path of the numbered history copy `seq` of a checkpoint.
    ///
    /// `run/tree.json` with seq 3 becomes `run/tree.0003.json`.
    pub fn history_path(path: impl AsRef<Path>, seq: u64) -> PathBuf {
        let path = path.as_ref();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "checkpoint".to_string());
        let name = match path.extension() {
            Some(ext) => format!("{stem}.{seq:04}.{}", ext.to_string_lossy()),
            None => format!("{stem}.{seq:04}"),
        };
        path.with_file_name(name)
    }
}

/// One line of the progress log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub event: String,
    pub node: DialogueNode,
}

/// Buffered JSONL writer for progress events.
#[derive(Debug)]
pub struct ProgressLog {
    path: PathBuf,
    run_id: Uuid,
    pending: Vec<String>,
}

impl ProgressLog {
    /// Create a log appending to `path`.
    pub fn new(path: impl Into<PathBuf>, run_id: Uuid) -> Self {
        Self {
            path: path.into(),
            run_id,
            pending: Vec::new(),
        }
    }

    /// The file events are appended to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of events waiting to be flushed.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Buffer an `add_node` event.
    pub fn record(&mut self, node: &DialogueNode) -> Result<(), PersistError> {
        let event = ProgressEvent {
            timestamp: Utc::now(),
            run_id: self.run_id,
            event: "add_node".to_string(),
            node: node.clone(),
        };
        self.pending.push(serde_json::to_string(&event)?);
        Ok(())
    }

    /// Append buffered events to the file. Returns how many were written.
    pub async fn flush(&mut self) -> Result<usize, PersistError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let mut content = self.pending.join("\n");
        content.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| PersistError::io(&self.path, e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| PersistError::io(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| PersistError::io(&self.path, e))?;

        let written = self.pending.len();
        self.pending.clear();
        Ok(written)
    }

    /// Read every event from a log file.
    pub async fn read_events(path: impl AsRef<Path>) -> Result<Vec<ProgressEvent>, PersistError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| PersistError::io(path, e))?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(PersistError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::node;

    fn checkpoint() -> Checkpoint {
        let mut tree = DialogueTree::new();
        tree.insert_root(node(0, None, 0)).unwrap();
        tree.insert_child(node(1, Some(0), 1)).unwrap();

        Checkpoint {
            version: CHECKPOINT_VERSION,
            run_id: Uuid::new_v4(),
            saved_at: Utc::now(),
            tree,
            queue: vec![QueueEntry {
                node_id: NodeId::new(1),
                depth: 1,
                refresh: false,
            }],
            node_counter: 2,
            cache: StateCache::default(),
            thresholds: Thresholds {
                min_depth: 3,
                min_duration_minutes: 0.75,
                min_endings: 1,
            },
            blueprint: None,
            progress: RunProgress {
                best: Some(PathMetrics {
                    depth: 1,
                    duration_minutes: 0.25,
                    endings: 0,
                }),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tree.json");
        let original = checkpoint();

        original.save(&path).await.unwrap();
        let loaded = Checkpoint::load(&path).await.unwrap();

        assert_eq!(loaded, original);
        assert_eq!(loaded.to_json().unwrap(), original.to_json().unwrap());
        assert!(!dir.path().join("nested").join("tree.json.tmp").exists());
    }

    #[test]
    fn test_version_mismatch() {
        let mut cp = checkpoint();
        cp.version = 99;
        let json = serde_json::to_string(&cp).unwrap();
        assert!(matches!(
            Checkpoint::from_json(&json),
            Err(PersistError::VersionMismatch {
                expected: 1,
                found: 99
            })
        ));
    }

    #[tokio::test]
    async fn test_load_errors_name_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        let err = Checkpoint::load(&missing).await.unwrap_err();
        assert!(err.to_string().contains("missing.json"));

        let garbage = dir.path().join("garbage.json");
        std::fs::write(&garbage, r#"{"version": 1, "tree": 7}"#).unwrap();
        let err = Checkpoint::load(&garbage).await.unwrap_err();
        assert!(matches!(err, PersistError::Corrupt { .. }));
        assert!(err.to_string().contains("garbage.json"));
    }

    #[test]
    fn test_history_path() {
        assert_eq!(
            Checkpoint::history_path("run/tree.json", 3),
            PathBuf::from("run/tree.0003.json")
        );
        assert_eq!(
            Checkpoint::history_path("cp", 12),
            PathBuf::from("cp.0012")
        );
    }

    #[tokio::test]
    async fn test_progress_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.jsonl");
        let run_id = Uuid::new_v4();
        let mut log = ProgressLog::new(&path, run_id);

        log.record(&node(0, None, 0)).unwrap();
        log.record(&node(1, Some(0), 1)).unwrap();
        assert_eq!(log.pending(), 2);
        assert_eq!(log.flush().await.unwrap(), 2);
        assert_eq!(log.flush().await.unwrap(), 0);

        log.record(&node(2, Some(0), 1)).unwrap();
        log.flush().await.unwrap();

        let events = ProgressLog::read_events(&path).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.event == "add_node" && e.run_id == run_id));
        assert_eq!(events[2].node.id, NodeId::new(2));
    }
}
