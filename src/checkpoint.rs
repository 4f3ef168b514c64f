//! Durable retrieval progress, keyed by dataset.
//!
//! The store assumes a single writer. Persistence writes a sibling temp file
//! and renames it over the target; concurrent processes updating the same
//! file are unsupported (last writer wins).

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::PipelineError;
use crate::types::DatasetKey;

/// Progress recorded for one dataset key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    /// Number of filtered upstream rows already written.
    pub last_index: u64,
    /// File the rows were appended to.
    pub output_file: PathBuf,
}

/// Full persisted checkpoint document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    #[serde(default)]
    pub datasets: BTreeMap<DatasetKey, CheckpointEntry>,
}

/// File-backed checkpoint store for resumable retrieval.
pub struct CheckpointStore {
    path: PathBuf,
    state: CheckpointState,
}

impl fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("path", &self.path)
            .field("datasets", &self.state.datasets.len())
            .finish()
    }
}

impl CheckpointStore {
    /// Open the store at `path`, starting empty when the file is missing or unreadable.
    pub fn open<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let state = load_state(&path);
        Self { path, state }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last recorded index for `key`, or `0` when unseen.
    pub fn last_index(&self, key: &str) -> u64 {
        self.state
            .datasets
            .get(key)
            .map(|entry| entry.last_index)
            .unwrap_or(0)
    }

    /// Output file recorded for `key`, if any.
    pub fn output_file(&self, key: &str) -> Option<&Path> {
        self.state
            .datasets
            .get(key)
            .map(|entry| entry.output_file.as_path())
    }

    /// Snapshot of all entries.
    pub fn state(&self) -> &CheckpointState {
        &self.state
    }

    /// Iterate entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&DatasetKey, &CheckpointEntry)> {
        self.state.datasets.iter()
    }

    /// Record progress for `key` and persist the full state immediately.
    ///
    /// Rejects updates that would move `last_index` backwards. Write failures
    /// are returned to the caller.
    pub fn update(
        &mut self,
        key: &str,
        last_index: u64,
        output_file: impl Into<PathBuf>,
    ) -> Result<(), PipelineError> {
        let output_file = output_file.into();
        if let Some(existing) = self.state.datasets.get(key) {
            if last_index < existing.last_index {
                return Err(PipelineError::CheckpointRegression {
                    key: key.to_string(),
                    current: existing.last_index,
                    requested: last_index,
                });
            }
            if existing.output_file != output_file {
                warn!(
                    "[corpusmix:checkpoint] dataset '{}' output moved {} -> {}",
                    key,
                    existing.output_file.display(),
                    output_file.display()
                );
            }
        }
        self.state.datasets.insert(
            key.to_string(),
            CheckpointEntry {
                last_index,
                output_file,
            },
        );
        self.save()
    }

    fn save(&self) -> Result<(), PipelineError> {
        ensure_parent_dir(&self.path).map_err(|err| self.write_error(err))?;
        let raw = serde_json::to_vec_pretty(&self.state).map_err(|err| self.write_error(err))?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, raw).map_err(|err| self.write_error(err))?;
        fs::rename(&tmp_path, &self.path).map_err(|err| self.write_error(err))?;
        debug!(
            "[corpusmix:checkpoint] persisted {} dataset(s) to {}",
            self.state.datasets.len(),
            self.path.display()
        );
        Ok(())
    }

    fn write_error(&self, err: impl fmt::Display) -> PipelineError {
        PipelineError::Checkpoint {
            path: self.path.clone(),
            reason: err.to_string(),
        }
    }
}

fn load_state(path: &Path) -> CheckpointState {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return CheckpointState::default(),
    };
    if raw.trim().is_empty() {
        return CheckpointState::default();
    }
    match serde_json::from_str(&raw) {
        Ok(state) => state,
        Err(err) => {
            warn!(
                "[corpusmix:checkpoint] ignoring unreadable checkpoint {}: {err}",
                path.display()
            );
            CheckpointState::default()
        }
    }
}

fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn unseen_keys_start_at_zero() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::open(dir.path().join("checkpoint.json"));
        assert_eq!(store.last_index("PubMed Abstracts"), 0);
        assert!(store.output_file("PubMed Abstracts").is_none());
        assert!(!dir.path().join("checkpoint.json").exists());
    }

    #[test]
    fn update_persists_and_reopens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("checkpoint.json");
        let mut store = CheckpointStore::open(&path);
        store.update("allenai/c4", 12, "data/c4.jsonl").unwrap();
        store.update("Wikipedia (en)", 3, "data/wikipedia.jsonl").unwrap();
        drop(store);

        let reopened = CheckpointStore::open(&path);
        assert_eq!(reopened.last_index("allenai/c4"), 12);
        let keys: Vec<&str> = reopened.entries().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["Wikipedia (en)", "allenai/c4"]);
        assert_eq!(
            reopened.output_file("Wikipedia (en)"),
            Some(Path::new("data/wikipedia.jsonl"))
        );
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn persisted_layout_nests_entries_under_datasets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let mut store = CheckpointStore::open(&path);
        store.update("key", 4, "out.jsonl").unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["datasets"]["key"]["last_index"], 4);
        assert_eq!(value["datasets"]["key"]["output_file"], "out.jsonl");
    }

    #[test]
    fn corrupt_or_empty_files_fall_back_to_empty_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        fs::write(&path, "datasets: [not json").unwrap();
        let store = CheckpointStore::open(&path);
        assert!(store.state().datasets.is_empty());

        fs::write(&path, "  \n").unwrap();
        let store = CheckpointStore::open(&path);
        assert!(store.state().datasets.is_empty());
    }

    #[test]
    fn last_index_cannot_move_backwards() {
        let dir = tempdir().unwrap();
        let mut store = CheckpointStore::open(dir.path().join("checkpoint.json"));
        store.update("key", 10, "out.jsonl").unwrap();
        store.update("key", 10, "out.jsonl").unwrap();
        let err = store.update("key", 9, "out.jsonl").unwrap_err();
        assert!(matches!(
            err,
            PipelineError::CheckpointRegression { current: 10, requested: 9, .. }
        ));
        assert_eq!(store.last_index("key"), 10);
    }

    #[test]
    fn write_failures_propagate() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "file, not a directory").unwrap();
        let mut store = CheckpointStore::open(blocker.join("checkpoint.json"));
        let err = store.update("key", 1, "out.jsonl").unwrap_err();
        assert!(matches!(err, PipelineError::Checkpoint { .. }));
    }

    #[test]
    fn debug_output_names_store() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::open(dir.path().join("checkpoint.json"));
        assert!(format!("{store:?}").contains("CheckpointStore"));
    }
}
