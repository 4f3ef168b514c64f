use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::{DatasetKey, SourceName};

/// Error type for configuration, parsing, upstream, and persistence failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("failed parsing {} line {line}: {reason}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("cannot {operation} while corpus is {found} (expected {expected})")]
    InvalidStage {
        operation: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    #[error("upstream source '{source_id}' is unavailable: {reason}")]
    SourceUnavailable {
        source_id: SourceName,
        reason: String,
    },
    #[error("checkpoint failure for {}: {reason}", path.display())]
    Checkpoint { path: PathBuf, reason: String },
    #[error("checkpoint for dataset '{key}' cannot move backwards ({current} -> {requested})")]
    CheckpointRegression {
        key: DatasetKey,
        current: u64,
        requested: u64,
    },
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("failed writing columnar archive {}: {reason}", path.display())]
    Archive { path: PathBuf, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
