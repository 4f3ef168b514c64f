//! Upstream dataset interfaces.
//!
//! Ownership model:
//! - `UpstreamSource` is the retriever-facing interface that opens a lazy row
//!   stream for a dataset reference.
//! - `ChainedRows` stitches per-file streams together so implementations can
//!   open files one at a time instead of materializing a dataset.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::constants::retrieval::{META_FIELD, TEXT_FIELD};
use crate::errors::PipelineError;
use crate::types::DatasetId;

/// Source implementation modules.
pub mod sources;

#[cfg(feature = "huggingface")]
pub use sources::huggingface::{HubDatasetConfig, HubDatasetUpstream};
pub use sources::local::LocalFileUpstream;

/// Identity of an upstream dataset subset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetRef {
    /// Dataset identifier, e.g. `allenai/c4`.
    pub dataset: DatasetId,
    /// Optional config variant, e.g. `en`.
    pub config: Option<String>,
    /// Split name, e.g. `train`.
    pub split: String,
}

impl DatasetRef {
    pub fn new(dataset: impl Into<DatasetId>, split: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            config: None,
            split: split.into(),
        }
    }

    pub fn with_config(mut self, config: Option<String>) -> Self {
        self.config = config;
        self
    }
}

/// One upstream row reduced to the fields retrieval cares about.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpstreamRow {
    /// Row text, when present.
    pub text: Option<String>,
    /// Nested metadata mapping (`meta`), empty when absent.
    pub meta: Map<String, Value>,
}

impl UpstreamRow {
    /// Row with text and no metadata.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            meta: Map::new(),
        }
    }

    /// Add one metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Decode a JSON row. Non-object rows are treated as bare text.
    ///
    /// `meta` may be an object or a JSON-encoded string, as some hub exports
    /// store it.
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut object) = value else {
            let text = match value {
                Value::String(text) => text,
                other => other.to_string(),
            };
            return Self {
                text: Some(text),
                meta: Map::new(),
            };
        };
        let text = match object.remove(TEXT_FIELD) {
            Some(Value::String(text)) => Some(text),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        let meta = match object.remove(META_FIELD) {
            Some(Value::Object(meta)) => meta,
            Some(Value::String(raw)) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(meta)) => meta,
                _ => Map::new(),
            },
            _ => Map::new(),
        };
        Self { text, meta }
    }

    /// Whether `meta[name]` equals `expected` (string comparison).
    pub fn meta_matches(&self, name: &str, expected: &str) -> bool {
        match self.meta.get(name) {
            Some(Value::String(value)) => value == expected,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == expected,
        }
    }
}

/// Lazy stream of upstream rows.
pub type RowStream<'a> = Box<dyn Iterator<Item = Result<UpstreamRow, PipelineError>> + 'a>;

/// Retriever-facing upstream interface.
///
/// Implementations must stream: the full dataset is never materialized.
pub trait UpstreamSource {
    /// Stable identifier used in logs and errors.
    fn id(&self) -> &str;
    /// Open a fresh stream positioned at the first row of `dataset`.
    fn stream(&self, dataset: &DatasetRef) -> Result<RowStream<'_>, PipelineError>;
}

/// Upstream backed by rows held in memory.
pub struct InMemoryUpstream {
    id: String,
    rows: Arc<Vec<UpstreamRow>>,
}

impl InMemoryUpstream {
    /// Create an upstream yielding `rows` for any dataset reference.
    pub fn new(id: impl Into<String>, rows: Vec<UpstreamRow>) -> Self {
        Self {
            id: id.into(),
            rows: Arc::new(rows),
        }
    }
}

impl UpstreamSource for InMemoryUpstream {
    fn id(&self) -> &str {
        &self.id
    }

    fn stream(&self, _dataset: &DatasetRef) -> Result<RowStream<'_>, PipelineError> {
        Ok(Box::new(self.rows.iter().cloned().map(Ok)))
    }
}

/// Opens the row stream for one pending item (a file path, a remote name, ...).
pub type StreamOpener<'a, T> = Box<dyn FnMut(T) -> Result<RowStream<'a>, PipelineError> + 'a>;

/// Concatenates per-item row streams, opening each item only when reached.
///
/// The stream fuses after the first error.
pub struct ChainedRows<'a, T> {
    pending: VecDeque<T>,
    opener: StreamOpener<'a, T>,
    current: Option<RowStream<'a>>,
    failed: bool,
}

impl<'a, T> ChainedRows<'a, T> {
    pub fn new(pending: impl IntoIterator<Item = T>, opener: StreamOpener<'a, T>) -> Self {
        Self {
            pending: pending.into_iter().collect(),
            opener,
            current: None,
            failed: false,
        }
    }
}

impl<T> Iterator for ChainedRows<'_, T> {
    type Item = Result<UpstreamRow, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(current) = self.current.as_mut() {
                match current.next() {
                    Some(Ok(row)) => return Some(Ok(row)),
                    Some(Err(err)) => {
                        self.failed = true;
                        return Some(Err(err));
                    }
                    None => self.current = None,
                }
            }
            let item = self.pending.pop_front()?;
            match (self.opener)(item) {
                Ok(stream) => self.current = Some(stream),
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
