use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::shards::PARTIAL_EXTENSION;
use crate::errors::PipelineError;
pub use crate::types::{SourceName, TokenId};

/// One text sample plus optional derived fields.
///
/// Unknown fields found in a source line are carried through untouched so a
/// record written to a shard re-reads equal to the one that was loaded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Sample text. Required at the parse boundary.
    pub text: String,
    /// Token ids produced by the prepare stage, when tokenized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_ids: Option<Vec<TokenId>>,
    /// Logical source the record was drawn from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceName>,
    /// Any additional fields present in the source line.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Record {
    /// Build a bare text record.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            input_ids: None,
            source: None,
            extra: BTreeMap::new(),
        }
    }

    /// Attach a source tag.
    pub fn with_source(mut self, source: impl Into<SourceName>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Attach token ids.
    pub fn with_input_ids(mut self, input_ids: Vec<TokenId>) -> Self {
        self.input_ids = Some(input_ids);
        self
    }

    /// Parse one JSONL line into a record.
    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Serialize as a single JSONL line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Whitespace-delimited token count used for length statistics.
    pub fn whitespace_len(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Metadata persisted alongside each shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMetadata {
    /// Zero-based shard index.
    pub shard_idx: usize,
    /// Number of records in the shard.
    pub num_examples: usize,
    /// Sorted distinct `source` tags present in the shard.
    pub example_sources: Vec<SourceName>,
}

/// Read every record of a JSONL file, skipping blank lines.
///
/// The first malformed line aborts the read with its 1-based line number.
pub fn read_records(path: &Path) -> Result<Vec<Record>, PipelineError> {
    let file = File::open(path).map_err(|err| PipelineError::Parse {
        path: path.to_path_buf(),
        line: 0,
        reason: format!("cannot open: {err}"),
    })?;
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|err| PipelineError::Parse {
            path: path.to_path_buf(),
            line: idx + 1,
            reason: err.to_string(),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record = Record::from_json_line(&line).map_err(|err| PipelineError::Parse {
            path: path.to_path_buf(),
            line: idx + 1,
            reason: err.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Write `records` as JSONL, replacing `path` only once the write completes.
pub fn write_records<'a>(
    path: &Path,
    records: impl IntoIterator<Item = &'a Record>,
) -> Result<usize, PipelineError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let partial = path.with_extension(PARTIAL_EXTENSION);
    let mut writer = BufWriter::new(File::create(&partial)?);
    let mut written = 0usize;
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
        written += 1;
    }
    writer.flush()?;
    drop(writer);
    fs::rename(&partial, path)?;
    Ok(written)
}
