//! Shard partitioning and persistence.
//!
//! A shard set is written as `shard_NNN.jsonl` payloads with sibling
//! `shard_NNN.meta.json` metadata, optional columnar archives, and a
//! `manifest.json` summary. Every file is written to a `.part` sibling and
//! renamed into place once complete.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parquet::data_type::{ByteArray, ByteArrayType, Int32Type};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use parquet::schema::parser::parse_message_type;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::shards::{
    MANIFEST_FILENAME, MIN_SHARD_INDEX_WIDTH, PARTIAL_EXTENSION, SHARD_ARCHIVE_EXTENSION,
    SHARD_FILE_PREFIX, SHARD_JSONL_EXTENSION, SHARD_META_SUFFIX,
};
use crate::data::{Record, ShardMetadata, write_records};
use crate::errors::PipelineError;
use crate::metrics::source_counts;
use crate::types::SourceName;

/// Zero-padding width for `shard_count` shard indices.
pub fn shard_index_width(shard_count: usize) -> usize {
    let largest = shard_count.saturating_sub(1);
    largest.to_string().len().max(MIN_SHARD_INDEX_WIDTH)
}

/// File stem of shard `idx`, e.g. `shard_007`.
pub fn shard_stem(idx: usize, width: usize) -> String {
    format!("{SHARD_FILE_PREFIX}{idx:0width$}")
}

/// Number of shards `total` records split into at `shard_size` per shard.
pub fn shard_count(total: usize, shard_size: usize) -> usize {
    if shard_size == 0 {
        return 0;
    }
    total.div_ceil(shard_size)
}

/// Metadata for one shard: its index, size, and sorted distinct source tags.
pub fn shard_metadata(shard_idx: usize, records: &[Record]) -> ShardMetadata {
    let example_sources: BTreeSet<&SourceName> = records
        .iter()
        .filter_map(|record| record.source.as_ref())
        .collect();
    ShardMetadata {
        shard_idx,
        num_examples: records.len(),
        example_sources: example_sources.into_iter().cloned().collect(),
    }
}

/// Summary of a written shard set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardManifest {
    /// Shuffle seed of the mix, when the mix was shuffled.
    pub seed: Option<u64>,
    pub shard_size: usize,
    pub total_examples: usize,
    pub shards: Vec<ShardMetadata>,
    /// Record count per source tag across the whole set.
    pub source_counts: BTreeMap<SourceName, usize>,
}

impl ShardManifest {
    /// Read `manifest.json` from a shard directory.
    pub fn load(shard_dir: &Path) -> Result<Self, PipelineError> {
        let raw = fs::read(shard_dir.join(MANIFEST_FILENAME))?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Writes one shard in an alternative columnar format.
pub trait ShardArchiver: Send + Sync {
    /// File extension of archives, without the dot.
    fn extension(&self) -> &str;
    fn write_shard(&self, records: &[Record], path: &Path) -> Result<(), PipelineError>;
}

/// Parquet archive with columns `text`, `input_ids` (list of int32), and
/// `source`. Extra record fields are not archived.
#[derive(Clone, Debug, Default)]
pub struct ParquetShardArchiver;

const PARQUET_SHARD_SCHEMA: &str = "message shard {
    REQUIRED BINARY text (UTF8);
    OPTIONAL group input_ids (LIST) {
        REPEATED group list {
            REQUIRED INT32 element;
        }
    }
    OPTIONAL BINARY source (UTF8);
}";

impl ParquetShardArchiver {
    fn archive_error(path: &Path, err: impl std::fmt::Display) -> PipelineError {
        PipelineError::Archive {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }
}

impl ShardArchiver for ParquetShardArchiver {
    fn extension(&self) -> &str {
        SHARD_ARCHIVE_EXTENSION
    }

    fn write_shard(&self, records: &[Record], path: &Path) -> Result<(), PipelineError> {
        let fail = |err: &dyn std::fmt::Display| Self::archive_error(path, err);
        let schema = Arc::new(parse_message_type(PARQUET_SHARD_SCHEMA).map_err(|e| fail(&e))?);
        let props = Arc::new(WriterProperties::builder().build());

        let texts: Vec<ByteArray> = records
            .iter()
            .map(|record| ByteArray::from(record.text.as_str()))
            .collect();

        let mut id_values = Vec::new();
        let mut id_defs = Vec::with_capacity(records.len());
        let mut id_reps = Vec::with_capacity(records.len());
        for record in records {
            match record.input_ids.as_deref() {
                None => {
                    id_defs.push(0);
                    id_reps.push(0);
                }
                Some([]) => {
                    id_defs.push(1);
                    id_reps.push(0);
                }
                Some(ids) => {
                    for (pos, id) in ids.iter().enumerate() {
                        let value = i32::try_from(*id).map_err(|e| fail(&e))?;
                        id_values.push(value);
                        id_defs.push(2);
                        id_reps.push(if pos == 0 { 0 } else { 1 });
                    }
                }
            }
        }

        let mut sources = Vec::new();
        let mut source_defs = Vec::with_capacity(records.len());
        for record in records {
            match record.source.as_deref() {
                Some(source) => {
                    sources.push(ByteArray::from(source));
                    source_defs.push(1);
                }
                None => source_defs.push(0),
            }
        }

        let partial = path.with_extension(PARTIAL_EXTENSION);
        let file = File::create(&partial)?;
        let mut writer = SerializedFileWriter::new(file, schema, props).map_err(|e| fail(&e))?;
        let mut row_group = writer.next_row_group().map_err(|e| fail(&e))?;

        if let Some(mut column) = row_group.next_column().map_err(|e| fail(&e))? {
            column
                .typed::<ByteArrayType>()
                .write_batch(&texts, None, None)
                .map_err(|e| fail(&e))?;
            column.close().map_err(|e| fail(&e))?;
        }
        if let Some(mut column) = row_group.next_column().map_err(|e| fail(&e))? {
            column
                .typed::<Int32Type>()
                .write_batch(&id_values, Some(&id_defs), Some(&id_reps))
                .map_err(|e| fail(&e))?;
            column.close().map_err(|e| fail(&e))?;
        }
        if let Some(mut column) = row_group.next_column().map_err(|e| fail(&e))? {
            column
                .typed::<ByteArrayType>()
                .write_batch(&sources, Some(&source_defs), None)
                .map_err(|e| fail(&e))?;
            column.close().map_err(|e| fail(&e))?;
        }
        row_group.close().map_err(|e| fail(&e))?;
        writer.close().map_err(|e| fail(&e))?;
        fs::rename(&partial, path)?;
        Ok(())
    }
}

/// Persists a mixed corpus as a shard set under one directory.
pub struct ShardWriter {
    output_dir: PathBuf,
    archiver: Option<Box<dyn ShardArchiver>>,
}

impl std::fmt::Debug for ShardWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardWriter")
            .field("output_dir", &self.output_dir)
            .field(
                "archiver",
                &self.archiver.as_ref().map(|archiver| archiver.extension()),
            )
            .finish()
    }
}

impl ShardWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            archiver: None,
        }
    }

    /// Attach a columnar archiver used when archives are requested.
    pub fn with_archiver(mut self, archiver: Box<dyn ShardArchiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Path of the JSONL payload of shard `stem`.
    pub fn shard_path(&self, stem: &str) -> PathBuf {
        self.output_dir
            .join(format!("{stem}.{SHARD_JSONL_EXTENSION}"))
    }

    /// Path of the metadata file of shard `stem`.
    pub fn metadata_path(&self, stem: &str) -> PathBuf {
        self.output_dir.join(format!("{stem}{SHARD_META_SUFFIX}"))
    }

    /// Partition `records` into consecutive chunks of at most `shard_size`
    /// and persist each chunk.
    ///
    /// Shard files and the manifest left in `output_dir` by an earlier write
    /// are removed first, so the directory only ever holds one shard set.
    /// `shard_size == 0` or an empty corpus writes nothing and returns no
    /// shards. Archives are written only when `as_arrow` is set and an
    /// archiver is attached.
    pub fn write(
        &self,
        records: &[Record],
        shard_size: usize,
        as_arrow: bool,
        seed: Option<u64>,
    ) -> Result<Vec<ShardMetadata>, PipelineError> {
        let count = shard_count(records.len(), shard_size);
        self.clear_previous_shards()?;
        if count == 0 {
            warn!(
                "[corpusmix:shard] nothing to write ({} records, shard_size {})",
                records.len(),
                shard_size
            );
            return Ok(Vec::new());
        }
        let archiver = match (as_arrow, self.archiver.as_deref()) {
            (true, Some(archiver)) => Some(archiver),
            (true, None) => {
                warn!("[corpusmix:shard] columnar output requested but no archiver is attached");
                None
            }
            (false, _) => None,
        };

        fs::create_dir_all(&self.output_dir)?;
        let width = shard_index_width(count);
        let mut shards = Vec::with_capacity(count);
        for (idx, chunk) in records.chunks(shard_size).enumerate() {
            let stem = shard_stem(idx, width);
            write_records(&self.shard_path(&stem), chunk)?;
            let metadata = shard_metadata(idx, chunk);
            write_json(&self.metadata_path(&stem), &metadata)?;
            if let Some(archiver) = archiver {
                let path = self
                    .output_dir
                    .join(format!("{stem}.{}", archiver.extension()));
                archiver.write_shard(chunk, &path)?;
            }
            debug!(
                "[corpusmix:shard] wrote {} ({} examples)",
                stem, metadata.num_examples
            );
            shards.push(metadata);
        }

        let manifest = ShardManifest {
            seed,
            shard_size,
            total_examples: records.len(),
            shards: shards.clone(),
            source_counts: source_counts(records),
        };
        write_json(&self.output_dir.join(MANIFEST_FILENAME), &manifest)?;
        info!(
            "[corpusmix:shard] wrote {} shard(s) with {} examples to {}",
            shards.len(),
            records.len(),
            self.output_dir.display()
        );
        Ok(shards)
    }

    fn clear_previous_shards(&self) -> Result<(), PipelineError> {
        if !self.output_dir.is_dir() {
            return Ok(());
        }
        let mut removed = 0usize;
        for entry in fs::read_dir(&self.output_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if entry.file_type()?.is_file() && is_shard_set_file(&name.to_string_lossy()) {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(
                "[corpusmix:shard] removed {} file(s) of a previous shard set in {}",
                removed,
                self.output_dir.display()
            );
        }
        Ok(())
    }
}

/// `manifest.json`, or any `shard_<digits>.<ext>` file, partials included.
fn is_shard_set_file(name: &str) -> bool {
    if name == MANIFEST_FILENAME
        || Path::new(MANIFEST_FILENAME).with_extension(PARTIAL_EXTENSION) == Path::new(name)
    {
        return true;
    }
    let Some((stem, _)) = name.split_once('.') else {
        return false;
    };
    stem.strip_prefix(SHARD_FILE_PREFIX)
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PipelineError> {
    let partial = path.with_extension(PARTIAL_EXTENSION);
    fs::write(&partial, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&partial, path)?;
    Ok(())
}

/// Read the metadata file of one shard.
pub fn read_shard_metadata(path: &Path) -> Result<ShardMetadata, PipelineError> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}
