use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::reader::RowIter;
use walkdir::WalkDir;

use crate::errors::PipelineError;
use crate::source::{RowStream, UpstreamRow};

/// Encoding of an upstream shard file, derived from its name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamFileKind {
    /// Newline-delimited JSON, uncompressed.
    Jsonl,
    /// Newline-delimited JSON, zstd-compressed.
    JsonlZstd,
    /// Newline-delimited JSON, gzip-compressed.
    JsonlGzip,
    /// Parquet file.
    Parquet,
}

impl UpstreamFileKind {
    /// Classify `path` by extension, `None` when not an accepted shard file.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".parquet") {
            Some(Self::Parquet)
        } else if name.ends_with(".zst") {
            Some(Self::JsonlZstd)
        } else if name.ends_with(".gz") {
            Some(Self::JsonlGzip)
        } else if name.ends_with(".jsonl") || name.ends_with(".ndjson") || name.ends_with(".json")
        {
            Some(Self::Jsonl)
        } else {
            None
        }
    }
}

/// Recursively list accepted upstream files under `root`, sorted by path.
///
/// A file `root` is returned as-is when accepted.
pub fn list_upstream_files(root: &Path, follow_links: bool) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(follow_links)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| UpstreamFileKind::from_path(path).is_some())
        .collect();
    files.sort();
    files
}

/// Open a lazy row stream over one upstream file.
pub fn open_file_rows(
    source_id: &str,
    path: &Path,
) -> Result<RowStream<'static>, PipelineError> {
    let kind = UpstreamFileKind::from_path(path).ok_or_else(|| PipelineError::SourceUnavailable {
        source_id: source_id.to_string(),
        reason: format!("unsupported upstream file {}", path.display()),
    })?;
    let file = File::open(path).map_err(|err| PipelineError::SourceUnavailable {
        source_id: source_id.to_string(),
        reason: format!("failed opening {}: {err}", path.display()),
    })?;
    match kind {
        UpstreamFileKind::Parquet => open_parquet_rows(source_id, path, file),
        UpstreamFileKind::Jsonl => Ok(json_line_rows(
            source_id,
            path,
            Box::new(BufReader::new(file)),
        )),
        UpstreamFileKind::JsonlGzip => Ok(json_line_rows(
            source_id,
            path,
            Box::new(BufReader::new(MultiGzDecoder::new(file))),
        )),
        UpstreamFileKind::JsonlZstd => {
            let decoder =
                zstd::stream::read::Decoder::new(file).map_err(|err| {
                    PipelineError::SourceUnavailable {
                        source_id: source_id.to_string(),
                        reason: format!("failed opening zstd stream {}: {err}", path.display()),
                    }
                })?;
            Ok(json_line_rows(
                source_id,
                path,
                Box::new(BufReader::new(decoder)),
            ))
        }
    }
}

fn json_line_rows(
    source_id: &str,
    path: &Path,
    reader: Box<dyn BufRead>,
) -> RowStream<'static> {
    let source_id = source_id.to_string();
    let path = path.to_path_buf();
    Box::new(
        reader
            .lines()
            .enumerate()
            .filter_map(move |(idx, line)| {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        return Some(Err(PipelineError::SourceUnavailable {
                            source_id: source_id.clone(),
                            reason: format!(
                                "failed reading {} line {}: {err}",
                                path.display(),
                                idx + 1
                            ),
                        }));
                    }
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return None;
                }
                Some(
                    serde_json::from_str(trimmed)
                        .map(UpstreamRow::from_value)
                        .map_err(|err| PipelineError::SourceUnavailable {
                            source_id: source_id.clone(),
                            reason: format!(
                                "failed decoding JSON row in {} line {}: {err}",
                                path.display(),
                                idx + 1
                            ),
                        }),
                )
            }),
    )
}

fn open_parquet_rows(
    source_id: &str,
    path: &Path,
    file: File,
) -> Result<RowStream<'static>, PipelineError> {
    let reader = SerializedFileReader::new(file).map_err(|err| {
        PipelineError::SourceUnavailable {
            source_id: source_id.to_string(),
            reason: format!("failed reading parquet shard {}: {err}", path.display()),
        }
    })?;
    let reader: Box<dyn FileReader> = Box::new(reader);
    let rows = RowIter::from_file_into(reader);
    let source_id = source_id.to_string();
    let path = path.to_path_buf();
    Ok(Box::new(rows.enumerate().map(move |(position, row)| {
        row.map(|row| UpstreamRow::from_value(row.to_json_value()))
            .map_err(|err| PipelineError::SourceUnavailable {
                source_id: source_id.clone(),
                reason: format!(
                    "failed reading parquet row {} in {}: {err}",
                    position,
                    path.display()
                ),
            })
    })))
}
