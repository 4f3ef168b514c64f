//! Resumable, budgeted retrieval of upstream rows into per-source JSONL files.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::DatasetSpec;
use crate::constants::retrieval::{APPEND_BATCH_BYTES, DEFAULT_SPLIT, PROGRESS_LOG_EVERY};
use crate::errors::PipelineError;
use crate::source::{DatasetRef, UpstreamRow, UpstreamSource};
use crate::types::{DatasetId, DatasetKey};

/// Parameters of one retrieval run.
#[derive(Clone, Debug, PartialEq)]
pub struct RetrievalRequest {
    pub dataset_name: DatasetId,
    pub config: Option<String>,
    pub split: String,
    pub filter_name: Option<String>,
    pub filter_value: Option<String>,
    /// Byte budget for accepted text; `0` disables the budget.
    pub max_bytes: u64,
    /// Destination JSONL file, opened in append mode. Required.
    pub output_file: Option<PathBuf>,
    pub max_samples: Option<usize>,
}

impl RetrievalRequest {
    pub fn new(dataset_name: impl Into<DatasetId>) -> Self {
        Self {
            dataset_name: dataset_name.into(),
            config: None,
            split: DEFAULT_SPLIT.to_string(),
            filter_name: None,
            filter_value: None,
            max_bytes: 0,
            output_file: None,
            max_samples: None,
        }
    }

    /// Request for a configured dataset, writing into `data_dir`.
    pub fn from_spec(spec: &DatasetSpec, data_dir: &Path) -> Self {
        Self {
            dataset_name: spec.dataset.clone(),
            config: spec.config.clone(),
            split: spec.split.clone(),
            filter_name: spec.filter_name.clone(),
            filter_value: spec.filter_value.clone(),
            max_bytes: spec.max_bytes,
            output_file: Some(data_dir.join(spec.raw_file_name())),
            max_samples: spec.max_samples,
        }
    }

    pub fn with_filter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter_name = Some(name.into());
        self.filter_value = Some(value.into());
        self
    }

    pub fn with_output_file(mut self, output_file: impl Into<PathBuf>) -> Self {
        self.output_file = Some(output_file.into());
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = Some(max_samples);
        self
    }

    /// Checkpoint key: the filter value when set, else the dataset name.
    pub fn dataset_key(&self) -> DatasetKey {
        self.filter_value
            .clone()
            .unwrap_or_else(|| self.dataset_name.clone())
    }

    fn dataset_ref(&self) -> DatasetRef {
        DatasetRef::new(self.dataset_name.clone(), self.split.clone()).with_config(self.config.clone())
    }

    fn accepts(&self, row: &UpstreamRow) -> bool {
        match (&self.filter_name, &self.filter_value) {
            (Some(name), Some(value)) => row.meta_matches(name, value),
            _ => true,
        }
    }
}

/// Summary of one retrieval run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetrievalOutcome {
    /// Rows appended by this run.
    pub count: usize,
    /// UTF-8 bytes of text appended by this run.
    pub total_bytes: u64,
    /// Checkpoint offset after this run.
    pub last_index: u64,
}

#[derive(Serialize)]
struct RawLine<'a> {
    text: &'a str,
}

/// Append-only destination that can discard a partially written tail.
trait AppendSink: Write {
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl AppendSink for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Buffers encoded rows and appends them in batches, tracking which rows are
/// fully on disk. A failed batch is truncated away so the sink only ever ends
/// on a committed row boundary.
struct RowAppender<W: AppendSink> {
    sink: W,
    batch_bytes: usize,
    pending: Vec<u8>,
    pending_rows: usize,
    pending_text_bytes: u64,
    committed_len: u64,
    committed_rows: usize,
    committed_text_bytes: u64,
}

impl<W: AppendSink> RowAppender<W> {
    fn new(sink: W, committed_len: u64, batch_bytes: usize) -> Self {
        Self {
            sink,
            batch_bytes,
            pending: Vec::new(),
            pending_rows: 0,
            pending_text_bytes: 0,
            committed_len,
            committed_rows: 0,
            committed_text_bytes: 0,
        }
    }

    fn push(&mut self, text: &str) -> Result<(), PipelineError> {
        serde_json::to_writer(&mut self.pending, &RawLine { text })?;
        self.pending.push(b'\n');
        self.pending_rows += 1;
        self.pending_text_bytes += text.len() as u64;
        if self.pending.len() >= self.batch_bytes {
            self.commit()?;
        }
        Ok(())
    }

    /// Write out pending rows. On failure the pending rows are discarded and
    /// the sink is cut back to the last committed row.
    fn commit(&mut self) -> Result<(), PipelineError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let written = self
            .sink
            .write_all(&self.pending)
            .and_then(|()| self.sink.flush());
        if let Err(err) = written {
            if let Err(truncate_err) = self.sink.truncate_to(self.committed_len) {
                warn!(
                    "[corpusmix:retrieve] failed truncating partial batch at byte {}: {truncate_err}",
                    self.committed_len
                );
            }
            self.clear_pending();
            return Err(err.into());
        }
        self.committed_len += self.pending.len() as u64;
        self.committed_rows += self.pending_rows;
        self.committed_text_bytes += self.pending_text_bytes;
        self.clear_pending();
        Ok(())
    }

    fn clear_pending(&mut self) {
        self.pending.clear();
        self.pending_rows = 0;
        self.pending_text_bytes = 0;
    }
}

/// Streams an upstream source into append-only JSONL files and records
/// progress in a checkpoint store.
pub struct SourceRetriever<'a> {
    upstream: &'a dyn UpstreamSource,
    checkpoints: CheckpointStore,
}

impl<'a> SourceRetriever<'a> {
    pub fn new(upstream: &'a dyn UpstreamSource, checkpoints: CheckpointStore) -> Self {
        Self {
            upstream,
            checkpoints,
        }
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn into_checkpoints(self) -> CheckpointStore {
        self.checkpoints
    }

    /// Append the next batch of filtered rows for `request`.
    ///
    /// The first `last_index` filtered rows are skipped. Retrieval stops once
    /// `max_samples` rows are accepted or the next row would push the text
    /// total past `max_bytes`; that row is dropped. Upstream exhaustion ends
    /// the run normally. On an upstream read failure or a write failure the
    /// rows already on disk are checkpointed before the error is returned; a
    /// partially written batch is truncated away first.
    pub fn retrieve(&mut self, request: &RetrievalRequest) -> Result<RetrievalOutcome, PipelineError> {
        let output_file = request.output_file.clone().ok_or_else(|| {
            PipelineError::Configuration(format!(
                "retrieval of '{}' requires an output_file",
                request.dataset_name
            ))
        })?;
        let key = request.dataset_key();
        let start_index = self.checkpoints.last_index(&key);
        info!(
            "[corpusmix:retrieve] dataset '{}' (key '{}') resuming at filtered row {}",
            request.dataset_name, key, start_index
        );

        if let Some(parent) = output_file.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&output_file)?;
        let existing_len = file.metadata()?.len();
        let mut appender = RowAppender::new(file, existing_len, APPEND_BATCH_BYTES);

        let mut accepted = 0usize;
        let mut accepted_bytes = 0u64;
        let mut skipped = 0u64;
        let mut failure = None;

        let dataset = request.dataset_ref();
        let upstream = self.upstream;
        let mut rows = upstream
            .stream(&dataset)
            .map_err(|err| with_dataset_key(err, &key))?;

        loop {
            if request.max_samples.is_some_and(|max| accepted >= max) {
                break;
            }
            let Some(row) = rows.next() else {
                break;
            };
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    failure = Some(with_dataset_key(err, &key));
                    break;
                }
            };
            if !request.accepts(&row) {
                continue;
            }
            if skipped < start_index {
                skipped += 1;
                continue;
            }

            let text = row.text.as_deref().unwrap_or("");
            let len = text.len() as u64;
            if request.max_bytes > 0 && accepted_bytes + len > request.max_bytes {
                break;
            }
            if let Err(err) = appender.push(text) {
                failure = Some(err);
                break;
            }
            accepted_bytes += len;
            accepted += 1;
            if accepted.is_multiple_of(PROGRESS_LOG_EVERY) {
                info!(
                    "[corpusmix:retrieve] '{}' accepted {} rows ({} bytes)",
                    key, accepted, accepted_bytes
                );
            }
        }
        // A failed push already discarded its batch, so this only writes
        // rows accepted before an upstream failure or the end of the stream.
        if let Err(err) = appender.commit() {
            failure.get_or_insert(err);
        }
        let count = appender.committed_rows;
        let total_bytes = appender.committed_text_bytes;

        if skipped < start_index {
            warn!(
                "[corpusmix:retrieve] '{}' upstream ended after {} of {} previously consumed rows",
                key, skipped, start_index
            );
        }

        let last_index = start_index + count as u64;
        self.checkpoints.update(&key, last_index, &output_file)?;
        if let Some(err) = failure {
            warn!(
                "[corpusmix:retrieve] '{}' stopped after {} committed rows: {err}",
                key, count
            );
            return Err(err);
        }
        info!(
            "[corpusmix:retrieve] '{}' appended {} rows ({} bytes) to {}",
            key,
            count,
            total_bytes,
            output_file.display()
        );
        Ok(RetrievalOutcome {
            count,
            total_bytes,
            last_index,
        })
    }
}

fn with_dataset_key(err: PipelineError, key: &str) -> PipelineError {
    match err {
        PipelineError::SourceUnavailable { source_id, reason } => PipelineError::SourceUnavailable {
            source_id,
            reason: format!("dataset '{key}': {reason}"),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{InMemoryUpstream, RowStream};
    use tempfile::tempdir;

    fn numbered(count: usize) -> InMemoryUpstream {
        InMemoryUpstream::new(
            "memory",
            (0..count).map(|idx| UpstreamRow::text(format!("row {idx}"))).collect(),
        )
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap()["text"]
                .as_str()
                .unwrap()
                .to_string())
            .collect()
    }

    struct FailingUpstream;

    impl UpstreamSource for FailingUpstream {
        fn id(&self) -> &str {
            "failing"
        }

        fn stream(&self, _dataset: &DatasetRef) -> Result<RowStream<'_>, PipelineError> {
            let rows = vec![
                Ok(UpstreamRow::text("ok")),
                Err(PipelineError::SourceUnavailable {
                    source_id: "failing".into(),
                    reason: "connection reset".into(),
                }),
            ];
            Ok(Box::new(rows.into_iter()))
        }
    }

    #[test]
    fn missing_output_file_fails_before_any_io() {
        let dir = tempdir().unwrap();
        let checkpoint = dir.path().join("checkpoint.json");
        let upstream = numbered(3);
        let mut retriever = SourceRetriever::new(&upstream, CheckpointStore::open(&checkpoint));
        let err = retriever.retrieve(&RetrievalRequest::new("org/data")).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(msg) if msg.contains("output_file")));
        assert!(!checkpoint.exists());
    }

    #[test]
    fn resumed_runs_append_without_overlap() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("data").join("src.jsonl");
        let upstream = numbered(10);
        let mut retriever =
            SourceRetriever::new(&upstream, CheckpointStore::open(dir.path().join("cp.json")));
        let request = RetrievalRequest::new("org/data")
            .with_output_file(&output)
            .with_max_samples(4);

        let first = retriever.retrieve(&request).unwrap();
        assert_eq!(first, RetrievalOutcome { count: 4, total_bytes: 20, last_index: 4 });
        let second = retriever.retrieve(&request).unwrap();
        assert_eq!(second.count, 4);
        assert_eq!(second.last_index, 8);
        let third = retriever.retrieve(&request).unwrap();
        assert_eq!(third.count, 2);
        assert_eq!(third.last_index, 10);

        let written = lines(&output);
        let expected: Vec<String> = (0..10).map(|idx| format!("row {idx}")).collect();
        assert_eq!(written, expected);
        assert_eq!(retriever.checkpoints().last_index("org/data"), 10);
    }

    #[test]
    fn filter_selects_rows_and_keys_checkpoint_by_value() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("pubmed.jsonl");
        let upstream = InMemoryUpstream::new(
            "memory",
            vec![
                UpstreamRow::text("a").with_meta("pile_set_name", "PubMed Abstracts"),
                UpstreamRow::text("b").with_meta("pile_set_name", "GitHub"),
                UpstreamRow::text("c").with_meta("pile_set_name", "PubMed Abstracts"),
                UpstreamRow::text("d"),
            ],
        );
        let mut retriever =
            SourceRetriever::new(&upstream, CheckpointStore::open(dir.path().join("cp.json")));
        let request = RetrievalRequest::new("monology/pile-uncopyrighted")
            .with_filter("pile_set_name", "PubMed Abstracts")
            .with_output_file(&output);

        let outcome = retriever.retrieve(&request).unwrap();
        assert_eq!(outcome.count, 2);
        assert_eq!(lines(&output), vec!["a", "c"]);
        assert_eq!(retriever.checkpoints().last_index("PubMed Abstracts"), 2);
        assert_eq!(
            retriever.checkpoints().last_index("monology/pile-uncopyrighted"),
            0
        );
    }

    #[test]
    fn byte_budget_drops_overflowing_row() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("budget.jsonl");
        let upstream = InMemoryUpstream::new(
            "memory",
            vec![
                UpstreamRow::text("aaaa"),
                UpstreamRow::text("bbbb"),
                UpstreamRow::text("cc"),
            ],
        );
        let mut retriever =
            SourceRetriever::new(&upstream, CheckpointStore::open(dir.path().join("cp.json")));
        let request = RetrievalRequest::new("org/data")
            .with_output_file(&output)
            .with_max_bytes(6);

        let outcome = retriever.retrieve(&request).unwrap();
        assert_eq!(outcome.count, 1);
        assert_eq!(outcome.total_bytes, 4);
        assert_eq!(lines(&output), vec!["aaaa"]);
    }

    #[test]
    fn rows_without_text_become_empty_strings() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("empty.jsonl");
        let upstream = InMemoryUpstream::new("memory", vec![UpstreamRow::default()]);
        let mut retriever =
            SourceRetriever::new(&upstream, CheckpointStore::open(dir.path().join("cp.json")));
        let outcome = retriever
            .retrieve(&RetrievalRequest::new("org/data").with_output_file(&output))
            .unwrap();
        assert_eq!(outcome.count, 1);
        assert_eq!(lines(&output), vec![""]);
    }

    #[test]
    fn upstream_failure_checkpoints_written_rows_and_names_key() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("partial.jsonl");
        let upstream = FailingUpstream;
        let mut retriever =
            SourceRetriever::new(&upstream, CheckpointStore::open(dir.path().join("cp.json")));
        let err = retriever
            .retrieve(&RetrievalRequest::new("org/data").with_output_file(&output))
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::SourceUnavailable { reason, .. } if reason.contains("'org/data'")
        ));
        assert_eq!(retriever.checkpoints().last_index("org/data"), 1);
        assert_eq!(lines(&output), vec!["ok"]);
    }

    /// In-memory sink that accepts at most four bytes per write call and
    /// fails once its write budget runs out.
    struct ShortSink {
        data: Vec<u8>,
        writes_left: usize,
    }

    impl Write for ShortSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.writes_left == 0 {
                return Err(io::Error::other("disk full"));
            }
            self.writes_left -= 1;
            let n = buf.len().min(4);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl AppendSink for ShortSink {
        fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn failed_batch_is_truncated_to_last_committed_row() {
        let first_line = "{\"text\":\"row 0\"}\n";
        let sink = ShortSink {
            data: Vec::new(),
            writes_left: first_line.len().div_ceil(4) + 2,
        };
        let mut appender = RowAppender::new(sink, 0, 1);

        appender.push("row 0").unwrap();
        let err = appender.push("row 1").unwrap_err();
        assert!(matches!(err, PipelineError::Io(_)));
        assert_eq!(appender.committed_rows, 1);
        assert_eq!(appender.committed_text_bytes, 5);
        assert_eq!(appender.committed_len, first_line.len() as u64);
        assert_eq!(appender.sink.data, first_line.as_bytes());
        assert!(appender.commit().is_ok());
        assert_eq!(appender.committed_rows, 1);
    }

    #[test]
    fn rows_are_buffered_until_the_batch_fills() {
        let sink = ShortSink {
            data: Vec::new(),
            writes_left: usize::MAX,
        };
        let mut appender = RowAppender::new(sink, 100, 1 << 20);
        appender.push("a").unwrap();
        appender.push("bb").unwrap();
        assert!(appender.sink.data.is_empty());
        assert_eq!(appender.committed_rows, 0);

        appender.commit().unwrap();
        assert_eq!(appender.committed_rows, 2);
        assert_eq!(appender.committed_text_bytes, 3);
        assert_eq!(appender.sink.data, b"{\"text\":\"a\"}\n{\"text\":\"bb\"}\n");
        assert_eq!(appender.committed_len, 100 + appender.sink.data.len() as u64);
    }

    #[test]
    fn from_spec_targets_data_dir() {
        let spec = DatasetSpec::new("wikipedia", "monology/pile-uncopyrighted")
            .with_filter("pile_set_name", "Wikipedia (en)");
        let request = RetrievalRequest::from_spec(&spec, Path::new("data"));
        assert_eq!(request.output_file, Some(PathBuf::from("data/wikipedia.jsonl")));
        assert_eq!(request.dataset_key(), "Wikipedia (en)");
    }
}
