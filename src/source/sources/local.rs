use std::path::{Path, PathBuf};

use tracing::info;

use super::select_dataset_files;
use crate::errors::PipelineError;
use crate::source::{ChainedRows, DatasetRef, RowStream, UpstreamSource};
use crate::transport::fs::{list_upstream_files, open_file_rows};

/// Upstream reading shard files from local disk.
///
/// `root` may be a single file or a directory. Directories are resolved per
/// dataset: `root/<dataset id>` is used when it exists, otherwise `root`
/// itself, and the files found there are narrowed by config and split.
#[derive(Clone, Debug)]
pub struct LocalFileUpstream {
    id: String,
    root: PathBuf,
    follow_links: bool,
}

impl LocalFileUpstream {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
            follow_links: true,
        }
    }

    /// Toggle symlink traversal during directory walks.
    pub fn with_follow_links(mut self, follow_links: bool) -> Self {
        self.follow_links = follow_links;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve_files(&self, dataset: &DatasetRef) -> Result<Vec<PathBuf>, PipelineError> {
        if self.root.is_file() {
            return Ok(vec![self.root.clone()]);
        }
        if !self.root.is_dir() {
            return Err(PipelineError::SourceUnavailable {
                source_id: self.id.clone(),
                reason: format!("local root {} does not exist", self.root.display()),
            });
        }
        let scoped = self.root.join(&dataset.dataset);
        let base = if scoped.is_dir() { scoped } else { self.root.clone() };
        let relative = list_upstream_files(&base, self.follow_links)
            .into_iter()
            .filter_map(|path| {
                path.strip_prefix(&base).ok().map(|rel| {
                    rel.components()
                        .map(|part| part.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/")
                })
            })
            .collect::<Vec<_>>();
        let selected = select_dataset_files(&self.id, dataset, relative);
        if selected.is_empty() {
            return Err(PipelineError::SourceUnavailable {
                source_id: self.id.clone(),
                reason: format!(
                    "no upstream files for dataset '{}' under {}",
                    dataset.dataset,
                    base.display()
                ),
            });
        }
        Ok(selected.into_iter().map(|rel| base.join(rel)).collect())
    }
}

impl UpstreamSource for LocalFileUpstream {
    fn id(&self) -> &str {
        &self.id
    }

    fn stream(&self, dataset: &DatasetRef) -> Result<RowStream<'_>, PipelineError> {
        let files = self.resolve_files(dataset)?;
        info!(
            "[corpusmix:source] streaming {} local file(s) for dataset '{}'",
            files.len(),
            dataset.dataset
        );
        let source_id = self.id.clone();
        Ok(Box::new(ChainedRows::new(
            files,
            Box::new(move |path: PathBuf| open_file_rows(&source_id, &path)),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn texts(upstream: &LocalFileUpstream, dataset: &DatasetRef) -> Vec<String> {
        upstream
            .stream(dataset)
            .unwrap()
            .map(|row| row.unwrap().text.unwrap_or_default())
            .collect()
    }

    #[test]
    fn single_file_root_streams_that_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        fs::write(&path, "{\"text\":\"a\"}\n{\"text\":\"b\"}\n").unwrap();

        let upstream = LocalFileUpstream::new("local", &path);
        assert_eq!(
            texts(&upstream, &DatasetRef::new("anything", "train")),
            vec!["a", "b"]
        );
    }

    #[test]
    fn directory_root_scopes_by_dataset_and_split() {
        let dir = tempdir().unwrap();
        let scoped = dir.path().join("org").join("corpus");
        fs::create_dir_all(scoped.join("train")).unwrap();
        fs::create_dir_all(scoped.join("validation")).unwrap();
        fs::write(scoped.join("train").join("01.jsonl"), "{\"text\":\"t1\"}\n").unwrap();
        fs::write(scoped.join("train").join("00.jsonl"), "{\"text\":\"t0\"}\n").unwrap();
        fs::write(scoped.join("validation").join("00.jsonl"), "{\"text\":\"v0\"}\n").unwrap();

        let upstream = LocalFileUpstream::new("local", dir.path());
        assert_eq!(
            texts(&upstream, &DatasetRef::new("org/corpus", "train")),
            vec!["t0", "t1"]
        );
        assert_eq!(
            texts(&upstream, &DatasetRef::new("org/corpus", "validation")),
            vec!["v0"]
        );
    }

    #[test]
    fn missing_root_and_empty_directory_are_unavailable() {
        let dir = tempdir().unwrap();
        let dataset = DatasetRef::new("org/corpus", "train");

        let missing = LocalFileUpstream::new("local", dir.path().join("absent"));
        assert!(matches!(
            missing.stream(&dataset),
            Err(PipelineError::SourceUnavailable { .. })
        ));

        let empty = LocalFileUpstream::new("local", dir.path());
        assert!(matches!(
            empty.stream(&dataset),
            Err(PipelineError::SourceUnavailable { reason, .. }) if reason.contains("no upstream files")
        ));
    }
}
