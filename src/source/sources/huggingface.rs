use std::path::{Path, PathBuf};

use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use tracing::info;

use super::select_dataset_files;
use crate::constants::retrieval::HUB_RETRIES;
use crate::errors::PipelineError;
use crate::source::{ChainedRows, DatasetRef, RowStream, UpstreamSource};
use crate::transport::fs::{UpstreamFileKind, open_file_rows};

/// Client options for hub dataset access.
#[derive(Clone, Debug)]
pub struct HubDatasetConfig {
    /// Local cache directory; hf-hub's default cache when unset.
    pub cache_dir: Option<PathBuf>,
    /// Access token for gated datasets; the cached hub login is used when unset.
    pub token: Option<String>,
    pub retries: usize,
    /// Show download progress bars.
    pub progress: bool,
}

impl Default for HubDatasetConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            token: None,
            retries: HUB_RETRIES,
            progress: true,
        }
    }
}

/// Upstream streaming data files of a hub dataset repository.
///
/// The remote file list is read once per stream; files are downloaded into
/// the hub cache only when the stream reaches them.
#[derive(Clone, Debug)]
pub struct HubDatasetUpstream {
    id: String,
    config: HubDatasetConfig,
}

impl HubDatasetUpstream {
    pub fn new(id: impl Into<String>, config: HubDatasetConfig) -> Self {
        Self {
            id: id.into(),
            config,
        }
    }

    fn api(&self) -> Result<Api, PipelineError> {
        let mut builder = ApiBuilder::new()
            .with_progress(self.config.progress)
            .with_retries(self.config.retries);
        if let Some(token) = &self.config.token {
            builder = builder.with_token(Some(token.clone()));
        }
        if let Some(cache_dir) = &self.config.cache_dir {
            builder = builder.with_cache_dir(cache_dir.clone());
        }
        builder.build().map_err(|err| PipelineError::SourceUnavailable {
            source_id: self.id.clone(),
            reason: format!("failed building hf-hub client: {err}"),
        })
    }
}

/// Keep remote paths with a readable data-file extension.
fn data_files(siblings: impl IntoIterator<Item = String>) -> Vec<String> {
    siblings
        .into_iter()
        .filter(|path| UpstreamFileKind::from_path(Path::new(path)).is_some())
        .collect()
}

impl UpstreamSource for HubDatasetUpstream {
    fn id(&self) -> &str {
        &self.id
    }

    fn stream(&self, dataset: &DatasetRef) -> Result<RowStream<'_>, PipelineError> {
        let api = self.api()?;
        let repo_api = api.repo(Repo::new(dataset.dataset.clone(), RepoType::Dataset));
        info!(
            "[corpusmix:hub] reading remote file list for dataset {}",
            dataset.dataset
        );
        let repo_info = repo_api
            .info()
            .map_err(|err| PipelineError::SourceUnavailable {
                source_id: self.id.clone(),
                reason: format!("failed reading hf-hub repository info: {err}"),
            })?;
        let candidates = data_files(repo_info.siblings.into_iter().map(|entry| entry.rfilename));
        let remote_files = select_dataset_files(&self.id, dataset, candidates);
        if remote_files.is_empty() {
            return Err(PipelineError::SourceUnavailable {
                source_id: self.id.clone(),
                reason: format!("dataset '{}' lists no readable data files", dataset.dataset),
            });
        }
        info!(
            "[corpusmix:hub] {} remote file(s) selected for dataset {} split '{}'",
            remote_files.len(),
            dataset.dataset,
            dataset.split
        );

        let source_id = self.id.clone();
        Ok(Box::new(ChainedRows::new(
            remote_files,
            Box::new(move |remote_path: String| {
                info!("[corpusmix:hub] fetching {remote_path}");
                let local = repo_api
                    .get(&remote_path)
                    .map_err(|err| PipelineError::SourceUnavailable {
                        source_id: source_id.clone(),
                        reason: format!("failed downloading '{remote_path}' from hf-hub: {err}"),
                    })?;
                open_file_rows(&source_id, &local)
            }),
        )))
    }
}
