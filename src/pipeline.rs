//! Stage orchestration driven by a validated [`PipelineConfig`].

use std::path::PathBuf;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::info;

use crate::checkpoint::CheckpointStore;
use crate::config::{DatasetSpec, PipelineConfig};
use crate::constants::normalizer::PROCESSED_SUFFIX;
use crate::data::ShardMetadata;
use crate::errors::PipelineError;
use crate::inspect::{InspectReport, Inspector};
use crate::metrics::MixComposition;
use crate::mixer::{CorpusMixer, SourceFile};
use crate::normalizer::TextNormalizer;
use crate::retriever::{RetrievalOutcome, RetrievalRequest, SourceRetriever};
use crate::shards::{ParquetShardArchiver, ShardWriter};
use crate::source::UpstreamSource;
use crate::tokenizer::{BatchTokenizer, HfTokenizer};
use crate::types::SourceName;

/// Results of the mix, inspect, and shard stages.
#[derive(Clone, Debug)]
pub struct MixSummary {
    pub total_examples: usize,
    pub composition: Option<MixComposition>,
    pub report: Option<InspectReport>,
    pub shards: Vec<ShardMetadata>,
}

/// Results of a full run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub retrieved: Vec<(SourceName, RetrievalOutcome)>,
    pub prepared: Vec<(SourceName, usize)>,
    pub mix: MixSummary,
}

/// Runs pipeline stages against one configuration.
pub struct Pipeline {
    config: PipelineConfig,
    inspector: Option<Inspector>,
}

impl Pipeline {
    /// Validate `config` and build a pipeline over it.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            inspector: None,
        })
    }

    /// Use `inspector` instead of the default one for the inspect stage.
    pub fn with_inspector(mut self, inspector: Inspector) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Raw retrieved file of `spec`.
    pub fn raw_path(&self, spec: &DatasetSpec) -> PathBuf {
        self.config.paths.data_dir.join(spec.raw_file_name())
    }

    /// Normalized file of `spec`.
    pub fn processed_path(&self, spec: &DatasetSpec) -> PathBuf {
        self.config
            .paths
            .processed_dir
            .join(format!("{}{PROCESSED_SUFFIX}.jsonl", spec.name))
    }

    /// Build the normalizer, loading the configured tokenizer if any.
    pub fn build_normalizer(&self) -> Result<TextNormalizer, PipelineError> {
        let preprocessing = &self.config.preprocessing;
        let tokenizer = match preprocessing.tokenizer_model.as_deref() {
            Some(model) => {
                let tokenizer = HfTokenizer::load(model, preprocessing.max_length)?;
                Some(Arc::new(tokenizer) as Arc<dyn BatchTokenizer>)
            }
            None => None,
        };
        Ok(TextNormalizer::new(preprocessing, tokenizer))
    }

    /// Retrieve every configured dataset from `upstream`, sequentially,
    /// sharing one checkpoint store.
    pub fn retrieve(
        &self,
        upstream: &dyn UpstreamSource,
    ) -> Result<Vec<(SourceName, RetrievalOutcome)>, PipelineError> {
        let checkpoints = CheckpointStore::open(&self.config.paths.checkpoint_file);
        let mut retriever = SourceRetriever::new(upstream, checkpoints);
        let mut outcomes = Vec::with_capacity(self.config.datasets.len());
        for spec in &self.config.datasets {
            let request = RetrievalRequest::from_spec(spec, &self.config.paths.data_dir);
            let outcome = retriever.retrieve(&request)?;
            info!(
                "[corpusmix:pipeline] retrieved {} new records for '{}' (checkpoint {})",
                outcome.count, spec.name, outcome.last_index
            );
            outcomes.push((spec.name.clone(), outcome));
        }
        Ok(outcomes)
    }

    /// Normalize every raw source file in parallel, one task per source.
    pub fn prepare(
        &self,
        normalizer: &TextNormalizer,
    ) -> Result<Vec<(SourceName, usize)>, PipelineError> {
        self.config
            .datasets
            .par_iter()
            .map(|spec| {
                let written =
                    normalizer.prepare_file(&spec.name, &self.raw_path(spec), &self.processed_path(spec))?;
                Ok((spec.name.clone(), written))
            })
            .collect()
    }

    /// Processed source files in configured order.
    pub fn processed_sources(&self) -> Vec<SourceFile> {
        self.config
            .datasets
            .iter()
            .map(|spec| SourceFile::new(spec.name.clone(), self.processed_path(spec)))
            .collect()
    }

    /// Load, mix, preview, inspect, and shard `sources`.
    pub fn mix(&self, sources: Vec<SourceFile>) -> Result<MixSummary, PipelineError> {
        let mut writer = ShardWriter::new(&self.config.paths.shard_dir);
        if self.config.sharding.as_arrow {
            writer = writer.with_archiver(Box::new(ParquetShardArchiver));
        }
        let mut mixer = CorpusMixer::new(sources).with_shard_writer(writer);
        if let Some(inspector) = &self.inspector {
            mixer = mixer.with_inspector(inspector.clone());
        }

        mixer.load()?;
        let mixing = &self.config.mixing;
        match &mixing.ratios {
            Some(ratios) => mixer.mix(ratios, mixing.seed)?,
            None => mixer.mix_all(mixing.seed)?,
        }
        mixer.debug_preview(&self.config.debug)?;
        let report = mixer.inspect(&self.config.inspect)?;
        let shards = mixer.shard(
            self.config.sharding.shard_size,
            self.config.sharding.as_arrow,
        )?;
        Ok(MixSummary {
            total_examples: mixer.records().len(),
            composition: mixer.composition(),
            report,
            shards,
        })
    }

    /// Run retrieve, prepare, and mix in order.
    pub fn run(
        &self,
        upstream: &dyn UpstreamSource,
        normalizer: &TextNormalizer,
    ) -> Result<RunSummary, PipelineError> {
        let retrieved = self.retrieve(upstream)?;
        let prepared = self.prepare(normalizer)?;
        let mix = self.mix(self.processed_sources())?;
        info!(
            "[corpusmix:pipeline] run complete: {} examples in {} shard(s)",
            mix.total_examples,
            mix.shards.len()
        );
        Ok(RunSummary {
            retrieved,
            prepared,
            mix,
        })
    }
}
