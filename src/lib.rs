#![doc = include_str!("../README.md")]

/// Command-line front end used by the `corpusmix` binary.
pub mod app;
/// Resumable retrieval bookkeeping.
pub mod checkpoint;
/// Pipeline configuration types.
pub mod config;
/// Centralized constants used across stages.
pub mod constants;
/// Corpus record and shard metadata types.
pub mod data;
mod hash;
/// Corpus inspection reports and histogram rendering.
pub mod inspect;
/// Mix composition metrics.
pub mod metrics;
/// Ratio mixing, seeded shuffling, and the mixing state machine.
pub mod mixer;
/// Text cleaning, normalization, and file preparation.
pub mod normalizer;
/// Stage orchestration.
pub mod pipeline;
/// Upstream row retrieval with checkpointed resumption.
pub mod retriever;
/// Shard partitioning and persistence.
pub mod shards;
/// Upstream dataset traits and built-in upstreams.
pub mod source;
/// Batch tokenizers.
pub mod tokenizer;
/// Input transports used by upstreams (filesystem today).
pub mod transport;
/// Shared type aliases.
pub mod types;

mod errors;

pub use checkpoint::{CheckpointEntry, CheckpointState, CheckpointStore};
pub use config::{
    DatasetSpec, DebugConfig, InspectConfig, MixRatioTable, MixingConfig, PathsConfig,
    PipelineConfig, PreprocessConfig, ShardingConfig,
};
pub use data::{Record, ShardMetadata, read_records, write_records};
pub use errors::PipelineError;
pub use inspect::{
    HistogramPlotter, InspectReport, Inspector, LanguageDetector, LengthHistogram,
    SvgHistogramPlotter, WhatlangDetector,
};
pub use metrics::{MixComposition, SourceShare};
pub use mixer::{CorpusMixer, DebugPreview, MixStage, SourceFile};
pub use normalizer::TextNormalizer;
pub use pipeline::{MixSummary, Pipeline, RunSummary};
pub use retriever::{RetrievalOutcome, RetrievalRequest, SourceRetriever};
pub use shards::{ParquetShardArchiver, ShardArchiver, ShardManifest, ShardWriter};
#[cfg(feature = "huggingface")]
pub use source::{HubDatasetConfig, HubDatasetUpstream};
pub use source::{
    DatasetRef, InMemoryUpstream, LocalFileUpstream, RowStream, UpstreamRow, UpstreamSource,
};
pub use tokenizer::{BatchTokenizer, HfTokenizer};
pub use types::{DatasetId, DatasetKey, LanguageTag, SourceName, TokenId};
