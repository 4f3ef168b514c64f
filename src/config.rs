use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::inspect::DEFAULT_OUTPUT_DIR;
use crate::constants::mixer::{DEFAULT_DEBUG_SAMPLES, DEFAULT_MIX_SEED};
use crate::constants::normalizer::{DEFAULT_MAX_LENGTH, DEFAULT_TOKENIZER_MODEL};
use crate::constants::pipeline::{DEFAULT_DATA_DIR, DEFAULT_PROCESSED_DIR, DEFAULT_SHARD_DIR};
use crate::constants::retrieval::{DEFAULT_CHECKPOINT_FILE, DEFAULT_SPLIT};
use crate::constants::shards::DEFAULT_SHARD_SIZE;
use crate::errors::PipelineError;
use crate::types::{DatasetId, DatasetKey, SourceName};

/// Mapping from source name to the fraction of its records kept in a mix.
///
/// Sources missing from the table contribute nothing. Fractions need not sum
/// to one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MixRatioTable(IndexMap<SourceName, f64>);

impl MixRatioTable {
    /// Build a table from `(name, ratio)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<SourceName>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(name, ratio)| (name.into(), ratio))
                .collect(),
        )
    }

    /// Ratio for `name`, `0.0` when absent.
    pub fn get(&self, name: &str) -> f64 {
        self.0.get(name).copied().unwrap_or(0.0)
    }

    /// Whether `name` has an explicit entry.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&SourceName, f64)> {
        self.0.iter().map(|(name, ratio)| (name, *ratio))
    }

    /// Number of explicit entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reject non-finite ratios and ratios outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), PipelineError> {
        for (name, ratio) in self.iter() {
            if !ratio.is_finite() || !(0.0..=1.0).contains(&ratio) {
                return Err(PipelineError::Configuration(format!(
                    "mix ratio for '{name}' must be within [0, 1], got {ratio}"
                )));
            }
        }
        Ok(())
    }
}

/// One upstream dataset subset to retrieve and mix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    /// Logical source name used for file names, ratios, and source tags.
    pub name: SourceName,
    /// Upstream dataset identifier, e.g. `allenai/c4`.
    pub dataset: DatasetId,
    /// Optional dataset config variant, e.g. `en`.
    #[serde(default)]
    pub config: Option<String>,
    /// Split name, e.g. `train`.
    #[serde(default = "default_split")]
    pub split: String,
    /// Nested `meta` field used for filtering.
    #[serde(default)]
    pub filter_name: Option<String>,
    /// Required value of `meta[filter_name]`.
    #[serde(default)]
    pub filter_value: Option<String>,
    /// Byte budget for retrieved text (0 means unlimited).
    #[serde(default)]
    pub max_bytes: u64,
    /// Optional cap on retrieved records.
    #[serde(default)]
    pub max_samples: Option<usize>,
}

fn default_split() -> String {
    DEFAULT_SPLIT.to_string()
}

impl DatasetSpec {
    /// Create a spec for `dataset` under logical `name` with defaults.
    pub fn new(name: impl Into<SourceName>, dataset: impl Into<DatasetId>) -> Self {
        Self {
            name: name.into(),
            dataset: dataset.into(),
            config: None,
            split: default_split(),
            filter_name: None,
            filter_value: None,
            max_bytes: 0,
            max_samples: None,
        }
    }

    /// Keep only rows whose `meta[name]` equals `value`.
    pub fn with_filter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter_name = Some(name.into());
        self.filter_value = Some(value.into());
        self
    }

    /// Set the dataset config variant.
    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }

    /// Set the byte budget.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Checkpoint key: the filter value when filtering, else the dataset id.
    pub fn checkpoint_key(&self) -> DatasetKey {
        self.filter_value
            .clone()
            .unwrap_or_else(|| self.dataset.clone())
    }

    /// Raw file name under the data directory.
    pub fn raw_file_name(&self) -> String {
        format!("{}.jsonl", self.name)
    }
}

/// Filesystem locations used by the pipeline stages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory receiving retrieved raw source files.
    pub data_dir: PathBuf,
    /// Directory receiving normalized source files.
    pub processed_dir: PathBuf,
    /// Directory receiving shards.
    pub shard_dir: PathBuf,
    /// Retrieval checkpoint file.
    pub checkpoint_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            processed_dir: PathBuf::from(DEFAULT_PROCESSED_DIR),
            shard_dir: PathBuf::from(DEFAULT_SHARD_DIR),
            checkpoint_file: PathBuf::from(DEFAULT_CHECKPOINT_FILE),
        }
    }
}

/// Mixing stage options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixingConfig {
    /// Ratio table. `None` keeps every loaded record.
    pub ratios: Option<MixRatioTable>,
    /// Shuffle seed.
    pub seed: u64,
}

impl Default for MixingConfig {
    fn default() -> Self {
        Self {
            ratios: None,
            seed: DEFAULT_MIX_SEED,
        }
    }
}

/// Sharding stage options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Maximum records per shard. Zero writes no shards.
    pub shard_size: usize,
    /// Also write each shard as a columnar archive.
    pub as_arrow: bool,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            shard_size: DEFAULT_SHARD_SIZE,
            as_arrow: false,
        }
    }
}

/// Lightweight debug preview of the mixed corpus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub enabled: bool,
    /// Number of leading records to preview.
    pub inspect_samples: usize,
    /// Also show leading token ids.
    pub verbose: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            inspect_samples: DEFAULT_DEBUG_SAMPLES,
            verbose: false,
        }
    }
}

/// Corpus inspection options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectConfig {
    pub enabled: bool,
    /// Directory receiving the report and histogram artifacts.
    pub output_dir: PathBuf,
    pub detect_language: bool,
    pub check_duplicates: bool,
    pub check_pii: bool,
}

impl Default for InspectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            detect_language: false,
            check_duplicates: false,
            check_pii: false,
        }
    }
}

/// Text cleaning, normalization, and tokenization options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Collapse whitespace runs to a single space.
    pub collapse_whitespace: bool,
    /// Strip characters outside letters, digits, and common punctuation.
    pub remove_punct: bool,
    pub lowercase: bool,
    /// Replace standalone numbers with a placeholder token.
    pub normalize_numbers: bool,
    /// Local `tokenizer.json` path or hub model id. `None` skips tokenization.
    pub tokenizer_model: Option<String>,
    /// Truncation length for token sequences.
    pub max_length: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            collapse_whitespace: true,
            remove_punct: true,
            lowercase: true,
            normalize_numbers: true,
            tokenizer_model: Some(DEFAULT_TOKENIZER_MODEL.to_string()),
            max_length: DEFAULT_MAX_LENGTH,
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Sources in mixing order.
    pub datasets: Vec<DatasetSpec>,
    pub paths: PathsConfig,
    pub mixing: MixingConfig,
    pub sharding: ShardingConfig,
    pub debug: DebugConfig,
    pub inspect: InspectConfig,
    pub preprocessing: PreprocessConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            datasets: vec![
                DatasetSpec::new("pubmed", "monology/pile-uncopyrighted")
                    .with_filter("pile_set_name", "PubMed Abstracts")
                    .with_max_bytes(50_000_000),
                DatasetSpec::new("wikipedia", "monology/pile-uncopyrighted")
                    .with_filter("pile_set_name", "Wikipedia (en)")
                    .with_max_bytes(20_000_000),
                DatasetSpec::new("c4", "allenai/c4")
                    .with_config("en")
                    .with_max_bytes(50_000_000),
            ],
            paths: PathsConfig::default(),
            mixing: MixingConfig::default(),
            sharding: ShardingConfig::default(),
            debug: DebugConfig::default(),
            inspect: InspectConfig::default(),
            preprocessing: PreprocessConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Read and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            PipelineError::Configuration(format!(
                "failed reading config {}: {err}",
                path.display()
            ))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|err| {
            PipelineError::Configuration(format!(
                "failed parsing config {}: {err}",
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints once at startup.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut seen = HashSet::new();
        for spec in &self.datasets {
            if spec.name.trim().is_empty() {
                return Err(PipelineError::Configuration(
                    "dataset entries require a non-empty name".into(),
                ));
            }
            if spec.dataset.trim().is_empty() {
                return Err(PipelineError::Configuration(format!(
                    "dataset '{}' requires an upstream dataset id",
                    spec.name
                )));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "dataset name '{}' is listed more than once",
                    spec.name
                )));
            }
            if spec.filter_name.is_some() != spec.filter_value.is_some() {
                return Err(PipelineError::Configuration(format!(
                    "dataset '{}' must set both filter_name and filter_value or neither",
                    spec.name
                )));
            }
        }

        if let Some(ratios) = &self.mixing.ratios {
            ratios.validate()?;
            for (name, _) in ratios.iter() {
                if !seen.contains(name.as_str()) {
                    warn!("[corpusmix:config] mix ratio for unknown source '{name}' is ignored");
                }
            }
        }

        if self.preprocessing.max_length == 0 {
            return Err(PipelineError::Configuration(
                "preprocessing.max_length must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Look up a dataset spec by logical name.
    pub fn dataset(&self, name: &str) -> Option<&DatasetSpec> {
        self.datasets.iter().find(|spec| spec.name == name)
    }
}
