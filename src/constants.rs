/// Constants used by the mixing engine.
pub mod mixer {
    /// Seed used for the post-mix shuffle when the caller does not override it.
    pub const DEFAULT_MIX_SEED: u64 = 42;
    /// Maximum characters of text shown per record in debug previews.
    pub const DEBUG_PREVIEW_CHARS: usize = 200;
    /// Maximum token ids shown per record in verbose debug previews.
    pub const DEBUG_PREVIEW_TOKENS: usize = 20;
    /// Number of records shown by debug previews when unset.
    pub const DEFAULT_DEBUG_SAMPLES: usize = 5;
}

/// Constants used by shard persistence.
pub mod shards {
    /// Default maximum number of records per shard.
    pub const DEFAULT_SHARD_SIZE: usize = 5000;
    /// Minimum zero-padding width of shard indices in file names.
    pub const MIN_SHARD_INDEX_WIDTH: usize = 3;
    /// File name prefix for shard payloads and metadata.
    pub const SHARD_FILE_PREFIX: &str = "shard_";
    /// Extension of JSONL shard payloads.
    pub const SHARD_JSONL_EXTENSION: &str = "jsonl";
    /// Suffix of per-shard metadata files.
    pub const SHARD_META_SUFFIX: &str = ".meta.json";
    /// Extension of columnar shard archives.
    pub const SHARD_ARCHIVE_EXTENSION: &str = "parquet";
    /// File name of the shard-set manifest.
    pub const MANIFEST_FILENAME: &str = "manifest.json";
    /// Extension used for in-progress writes before the final rename.
    pub const PARTIAL_EXTENSION: &str = "part";
}

/// Constants used by the corpus inspector.
pub mod inspect {
    /// Maximum records passed to language detection.
    pub const LANGUAGE_SAMPLE_LIMIT: usize = 500;
    /// Number of bins in the length histogram.
    pub const HISTOGRAM_BINS: usize = 50;
    /// Default directory for inspection artifacts.
    pub const DEFAULT_OUTPUT_DIR: &str = "inspect_reports";
    /// File name of the structured inspection report.
    pub const REPORT_FILENAME: &str = "inspect_report.json";
    /// File name of the histogram data artifact.
    pub const HISTOGRAM_DATA_FILENAME: &str = "length_hist.json";
    /// File name stem of the rendered histogram plot.
    pub const HISTOGRAM_PLOT_STEM: &str = "length_hist";
    /// Email-like pattern counted as a PII hit.
    pub const PII_EMAIL_PATTERN: &str = r"\b[\w.-]+?@\w+?\.\w+?\b";
}

/// Constants used by text normalization and tokenization.
pub mod normalizer {
    /// Placeholder substituted for standalone numeric tokens.
    pub const NUMBER_PLACEHOLDER: &str = "<NUM>";
    /// Default tokenizer model identifier.
    pub const DEFAULT_TOKENIZER_MODEL: &str = "bert-base-uncased";
    /// Default maximum token sequence length.
    pub const DEFAULT_MAX_LENGTH: usize = 512;
    /// Tokenizer definition file fetched from model repositories.
    pub const TOKENIZER_FILENAME: &str = "tokenizer.json";
    /// Padding token looked up in the tokenizer vocabulary.
    pub const PAD_TOKEN: &str = "[PAD]";
    /// Suffix appended to processed source file stems.
    pub const PROCESSED_SUFFIX: &str = "_processed";
}

/// Constants used by retrieval and checkpointing.
pub mod retrieval {
    /// Default split requested from upstream datasets.
    pub const DEFAULT_SPLIT: &str = "train";
    /// Default checkpoint file location.
    pub const DEFAULT_CHECKPOINT_FILE: &str = "config/dataset_checkpoint.json";
    /// Upstream row field carrying record text.
    pub const TEXT_FIELD: &str = "text";
    /// Upstream row field carrying nested metadata.
    pub const META_FIELD: &str = "meta";
    /// Number of accepted rows between retrieval progress log lines.
    pub const PROGRESS_LOG_EVERY: usize = 10_000;
    /// Encoded bytes buffered before retrieved rows are appended to disk.
    pub const APPEND_BATCH_BYTES: usize = 1 << 20;
    /// Hub download retry budget.
    pub const HUB_RETRIES: usize = 5;
}

/// Constants used by the pipeline driver.
pub mod pipeline {
    /// Environment variable naming the configuration file.
    pub const CONFIG_ENV_VAR: &str = "CORPUSMIX_CONFIG";
    /// Default directory for retrieved raw source files.
    pub const DEFAULT_DATA_DIR: &str = "data";
    /// Default directory for normalized source files.
    pub const DEFAULT_PROCESSED_DIR: &str = "processed";
    /// Default directory for written shards.
    pub const DEFAULT_SHARD_DIR: &str = "processed_shards";
}
