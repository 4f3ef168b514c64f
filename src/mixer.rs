//! Ratio-weighted mixing of loaded sources and hand-off to sharding.
//!
//! `CorpusMixer` walks a fixed lifecycle:
//! `Empty -> Loaded -> Mixed -> (Inspected) -> Sharded`. Calling an
//! operation out of order fails with [`PipelineError::InvalidStage`].

use std::path::PathBuf;

use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::config::{DebugConfig, InspectConfig, MixRatioTable};
use crate::constants::mixer::{DEBUG_PREVIEW_CHARS, DEBUG_PREVIEW_TOKENS};
use crate::constants::pipeline::DEFAULT_SHARD_DIR;
use crate::data::{Record, ShardMetadata, read_records};
use crate::errors::PipelineError;
use crate::inspect::{InspectReport, Inspector};
use crate::metrics::{MixComposition, composition, source_counts};
use crate::shards::ShardWriter;
use crate::types::{SourceName, TokenId};

/// Small deterministic RNG used for reproducible shuffles.
#[derive(Debug, Clone)]
struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64_internal(&mut self) -> u64 {
        let mut z = self.state.wrapping_add(0x9E3779B97F4A7C15);
        self.state = z;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }
}

impl rand::RngCore for DeterministicRng {
    fn next_u32(&mut self) -> u32 {
        self.next_u64_internal() as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.next_u64_internal()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64_internal().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}

/// Logical source name and the JSONL file holding its records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    pub name: SourceName,
    pub path: PathBuf,
}

impl SourceFile {
    pub fn new(name: impl Into<SourceName>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Lifecycle position of a [`CorpusMixer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MixStage {
    Empty,
    Loaded,
    Mixed,
    Inspected,
    Sharded,
}

impl MixStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Loaded => "loaded",
            Self::Mixed => "mixed",
            Self::Inspected => "inspected",
            Self::Sharded => "sharded",
        }
    }
}

/// Number of leading records a source contributes at `ratio`.
///
/// Zero for a zero ratio or an empty source; otherwise at least one.
pub fn take_count(len: usize, ratio: f64) -> usize {
    if len == 0 || ratio <= 0.0 {
        return 0;
    }
    let scaled = (len as f64 * ratio).floor() as usize;
    scaled.clamp(1, len)
}

/// One record as shown by [`CorpusMixer::debug_preview`].
#[derive(Clone, Debug, PartialEq)]
pub struct DebugPreview {
    pub index: usize,
    pub source: Option<SourceName>,
    /// Text cut to its first 200 characters.
    pub text: String,
    /// First 20 token ids, when verbose and tokenized.
    pub input_ids: Option<Vec<TokenId>>,
}

/// Loads source files, mixes them by ratio, and shards the result.
pub struct CorpusMixer {
    sources: Vec<SourceFile>,
    loaded: Vec<(SourceName, Vec<Record>)>,
    mixed: Vec<Record>,
    seed: Option<u64>,
    stage: MixStage,
    inspector: Inspector,
    shard_writer: ShardWriter,
}

impl std::fmt::Debug for CorpusMixer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorpusMixer")
            .field("sources", &self.sources)
            .field("stage", &self.stage)
            .field("mixed", &self.mixed.len())
            .finish()
    }
}

impl CorpusMixer {
    /// Mixer over `sources`, in mixing order.
    pub fn new(sources: Vec<SourceFile>) -> Self {
        Self {
            sources,
            loaded: Vec::new(),
            mixed: Vec::new(),
            seed: None,
            stage: MixStage::Empty,
            inspector: Inspector::default(),
            shard_writer: ShardWriter::new(DEFAULT_SHARD_DIR),
        }
    }

    pub fn with_inspector(mut self, inspector: Inspector) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn with_shard_writer(mut self, shard_writer: ShardWriter) -> Self {
        self.shard_writer = shard_writer;
        self
    }

    pub fn stage(&self) -> MixStage {
        self.stage
    }

    /// The mixed corpus in shuffled order (empty before mixing).
    pub fn records(&self) -> &[Record] {
        &self.mixed
    }

    /// Loaded sources with their record counts, in configured order.
    pub fn loaded_sources(&self) -> impl Iterator<Item = (&str, usize)> {
        self.loaded
            .iter()
            .map(|(name, records)| (name.as_str(), records.len()))
    }

    /// Read every source file. Records without a source tag are tagged with
    /// their file's logical name.
    ///
    /// Any unreadable file or malformed line fails the whole load and leaves
    /// the mixer empty.
    pub fn load(&mut self) -> Result<(), PipelineError> {
        self.require("load", "empty", &[MixStage::Empty])?;
        let mut loaded = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let mut records = read_records(&source.path)?;
            for record in &mut records {
                if record.source.is_none() {
                    record.source = Some(source.name.clone());
                }
            }
            info!(
                "[corpusmix:mix] loaded {} records for '{}' from {}",
                records.len(),
                source.name,
                source.path.display()
            );
            loaded.push((source.name.clone(), records));
        }
        self.loaded = loaded;
        self.stage = MixStage::Loaded;
        Ok(())
    }

    /// Take a ratio-determined prefix of each source and shuffle the
    /// concatenation with `seed`.
    ///
    /// Sources absent from `ratios`, or with a zero ratio, contribute
    /// nothing. Any positive ratio keeps at least one record of a non-empty
    /// source.
    pub fn mix(&mut self, ratios: &MixRatioTable, seed: u64) -> Result<(), PipelineError> {
        self.require("mix", "loaded", &[MixStage::Loaded])?;
        ratios.validate()?;
        for (name, _) in ratios.iter() {
            if !self.loaded.iter().any(|(loaded, _)| loaded == name) {
                warn!("[corpusmix:mix] ratio for '{name}' has no loaded source");
            }
        }
        self.mix_with(seed, |name, len| take_count(len, ratios.get(name)))
    }

    /// Keep every loaded record and shuffle with `seed`.
    pub fn mix_all(&mut self, seed: u64) -> Result<(), PipelineError> {
        self.require("mix", "loaded", &[MixStage::Loaded])?;
        self.mix_with(seed, |_, len| len)
    }

    fn mix_with(
        &mut self,
        seed: u64,
        take: impl Fn(&str, usize) -> usize,
    ) -> Result<(), PipelineError> {
        let mut mixed = Vec::new();
        for (name, records) in &self.loaded {
            let n = take(name, records.len());
            info!(
                "[corpusmix:mix] '{}' contributes {} of {} records",
                name,
                n,
                records.len()
            );
            mixed.extend(records.iter().take(n).cloned());
        }
        let mut rng = DeterministicRng::new(seed);
        mixed.shuffle(&mut rng);
        self.mixed = mixed;
        self.seed = Some(seed);
        self.stage = MixStage::Mixed;

        if let Some(summary) = self.composition() {
            info!(
                "[corpusmix:mix] mixed {} records from {} source(s); largest share {:.3}, max/min {:.2}",
                summary.total,
                summary.sources,
                summary.max_share(),
                summary.ratio
            );
        } else {
            warn!("[corpusmix:mix] mix is empty");
        }
        Ok(())
    }

    /// Per-source counts and shares of the current mix.
    pub fn composition(&self) -> Option<MixComposition> {
        composition(&source_counts(&self.mixed))
    }

    /// Log and return the leading records of the mix. Disabled configs are
    /// a no-op.
    pub fn debug_preview(&self, config: &DebugConfig) -> Result<Vec<DebugPreview>, PipelineError> {
        if !config.enabled {
            return Ok(Vec::new());
        }
        self.require(
            "preview",
            "mixed",
            &[MixStage::Mixed, MixStage::Inspected, MixStage::Sharded],
        )?;
        let previews: Vec<DebugPreview> = self
            .mixed
            .iter()
            .take(config.inspect_samples)
            .enumerate()
            .map(|(index, record)| DebugPreview {
                index,
                source: record.source.clone(),
                text: record.text.chars().take(DEBUG_PREVIEW_CHARS).collect(),
                input_ids: config
                    .verbose
                    .then(|| record.input_ids.as_ref())
                    .flatten()
                    .map(|ids| ids.iter().take(DEBUG_PREVIEW_TOKENS).copied().collect()),
            })
            .collect();
        for preview in &previews {
            info!(
                "[corpusmix:debug] sample {} (source: {}): {}",
                preview.index,
                preview.source.as_deref().unwrap_or("?"),
                preview.text
            );
            if let Some(ids) = &preview.input_ids {
                info!("[corpusmix:debug] sample {} input_ids: {:?}", preview.index, ids);
            }
        }
        Ok(previews)
    }

    /// Inspect the mix without modifying it. Disabled configs are a no-op.
    pub fn inspect(&mut self, config: &InspectConfig) -> Result<Option<InspectReport>, PipelineError> {
        if !config.enabled {
            return Ok(None);
        }
        self.require("inspect", "mixed", &[MixStage::Mixed, MixStage::Inspected])?;
        let report = self.inspector.inspect(&self.mixed, config)?;
        self.stage = MixStage::Inspected;
        Ok(report)
    }

    /// Persist the mix as consecutive shards of at most `shard_size`.
    pub fn shard(
        &mut self,
        shard_size: usize,
        as_arrow: bool,
    ) -> Result<Vec<ShardMetadata>, PipelineError> {
        self.require("shard", "mixed", &[MixStage::Mixed, MixStage::Inspected])?;
        let shards = self
            .shard_writer
            .write(&self.mixed, shard_size, as_arrow, self.seed)?;
        self.stage = MixStage::Sharded;
        Ok(shards)
    }

    fn require(
        &self,
        operation: &'static str,
        expected: &'static str,
        allowed: &[MixStage],
    ) -> Result<(), PipelineError> {
        if allowed.contains(&self.stage) {
            Ok(())
        } else {
            Err(PipelineError::InvalidStage {
                operation,
                expected,
                found: self.stage.as_str(),
            })
        }
    }
}
