//! Batch tokenization behind an injectable trait.

use std::path::Path;

use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tracing::info;

use crate::constants::normalizer::PAD_TOKEN;
use crate::errors::PipelineError;
use crate::types::TokenId;

/// Converts a batch of texts into token-id sequences.
///
/// Implementations pad every sequence of a batch to the batch's longest
/// sequence and truncate at their configured maximum length.
pub trait BatchTokenizer: Send + Sync {
    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<TokenId>>, PipelineError>;
}

/// `tokenizers`-backed implementation configured for longest-in-batch
/// padding and truncation.
pub struct HfTokenizer {
    inner: Tokenizer,
    max_length: usize,
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("max_length", &self.max_length)
            .finish()
    }
}

impl HfTokenizer {
    /// Wrap an already constructed tokenizer.
    pub fn from_tokenizer(mut inner: Tokenizer, max_length: usize) -> Result<Self, PipelineError> {
        let pad_id = inner.token_to_id(PAD_TOKEN).unwrap_or(0);
        inner.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            pad_id,
            pad_token: PAD_TOKEN.to_string(),
            ..Default::default()
        }));
        inner
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|err| PipelineError::Tokenizer(format!("invalid truncation: {err}")))?;
        Ok(Self { inner, max_length })
    }

    /// Load a `tokenizer.json` definition from disk.
    pub fn from_file(path: impl AsRef<Path>, max_length: usize) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let inner = Tokenizer::from_file(path).map_err(|err| {
            PipelineError::Tokenizer(format!("failed loading {}: {err}", path.display()))
        })?;
        Self::from_tokenizer(inner, max_length)
    }

    /// Fetch `tokenizer.json` for `model_id` through the hub cache.
    #[cfg(feature = "huggingface")]
    pub fn from_pretrained(model_id: &str, max_length: usize) -> Result<Self, PipelineError> {
        use crate::constants::normalizer::TOKENIZER_FILENAME;
        use crate::constants::retrieval::HUB_RETRIES;
        use hf_hub::api::sync::ApiBuilder;
        use hf_hub::{Repo, RepoType};

        let api = ApiBuilder::new()
            .with_progress(true)
            .with_retries(HUB_RETRIES)
            .build()
            .map_err(|err| PipelineError::Tokenizer(format!("failed building hf-hub client: {err}")))?;
        let repo_api = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let path = repo_api.get(TOKENIZER_FILENAME).map_err(|err| {
            PipelineError::Tokenizer(format!(
                "failed downloading {TOKENIZER_FILENAME} for '{model_id}': {err}"
            ))
        })?;
        Self::from_file(path, max_length)
    }

    /// Resolve `model` as a local file when it exists, else as a hub model id.
    pub fn load(model: &str, max_length: usize) -> Result<Self, PipelineError> {
        let local = Path::new(model);
        if local.is_file() {
            info!("[corpusmix:tokenize] loading tokenizer from {}", local.display());
            return Self::from_file(local, max_length);
        }
        #[cfg(feature = "huggingface")]
        {
            info!("[corpusmix:tokenize] resolving tokenizer '{model}' from the hub");
            Self::from_pretrained(model, max_length)
        }
        #[cfg(not(feature = "huggingface"))]
        {
            Err(PipelineError::Configuration(format!(
                "tokenizer '{model}' is not a local file and hub support is disabled"
            )))
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl BatchTokenizer for HfTokenizer {
    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<TokenId>>, PipelineError> {
        let encodings = self
            .inner
            .encode_batch(texts.to_vec(), true)
            .map_err(|err| PipelineError::Tokenizer(format!("batch encoding failed: {err}")))?;
        Ok(encodings
            .into_iter()
            .map(|encoding| encoding.get_ids().to_vec())
            .collect())
    }
}
