//! Text cleaning, normalization, and tokenization of source files.
//!
//! Stages always run in the order clean, normalize, tokenize.

use std::path::Path;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{info, warn};

use crate::config::PreprocessConfig;
use crate::constants::normalizer::NUMBER_PLACEHOLDER;
use crate::data::{read_records, write_records};
use crate::errors::PipelineError;
use crate::tokenizer::BatchTokenizer;
use crate::types::TokenId;

static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("Invalid whitespace regex"));
static DISALLOWED_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^a-zA-Z0-9.,;:!?()\[\]\-'\s]").expect("Invalid character filter regex")
});
static REPEATED_TERMINAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([.!?]){2,}").expect("Invalid punctuation regex"));
static STANDALONE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(\.\d+)?\b").expect("Invalid number regex"));

/// Configurable text normalizer with an optional injected tokenizer.
#[derive(Clone)]
pub struct TextNormalizer {
    collapse_whitespace: bool,
    remove_punct: bool,
    lowercase: bool,
    normalize_numbers: bool,
    tokenizer: Option<Arc<dyn BatchTokenizer>>,
}

impl std::fmt::Debug for TextNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextNormalizer")
            .field("collapse_whitespace", &self.collapse_whitespace)
            .field("remove_punct", &self.remove_punct)
            .field("lowercase", &self.lowercase)
            .field("normalize_numbers", &self.normalize_numbers)
            .field("tokenizer", &self.tokenizer.is_some())
            .finish()
    }
}

impl TextNormalizer {
    pub fn new(config: &PreprocessConfig, tokenizer: Option<Arc<dyn BatchTokenizer>>) -> Self {
        Self {
            collapse_whitespace: config.collapse_whitespace,
            remove_punct: config.remove_punct,
            lowercase: config.lowercase,
            normalize_numbers: config.normalize_numbers,
            tokenizer,
        }
    }

    /// Collapse whitespace runs, drop characters outside the allowed set,
    /// and lowercase; each step follows its toggle.
    pub fn clean(&self, text: &str) -> String {
        let mut out = if self.collapse_whitespace {
            WHITESPACE_RUN.replace_all(text, " ").into_owned()
        } else {
            text.to_string()
        };
        if self.remove_punct {
            out = DISALLOWED_CHARS.replace_all(&out, "").into_owned();
        }
        if self.lowercase {
            out = out.to_lowercase();
        }
        out
    }

    /// Collapse runs of `.`, `!`, `?` to one character and, when enabled,
    /// replace standalone numbers with the placeholder token.
    pub fn normalize(&self, text: &str) -> String {
        let out = REPEATED_TERMINAL.replace_all(text, "$1");
        if self.normalize_numbers {
            STANDALONE_NUMBER
                .replace_all(&out, NUMBER_PLACEHOLDER)
                .into_owned()
        } else {
            out.into_owned()
        }
    }

    /// Clean then normalize.
    pub fn prepare_text(&self, text: &str) -> String {
        self.normalize(&self.clean(text))
    }

    /// Tokenize one batch with the injected tokenizer.
    ///
    /// Empty input returns empty output. Fails with a configuration error
    /// when no tokenizer was injected.
    pub fn tokenize(&self, texts: &[String]) -> Result<Vec<Vec<TokenId>>, PipelineError> {
        if texts.is_empty() {
            warn!("[corpusmix:normalize] no texts passed for tokenization");
            return Ok(Vec::new());
        }
        let tokenizer = self.tokenizer.as_ref().ok_or_else(|| {
            PipelineError::Configuration("tokenization requested without a tokenizer".into())
        })?;
        let ids = tokenizer.encode_batch(texts)?;
        if ids.len() != texts.len() {
            return Err(PipelineError::Tokenizer(format!(
                "tokenizer returned {} sequences for {} texts",
                ids.len(),
                texts.len()
            )));
        }
        Ok(ids)
    }

    pub fn has_tokenizer(&self) -> bool {
        self.tokenizer.is_some()
    }

    /// Process a whole source file into `output`, tagging every record with
    /// `source_name`. Returns the number of records written.
    ///
    /// Without a tokenizer, `input_ids` is omitted. The output replaces any
    /// previous file only after a complete write.
    pub fn prepare_file(
        &self,
        source_name: &str,
        input: &Path,
        output: &Path,
    ) -> Result<usize, PipelineError> {
        let mut records = read_records(input)?;
        for record in &mut records {
            record.text = self.prepare_text(&record.text);
            record.input_ids = None;
            record.source = Some(source_name.to_string());
        }
        if self.tokenizer.is_some() && !records.is_empty() {
            let texts: Vec<String> = records.iter().map(|record| record.text.clone()).collect();
            let ids = self.tokenize(&texts)?;
            for (record, ids) in records.iter_mut().zip(ids) {
                record.input_ids = Some(ids);
            }
        }
        let written = write_records(output, &records)?;
        info!(
            "[corpusmix:normalize] '{}' prepared {} records -> {}",
            source_name,
            written,
            output.display()
        );
        Ok(written)
    }
}

impl Default for TextNormalizer {
    fn default() -> Self {
        Self::new(&PreprocessConfig::default(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    /// Splits on whitespace and maps each word to its length, padding the
    /// batch to its longest sequence.
    struct WordLengthTokenizer;

    impl BatchTokenizer for WordLengthTokenizer {
        fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<TokenId>>, PipelineError> {
            let raw: Vec<Vec<TokenId>> = texts
                .iter()
                .map(|text| text.split_whitespace().map(|w| w.len() as TokenId).collect())
                .collect();
            let longest = raw.iter().map(Vec::len).max().unwrap_or(0);
            Ok(raw
                .into_iter()
                .map(|mut ids| {
                    ids.resize(longest, 0);
                    ids
                })
                .collect())
        }
    }

    fn config(remove_punct: bool, lowercase: bool, normalize_numbers: bool) -> PreprocessConfig {
        PreprocessConfig {
            remove_punct,
            lowercase,
            normalize_numbers,
            tokenizer_model: None,
            ..PreprocessConfig::default()
        }
    }

    #[test]
    fn clean_collapses_strips_and_lowercases() {
        let normalizer = TextNormalizer::default();
        assert_eq!(
            normalizer.clean("Hello\t\n  World™ (ok) [x] - it's #1!"),
            "hello world (ok) [x] - it's 1!"
        );
    }

    #[test]
    fn clean_steps_follow_toggles() {
        let keep_all = TextNormalizer::new(&config(false, false, true), None);
        assert_eq!(keep_all.clean("A  b#C"), "A b#C");

        let mut raw = config(false, false, true);
        raw.collapse_whitespace = false;
        let untouched = TextNormalizer::new(&raw, None);
        assert_eq!(untouched.clean("A \t b"), "A \t b");
    }

    #[test]
    fn normalize_collapses_terminal_runs_and_numbers() {
        let normalizer = TextNormalizer::default();
        assert_eq!(normalizer.normalize("wow!!! really?? ok..."), "wow! really? ok.");
        assert_eq!(
            normalizer.normalize("took 12 doses of 2.5 mg in 2020"),
            "took <NUM> doses of <NUM> mg in <NUM>"
        );
        assert_eq!(normalizer.normalize("covid19 stays"), "covid19 stays");

        let keep_numbers = TextNormalizer::new(&config(true, true, false), None);
        assert_eq!(keep_numbers.normalize("12 monkeys!!"), "12 monkeys!");
    }

    #[test]
    fn tokenize_requires_a_tokenizer_only_for_non_empty_input() {
        let normalizer = TextNormalizer::default();
        assert!(normalizer.tokenize(&[]).unwrap().is_empty());
        assert!(matches!(
            normalizer.tokenize(&["x".to_string()]),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn tokenize_pads_batch_to_longest() {
        let normalizer =
            TextNormalizer::new(&PreprocessConfig::default(), Some(Arc::new(WordLengthTokenizer)));
        let ids = normalizer
            .tokenize(&["aa bbb".to_string(), "c".to_string()])
            .unwrap();
        assert_eq!(ids, vec![vec![2, 3], vec![1, 0]]);
    }

    #[test]
    fn prepare_file_writes_tagged_tokenized_records() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("pubmed.jsonl");
        let output = dir.path().join("processed").join("pubmed_processed.jsonl");
        fs::write(
            &input,
            "{\"text\":\"Dose  WAS 10 mg!!!\"}\n\n{\"text\":\"Fine.\"}\n",
        )
        .unwrap();

        let normalizer =
            TextNormalizer::new(&PreprocessConfig::default(), Some(Arc::new(WordLengthTokenizer)));
        assert_eq!(normalizer.prepare_file("pubmed", &input, &output).unwrap(), 2);

        let records = read_records(&output).unwrap();
        assert_eq!(records[0].text, "dose was <NUM> mg!");
        assert_eq!(records[0].source.as_deref(), Some("pubmed"));
        assert_eq!(records[0].input_ids, Some(vec![4, 3, 5, 3]));
        assert_eq!(records[1].input_ids, Some(vec![5, 0, 0, 0]));
        assert!(records.iter().all(|record| record.input_ids.is_some()));
    }

    #[test]
    fn prepare_file_without_tokenizer_omits_input_ids() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("c4.jsonl");
        let output = dir.path().join("c4_processed.jsonl");
        fs::write(&input, "{\"text\":\"Plain TEXT\"}\n").unwrap();

        let normalizer = TextNormalizer::new(&config(true, true, true), None);
        normalizer.prepare_file("c4", &input, &output).unwrap();
        let raw = fs::read_to_string(&output).unwrap();
        assert_eq!(raw, "{\"text\":\"plain text\",\"source\":\"c4\"}\n");
    }
}
