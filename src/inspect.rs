//! Quality signals over a mixed corpus.
//!
//! Inspection is read-only with respect to the corpus. When disabled it
//! performs no filesystem access at all.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::InspectConfig;
use crate::constants::inspect::{
    HISTOGRAM_BINS, HISTOGRAM_DATA_FILENAME, HISTOGRAM_PLOT_STEM, LANGUAGE_SAMPLE_LIMIT,
    PII_EMAIL_PATTERN, REPORT_FILENAME,
};
use crate::data::Record;
use crate::errors::PipelineError;
use crate::hash::content_digest;
use crate::types::LanguageTag;

static EMAIL_LIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PII_EMAIL_PATTERN).expect("Invalid PII regex"));

/// Identifies the language of a text sample.
pub trait LanguageDetector: Send + Sync {
    /// `None` when the language cannot be determined.
    fn detect(&self, text: &str) -> Option<LanguageTag>;
}

/// Renders a length histogram to an image file.
pub trait HistogramPlotter: Send + Sync {
    /// File extension of rendered plots, without the dot.
    fn extension(&self) -> &str;
    fn render(&self, histogram: &LengthHistogram, path: &Path) -> Result<(), PipelineError>;
}

/// Structured inspection report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InspectReport {
    pub num_samples: usize,
    /// Mean whitespace-token length, `0.0` for an empty corpus.
    pub avg_length: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang_counts: Option<BTreeMap<LanguageTag, usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_count: Option<usize>,
    /// Records containing at least one email-like string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pii_hits: Option<usize>,
}

/// Equal-width histogram of whitespace-token lengths.
///
/// Bins are half-open except the last, which includes the maximum. A corpus
/// of identical lengths is centered in a unit-wide range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LengthHistogram {
    /// `counts.len() + 1` ascending bin edges.
    pub edges: Vec<f64>,
    pub counts: Vec<usize>,
}

impl LengthHistogram {
    pub fn from_lengths(lengths: &[usize], bins: usize) -> Self {
        let bins = bins.max(1);
        let (mut lo, mut hi) = match (lengths.iter().min(), lengths.iter().max()) {
            (Some(min), Some(max)) => (*min as f64, *max as f64),
            _ => (0.0, 1.0),
        };
        if lo == hi {
            lo -= 0.5;
            hi += 0.5;
        }
        let width = (hi - lo) / bins as f64;
        let edges = (0..=bins).map(|idx| lo + width * idx as f64).collect();
        let mut counts = vec![0usize; bins];
        for &length in lengths {
            let offset = ((length as f64 - lo) / width).floor() as usize;
            counts[offset.min(bins - 1)] += 1;
        }
        Self { edges, counts }
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }
}

/// Minimal SVG bar chart renderer.
#[derive(Clone, Debug)]
pub struct SvgHistogramPlotter {
    pub width: u32,
    pub height: u32,
}

impl Default for SvgHistogramPlotter {
    fn default() -> Self {
        Self {
            width: 640,
            height: 400,
        }
    }
}

impl SvgHistogramPlotter {
    fn svg(&self, histogram: &LengthHistogram) -> String {
        let margin = 40.0;
        let plot_w = self.width as f64 - 2.0 * margin;
        let plot_h = self.height as f64 - 2.0 * margin;
        let peak = histogram.counts.iter().copied().max().unwrap_or(0).max(1) as f64;
        let bar_w = plot_w / histogram.counts.len().max(1) as f64;

        let mut svg = String::new();
        let _ = writeln!(
            svg,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{}" height="{}" viewBox="0 0 {} {}">"#,
            self.width, self.height, self.width, self.height
        );
        let _ = writeln!(
            svg,
            r#"<text x="{}" y="20" text-anchor="middle" font-size="14">Text Length Histogram</text>"#,
            self.width / 2
        );
        for (idx, count) in histogram.counts.iter().enumerate() {
            let bar_h = plot_h * (*count as f64) / peak;
            let _ = writeln!(
                svg,
                r##"<rect x="{:.2}" y="{:.2}" width="{:.2}" height="{:.2}" fill="#4c72b0"/>"##,
                margin + bar_w * idx as f64,
                margin + plot_h - bar_h,
                bar_w.max(0.5) * 0.95,
                bar_h
            );
        }
        let first = histogram.edges.first().copied().unwrap_or(0.0);
        let last = histogram.edges.last().copied().unwrap_or(0.0);
        let baseline = margin + plot_h;
        let _ = writeln!(
            svg,
            r#"<text x="{margin}" y="{:.2}" font-size="11">{first:.0}</text>"#,
            baseline + 15.0
        );
        let _ = writeln!(
            svg,
            r#"<text x="{:.2}" y="{:.2}" text-anchor="end" font-size="11">{last:.0}</text>"#,
            margin + plot_w,
            baseline + 15.0
        );
        let _ = writeln!(
            svg,
            r#"<text x="{}" y="{}" text-anchor="middle" font-size="12">Tokens</text>"#,
            self.width / 2,
            self.height - 5
        );
        let _ = writeln!(
            svg,
            r#"<text x="12" y="{}" font-size="12" transform="rotate(-90 12 {})">Frequency</text>"#,
            self.height / 2,
            self.height / 2
        );
        svg.push_str("</svg>\n");
        svg
    }
}

impl HistogramPlotter for SvgHistogramPlotter {
    fn extension(&self) -> &str {
        "svg"
    }

    fn render(&self, histogram: &LengthHistogram, path: &Path) -> Result<(), PipelineError> {
        fs::write(path, self.svg(histogram))?;
        Ok(())
    }
}

/// Trigram-based detector reporting ISO 639-3 codes such as `eng` or `deu`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WhatlangDetector;

impl LanguageDetector for WhatlangDetector {
    fn detect(&self, text: &str) -> Option<LanguageTag> {
        whatlang::detect(text).map(|info| info.lang().code().to_string())
    }
}

/// Computes inspection reports with optional injected capabilities.
#[derive(Clone)]
pub struct Inspector {
    language_detector: Option<Arc<dyn LanguageDetector>>,
    plotter: Option<Arc<dyn HistogramPlotter>>,
}

impl Default for Inspector {
    fn default() -> Self {
        Self {
            language_detector: Some(Arc::new(WhatlangDetector)),
            plotter: Some(Arc::new(SvgHistogramPlotter::default())),
        }
    }
}

impl std::fmt::Debug for Inspector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inspector")
            .field("language_detector", &self.language_detector.is_some())
            .field("plotter", &self.plotter.as_ref().map(|p| p.extension()))
            .finish()
    }
}

impl Inspector {
    /// Replace the language detector; `None` disables language counts.
    pub fn with_language_detector(mut self, detector: Option<Arc<dyn LanguageDetector>>) -> Self {
        self.language_detector = detector;
        self
    }

    /// Replace the plotter; `None` disables plot rendering.
    pub fn with_plotter(mut self, plotter: Option<Arc<dyn HistogramPlotter>>) -> Self {
        self.plotter = plotter;
        self
    }

    /// Compute the report and write its artifacts to `config.output_dir`.
    ///
    /// Returns `None` without touching the filesystem when disabled. A plot
    /// failure is logged and does not fail inspection.
    pub fn inspect(
        &self,
        records: &[Record],
        config: &InspectConfig,
    ) -> Result<Option<InspectReport>, PipelineError> {
        if !config.enabled {
            return Ok(None);
        }
        let lengths: Vec<usize> = records.iter().map(Record::whitespace_len).collect();
        let histogram = LengthHistogram::from_lengths(&lengths, HISTOGRAM_BINS);
        let report = self.report(records, &lengths, config);

        fs::create_dir_all(&config.output_dir)?;
        fs::write(
            config.output_dir.join(HISTOGRAM_DATA_FILENAME),
            serde_json::to_vec_pretty(&histogram)?,
        )?;
        if let Some(plotter) = &self.plotter {
            let path = plot_path(&config.output_dir, plotter.extension());
            if let Err(err) = plotter.render(&histogram, &path) {
                warn!(
                    "[corpusmix:inspect] failed rendering histogram {}: {err}",
                    path.display()
                );
            }
        }
        fs::write(
            config.output_dir.join(REPORT_FILENAME),
            serde_json::to_vec_pretty(&report)?,
        )?;
        info!(
            "[corpusmix:inspect] report for {} samples saved to {}",
            report.num_samples,
            config.output_dir.display()
        );
        Ok(Some(report))
    }

    fn report(&self, records: &[Record], lengths: &[usize], config: &InspectConfig) -> InspectReport {
        let avg_length = if lengths.is_empty() {
            0.0
        } else {
            lengths.iter().sum::<usize>() as f64 / lengths.len() as f64
        };

        let lang_counts = match (config.detect_language, &self.language_detector) {
            (true, Some(detector)) => {
                let mut counts = BTreeMap::new();
                for record in records.iter().take(LANGUAGE_SAMPLE_LIMIT) {
                    let tag = detector
                        .detect(&record.text)
                        .unwrap_or_else(|| "unknown".to_string());
                    *counts.entry(tag).or_insert(0) += 1;
                }
                Some(counts)
            }
            (true, None) => {
                warn!("[corpusmix:inspect] language detection requested but no detector is available");
                None
            }
            (false, _) => None,
        };

        let duplicate_count = config.check_duplicates.then(|| {
            let distinct: HashSet<_> = records
                .iter()
                .map(|record| content_digest(&record.text))
                .collect();
            records.len() - distinct.len()
        });

        let pii_hits = config.check_pii.then(|| {
            records
                .iter()
                .filter(|record| EMAIL_LIKE.is_match(&record.text))
                .count()
        });

        InspectReport {
            num_samples: records.len(),
            avg_length,
            lang_counts,
            duplicate_count,
            pii_hits,
        }
    }
}

fn plot_path(output_dir: &Path, extension: &str) -> PathBuf {
    output_dir.join(format!("{HISTOGRAM_PLOT_STEM}.{extension}"))
}
