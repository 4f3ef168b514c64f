use std::collections::BTreeMap;

use serde::Serialize;

use crate::data::Record;
use crate::types::SourceName;

/// Tag used for records that carry no source.
pub const UNTAGGED_SOURCE: &str = "<untagged>";

/// Per-source composition of a mixed corpus.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MixComposition {
    pub total: usize,
    pub sources: usize,
    pub min: usize,
    pub max: usize,
    /// `max / min`; infinite when a listed source contributed nothing.
    pub ratio: f64,
    /// Sorted by descending count, then name.
    pub per_source: Vec<SourceShare>,
}

/// One source's count and fraction of the mix.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SourceShare {
    pub source: SourceName,
    pub count: usize,
    pub share: f64,
}

impl MixComposition {
    /// Share of the largest source, `0.0` for an empty mix.
    pub fn max_share(&self) -> f64 {
        self.per_source.first().map(|entry| entry.share).unwrap_or(0.0)
    }
}

/// Count records per source tag.
pub fn source_counts(records: &[Record]) -> BTreeMap<SourceName, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        let source = record.source.as_deref().unwrap_or(UNTAGGED_SOURCE);
        *counts.entry(source.to_string()).or_insert(0) += 1;
    }
    counts
}

/// Summarize per-source counts; `None` when there are no sources.
pub fn composition(counts: &BTreeMap<SourceName, usize>) -> Option<MixComposition> {
    let min = counts.values().copied().min()?;
    let max = counts.values().copied().max()?;
    let total: usize = counts.values().sum();
    let share = |count: usize| {
        if total == 0 {
            0.0
        } else {
            count as f64 / total as f64
        }
    };
    let ratio = if min == 0 {
        f64::INFINITY
    } else {
        max as f64 / min as f64
    };
    let mut per_source: Vec<SourceShare> = counts
        .iter()
        .map(|(source, count)| SourceShare {
            source: source.clone(),
            count: *count,
            share: share(*count),
        })
        .collect();
    per_source.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.source.cmp(&b.source)));
    Some(MixComposition {
        total,
        sources: counts.len(),
        min,
        max,
        ratio,
        per_source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composition_reports_balance() {
        let counts = BTreeMap::from([("a".to_string(), 2), ("b".to_string(), 2)]);
        let mix = composition(&counts).unwrap();
        assert_eq!(mix.total, 4);
        assert_eq!(mix.sources, 2);
        assert!((mix.ratio - 1.0).abs() < 1e-9);
        assert!((mix.max_share() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn composition_orders_by_count_and_flags_starved_sources() {
        let counts = BTreeMap::from([
            ("c4".to_string(), 2),
            ("pubmed".to_string(), 6),
            ("wikipedia".to_string(), 0),
        ]);
        let mix = composition(&counts).unwrap();
        assert_eq!(mix.per_source[0].source, "pubmed");
        assert_eq!(mix.per_source[2].source, "wikipedia");
        assert!(mix.ratio.is_infinite());
        assert!((mix.max_share() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn empty_counts_have_no_composition() {
        assert!(composition(&BTreeMap::new()).is_none());
    }

    #[test]
    fn source_counts_bucket_untagged_records() {
        let records = vec![
            Record::new("x").with_source("a"),
            Record::new("y").with_source("a"),
            Record::new("z"),
        ];
        let counts = source_counts(&records);
        assert_eq!(counts.get("a"), Some(&2));
        assert_eq!(counts.get(UNTAGGED_SOURCE), Some(&1));
    }
}
