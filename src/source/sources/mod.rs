use tracing::warn;

use super::DatasetRef;

#[cfg(feature = "huggingface")]
/// Hub dataset repository upstream.
pub mod huggingface;
/// Local directory or file upstream.
pub mod local;

/// Narrow `paths` (relative, `/`-separated) to the files of `dataset`'s
/// config and split.
///
/// Each filter falls back to the unfiltered set when it matches nothing, so
/// flat layouts without split or config markers still resolve. The result is
/// sorted.
pub(crate) fn select_dataset_files(
    source_id: &str,
    dataset: &DatasetRef,
    paths: Vec<String>,
) -> Vec<String> {
    let mut selected = paths;
    if let Some(config) = dataset.config.as_deref().filter(|c| !c.is_empty()) {
        selected = narrow(source_id, "config", config, selected, |path| {
            path_matches_config(path, config)
        });
    }
    if !dataset.split.is_empty() {
        selected = narrow(source_id, "split", &dataset.split, selected, |path| {
            path_matches_split(path, &dataset.split)
        });
    }
    selected.sort();
    selected
}

fn narrow(
    source_id: &str,
    label: &str,
    value: &str,
    paths: Vec<String>,
    keep: impl Fn(&str) -> bool,
) -> Vec<String> {
    let matched: Vec<String> = paths.iter().filter(|path| keep(path)).cloned().collect();
    if matched.is_empty() && !paths.is_empty() {
        warn!(
            "[corpusmix:source] {label} filter '{value}' matched no files for '{source_id}'; using all {} candidate(s)",
            paths.len()
        );
        return paths;
    }
    matched
}

fn path_matches_config(path: &str, config: &str) -> bool {
    path.split('/')
        .rev()
        .skip(1)
        .any(|segment| segment == config)
}

fn path_matches_split(path: &str, split: &str) -> bool {
    path.split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token == split)
}
